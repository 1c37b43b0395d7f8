//! Graph visualization - DOT, Mermaid, and ASCII rendering
//!
//! Render a [`PipelineGraph`] for debugging and documentation:
//!
//! - **DOT/Graphviz** - professional diagrams (`dot -Tpng`)
//! - **Mermaid** - renders natively in markdown on most code hosts
//! - **ASCII** - quick console output while developing
//!
//! Pure formatting over the frozen graph; nothing here touches node
//! instances or execution state.
//!
//! # Example
//!
//! ```rust,ignore
//! use npipeline_core::visualization::{visualize, VisualizationOptions};
//!
//! let mermaid = visualize(
//!     pipeline.graph(),
//!     &VisualizationOptions::mermaid().with_title("ingest"),
//! );
//! println!("{}", mermaid);
//! ```

use crate::graph::{NodeKind, PipelineGraph};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualizationFormat {
    /// DOT format for Graphviz
    Dot,
    /// Mermaid diagram format
    Mermaid,
    /// Simple ASCII art
    Ascii,
}

/// Rendering options
#[derive(Debug, Clone)]
pub struct VisualizationOptions {
    /// Output format
    pub format: VisualizationFormat,
    /// Include strategy/merge details in node labels
    pub include_details: bool,
    /// Graph title/label
    pub title: Option<String>,
}

impl Default for VisualizationOptions {
    fn default() -> Self {
        Self {
            format: VisualizationFormat::Dot,
            include_details: false,
            title: None,
        }
    }
}

impl VisualizationOptions {
    /// Create with DOT format
    pub fn dot() -> Self {
        Self::default()
    }

    /// Create with Mermaid format
    pub fn mermaid() -> Self {
        Self {
            format: VisualizationFormat::Mermaid,
            ..Self::default()
        }
    }

    /// Create with ASCII format
    pub fn ascii() -> Self {
        Self {
            format: VisualizationFormat::Ascii,
            ..Self::default()
        }
    }

    /// Set the title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Include strategy/merge details in node labels
    pub fn with_details(mut self) -> Self {
        self.include_details = true;
        self
    }
}

/// Render a graph as a string in the selected format
pub fn visualize(graph: &PipelineGraph, options: &VisualizationOptions) -> String {
    match options.format {
        VisualizationFormat::Dot => visualize_dot(graph, options),
        VisualizationFormat::Mermaid => visualize_mermaid(graph, options),
        VisualizationFormat::Ascii => visualize_ascii(graph, options),
    }
}

fn node_label(graph: &PipelineGraph, id: &str, include_details: bool) -> String {
    let Some(node) = graph.node(id) else {
        return id.to_string();
    };
    if include_details {
        format!(
            "{}\\n[{} | {} | {:?}]",
            node.display_name,
            node.kind,
            node.strategy.name(),
            node.merge_type
        )
    } else {
        node.display_name.clone()
    }
}

fn kind_shape_dot(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Source => "shape=ellipse, style=filled, fillcolor=lightgreen",
        NodeKind::Sink => "shape=ellipse, style=filled, fillcolor=lightcoral",
        NodeKind::Transform => "shape=box, style=rounded",
        NodeKind::CustomMerge => "shape=diamond",
    }
}

fn visualize_dot(graph: &PipelineGraph, options: &VisualizationOptions) -> String {
    let mut output = String::new();
    output.push_str("digraph pipeline {\n");
    output.push_str("    rankdir=LR;\n");

    if let Some(title) = &options.title {
        output.push_str("    labelloc=\"t\";\n");
        output.push_str(&format!("    label=\"{}\";\n", escape_dot(title)));
    }

    for node in graph.nodes() {
        output.push_str(&format!(
            "    \"{}\" [label=\"{}\", {}];\n",
            escape_dot(&node.id),
            escape_dot(&node_label(graph, &node.id, options.include_details)),
            kind_shape_dot(node.kind)
        ));
    }
    for edge in graph.edges() {
        output.push_str(&format!(
            "    \"{}\" -> \"{}\";\n",
            escape_dot(&edge.from),
            escape_dot(&edge.to)
        ));
    }

    output.push_str("}\n");
    output
}

fn visualize_mermaid(graph: &PipelineGraph, options: &VisualizationOptions) -> String {
    let mut output = String::new();
    output.push_str("graph LR\n");

    if let Some(title) = &options.title {
        output.push_str(&format!("    %% {}\n", title));
    }

    for node in graph.nodes() {
        let label = escape_mermaid(&node_label(graph, &node.id, options.include_details));
        let shape = match node.kind {
            NodeKind::Source => format!("{}([\"{}\"])", mermaid_id(&node.id), label),
            NodeKind::Sink => format!("{}[[\"{}\"]]", mermaid_id(&node.id), label),
            NodeKind::Transform => format!("{}[\"{}\"]", mermaid_id(&node.id), label),
            NodeKind::CustomMerge => format!("{}{{\"{}\"}}", mermaid_id(&node.id), label),
        };
        output.push_str(&format!("    {}\n", shape));
    }
    for edge in graph.edges() {
        output.push_str(&format!(
            "    {} --> {}\n",
            mermaid_id(&edge.from),
            mermaid_id(&edge.to)
        ));
    }

    output
}

fn visualize_ascii(graph: &PipelineGraph, options: &VisualizationOptions) -> String {
    let mut output = String::new();
    if let Some(title) = &options.title {
        output.push_str(&format!("{}\n{}\n", title, "=".repeat(title.len())));
    }

    output.push_str("nodes:\n");
    for node in graph.nodes() {
        output.push_str(&format!(
            "  [{}] {} ({})\n",
            node.kind, node.id, node.strategy.name()
        ));
    }
    output.push_str("edges:\n");
    for edge in graph.edges() {
        output.push_str(&format!("  {}\n", edge));
    }
    output
}

fn escape_dot(s: &str) -> String {
    s.replace('\"', "\\\"")
}

fn escape_mermaid(s: &str) -> String {
    s.replace('\"', "'")
}

/// Mermaid node ids must be bare words
fn mermaid_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
