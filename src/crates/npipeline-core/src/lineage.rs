//! Item-level lineage - provenance packets threaded through the graph
//!
//! When lineage is enabled for a run, every item carries a
//! [`LineagePacket`] recording where it originated, which nodes it
//! traversed, and what happened at each hop. Transform strategies adapt
//! input packets onto output items with a **mapping strategy** selected by
//! the node's declared cardinality and the run's [`LineageOptions`]:
//!
//! | Cardinality / options | Strategy |
//! |-----------------------|----------|
//! | One-to-one, no custom mapper | **Streaming 1:1** - inputs and outputs pair in lock-step; the packet's id is preserved and a hop appended |
//! | Non-1:1 or custom mapper | **Materializing** - both sides buffer; a custom mapper supplies output-to-input ancestry, otherwise alignment is positional |
//! | `materialization_cap` configured | **Cap-aware** - buffers fill to the cap, then the overflow policy decides: `Strict` fails, `WarnContinue` keeps buffering, `Degrade` switches to positional streaming |
//! | Degraded remainder | **Positional streaming** - pair in stream order with no mismatch enforcement |
//!
//! # Mismatch Detection
//!
//! For a one-to-one node, input and output counts must agree. When they
//! do not, a [`LineageMismatchContext`] is built; `strict` mode fails the
//! node with [`PipelineError::LineageMismatch`], otherwise
//! `warn_on_mismatch` logs it and the run continues.
//!
//! Hop lists are capped by `max_hop_records_per_item`: further hops are
//! suppressed and the last record's `truncated` flag is set.
//!
//! # Cost When Disabled
//!
//! Lineage is off by default. Disabled runs carry `packet: None` on every
//! item, so the overhead is one `Option` discriminant per item.

use crate::error::{PipelineError, Result};
use crate::pipe::{BoxItemStream, PipeItem};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Declared input/output cardinality of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageCardinality {
    /// Every input yields exactly one output
    OneToOne,
    /// Every input yields zero or one output (filtering)
    OneToZeroOrOne,
    /// An input may yield several outputs (flattening)
    OneToMany,
    /// Several inputs fold into one output (aggregation)
    ManyToOne,
    /// Arbitrary reshaping; requires a custom lineage mapper
    ManyToMany,
}

impl Default for LineageCardinality {
    fn default() -> Self {
        Self::OneToOne
    }
}

/// What happened to an item at a hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopOutcome {
    /// The item was transformed and emitted
    Emitted,
    /// The item is the fold of several inputs
    Aggregated,
    /// The item was dropped at this node
    Dropped,
}

/// Input/output ratio observed at a hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedCardinality {
    Zero,
    One,
    Many,
    Unknown,
}

/// One traversal step in a packet's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopRecord {
    /// Node the item passed through
    pub node_id: String,
    /// What happened to the item there
    pub outcome: HopOutcome,
    /// Input/output ratio observed at the hop
    pub observed_cardinality: ObservedCardinality,
    /// Indices of the contributing inputs, when known
    pub ancestry: Option<Vec<usize>>,
    /// Set on the last record when further hops were suppressed
    pub truncated: bool,
}

/// Provenance carried by one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineagePacket {
    /// Stable id; preserved across one-to-one hops
    pub lineage_id: Uuid,
    /// Node ids traversed, origin first
    pub traversal_path: Vec<String>,
    /// Whether hop records are being collected
    pub collect: bool,
    /// Per-hop history, capped by `max_hop_records_per_item`
    pub hops: Vec<HopRecord>,
}

impl LineagePacket {
    /// Fresh packet seeded at a source node
    pub fn new(origin: &str, collect: bool) -> Self {
        Self {
            lineage_id: Uuid::new_v4(),
            traversal_path: vec![origin.to_string()],
            collect,
            hops: vec![HopRecord {
                node_id: origin.to_string(),
                outcome: HopOutcome::Emitted,
                observed_cardinality: ObservedCardinality::One,
                ancestry: None,
                truncated: false,
            }],
        }
    }

    /// Record traversal of a node
    ///
    /// Extends the traversal path and, when collecting, appends a hop.
    /// Once `max_hops` records exist, further hops are suppressed and the
    /// last record is flagged `truncated`.
    pub fn advance(
        &mut self,
        node_id: &str,
        outcome: HopOutcome,
        observed: ObservedCardinality,
        ancestry: Option<Vec<usize>>,
        max_hops: usize,
    ) {
        self.traversal_path.push(node_id.to_string());
        if !self.collect {
            return;
        }
        if self.hops.len() >= max_hops {
            if let Some(last) = self.hops.last_mut() {
                last.truncated = true;
            }
            return;
        }
        self.hops.push(HopRecord {
            node_id: node_id.to_string(),
            outcome,
            observed_cardinality: observed,
            ancestry,
            truncated: false,
        });
    }
}

/// What to do when lineage buffers hit the materialization cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageOverflowPolicy {
    /// Fail the node
    Strict,
    /// Log and keep buffering past the cap
    WarnContinue,
    /// Switch to positional streaming for the remainder
    Degrade,
}

/// Run-wide lineage configuration
#[derive(Debug, Clone)]
pub struct LineageOptions {
    /// Whether lineage packets are attached at all
    pub enabled: bool,
    /// Fail one-to-one nodes whose input/output counts diverge
    pub strict: bool,
    /// Log mismatches when not strict
    pub warn_on_mismatch: bool,
    /// Buffer budget for the materializing strategies
    pub materialization_cap: Option<usize>,
    /// Behavior at the cap
    pub overflow_policy: LineageOverflowPolicy,
    /// Hop records kept per item before truncation
    pub max_hop_records_per_item: usize,
}

impl LineageOptions {
    /// Lineage switched on with defaults otherwise
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Fail on one-to-one mismatches
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Bound the materializing buffers
    pub fn with_materialization_cap(mut self, cap: usize) -> Self {
        self.materialization_cap = Some(cap);
        self
    }

    /// Behavior when the cap is hit
    pub fn with_overflow_policy(mut self, policy: LineageOverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Hop records kept per item
    pub fn with_max_hop_records(mut self, max: usize) -> Self {
        self.max_hop_records_per_item = max;
        self
    }
}

impl Default for LineageOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            strict: false,
            warn_on_mismatch: true,
            materialization_cap: None,
            overflow_policy: LineageOverflowPolicy::Degrade,
            max_hop_records_per_item: 64,
        }
    }
}

/// Ancestry of one aggregated output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    /// Index of the output item
    pub output_index: usize,
    /// Indices of the inputs folded into it
    pub input_indices: Vec<usize>,
}

/// Diagnostic built when a one-to-one node's counts diverge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageMismatchContext {
    /// Node where the divergence was observed
    pub node_id: String,
    /// Inputs consumed
    pub inputs: usize,
    /// Outputs emitted
    pub outputs: usize,
    /// Input indices that produced no output
    pub missing_inputs: Vec<usize>,
    /// Output indices with no paired input
    pub extra_outputs: Vec<usize>,
    /// Known aggregation ancestry, when a mapper was involved
    pub aggregated: Vec<AggregatedRecord>,
}

impl LineageMismatchContext {
    fn summary(&self) -> String {
        format!(
            "{} inputs vs {} outputs ({} missing, {} extra)",
            self.inputs,
            self.outputs,
            self.missing_inputs.len(),
            self.extra_outputs.len()
        )
    }
}

/// Custom ancestry callback: `(output_index, input_count)` to the input
/// indices that produced that output
pub type LineageMapper = Arc<dyn Fn(usize, usize) -> Vec<usize> + Send + Sync>;

/// An item plus its optional provenance
///
/// This is the element type flowing on the edges between nodes; node
/// contracts see only the payload.
#[derive(Debug, Clone)]
pub struct Traced<T> {
    /// The payload handed to node contracts
    pub value: T,
    /// Provenance; `None` when lineage is disabled
    pub packet: Option<LineagePacket>,
}

impl<T> Traced<T> {
    /// Item without provenance
    pub fn bare(value: T) -> Self {
        Self {
            value,
            packet: None,
        }
    }

    /// Item with provenance
    pub fn with_packet(value: T, packet: LineagePacket) -> Self {
        Self {
            value,
            packet: Some(packet),
        }
    }
}

/// Stream of traced items, the internal edge representation
pub type TracedStream<T> = BoxItemStream<Traced<T>>;

/// Shared tap the transform strategies fill with consumed input packets
pub(crate) type PacketTap = Arc<Mutex<VecDeque<Option<LineagePacket>>>>;

/// Wrap a source's plain output into traced items, seeding packets when
/// lineage is enabled
pub(crate) fn seed_stream<T: PipeItem>(
    node_id: String,
    stream: BoxItemStream<T>,
    opts: &LineageOptions,
) -> TracedStream<T> {
    let enabled = opts.enabled;
    Box::pin(stream.map(move |item| {
        item.map(|value| {
            if enabled {
                Traced::with_packet(value, LineagePacket::new(&node_id, true))
            } else {
                Traced::bare(value)
            }
        })
    }))
}

/// Drop provenance ahead of an item-typed contract (sinks, custom merges)
pub(crate) fn strip_stream<T: PipeItem>(stream: TracedStream<T>) -> BoxItemStream<T> {
    Box::pin(stream.map(|item| item.map(|traced| traced.value)))
}

/// Advance a packet across a one-to-one hop
pub(crate) fn advance_packet(
    packet: Option<LineagePacket>,
    node_id: &str,
    opts: &LineageOptions,
) -> Option<LineagePacket> {
    packet.map(|mut p| {
        p.advance(
            node_id,
            HopOutcome::Emitted,
            ObservedCardinality::One,
            None,
            opts.max_hop_records_per_item,
        );
        p
    })
}

/// Fold several input packets into one aggregated packet
pub(crate) fn combine_packets(
    node_id: &str,
    packets: Vec<LineagePacket>,
    ancestry: Option<Vec<usize>>,
    opts: &LineageOptions,
) -> Option<LineagePacket> {
    let mut iter = packets.into_iter();
    let mut combined = iter.next()?;
    let observed = if iter.len() == 0 {
        ObservedCardinality::One
    } else {
        ObservedCardinality::Many
    };
    combined.advance(
        node_id,
        HopOutcome::Aggregated,
        observed,
        ancestry,
        opts.max_hop_records_per_item,
    );
    Some(combined)
}

/// The mapping strategy chosen for a transform node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStrategyKind {
    /// Lock-step pairing; preserves lineage ids
    StreamingOneToOne,
    /// Buffer both sides, align by mapper or position
    Materializing,
    /// Materializing bounded by the cap, with an overflow policy
    CapAware,
    /// Pair in stream order without mismatch enforcement
    PositionalStreaming,
}

/// Select the mapping strategy for a node (see the module table)
pub fn select_mapping(
    cardinality: LineageCardinality,
    has_mapper: bool,
    opts: &LineageOptions,
) -> MappingStrategyKind {
    if cardinality == LineageCardinality::OneToOne && !has_mapper {
        MappingStrategyKind::StreamingOneToOne
    } else if opts.materialization_cap.is_some() {
        MappingStrategyKind::CapAware
    } else {
        MappingStrategyKind::Materializing
    }
}

fn handle_mismatch(ctx: LineageMismatchContext, opts: &LineageOptions) -> Result<()> {
    if opts.strict {
        return Err(PipelineError::LineageMismatch {
            node: ctx.node_id.clone(),
            detail: ctx.summary(),
        });
    }
    if opts.warn_on_mismatch {
        tracing::warn!(
            node = %ctx.node_id,
            inputs = ctx.inputs,
            outputs = ctx.outputs,
            "lineage mismatch at one-to-one node"
        );
    }
    Ok(())
}

/// Adapt a whole-stream transform's plain output back into traced items
///
/// `packets` is the tap the input side fills as the node consumes items;
/// alignment follows the selected mapping strategy.
pub(crate) fn adapt_stream_output<TOut: PipeItem>(
    node_id: String,
    outputs: BoxItemStream<TOut>,
    packets: PacketTap,
    cardinality: LineageCardinality,
    mapper: Option<LineageMapper>,
    opts: LineageOptions,
) -> TracedStream<TOut> {
    if !opts.enabled {
        return Box::pin(outputs.map(|item| item.map(Traced::bare)));
    }

    let kind = select_mapping(cardinality, mapper.is_some(), &opts);
    match kind {
        MappingStrategyKind::StreamingOneToOne => {
            streaming_one_to_one(node_id, outputs, packets, opts)
        }
        MappingStrategyKind::Materializing => {
            materializing(node_id, outputs, packets, mapper, opts, None)
        }
        MappingStrategyKind::CapAware => {
            let cap = opts.materialization_cap.unwrap_or(usize::MAX);
            materializing(node_id, outputs, packets, mapper, opts, Some(cap))
        }
        MappingStrategyKind::PositionalStreaming => {
            positional_streaming(node_id, outputs, packets, opts)
        }
    }
}

fn streaming_one_to_one<TOut: PipeItem>(
    node_id: String,
    mut outputs: BoxItemStream<TOut>,
    packets: PacketTap,
    opts: LineageOptions,
) -> TracedStream<TOut> {
    Box::pin(async_stream::stream! {
        let mut emitted = 0usize;
        let mut extra_outputs = Vec::new();

        while let Some(item) = outputs.next().await {
            match item {
                Ok(value) => {
                    let packet = packets.lock().expect("lineage tap poisoned").pop_front();
                    let traced = match packet {
                        Some(packet) => Traced {
                            value,
                            packet: advance_packet(packet, &node_id, &opts),
                        },
                        None => {
                            extra_outputs.push(emitted);
                            Traced::bare(value)
                        }
                    };
                    emitted += 1;
                    yield Ok(traced);
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        let missing: Vec<usize> = {
            let tap = packets.lock().expect("lineage tap poisoned");
            (emitted..emitted + tap.len()).collect()
        };
        if !missing.is_empty() || !extra_outputs.is_empty() {
            let inputs = emitted - extra_outputs.len() + missing.len();
            let ctx = LineageMismatchContext {
                node_id: node_id.clone(),
                inputs,
                outputs: emitted,
                missing_inputs: missing,
                extra_outputs,
                aggregated: Vec::new(),
            };
            if let Err(e) = handle_mismatch(ctx, &opts) {
                yield Err(e);
            }
        }
    })
}

fn positional_streaming<TOut: PipeItem>(
    node_id: String,
    mut outputs: BoxItemStream<TOut>,
    packets: PacketTap,
    opts: LineageOptions,
) -> TracedStream<TOut> {
    Box::pin(async_stream::stream! {
        while let Some(item) = outputs.next().await {
            match item {
                Ok(value) => {
                    let packet = packets.lock().expect("lineage tap poisoned").pop_front();
                    let traced = match packet.flatten() {
                        Some(mut p) => {
                            p.advance(
                                &node_id,
                                HopOutcome::Emitted,
                                ObservedCardinality::Unknown,
                                None,
                                opts.max_hop_records_per_item,
                            );
                            Traced::with_packet(value, p)
                        }
                        None => Traced::bare(value),
                    };
                    yield Ok(traced);
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

fn materializing<TOut: PipeItem>(
    node_id: String,
    mut outputs: BoxItemStream<TOut>,
    packets: PacketTap,
    mapper: Option<LineageMapper>,
    opts: LineageOptions,
    cap: Option<usize>,
) -> TracedStream<TOut> {
    Box::pin(async_stream::stream! {
        let mut buffered: Vec<TOut> = Vec::new();
        let mut degrade = false;
        let mut warned = false;

        while let Some(item) = outputs.next().await {
            match item {
                Ok(value) => {
                    buffered.push(value);
                    if let Some(cap) = cap {
                        let input_len = packets.lock().expect("lineage tap poisoned").len();
                        if buffered.len() > cap || input_len > cap {
                            match opts.overflow_policy {
                                LineageOverflowPolicy::Strict => {
                                    yield Err(PipelineError::LineageMismatch {
                                        node: node_id.clone(),
                                        detail: format!(
                                            "lineage materialization cap of {} exceeded",
                                            cap
                                        ),
                                    });
                                    return;
                                }
                                LineageOverflowPolicy::WarnContinue => {
                                    if !warned {
                                        warned = true;
                                        tracing::warn!(
                                            node = %node_id,
                                            cap,
                                            "lineage materialization cap exceeded, buffering anyway"
                                        );
                                    }
                                }
                                LineageOverflowPolicy::Degrade => {
                                    tracing::info!(
                                        node = %node_id,
                                        cap,
                                        "lineage materialization cap exceeded, degrading to \
                                         positional streaming"
                                    );
                                    degrade = true;
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if degrade {
            // Pair what was buffered positionally, then stream the rest.
            for value in buffered {
                let packet = packets.lock().expect("lineage tap poisoned").pop_front();
                let traced = match packet.flatten() {
                    Some(mut p) => {
                        p.advance(
                            &node_id,
                            HopOutcome::Emitted,
                            ObservedCardinality::Unknown,
                            None,
                            opts.max_hop_records_per_item,
                        );
                        Traced::with_packet(value, p)
                    }
                    None => Traced::bare(value),
                };
                yield Ok(traced);
            }
            let mut rest = positional_streaming(node_id, outputs, packets, opts);
            while let Some(item) = rest.next().await {
                yield item;
            }
            return;
        }

        let inputs: Vec<Option<LineagePacket>> = {
            let mut tap = packets.lock().expect("lineage tap poisoned");
            tap.drain(..).collect()
        };
        let input_count = inputs.len();

        for (output_index, value) in buffered.into_iter().enumerate() {
            let packet = match &mapper {
                Some(mapper) => {
                    let indices = mapper(output_index, input_count);
                    let ancestors: Vec<LineagePacket> = indices
                        .iter()
                        .filter_map(|i| inputs.get(*i).cloned().flatten())
                        .collect();
                    combine_packets(&node_id, ancestors, Some(indices), &opts)
                }
                None => inputs
                    .get(output_index)
                    .cloned()
                    .flatten()
                    .and_then(|p| advance_packet(Some(p), &node_id, &opts)),
            };
            yield Ok(Traced {
                value,
                packet,
            });
        }
    })
}
