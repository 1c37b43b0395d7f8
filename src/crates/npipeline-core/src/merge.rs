//! Merge service - combining multiple inbound pipes into one
//!
//! A node with two or more inbound edges needs its inputs combined before
//! execution. The [`MergePolicy`] on the node picks how:
//!
//! | Policy | Behavior | Cross-input order |
//! |--------|----------|-------------------|
//! | [`MergePolicy::Interleave`] (default) | whichever input has an item ready is emitted first | none |
//! | [`MergePolicy::Concatenate`] | drain input *i* fully before starting input *i+1*, in edge order | edge order |
//! | [`MergePolicy::KeyedJoin`] | buffered inner join keyed by a selector; a group emits once every input contributed | none |
//! | [`MergePolicy::Custom`] | delegate to the node's own [`CustomMerge`](crate::node::CustomMerge) | node-defined |
//!
//! Within a single input, item order is preserved by **every** policy.
//!
//! # Keyed Joins
//!
//! [`JoinConfig`] supplies the key selector and a combiner folding one item
//! per input into the joined output item. Groups missing a contribution are
//! held until the optional `timeout` (default: unbounded) or end-of-input,
//! then dropped and reported as `item_dropped`. The hold buffer is bounded
//! by `capacity`; exceeding it fails the node with
//! [`PipelineError::MergeOverflow`].

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::lineage::{combine_packets, LineagePacket, Traced, TracedStream};
use crate::observer::ExecutionObserver;
use crate::pipe::PipeItem;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Type-erased merge discriminant carried on node definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeType {
    Interleave,
    Concatenate,
    KeyedJoin,
    Custom,
}

/// Configuration of a keyed inner join
pub struct JoinConfig<T> {
    /// Join key of an item
    pub key_selector: Arc<dyn Fn(&T) -> String + Send + Sync>,
    /// Folds one item per input (in edge order) into the joined item
    pub combiner: Arc<dyn Fn(Vec<T>) -> T + Send + Sync>,
    /// How long incomplete groups are held; `None` holds to end-of-input
    pub timeout: Option<Duration>,
    /// Bound on items buffered across all groups
    pub capacity: usize,
}

impl<T> JoinConfig<T> {
    /// Default hold-buffer bound
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(
        key_selector: impl Fn(&T) -> String + Send + Sync + 'static,
        combiner: impl Fn(Vec<T>) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            key_selector: Arc::new(key_selector),
            combiner: Arc::new(combiner),
            timeout: None,
            capacity: Self::DEFAULT_CAPACITY,
        }
    }

    /// Bound how long incomplete groups are held
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bound the hold buffer
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl<T> Clone for JoinConfig<T> {
    fn clone(&self) -> Self {
        Self {
            key_selector: Arc::clone(&self.key_selector),
            combiner: Arc::clone(&self.combiner),
            timeout: self.timeout,
            capacity: self.capacity,
        }
    }
}

impl<T> std::fmt::Debug for JoinConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinConfig")
            .field("timeout", &self.timeout)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// How a node's inbound pipes are combined
pub enum MergePolicy<T> {
    /// First-ready wins; per-input order preserved
    Interleave,
    /// Drain inputs fully in edge order
    Concatenate,
    /// Buffered inner join
    KeyedJoin(JoinConfig<T>),
    /// Delegate to the node's [`CustomMerge`](crate::node::CustomMerge)
    Custom,
}

impl<T> MergePolicy<T> {
    /// The type-erased discriminant stored on the node definition
    pub fn merge_type(&self) -> MergeType {
        match self {
            Self::Interleave => MergeType::Interleave,
            Self::Concatenate => MergeType::Concatenate,
            Self::KeyedJoin(_) => MergeType::KeyedJoin,
            Self::Custom => MergeType::Custom,
        }
    }
}

impl<T> Clone for MergePolicy<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Interleave => Self::Interleave,
            Self::Concatenate => Self::Concatenate,
            Self::KeyedJoin(config) => Self::KeyedJoin(config.clone()),
            Self::Custom => Self::Custom,
        }
    }
}

impl<T> Default for MergePolicy<T> {
    fn default() -> Self {
        Self::Interleave
    }
}

impl<T> std::fmt::Debug for MergePolicy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MergePolicy::{:?}", self.merge_type())
    }
}

/// Combine a node's inbound streams according to its policy
///
/// A single input bypasses merging. `Custom` never reaches this function;
/// the execution plan routes it to the node's own `merge`.
pub(crate) fn merge_streams<T: PipeItem>(
    node_id: &str,
    policy: &MergePolicy<T>,
    mut inputs: Vec<TracedStream<T>>,
    ctx: Arc<PipelineContext>,
) -> Result<TracedStream<T>> {
    if inputs.len() == 1 {
        return Ok(inputs.remove(0));
    }

    match policy {
        MergePolicy::Interleave => Ok(Box::pin(futures::stream::select_all(inputs))),
        MergePolicy::Concatenate => Ok(Box::pin(futures::stream::iter(inputs).flatten())),
        MergePolicy::KeyedJoin(config) => {
            Ok(keyed_join(node_id.to_string(), config.clone(), inputs, ctx))
        }
        MergePolicy::Custom => Err(PipelineError::configuration(format!(
            "node '{}' selects a custom merge but is not a custom-merge node",
            node_id
        ))),
    }
}

fn keyed_join<T: PipeItem>(
    node_id: String,
    config: JoinConfig<T>,
    inputs: Vec<TracedStream<T>>,
    ctx: Arc<PipelineContext>,
) -> TracedStream<T> {
    let input_count = inputs.len();
    Box::pin(async_stream::stream! {
        let mut tagged = futures::stream::select_all(
            inputs
                .into_iter()
                .enumerate()
                .map(|(idx, s)| s.map(move |item| (idx, item)).boxed()),
        );

        // Per key, one FIFO per input index.
        let mut groups: HashMap<String, Vec<VecDeque<Traced<T>>>> = HashMap::new();
        let mut buffered = 0usize;
        let deadline = config
            .timeout
            .map(|t| tokio::time::Instant::now() + t);
        let mut timed_out = false;

        loop {
            let next = match deadline {
                Some(at) => tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(at) => {
                        timed_out = true;
                        None
                    }
                    item = tagged.next() => item,
                },
                None => tagged.next().await,
            };
            let Some((idx, item)) = next else { break };

            match item {
                Ok(traced) => {
                    let key = (config.key_selector)(&traced.value);
                    let group = groups
                        .entry(key.clone())
                        .or_insert_with(|| vec![VecDeque::new(); input_count]);
                    group[idx].push_back(traced);
                    buffered += 1;

                    if group.iter().all(|q| !q.is_empty()) {
                        let members: Vec<Traced<T>> =
                            group.iter_mut().filter_map(|q| q.pop_front()).collect();
                        buffered -= members.len();
                        if group.iter().all(|q| q.is_empty()) {
                            groups.remove(&key);
                        }

                        let mut values = Vec::with_capacity(members.len());
                        let mut packets: Vec<LineagePacket> = Vec::new();
                        for member in members {
                            values.push(member.value);
                            if let Some(packet) = member.packet {
                                packets.push(packet);
                            }
                        }
                        let value = (config.combiner)(values);
                        let packet = combine_packets(
                            &node_id,
                            packets,
                            Some((0..input_count).collect()),
                            ctx.lineage_options(),
                        );
                        yield Ok(Traced { value, packet });
                    } else if buffered > config.capacity {
                        yield Err(PipelineError::MergeOverflow {
                            node: node_id.clone(),
                            capacity: config.capacity,
                        });
                        return;
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        let leftover: usize = groups
            .values()
            .map(|group| group.iter().map(|q| q.len()).sum::<usize>())
            .sum();
        if leftover > 0 {
            tracing::warn!(
                node = %node_id,
                dropped = leftover,
                timed_out,
                "dropping items held by incomplete join groups"
            );
            for _ in 0..leftover {
                ctx.observer().item_dropped(&node_id, "keyed join group incomplete");
            }
        }
    })
}
