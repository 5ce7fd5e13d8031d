// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Immutable copies of finished transactions, as handed to transformers.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::metadata::{AttributeValue, ImmutableTransactionMetadata};
use crate::name::TransactionName;
use crate::propagation::distributed_trace::TracingState;
use crate::segment::data::SegmentData;
use crate::segment::{MethodCall, Segment, SegmentSlot};

#[derive(Debug, Clone, Serialize)]
pub struct ImmutableTransaction {
    pub guid: String,
    pub trace_id: String,
    pub name: TransactionName,
    pub metric_name: String,
    pub start_time: SystemTime,
    pub duration: Duration,
    pub response_time: Option<Duration>,
    pub priority: f32,
    pub sampled: bool,
    pub ignore_apdex: bool,
    /// Finished by the abandoned-transaction path rather than by `end`.
    pub abandoned: bool,
    pub metadata: ImmutableTransactionMetadata,
    pub tracing_state: Option<TracingState>,
    /// Root segments; descendants hang off [`ImmutableSegment::children`].
    pub segments: Vec<ImmutableSegment>,
    /// Segments recorded, pruned ones included.
    pub segment_count: usize,
}

impl ImmutableTransaction {
    /// Every segment, depth first.
    #[must_use]
    pub fn all_segments(&self) -> Vec<&ImmutableSegment> {
        let mut all = Vec::new();
        let mut pending: Vec<&ImmutableSegment> = self.segments.iter().rev().collect();
        while let Some(segment) = pending.pop() {
            all.push(segment);
            pending.extend(segment.children.iter().rev());
        }
        all
    }

    #[must_use]
    pub fn find_segment(&self, name: &str) -> Option<&ImmutableSegment> {
        self.all_segments()
            .into_iter()
            .find(|segment| segment.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImmutableSegment {
    pub id: usize,
    /// Nearest retained ancestor.
    pub parent_id: Option<usize>,
    pub name: String,
    pub method_call: MethodCall,
    pub data: SegmentData,
    pub relative_start: Duration,
    pub duration: Option<Duration>,
    pub exclusive_duration: Option<Duration>,
    /// Number of segments combined into this one.
    pub call_count: u32,
    pub combinable: bool,
    pub unfinished: bool,
    pub span_id: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub error_message: Option<String>,
    pub children: Vec<ImmutableSegment>,
}

impl ImmutableSegment {
    fn from_segment(segment: &Segment, parent_id: Option<usize>) -> Self {
        ImmutableSegment {
            id: segment.id,
            parent_id,
            name: segment.name(),
            method_call: segment.method_call.clone(),
            data: segment.data.clone(),
            relative_start: segment.relative_start,
            duration: segment.duration(),
            exclusive_duration: segment.exclusive_duration(),
            call_count: 1,
            combinable: segment.combinable,
            unfinished: segment.relative_end.is_none(),
            span_id: segment.span_id.clone(),
            attributes: segment.attributes.clone(),
            error_message: segment.error_message.clone(),
            children: Vec::new(),
        }
    }

    fn can_combine_with(&self, other: &ImmutableSegment) -> bool {
        self.combinable
            && other.combinable
            && !self.unfinished
            && !other.unfinished
            && self.children.is_empty()
            && other.children.is_empty()
            && self.method_call == other.method_call
            && self.data.is_combinable_with(&other.data)
    }

    /// Folds `other` into `self`. Attributes already present on `self` win.
    fn absorb(&mut self, other: ImmutableSegment) {
        self.duration = sum(self.duration, other.duration);
        self.exclusive_duration = sum(self.exclusive_duration, other.exclusive_duration);
        self.call_count += other.call_count;
        for (key, value) in other.attributes {
            self.attributes.entry(key).or_insert(value);
        }
    }
}

fn sum(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.saturating_add(b)),
        (a, b) => a.or(b),
    }
}

/// Merges runs of adjacent combinable leaf siblings.
///
/// The merged segment keeps the id and parent of the first segment of the run,
/// so applying this twice yields the same result as applying it once.
#[must_use]
pub fn combine_siblings(siblings: Vec<ImmutableSegment>) -> Vec<ImmutableSegment> {
    let mut combined: Vec<ImmutableSegment> = Vec::with_capacity(siblings.len());
    for segment in siblings {
        if let Some(previous) = combined.last_mut() {
            if previous.can_combine_with(&segment) {
                previous.absorb(segment);
                continue;
            }
        }
        combined.push(segment);
    }
    combined
}

/// Follows parent links past pruned slots.
fn retained_parent(slots: &[SegmentSlot], id: usize) -> Option<usize> {
    let mut parent = slots.get(id).and_then(SegmentSlot::parent_id);
    while let Some(parent_id) = parent {
        // Parents always start before, and so have lower ids than, children.
        if parent_id >= id {
            return None;
        }
        match slots.get(parent_id) {
            Some(SegmentSlot::Live(_)) => return Some(parent_id),
            Some(pruned) => parent = pruned.parent_id(),
            None => return None,
        }
    }
    None
}

pub(crate) fn build_segment_tree(slots: &[SegmentSlot]) -> Vec<ImmutableSegment> {
    let mut children: HashMap<Option<usize>, Vec<usize>> = HashMap::new();
    for (id, slot) in slots.iter().enumerate() {
        if slot.live().is_some() {
            children
                .entry(retained_parent(slots, id))
                .or_default()
                .push(id);
        }
    }
    build_children(slots, &mut children, None)
}

fn build_children(
    slots: &[SegmentSlot],
    children: &mut HashMap<Option<usize>, Vec<usize>>,
    parent_id: Option<usize>,
) -> Vec<ImmutableSegment> {
    let ids = children.remove(&parent_id).unwrap_or_default();
    let mut nodes: Vec<ImmutableSegment> = ids
        .into_iter()
        .filter_map(|id| {
            let segment = slots.get(id).and_then(SegmentSlot::live)?;
            let mut node = ImmutableSegment::from_segment(segment, parent_id);
            node.children = build_children(slots, children, Some(id));
            Some(node)
        })
        .collect();
    nodes.sort_by_key(|node| (node.relative_start, node.id));
    combine_siblings(nodes)
}
