// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segments: timed units of work inside a transaction.
//!
//! Segment state lives in its transaction, indexed by id. Instrumentation
//! holds a [`SegmentHandle`], which is inert when the segment was never
//! recorded (ignored transaction, leaf parent).

pub mod data;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::context::{ContextKey, ExecutionContext};
use crate::error::{require_non_empty, Error};
use crate::metadata::AttributeValue;
use crate::transaction::Transaction;
use data::SegmentData;

/// The instrumented method a segment was started from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MethodCall {
    pub type_name: String,
    pub method_name: String,
    /// Identity of the receiver, when the instrumentation knows it.
    pub invocation_target: Option<u64>,
}

impl MethodCall {
    pub fn new(
        type_name: &str,
        method_name: &str,
        invocation_target: Option<u64>,
    ) -> Result<Self, Error> {
        require_non_empty("type_name", type_name)?;
        require_non_empty("method_name", method_name)?;
        Ok(MethodCall {
            type_name: type_name.to_string(),
            method_name: method_name.to_string(),
            invocation_target,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub(crate) id: usize,
    pub(crate) parent_id: Option<usize>,
    /// Stack key of the context the segment started on.
    pub(crate) context_key: ContextKey,
    pub(crate) method_call: MethodCall,
    pub(crate) data: SegmentData,
    pub(crate) relative_start: Duration,
    pub(crate) relative_end: Option<Duration>,
    /// Total duration of children that ended synchronously.
    pub(crate) child_duration: Duration,
    pub(crate) combinable: bool,
    pub(crate) is_leaf: bool,
    pub(crate) span_id: String,
    pub(crate) attributes: BTreeMap<String, AttributeValue>,
    pub(crate) error_message: Option<String>,
}

impl Segment {
    pub(crate) fn new(
        id: usize,
        parent_id: Option<usize>,
        context_key: ContextKey,
        method_call: MethodCall,
        data: SegmentData,
        relative_start: Duration,
    ) -> Self {
        Segment {
            id,
            parent_id,
            context_key,
            method_call,
            data,
            relative_start,
            relative_end: None,
            child_duration: Duration::ZERO,
            combinable: false,
            is_leaf: false,
            span_id: crate::ids::generate_guid(),
            attributes: BTreeMap::new(),
            error_message: None,
        }
    }

    pub(crate) fn duration(&self) -> Option<Duration> {
        self.relative_end
            .map(|end| end.saturating_sub(self.relative_start))
    }

    pub(crate) fn exclusive_duration(&self) -> Option<Duration> {
        self.duration()
            .map(|duration| duration.saturating_sub(self.child_duration))
    }

    /// End offset, or the start offset while the segment is still running.
    pub(crate) fn calculated_relative_end(&self) -> Duration {
        self.relative_end.unwrap_or(self.relative_start)
    }

    pub(crate) fn name(&self) -> String {
        self.data.name()
    }
}

/// Storage slot of a segment. Segments past the segment limit are replaced by
/// a tombstone once they end; only their parent link is kept so children can
/// be re-parented.
#[derive(Debug, Clone)]
pub(crate) enum SegmentSlot {
    Live(Segment),
    Pruned { parent_id: Option<usize> },
}

impl SegmentSlot {
    pub(crate) fn live(&self) -> Option<&Segment> {
        match self {
            SegmentSlot::Live(segment) => Some(segment),
            SegmentSlot::Pruned { .. } => None,
        }
    }

    pub(crate) fn live_mut(&mut self) -> Option<&mut Segment> {
        match self {
            SegmentSlot::Live(segment) => Some(segment),
            SegmentSlot::Pruned { .. } => None,
        }
    }

    pub(crate) fn parent_id(&self) -> Option<usize> {
        match self {
            SegmentSlot::Live(segment) => segment.parent_id,
            SegmentSlot::Pruned { parent_id } => *parent_id,
        }
    }
}

/// Handle to a started segment. Every operation is a no-op on an inert handle.
#[derive(Clone, Default)]
pub struct SegmentHandle {
    inner: Option<(Transaction, usize)>,
}

impl fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some((transaction, id)) => f
                .debug_struct("SegmentHandle")
                .field("transaction", &transaction.guid())
                .field("id", id)
                .finish(),
            None => f.write_str("SegmentHandle(noop)"),
        }
    }
}

impl SegmentHandle {
    pub(crate) fn new(transaction: Transaction, id: usize) -> Self {
        SegmentHandle {
            inner: Some((transaction, id)),
        }
    }

    #[must_use]
    pub fn noop() -> Self {
        SegmentHandle { inner: None }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    #[must_use]
    pub fn id(&self) -> Option<usize> {
        self.inner.as_ref().map(|(_, id)| *id)
    }

    #[must_use]
    pub fn transaction(&self) -> Option<&Transaction> {
        self.inner.as_ref().map(|(transaction, _)| transaction)
    }

    /// Span id used as the parent id of outbound distributed trace headers.
    #[must_use]
    pub fn span_id(&self) -> Option<String> {
        let (transaction, id) = self.inner.as_ref()?;
        transaction.with_segment(*id, |segment| segment.span_id.clone())
    }

    /// Ends the segment. Only the first call has any effect.
    pub fn end(&self, ctx: &ExecutionContext) {
        if let Some((transaction, id)) = &self.inner {
            transaction.end_segment(ctx, *id, None);
        }
    }

    pub fn end_with_error(&self, ctx: &ExecutionContext, message: &str) {
        if let Some((transaction, id)) = &self.inner {
            transaction.end_segment(ctx, *id, Some(message));
        }
    }

    /// Stops the segment from parenting segments started later without
    /// ending it, for work that continues outside of the current call.
    pub fn remove_from_call_stack(&self, ctx: &ExecutionContext) {
        if let Some((transaction, id)) = &self.inner {
            transaction.remove_segment_from_call_stack(ctx, *id);
        }
    }

    pub fn make_combinable(&self) {
        if let Some((transaction, id)) = &self.inner {
            transaction.with_segment_mut(*id, |segment| segment.combinable = true);
        }
    }

    /// Children started under a leaf segment are not recorded.
    pub fn make_leaf(&self) {
        if let Some((transaction, id)) = &self.inner {
            transaction.with_segment_mut(*id, |segment| segment.is_leaf = true);
        }
    }

    pub fn add_custom_attribute(&self, key: &str, value: impl Into<AttributeValue>) {
        let Some((transaction, id)) = &self.inner else {
            return;
        };
        if !crate::metadata::valid_attribute_key(key) {
            return;
        }
        let value = value.into();
        transaction.with_segment_mut(*id, |segment| {
            segment.attributes.insert(key.to_string(), value);
        });
    }
}
