// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transactions and the segments recorded on them.
//!
//! A [`Transaction`] is a cheap handle to shared state. The state is finished
//! exactly once, either by [`Transaction::end`] once no unit of work is
//! outstanding, or by the abandoned-transaction path when the last handle is
//! dropped first.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, debug_span, enabled, error, trace, Level};

use crate::call_stack::CallStackManager;
use crate::context::{ContextSlot, ExecutionContext, TransactionContextStore};
use crate::error::{require_non_empty, Error};
use crate::health::SupportabilityMetric;
use crate::ids::{generate_guid, generate_trace_id};
use crate::metadata::{
    strip_query_for_header, AttributeValue, ImmutableTransactionMetadata, TransactionMetadata,
};
use crate::name::{CandidateTransactionName, FreezeReason, TransactionName, TransactionNamePriority};
use crate::priority::create_priority;
use crate::propagation::cat::{CrossApplicationRequestData, UNKNOWN_CONTENT_LENGTH};
use crate::propagation::distributed_trace::{OutboundTraceContext, TracingState, TransportType};
use crate::segment::data::{
    clamp_name, ConnectionInfo, DestinationType, MessageBrokerAction, ParsedStatement, SegmentData,
};
use crate::segment::{MethodCall, Segment, SegmentHandle, SegmentSlot};
use crate::service::EngineComponents;
use crate::snapshot::{build_segment_tree, ImmutableTransaction};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct TransactionState {
    pub(crate) guid: String,
    trace_id: String,
    priority: f32,
    start_time: SystemTime,
    start_instant: Instant,
    pub(crate) components: Arc<EngineComponents>,
    store: Weak<TransactionContextStore>,
    /// Context slots this transaction was set on.
    holders: Mutex<Vec<Weak<ContextSlot>>>,
    sampled: OnceLock<bool>,
    ignored: AtomicBool,
    ignore_apdex: AtomicBool,
    finished: AtomicBool,
    unit_of_work_count: AtomicI32,
    nested_attempts: AtomicU32,
    name: Mutex<CandidateTransactionName>,
    pub(crate) metadata: TransactionMetadata,
    segments: Mutex<Vec<SegmentSlot>>,
    call_stack: CallStackManager,
    tracing_state: Mutex<Option<TracingState>>,
    duration: OnceLock<Duration>,
    forced_duration: Mutex<Option<Duration>>,
    response_time: OnceLock<Duration>,
}

/// Timing summary of one recorded segment.
pub(crate) struct SegmentTiming {
    pub(crate) name: String,
    pub(crate) relative_start: Duration,
    pub(crate) calculated_relative_end: Duration,
}

impl TransactionState {
    fn elapsed(&self) -> Duration {
        self.components
            .clock
            .now()
            .saturating_duration_since(self.start_instant)
    }

    fn now_unix_ms(&self) -> u64 {
        let now = self.start_time + self.elapsed();
        now.duration_since(UNIX_EPOCH)
            .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn is_ignored(&self) -> bool {
        self.ignored.load(Ordering::Acquire)
    }

    pub(crate) fn metric_name(&self) -> String {
        lock(&self.name).name().metric_name()
    }

    fn trace_id(&self) -> String {
        lock(&self.tracing_state)
            .as_ref()
            .map_or_else(|| self.trace_id.clone(), |state| state.trace_id.clone())
    }

    fn priority(&self) -> f32 {
        lock(&self.tracing_state)
            .as_ref()
            .and_then(|state| state.priority)
            .unwrap_or(self.priority)
    }

    fn sampled(&self) -> bool {
        if let Some(sampled) = self.sampled.get() {
            return *sampled;
        }
        // Read outside of the initializer, which must not take any other lock.
        let priority = self.priority();
        *self
            .sampled
            .get_or_init(|| self.components.sampler.compute_sampled(priority))
    }

    fn capture_response_time(&self) -> Duration {
        *self.response_time.get_or_init(|| self.elapsed())
    }

    /// Marks the transaction finished. Returns `true` for the one caller that
    /// made the transition.
    pub(crate) fn finish(&self) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let forced = *lock(&self.forced_duration);
        let duration = forced.unwrap_or_else(|| self.elapsed());
        // Only the winner of the exchange above gets here.
        let _ = self.duration.set(duration);
        true
    }

    pub(crate) fn force_change_duration(&self, duration: Duration) {
        *lock(&self.forced_duration) = Some(duration);
    }

    /// Recomputes the path hash from the current name and the referrer's hash.
    pub(crate) fn update_path_hash(&self) -> String {
        let components = &self.components;
        let path_hash = components.path_hash_maker.calculate_path_hash(
            &components.config.app_name,
            &self.metric_name(),
            self.metadata
                .cross_application_referrer_path_hash()
                .as_deref(),
        );
        self.metadata
            .set_cross_application_path_hash(path_hash.clone());
        path_hash
    }

    pub(crate) fn segment_timings(&self) -> Vec<SegmentTiming> {
        lock(&self.segments)
            .iter()
            .filter_map(SegmentSlot::live)
            .map(|segment| SegmentTiming {
                name: segment.name(),
                relative_start: segment.relative_start,
                calculated_relative_end: segment.calculated_relative_end(),
            })
            .collect()
    }

    pub(crate) fn to_immutable(&self, abandoned: bool) -> ImmutableTransaction {
        let name = lock(&self.name).name().clone();
        let (segments, segment_count) = {
            let slots = lock(&self.segments);
            (build_segment_tree(&slots), slots.len())
        };
        let tracing_state = lock(&self.tracing_state).clone();
        ImmutableTransaction {
            guid: self.guid.clone(),
            trace_id: self.trace_id(),
            metric_name: name.metric_name(),
            name,
            start_time: self.start_time,
            duration: self
                .duration
                .get()
                .copied()
                .unwrap_or_else(|| self.elapsed()),
            response_time: self.response_time.get().copied(),
            priority: self.priority(),
            sampled: self.sampled(),
            ignore_apdex: self.ignore_apdex.load(Ordering::Acquire),
            abandoned,
            metadata: self.metadata.snapshot(),
            tracing_state,
            segments,
            segment_count,
        }
    }
}

impl Drop for TransactionState {
    fn drop(&mut self) {
        if self.finished.load(Ordering::Acquire) || self.is_ignored() {
            return;
        }
        let components = Arc::clone(&self.components);
        let state = &*self;
        if catch_unwind(AssertUnwindSafe(|| {
            components.finalizer.on_transaction_abandoned(state);
        }))
        .is_err()
        {
            error!("Failed to finalize abandoned transaction {}", self.guid);
        }
    }
}

/// Shared handle to a transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionState>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("guid", &self.inner.guid)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        components: Arc<EngineComponents>,
        store: Weak<TransactionContextStore>,
        initial_name: TransactionName,
    ) -> Self {
        let start_instant = components.clock.now();
        Transaction {
            inner: Arc::new(TransactionState {
                guid: generate_guid(),
                trace_id: generate_trace_id(),
                priority: create_priority(),
                start_time: SystemTime::now(),
                start_instant,
                components,
                store,
                holders: Mutex::new(Vec::new()),
                sampled: OnceLock::new(),
                ignored: AtomicBool::new(false),
                ignore_apdex: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                unit_of_work_count: AtomicI32::new(1),
                nested_attempts: AtomicU32::new(0),
                name: Mutex::new(CandidateTransactionName::new(initial_name)),
                metadata: TransactionMetadata::default(),
                segments: Mutex::new(Vec::new()),
                call_stack: CallStackManager::default(),
                tracing_state: Mutex::new(None),
                duration: OnceLock::new(),
                forced_duration: Mutex::new(None),
                response_time: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn note_held_by(&self, slot: &Arc<ContextSlot>) {
        let mut holders = lock(&self.inner.holders);
        holders.retain(|holder| holder.strong_count() > 0);
        if !holders
            .iter()
            .any(|holder| std::ptr::eq(holder.as_ptr(), Arc::as_ptr(slot)))
        {
            holders.push(Arc::downgrade(slot));
        }
    }

    pub(crate) fn take_holders(&self) -> Vec<Weak<ContextSlot>> {
        std::mem::take(&mut *lock(&self.inner.holders))
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    /// The inbound trace id when a distributed trace was accepted, otherwise
    /// this transaction's own.
    #[must_use]
    pub fn trace_id(&self) -> String {
        self.inner.trace_id()
    }

    #[must_use]
    pub fn priority(&self) -> f32 {
        self.inner.priority()
    }

    /// Decided on first read and never changed afterwards.
    #[must_use]
    pub fn sampled(&self) -> bool {
        self.inner.sampled()
    }

    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.inner.start_time
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.inner.is_ignored()
    }

    #[must_use]
    pub fn name(&self) -> TransactionName {
        lock(&self.inner.name).name().clone()
    }

    #[must_use]
    pub fn metric_name(&self) -> String {
        self.inner.metric_name()
    }

    /// Returns whether `name` replaced the current name.
    pub fn try_set_name(&self, name: TransactionName, priority: TransactionNamePriority) -> bool {
        let accepted = lock(&self.inner.name).try_set(name, priority);
        if !accepted {
            trace!("Transaction {} name change rejected", self.inner.guid);
        }
        accepted
    }

    pub fn freeze_name(&self, reason: FreezeReason) {
        lock(&self.inner.name).freeze(reason);
    }

    #[must_use]
    pub fn name_frozen_reason(&self) -> Option<FreezeReason> {
        lock(&self.inner.name).frozen_reason()
    }

    pub fn notice_unit_of_work_begins(&self) -> i32 {
        self.inner.unit_of_work_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Never goes below zero.
    pub fn notice_unit_of_work_ends(&self) -> i32 {
        let previous = self
            .inner
            .unit_of_work_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some((count - 1).max(0))
            })
            .unwrap_or_default();
        (previous - 1).max(0)
    }

    pub(crate) fn notice_nested_transaction_attempt(&self) -> u32 {
        self.inner.nested_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Suppresses all output for this transaction.
    pub fn ignore(&self) {
        self.inner.ignored.store(true, Ordering::Release);
        debug!("Transaction {} ignored", self.inner.guid);
    }

    pub fn ignore_apdex(&self) {
        self.inner.ignore_apdex.store(true, Ordering::Release);
    }

    /// Overrides the measured duration when the transaction finishes.
    pub fn force_change_duration(&self, duration: Duration) {
        self.inner.force_change_duration(duration);
    }

    pub fn add_custom_attribute(&self, key: &str, value: impl Into<AttributeValue>) {
        self.inner.metadata.add_custom_attribute(key, value.into());
    }

    pub fn set_http_response_status_code(&self, status: u16, sub_status: Option<u16>) {
        self.inner
            .metadata
            .set_http_response_status_code(status, sub_status);
    }

    pub fn set_queue_time(&self, queue_time: Duration) {
        self.inner.metadata.set_queue_time(queue_time);
    }

    pub fn set_uri(&self, uri: &str) {
        self.inner.metadata.set_uri(uri);
    }

    pub fn set_original_uri(&self, uri: &str) {
        self.inner.metadata.set_original_uri(uri);
    }

    pub fn set_referrer_uri(&self, uri: &str) {
        self.inner.metadata.set_referrer_uri(uri);
    }

    pub fn set_request_method(&self, method: &str) {
        self.inner.metadata.set_request_method(method);
    }

    /// Captures request headers. Skipped entirely in high security mode.
    pub fn set_request_headers<'a>(&self, headers: impl IntoIterator<Item = (&'a str, &'a str)>) {
        if self.inner.components.config.high_security_mode_enabled {
            return;
        }
        for (key, value) in headers {
            self.inner
                .metadata
                .add_request_header(key, strip_query_for_header(key, value));
        }
    }

    #[must_use]
    pub fn metadata(&self) -> ImmutableTransactionMetadata {
        self.inner.metadata.snapshot()
    }

    #[must_use]
    pub fn tracing_state(&self) -> Option<TracingState> {
        lock(&self.inner.tracing_state).clone()
    }

    /// Converts the current state into its immutable form without finishing.
    #[must_use]
    pub fn to_snapshot(&self) -> ImmutableTransaction {
        self.inner.to_immutable(false)
    }

    /// Starts a segment under the segment currently on top of the call stack
    /// of `ctx`.
    ///
    /// Returns an inert handle for ignored or finished transactions and below
    /// leaf segments. Only empty required names are reported as errors.
    pub fn start_segment(
        &self,
        ctx: &ExecutionContext,
        method_call: MethodCall,
        mut data: SegmentData,
    ) -> Result<SegmentHandle, Error> {
        validate_segment_data(&mut data)?;
        let state = &self.inner;
        if state.is_ignored() {
            return Ok(SegmentHandle::noop());
        }
        if self.is_finished() {
            debug!(
                "Transaction {} already finished, not starting {}",
                state.guid,
                data.name()
            );
            return Ok(SegmentHandle::noop());
        }

        let parent_id = state.call_stack.current_parent_id(ctx);
        let relative_start = state.elapsed();
        let id = {
            let mut segments = lock(&state.segments);
            let parent = parent_id
                .and_then(|parent_id| segments.get(parent_id))
                .and_then(SegmentSlot::live);
            if parent.is_some_and(|parent| parent.is_leaf) {
                trace!("Not starting {} below a leaf segment", data.name());
                return Ok(SegmentHandle::noop());
            }
            let id = segments.len();
            segments.push(SegmentSlot::Live(Segment::new(
                id,
                parent_id,
                ctx.stack_key(),
                method_call,
                data,
                relative_start,
            )));
            id
        };
        state.call_stack.push(ctx, id);
        if enabled!(Level::TRACE) {
            let name = self.with_segment(id, Segment::name).unwrap_or_default();
            trace!("Trx {}: Segment {id} started: {name}", state.guid);
        }
        Ok(SegmentHandle::new(self.clone(), id))
    }

    pub fn start_custom_segment(
        &self,
        ctx: &ExecutionContext,
        method_call: MethodCall,
        name: &str,
    ) -> Result<SegmentHandle, Error> {
        self.start_segment(
            ctx,
            method_call,
            SegmentData::Custom {
                name: name.to_string(),
            },
        )
    }

    pub fn start_method_segment(
        &self,
        ctx: &ExecutionContext,
        method_call: MethodCall,
    ) -> Result<SegmentHandle, Error> {
        let data = SegmentData::Method {
            type_name: method_call.type_name.clone(),
            method_name: method_call.method_name.clone(),
        };
        self.start_segment(ctx, method_call, data)
    }

    pub fn start_datastore_segment(
        &self,
        ctx: &ExecutionContext,
        method_call: MethodCall,
        statement: ParsedStatement,
        command_text: Option<&str>,
        connection: ConnectionInfo,
    ) -> Result<SegmentHandle, Error> {
        self.start_segment(
            ctx,
            method_call,
            SegmentData::Datastore {
                statement,
                command_text: command_text.map(str::to_string),
                connection,
            },
        )
    }

    pub fn start_external_segment(
        &self,
        ctx: &ExecutionContext,
        method_call: MethodCall,
        uri: &str,
        method: &str,
    ) -> Result<SegmentHandle, Error> {
        self.start_segment(
            ctx,
            method_call,
            SegmentData::External {
                uri: uri.to_string(),
                method: method.to_string(),
                cross_application_response: None,
            },
        )
    }

    pub fn start_message_broker_segment(
        &self,
        ctx: &ExecutionContext,
        method_call: MethodCall,
        vendor: &str,
        destination: Option<&str>,
        destination_type: DestinationType,
        action: MessageBrokerAction,
    ) -> Result<SegmentHandle, Error> {
        self.start_segment(
            ctx,
            method_call,
            SegmentData::MessageBroker {
                vendor: vendor.to_string(),
                destination: destination.map(str::to_string),
                destination_type,
                action,
            },
        )
    }

    /// The segment new segments started on `ctx` would be children of.
    #[must_use]
    pub fn current_segment(&self, ctx: &ExecutionContext) -> SegmentHandle {
        match self.inner.call_stack.current_parent_id(ctx) {
            Some(id) => SegmentHandle::new(self.clone(), id),
            None => SegmentHandle::noop(),
        }
    }

    pub(crate) fn with_segment<R>(&self, id: usize, f: impl FnOnce(&Segment) -> R) -> Option<R> {
        lock(&self.inner.segments)
            .get(id)
            .and_then(SegmentSlot::live)
            .map(f)
    }

    pub(crate) fn with_segment_mut<R>(
        &self,
        id: usize,
        f: impl FnOnce(&mut Segment) -> R,
    ) -> Option<R> {
        lock(&self.inner.segments)
            .get_mut(id)
            .and_then(SegmentSlot::live_mut)
            .map(f)
    }

    pub(crate) fn end_segment(&self, ctx: &ExecutionContext, id: usize, error: Option<&str>) {
        let state = &self.inner;
        let relative_end = state.elapsed();
        let max_segments = state.components.config.transaction_tracer_max_segments;

        let started_on = {
            let mut segments = lock(&state.segments);
            let Some(segment) = segments.get_mut(id).and_then(SegmentSlot::live_mut) else {
                return;
            };
            if segment.relative_end.is_some() {
                trace!("Segment {id} already ended");
                return;
            }
            segment.relative_end = Some(relative_end.max(segment.relative_start));
            if let Some(message) = error {
                segment.error_message = Some(message.to_string());
            }
            let started_on = segment.context_key;
            let parent_id = segment.parent_id;
            let duration = segment.duration().unwrap_or_default();

            let parent = parent_id
                .and_then(|parent_id| segments.get_mut(parent_id))
                .and_then(SegmentSlot::live_mut);
            if let Some(parent) = parent {
                if parent.context_key == ctx.stack_key() {
                    parent.child_duration += duration;
                }
            }

            if id >= max_segments {
                if let Some(slot) = segments.get_mut(id) {
                    *slot = SegmentSlot::Pruned { parent_id };
                }
            }
            started_on
        };
        if enabled!(Level::TRACE) {
            trace!(
                "Trx {}: Segment {id} ended at {relative_end:?}",
                state.guid
            );
        }
        state.call_stack.try_pop(ctx, id, started_on);
    }

    pub(crate) fn remove_segment_from_call_stack(&self, ctx: &ExecutionContext, id: usize) {
        if let Some(started_on) = self.with_segment(id, |segment| segment.context_key) {
            self.inner.call_stack.try_pop(ctx, id, started_on);
        }
    }

    /// Ends one unit of work. The transaction finishes, and is handed to the
    /// transformer, once none remain.
    pub fn end(&self, ctx: &ExecutionContext) {
        let state = &self.inner;
        let span = debug_span!("transaction", guid = %state.guid);
        let _entered = span.enter();

        if self.is_finished() {
            trace!("Transaction already ended");
            return;
        }

        self.rollup_status_code_name();
        state.capture_response_time();
        // The response is out; nothing should pick this transaction up again.
        if let Some(store) = state.store.upgrade() {
            store.remove(ctx, true, true);
        }

        let remaining = self.notice_unit_of_work_ends();
        if remaining > 0 {
            debug!("{remaining} units of work outstanding, not finishing yet");
            return;
        }

        let finalizer = &state.components.finalizer;
        if !finalizer.finish(state) {
            return;
        }
        if let Some(store) = state.store.upgrade() {
            store.release(self);
        }
        debug!("Transaction finished");
        finalizer.transform(state, false);
    }

    fn rollup_status_code_name(&self) {
        let Some(status) = self.inner.metadata.http_response_status_code() else {
            return;
        };
        if status < 400 {
            return;
        }
        let mut name = lock(&self.inner.name);
        if name.name().is_web() {
            name.try_set(
                TransactionName::web("StatusCode", &status.to_string()),
                TransactionNamePriority::StatusCode,
            );
        }
    }

    fn cat_enabled(&self) -> bool {
        let config = &self.inner.components.config;
        config.cross_application_tracing_enabled && !config.distributed_tracing_enabled
    }

    /// Records the referrer of an inbound CAT request. Only the first request
    /// is kept; later ones are reported and ignored.
    pub fn accept_cross_application_request<C: ?Sized>(
        &self,
        carrier: &C,
        getter: impl Fn(&C, &str) -> Vec<String>,
    ) -> bool {
        if !self.cat_enabled() {
            return false;
        }
        let components = &self.inner.components;
        let Some(inbound) = components.cat.try_decode_inbound_request(carrier, getter) else {
            return false;
        };

        let request = inbound.request.as_ref();
        let accepted = self.inner.metadata.try_set_cross_application_referrer(
            &inbound.referrer_process_id,
            request.map(|request| request.transaction_guid.as_str()),
            request.and_then(|request| request.trip_id.as_deref()),
            request.and_then(|request| request.path_hash.as_deref()),
            inbound.content_length,
        );
        if accepted {
            components
                .health
                .report_supportability(SupportabilityMetric::CatRequestAcceptSuccess);
        } else {
            debug!(
                "Transaction {} already has a CAT referrer, ignoring request from {}",
                self.inner.guid, inbound.referrer_process_id
            );
            components
                .health
                .report_supportability(SupportabilityMetric::CatRequestAcceptMultipleAttempts);
        }
        accepted
    }

    /// CAT headers for an outbound request.
    #[must_use]
    pub fn request_metadata(&self) -> Vec<(&'static str, String)> {
        if !self.cat_enabled() {
            return Vec::new();
        }
        let state = &self.inner;
        let path_hash = state.update_path_hash();
        let trip_id = state
            .metadata
            .cross_application_referrer_trip_id()
            .unwrap_or_else(|| state.guid.clone());
        state
            .components
            .cat
            .outbound_request_headers(&CrossApplicationRequestData {
                transaction_guid: state.guid.clone(),
                unused: false,
                trip_id: Some(trip_id),
                path_hash: Some(path_hash),
            })
    }

    /// CAT headers for the response to an accepted CAT request. Freezes the
    /// name, since the caller records it.
    #[must_use]
    pub fn response_metadata(&self) -> Vec<(&'static str, String)> {
        if !self.cat_enabled() {
            return Vec::new();
        }
        let state = &self.inner;
        if state
            .metadata
            .cross_application_referrer_process_id()
            .is_none()
        {
            trace!("No CAT referrer, not creating response headers");
            return Vec::new();
        }

        self.freeze_name(FreezeReason::CrossApplicationTracing);
        state.update_path_hash();
        let response_time = state.capture_response_time();
        let queue_time = state.metadata.queue_time().unwrap_or_default();
        let content_length = state
            .metadata
            .cross_application_referrer_content_length()
            .unwrap_or(UNKNOWN_CONTENT_LENGTH);

        let Some(response) = state.components.cat.response_data(
            state.metric_name(),
            queue_time.as_secs_f64(),
            response_time.as_secs_f64(),
            content_length,
            &state.guid,
        ) else {
            debug!("No cross process id configured, not creating CAT response headers");
            return Vec::new();
        };
        state.metadata.mark_has_cat_response_headers();
        state.components.cat.outbound_response_headers(&response)
    }

    /// Attaches decoded CAT response data to an external segment of this
    /// transaction.
    pub fn process_inbound_response<C: ?Sized>(
        &self,
        carrier: &C,
        getter: impl Fn(&C, &str) -> Vec<String>,
        segment: &SegmentHandle,
    ) {
        if !self.cat_enabled() {
            return;
        }
        let Some(id) = segment
            .id()
            .filter(|_| segment.transaction().is_some_and(|owner| owner.ptr_eq(self)))
        else {
            debug!("Segment does not belong to transaction {}", self.inner.guid);
            return;
        };
        let components = &self.inner.components;
        let Some(response) = components.cat.try_decode_inbound_response(carrier, getter) else {
            return;
        };

        let outcome = self.with_segment_mut(id, |segment| match &mut segment.data {
            SegmentData::External {
                cross_application_response: existing @ None,
                ..
            } => {
                *existing = Some(response);
                true
            }
            SegmentData::External { .. } => false,
            _ => {
                debug!("Segment {id} is not an external segment, ignoring CAT response");
                true
            }
        });
        if outcome == Some(false) {
            debug!("Segment {id} already has a CAT response");
            components
                .health
                .report_supportability(SupportabilityMetric::CatResponseAcceptMultipleAttempts);
        }
    }

    /// Accepts inbound distributed trace headers. Ignored when a trace was
    /// already accepted or outbound headers were already created.
    pub fn accept_distributed_trace_headers<C: ?Sized>(
        &self,
        carrier: &C,
        getter: impl Fn(&C, &str) -> Vec<String>,
        transport_type: TransportType,
    ) -> bool {
        let state = &self.inner;
        let components = &state.components;
        if !components.config.distributed_tracing_enabled {
            return false;
        }

        if lock(&state.tracing_state).is_some() {
            self.ignore_multiple_accepts();
            return false;
        }
        if state.metadata.has_outgoing_trace_headers() {
            debug!(
                "Transaction {} created outbound headers before accepting",
                state.guid
            );
            components.health.report_supportability(
                SupportabilityMetric::DistributedTraceAcceptIgnoredCreateBeforeAccept,
            );
            return false;
        }

        // Decoding reports to the health reporter, so no lock is held here.
        let Some(accepted) =
            components
                .dt
                .accept(carrier, getter, transport_type, state.now_unix_ms())
        else {
            return false;
        };
        let sampled = accepted.sampled.filter(|_| accepted.priority.is_some());
        {
            let mut tracing_state = lock(&state.tracing_state);
            if tracing_state.is_some() {
                drop(tracing_state);
                self.ignore_multiple_accepts();
                return false;
            }
            *tracing_state = Some(accepted);
        }
        if let Some(sampled) = sampled {
            // A decision already read locally stays in force.
            let _ = state.sampled.set(sampled);
        }
        true
    }

    fn ignore_multiple_accepts(&self) {
        debug!(
            "Transaction {} already accepted a distributed trace",
            self.inner.guid
        );
        self.inner
            .components
            .health
            .report_supportability(SupportabilityMetric::DistributedTraceAcceptIgnoredMultiple);
    }

    /// Writes outbound distributed trace headers through `setter`.
    pub fn insert_distributed_trace_headers<C: ?Sized>(
        &self,
        ctx: &ExecutionContext,
        carrier: &mut C,
        mut setter: impl FnMut(&mut C, &str, String),
    ) {
        let state = &self.inner;
        let config = &state.components.config;
        if !config.distributed_tracing_enabled {
            return;
        }

        let span_id = if config.span_events_enabled {
            self.current_segment(ctx).span_id()
        } else {
            None
        };
        let transaction_id = config
            .transaction_events_enabled
            .then(|| state.guid.clone());
        let vendor_state_entries = lock(&state.tracing_state)
            .as_ref()
            .map(|tracing| tracing.vendor_state_entries.clone())
            .unwrap_or_default();
        let trace_id = state.trace_id();

        let headers = state.components.dt.create_headers(&OutboundTraceContext {
            trace_id: &trace_id,
            span_id: span_id.as_deref(),
            transaction_id: transaction_id.as_deref(),
            sampled: state.sampled(),
            priority: state.priority(),
            timestamp_ms: state.now_unix_ms(),
            vendor_state_entries: &vendor_state_entries,
        });
        state.metadata.mark_has_outgoing_trace_headers();
        for (key, value) in headers {
            setter(carrier, key, value);
        }
    }

    /// Makes this transaction visible from the async flow of `ctx`, with the
    /// call stack of the thread it was attached from.
    pub fn attach_to_async(&self, ctx: &ExecutionContext) -> bool {
        let Some(store) = self.inner.store.upgrade() else {
            return false;
        };
        if !store.set_async(ctx, self.clone()) {
            debug!(
                "Transaction {} could not be attached to async storage",
                self.inner.guid
            );
            return false;
        }
        self.inner.call_stack.attach_to_async(ctx);
        true
    }

    /// Stops the thread of `ctx` from seeing this transaction.
    pub fn detach_from_primary(&self, ctx: &ExecutionContext) {
        if let Some(store) = self.inner.store.upgrade() {
            store.remove(ctx, false, true);
        }
    }
}

fn validate_segment_data(data: &mut SegmentData) -> Result<(), Error> {
    match data {
        SegmentData::Custom { name } | SegmentData::Simple { name } => {
            require_non_empty("name", name)?;
            *name = clamp_name(name.trim());
        }
        SegmentData::Datastore { statement, .. } => {
            require_non_empty("vendor", &statement.vendor)?;
            require_non_empty("operation", &statement.operation)?;
        }
        SegmentData::External { uri, method, .. } => {
            require_non_empty("uri", uri)?;
            require_non_empty("method", method)?;
        }
        SegmentData::MessageBroker { vendor, .. } => {
            require_non_empty("vendor", vendor)?;
        }
        SegmentData::Method {
            type_name,
            method_name,
        } => {
            require_non_empty("type_name", type_name)?;
            require_non_empty("method_name", method_name)?;
        }
    }
    Ok(())
}
