// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Operator-facing health signals emitted by the engine.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

pub const TRANSACTION_GARBAGE_COLLECTED: &str =
    "Supportability/AgentHealthEvent/TransactionGarbageCollected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupportabilityMetric {
    CatRequestAcceptSuccess,
    CatRequestAcceptMultipleAttempts,
    CatRequestAcceptUnableToDecode,
    CatRequestAcceptNotTrusted,
    CatRequestCreateSuccess,
    CatRequestCreateMissingCrossProcessId,
    CatResponseCreateSuccess,
    CatResponseAcceptSuccess,
    CatResponseAcceptMultipleAttempts,
    CatResponseAcceptUnableToDecode,
    CatResponseAcceptNotTrusted,
    DistributedTraceAcceptSuccess,
    DistributedTraceAcceptParseException,
    DistributedTraceAcceptIgnoredNull,
    DistributedTraceAcceptIgnoredMajorVersion,
    DistributedTraceAcceptIgnoredUntrustedAccount,
    DistributedTraceAcceptIgnoredMultiple,
    DistributedTraceAcceptIgnoredCreateBeforeAccept,
    DistributedTraceCreateSuccess,
    DistributedTraceCreateException,
    TraceContextAcceptSuccess,
    TraceContextAcceptException,
    TraceContextCreateSuccess,
    TraceContextTraceStateNoNrEntry,
}

impl SupportabilityMetric {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            SupportabilityMetric::CatRequestAcceptSuccess => {
                "Supportability/CrossApplicationTracing/Request/Accept/Success"
            }
            SupportabilityMetric::CatRequestAcceptMultipleAttempts => {
                "Supportability/CrossApplicationTracing/Request/Accept/Warning/MultipleAttempts"
            }
            SupportabilityMetric::CatRequestAcceptUnableToDecode => {
                "Supportability/CrossApplicationTracing/Request/Accept/Ignored/UnableToDecode"
            }
            SupportabilityMetric::CatRequestAcceptNotTrusted => {
                "Supportability/CrossApplicationTracing/Request/Accept/Ignored/NotTrusted"
            }
            SupportabilityMetric::CatRequestCreateSuccess => {
                "Supportability/CrossApplicationTracing/Request/Create/Success"
            }
            SupportabilityMetric::CatRequestCreateMissingCrossProcessId => {
                "Supportability/CrossApplicationTracing/Request/Create/Exception/CrossProcessID"
            }
            SupportabilityMetric::CatResponseCreateSuccess => {
                "Supportability/CrossApplicationTracing/Response/Create/Success"
            }
            SupportabilityMetric::CatResponseAcceptSuccess => {
                "Supportability/CrossApplicationTracing/Response/Accept/Success"
            }
            SupportabilityMetric::CatResponseAcceptMultipleAttempts => {
                "Supportability/CrossApplicationTracing/Response/Accept/Ignored/MultipleAttempts"
            }
            SupportabilityMetric::CatResponseAcceptUnableToDecode => {
                "Supportability/CrossApplicationTracing/Response/Accept/Ignored/UnableToDecode"
            }
            SupportabilityMetric::CatResponseAcceptNotTrusted => {
                "Supportability/CrossApplicationTracing/Response/Accept/Ignored/NotTrusted"
            }
            SupportabilityMetric::DistributedTraceAcceptSuccess => {
                "Supportability/DistributedTrace/AcceptPayload/Success"
            }
            SupportabilityMetric::DistributedTraceAcceptParseException => {
                "Supportability/DistributedTrace/AcceptPayload/ParseException"
            }
            SupportabilityMetric::DistributedTraceAcceptIgnoredNull => {
                "Supportability/DistributedTrace/AcceptPayload/Ignored/Null"
            }
            SupportabilityMetric::DistributedTraceAcceptIgnoredMajorVersion => {
                "Supportability/DistributedTrace/AcceptPayload/Ignored/MajorVersion"
            }
            SupportabilityMetric::DistributedTraceAcceptIgnoredUntrustedAccount => {
                "Supportability/DistributedTrace/AcceptPayload/Ignored/UntrustedAccount"
            }
            SupportabilityMetric::DistributedTraceAcceptIgnoredMultiple => {
                "Supportability/DistributedTrace/AcceptPayload/Ignored/Multiple"
            }
            SupportabilityMetric::DistributedTraceAcceptIgnoredCreateBeforeAccept => {
                "Supportability/DistributedTrace/AcceptPayload/Ignored/CreateBeforeAccept"
            }
            SupportabilityMetric::DistributedTraceCreateSuccess => {
                "Supportability/DistributedTrace/CreatePayload/Success"
            }
            SupportabilityMetric::DistributedTraceCreateException => {
                "Supportability/DistributedTrace/CreatePayload/Exception"
            }
            SupportabilityMetric::TraceContextAcceptSuccess => {
                "Supportability/TraceContext/Accept/Success"
            }
            SupportabilityMetric::TraceContextAcceptException => {
                "Supportability/TraceContext/Accept/Exception"
            }
            SupportabilityMetric::TraceContextCreateSuccess => {
                "Supportability/TraceContext/Create/Success"
            }
            SupportabilityMetric::TraceContextTraceStateNoNrEntry => {
                "Supportability/TraceContext/TraceState/NoNrEntry"
            }
        }
    }
}

pub trait HealthReporter: Send + Sync {
    /// An unfinished transaction lost its last owner.
    fn report_transaction_garbage_collected(
        &self,
        transaction_name: &str,
        last_started_segment: &str,
        last_finished_segment: &str,
    );

    fn report_supportability(&self, metric: SupportabilityMetric);
}

/// Keeps named counters in memory until they are drained by a harvest.
#[derive(Debug, Default)]
pub struct AgentHealthReporter {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl AgentHealthReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<&'static str, u64>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn increment(&self, name: &'static str) {
        *self.lock().entry(name).or_insert(0) += 1;
    }

    #[must_use]
    pub fn count(&self, name: &str) -> u64 {
        self.lock().get(name).copied().unwrap_or(0)
    }

    /// Returns the counters and resets them.
    pub fn drain(&self) -> HashMap<&'static str, u64> {
        std::mem::take(&mut *self.lock())
    }
}

impl HealthReporter for AgentHealthReporter {
    fn report_transaction_garbage_collected(
        &self,
        transaction_name: &str,
        last_started_segment: &str,
        last_finished_segment: &str,
    ) {
        debug!(
            "Transaction was garbage collected without ever ending.\nTransaction Name: {transaction_name}\nLast Started Segment: {last_started_segment}\nLast Finished Segment: {last_finished_segment}"
        );
        self.increment(TRANSACTION_GARBAGE_COLLECTED);
    }

    fn report_supportability(&self, metric: SupportabilityMetric) {
        self.increment(metric.name());
    }
}
