// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recording implementations of the engine's output seams

use std::sync::Mutex;

use transaction_engine::health::{AgentHealthReporter, HealthReporter, SupportabilityMetric};
use transaction_engine::{ImmutableTransaction, TransactionTransformer};

/// Keeps every transformed transaction
#[derive(Default)]
pub struct RecordingTransformer {
    transactions: Mutex<Vec<ImmutableTransaction>>,
}

impl RecordingTransformer {
    pub fn take(&self) -> Vec<ImmutableTransaction> {
        std::mem::take(&mut *self.transactions.lock().unwrap())
    }
}

impl TransactionTransformer for RecordingTransformer {
    fn transform(&self, transaction: ImmutableTransaction) {
        self.transactions.lock().unwrap().push(transaction);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GarbageCollectedEvent {
    pub transaction_name: String,
    pub last_started_segment: String,
    pub last_finished_segment: String,
}

/// Counts supportability metrics like the agent reporter and keeps the
/// garbage collected events it receives.
#[derive(Default)]
pub struct RecordingHealthReporter {
    pub counters: AgentHealthReporter,
    events: Mutex<Vec<GarbageCollectedEvent>>,
}

impl RecordingHealthReporter {
    pub fn garbage_collected(&self) -> Vec<GarbageCollectedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, metric: SupportabilityMetric) -> u64 {
        self.counters.count(metric.name())
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn report_transaction_garbage_collected(
        &self,
        transaction_name: &str,
        last_started_segment: &str,
        last_finished_segment: &str,
    ) {
        self.counters.report_transaction_garbage_collected(
            transaction_name,
            last_started_segment,
            last_finished_segment,
        );
        self.events.lock().unwrap().push(GarbageCollectedEvent {
            transaction_name: transaction_name.to_string(),
            last_started_segment: last_started_segment.to_string(),
            last_finished_segment: last_finished_segment.to_string(),
        });
    }

    fn report_supportability(&self, metric: SupportabilityMetric) {
        self.counters.report_supportability(metric);
    }
}
