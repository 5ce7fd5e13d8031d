// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Finishing transactions, on the clean path and when abandoned.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::config::Config;
use crate::health::HealthReporter;
use crate::snapshot::ImmutableTransaction;
use crate::transaction::TransactionState;
use crate::transform::TransactionTransformer;

/// Duration given to an abandoned transaction without any segment.
const MIN_ABANDONED_DURATION: Duration = Duration::from_millis(1);
const UNKNOWN_SEGMENT: &str = "<unknown>";

pub(crate) struct TransactionFinalizer {
    config: Arc<Config>,
    health: Arc<dyn HealthReporter>,
    transformer: Arc<dyn TransactionTransformer>,
}

impl TransactionFinalizer {
    pub(crate) fn new(
        config: Arc<Config>,
        health: Arc<dyn HealthReporter>,
        transformer: Arc<dyn TransactionTransformer>,
    ) -> Self {
        TransactionFinalizer {
            config,
            health,
            transformer,
        }
    }

    /// Returns `true` exactly once per transaction.
    pub(crate) fn finish(&self, state: &TransactionState) -> bool {
        if !state.finish() {
            return false;
        }
        state.update_path_hash();
        true
    }

    /// Runs when the last handle to an unfinished transaction is dropped.
    ///
    /// The duration is estimated from the segments recorded so far: the later
    /// of the end of the last finished segment and the start of the last
    /// started one.
    pub(crate) fn on_transaction_abandoned(&self, state: &TransactionState) {
        let timings = state.segment_timings();
        let last_started = timings.iter().max_by_key(|timing| timing.relative_start);
        let last_finished = timings
            .iter()
            .max_by_key(|timing| timing.calculated_relative_end);

        let estimated = match (last_started, last_finished) {
            (Some(started), Some(finished)) => started
                .calculated_relative_end
                .max(finished.calculated_relative_end),
            _ => MIN_ABANDONED_DURATION,
        };
        state.force_change_duration(estimated);

        if self.finish(state) {
            debug!(
                "Transaction {} abandoned, finishing with an estimated duration of {estimated:?}",
                state.guid
            );
            self.transform(state, true);
        }

        self.health.report_transaction_garbage_collected(
            &state.metric_name(),
            last_started.map_or(UNKNOWN_SEGMENT, |timing| timing.name.as_str()),
            last_finished.map_or(UNKNOWN_SEGMENT, |timing| timing.name.as_str()),
        );
    }

    /// Hands a finished transaction to the transformer. Ignored transactions
    /// are dropped here.
    pub(crate) fn transform(&self, state: &TransactionState, abandoned: bool) {
        if state.is_ignored() {
            debug!("Transaction {} is ignored, not transforming", state.guid);
            return;
        }
        let snapshot = state.to_immutable(abandoned);
        let transformer = Arc::clone(&self.transformer);

        if !self.config.complete_transactions_on_thread {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                drop(handle.spawn_blocking(move || run_transformer(transformer.as_ref(), snapshot)));
                return;
            }
            debug!("No tokio runtime available, transforming on the current thread");
        }
        run_transformer(transformer.as_ref(), snapshot);
    }
}

fn run_transformer(
    transformer: &dyn TransactionTransformer,
    snapshot: ImmutableTransaction,
) {
    let guid = snapshot.guid.clone();
    if catch_unwind(AssertUnwindSafe(|| transformer.transform(snapshot))).is_err() {
        error!("Transaction transformer panicked on transaction {guid}");
    }
}
