// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for building services under test

use std::sync::Arc;

use transaction_engine::clock::ManualClock;
use transaction_engine::config::Config;
use transaction_engine::{MethodCall, TransactionService};

use super::mocks::{RecordingHealthReporter, RecordingTransformer};

pub struct Harness {
    pub service: TransactionService,
    pub clock: Arc<ManualClock>,
    pub transformer: Arc<RecordingTransformer>,
    pub health: Arc<RecordingHealthReporter>,
}

/// Service with a manual clock and recording seams
pub fn harness(config: Config) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let transformer = Arc::new(RecordingTransformer::default());
    let health = Arc::new(RecordingHealthReporter::default());
    let service = TransactionService::builder(config)
        .clock(clock.clone())
        .transformer(transformer.clone())
        .health(health.clone())
        .build();
    Harness {
        service,
        clock,
        transformer,
        health,
    }
}

#[allow(dead_code)]
pub fn dt_config(account_id: &str, app_id: &str) -> Config {
    Config {
        distributed_tracing_enabled: true,
        account_id: Some(account_id.to_string()),
        primary_application_id: Some(app_id.to_string()),
        trusted_account_key: Some(account_id.to_string()),
        ..Config::default()
    }
}

pub fn call(type_name: &str, method_name: &str) -> MethodCall {
    MethodCall::new(type_name, method_name, None).unwrap()
}
