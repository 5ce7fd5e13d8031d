// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;

use thiserror::Error;

const DEFAULT_APP_NAME: &str = "My Application";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_MAX_SEGMENTS: usize = 3000;
const DEFAULT_SAMPLING_RATIO: f32 = 0.5;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{key} has an invalid value `{value}`: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub log_level: String,
    pub cross_application_tracing_enabled: bool,
    pub distributed_tracing_enabled: bool,
    /// `accountId#appId` of this process, announced in CAT headers.
    pub cross_process_id: Option<String>,
    /// Key used to obfuscate CAT header payloads. Plain base64 when unset.
    pub encoding_key: Option<String>,
    /// Accounts allowed to send CAT requests. Empty trusts every account.
    pub trusted_account_ids: Vec<u64>,
    pub trusted_account_key: Option<String>,
    pub account_id: Option<String>,
    pub primary_application_id: Option<String>,
    pub span_events_enabled: bool,
    pub transaction_events_enabled: bool,
    pub exclude_newrelic_header: bool,
    pub payload_success_metrics_enabled: bool,
    pub transaction_tracer_max_segments: usize,
    /// Fraction of transactions marked as sampled, in `[0, 1]`.
    pub sampling_ratio: f32,
    pub complete_transactions_on_thread: bool,
    pub high_security_mode_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_name: DEFAULT_APP_NAME.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            cross_application_tracing_enabled: true,
            distributed_tracing_enabled: false,
            cross_process_id: None,
            encoding_key: None,
            trusted_account_ids: Vec::new(),
            trusted_account_key: None,
            account_id: None,
            primary_application_id: None,
            span_events_enabled: true,
            transaction_events_enabled: true,
            exclude_newrelic_header: false,
            payload_success_metrics_enabled: true,
            transaction_tracer_max_segments: DEFAULT_MAX_SEGMENTS,
            sampling_ratio: DEFAULT_SAMPLING_RATIO,
            complete_transactions_on_thread: true,
            high_security_mode_enabled: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let transaction_tracer_max_segments = match env::var("APM_TRANSACTION_TRACER_MAX_SEGMENTS")
        {
            Ok(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "APM_TRANSACTION_TRACER_MAX_SEGMENTS",
                    value,
                    reason: "expected a non-negative integer",
                })?,
            Err(_) => defaults.transaction_tracer_max_segments,
        };

        let sampling_ratio = match env::var("APM_SAMPLING_RATIO") {
            Ok(value) => match value.trim().parse::<f32>() {
                Ok(ratio) if (0.0..=1.0).contains(&ratio) => ratio,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "APM_SAMPLING_RATIO",
                        value,
                        reason: "expected a number between 0 and 1",
                    })
                }
            },
            Err(_) => defaults.sampling_ratio,
        };

        let trusted_account_ids = env::var("APM_TRUSTED_ACCOUNT_IDS")
            .map(|ids| {
                ids.split(',')
                    .filter_map(|id| id.trim().parse::<u64>().ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            app_name: env::var("APM_APP_NAME").unwrap_or(defaults.app_name),
            log_level: env::var("APM_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            cross_application_tracing_enabled: env_bool(
                "APM_CROSS_APPLICATION_TRACING_ENABLED",
                defaults.cross_application_tracing_enabled,
            ),
            distributed_tracing_enabled: env_bool(
                "APM_DISTRIBUTED_TRACING_ENABLED",
                defaults.distributed_tracing_enabled,
            ),
            cross_process_id: env_string("APM_CROSS_PROCESS_ID"),
            encoding_key: env_string("APM_ENCODING_KEY"),
            trusted_account_ids,
            trusted_account_key: env_string("APM_TRUSTED_ACCOUNT_KEY"),
            account_id: env_string("APM_ACCOUNT_ID"),
            primary_application_id: env_string("APM_PRIMARY_APPLICATION_ID"),
            span_events_enabled: env_bool("APM_SPAN_EVENTS_ENABLED", defaults.span_events_enabled),
            transaction_events_enabled: env_bool(
                "APM_TRANSACTION_EVENTS_ENABLED",
                defaults.transaction_events_enabled,
            ),
            exclude_newrelic_header: env_bool(
                "APM_EXCLUDE_NEWRELIC_HEADER",
                defaults.exclude_newrelic_header,
            ),
            payload_success_metrics_enabled: env_bool(
                "APM_PAYLOAD_SUCCESS_METRICS_ENABLED",
                defaults.payload_success_metrics_enabled,
            ),
            transaction_tracer_max_segments,
            sampling_ratio,
            complete_transactions_on_thread: env_bool(
                "APM_COMPLETE_TRANSACTIONS_ON_THREAD",
                defaults.complete_transactions_on_thread,
            ),
            high_security_mode_enabled: env_bool(
                "APM_HIGH_SECURITY",
                defaults.high_security_mode_enabled,
            ),
        })
    }

    /// Key compared against inbound DT payloads. Falls back to the account id.
    #[must_use]
    pub fn trust_key(&self) -> Option<&str> {
        self.trusted_account_key
            .as_deref()
            .or(self.account_id.as_deref())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| match value.trim().to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}
