// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Distributed tracing headers.
//!
//! Outbound requests carry W3C trace context (`traceparent` and `tracestate`,
//! whose first entry is `{trustKey}@nr=...`) plus, unless excluded, the
//! base64 JSON `newrelic` payload. Inbound, a valid `traceparent` wins; the
//! `newrelic` payload is only consulted without one.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::health::{HealthReporter, SupportabilityMetric};
use crate::ids::{format_trace_id_for_w3c, generate_guid};
use crate::priority::{format_priority, inbound_priority};
use crate::propagation::error::Error;

pub const NEWRELIC_HEADER: &str = "newrelic";
pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

const PAYLOAD_MAJOR_VERSION: u32 = 0;
const PAYLOAD_MINOR_VERSION: u32 = 1;
const TRACESTATE_VERSION: u32 = 0;
/// `tracestate` allows 32 entries; one of them is ours.
const MAX_VENDOR_ENTRIES: usize = 31;

lazy_static! {
    static ref TRACEPARENT_REGEX: Regex =
        Regex::new(r"(?i)^([a-f0-9]{2})-([a-f0-9]{32})-([a-f0-9]{16})-([a-f0-9]{2})(-.*)?$")
            .expect("failed creating regex");
    static ref INVALID_SEGMENT_REGEX: Regex = Regex::new(r"^0+$").expect("failed creating regex");
    static ref INVALID_ASCII_CHARACTERS_REGEX: Regex =
        Regex::new(r"[^\x20-\x7E]+").expect("failed creating regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportType {
    Unknown,
    Http,
    Https,
    Kafka,
    Jms,
    IronMq,
    Amqp,
    Queue,
    Other,
}

impl TransportType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Unknown => "Unknown",
            TransportType::Http => "HTTP",
            TransportType::Https => "HTTPS",
            TransportType::Kafka => "Kafka",
            TransportType::Jms => "JMS",
            TransportType::IronMq => "IronMQ",
            TransportType::Amqp => "AMQP",
            TransportType::Queue => "Queue",
            TransportType::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParentType {
    App,
    Browser,
    Mobile,
}

impl ParentType {
    fn from_payload(value: &str) -> Option<Self> {
        match value {
            "App" => Some(ParentType::App),
            "Browser" => Some(ParentType::Browser),
            "Mobile" => Some(ParentType::Mobile),
            _ => None,
        }
    }

    fn from_tracestate(value: &str) -> Option<Self> {
        match value {
            "0" => Some(ParentType::App),
            "1" => Some(ParentType::Browser),
            "2" => Some(ParentType::Mobile),
            _ => None,
        }
    }
}

/// Tracing metadata accepted from an upstream caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracingState {
    pub trace_id: String,
    /// Span id of the caller, used as the parent of this transaction.
    pub parent_id: Option<String>,
    pub transaction_id: Option<String>,
    pub sampled: Option<bool>,
    pub priority: Option<f32>,
    pub timestamp_ms: Option<u64>,
    pub parent_type: Option<ParentType>,
    pub parent_account_id: Option<String>,
    pub parent_app_id: Option<String>,
    pub transport_type: TransportType,
    pub transport_duration: Option<Duration>,
    /// Other vendors' `tracestate` entries, forwarded unchanged.
    pub vendor_state_entries: Vec<String>,
    pub from_trace_context: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedTracePayload {
    pub v: Vec<u32>,
    pub d: PayloadData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadData {
    pub ty: String,
    pub ac: String,
    pub ap: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx: Option<String>,
    pub tr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sa: Option<bool>,
    pub ti: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tk: Option<String>,
}

impl DistributedTracePayload {
    /// Accepts both base64 encoded and raw JSON payloads.
    pub fn decode(encoded: &str) -> Result<Self, Error> {
        let trimmed = encoded.trim();
        let json = if trimmed.starts_with('{') {
            trimmed.to_string()
        } else {
            let bytes = BASE64_STANDARD
                .decode(trimmed)
                .map_err(|_| Error::decode("invalid base64", NEWRELIC_HEADER))?;
            String::from_utf8(bytes).map_err(|_| Error::decode("invalid utf-8", NEWRELIC_HEADER))?
        };
        serde_json::from_str(&json).map_err(|_| Error::decode("invalid payload json", NEWRELIC_HEADER))
    }

    pub fn encode(&self) -> Result<String, Error> {
        let json = serde_json::to_string(self)
            .map_err(|_| Error::encode("payload serialization failed", NEWRELIC_HEADER))?;
        Ok(BASE64_STANDARD.encode(json))
    }
}

/// Everything needed to build outbound headers.
#[derive(Debug, Clone)]
pub struct OutboundTraceContext<'a> {
    pub trace_id: &'a str,
    pub span_id: Option<&'a str>,
    pub transaction_id: Option<&'a str>,
    pub sampled: bool,
    pub priority: f32,
    pub timestamp_ms: u64,
    pub vendor_state_entries: &'a [String],
}

struct Traceparent {
    trace_id: String,
    parent_id: String,
}

#[derive(Debug, PartialEq)]
struct NrTraceStateEntry {
    parent_type: ParentType,
    account_id: String,
    app_id: String,
    transaction_id: Option<String>,
    sampled: Option<bool>,
    priority: Option<f32>,
    timestamp_ms: u64,
}

pub struct DistributedTraceHandler {
    config: Arc<Config>,
    health: Arc<dyn HealthReporter>,
}

impl DistributedTraceHandler {
    #[must_use]
    pub fn new(config: Arc<Config>, health: Arc<dyn HealthReporter>) -> Self {
        DistributedTraceHandler { config, health }
    }

    fn report(&self, metric: SupportabilityMetric) {
        self.health.report_supportability(metric);
    }

    /// Decodes inbound tracing headers. Never fails: headers that are absent,
    /// malformed or untrusted yield `None` and a supportability metric.
    pub fn accept<C: ?Sized>(
        &self,
        carrier: &C,
        getter: impl Fn(&C, &str) -> Vec<String>,
        transport_type: TransportType,
        now_ms: u64,
    ) -> Option<TracingState> {
        let traceparents = getter(carrier, TRACEPARENT_HEADER);
        if !traceparents.is_empty() {
            let parsed = match traceparents.as_slice() {
                [single] => Self::parse_traceparent(single),
                _ => Err(Error::decode("multiple traceparent headers", TRACEPARENT_HEADER)),
            };
            match parsed {
                Ok(traceparent) => {
                    self.report(SupportabilityMetric::TraceContextAcceptSuccess);
                    let tracestate = getter(carrier, TRACESTATE_HEADER);
                    return Some(self.from_trace_context(traceparent, &tracestate, transport_type, now_ms));
                }
                Err(e) => {
                    debug!("{e}");
                    self.report(SupportabilityMetric::TraceContextAcceptException);
                }
            }
        }

        let payload = getter(carrier, NEWRELIC_HEADER).into_iter().next()?;
        self.accept_payload(&payload, transport_type, now_ms)
    }

    fn from_trace_context(
        &self,
        traceparent: Traceparent,
        tracestate: &[String],
        transport_type: TransportType,
        now_ms: u64,
    ) -> TracingState {
        let (entry, vendor_state_entries) = self.parse_tracestate(tracestate);
        if entry.is_none() {
            self.report(SupportabilityMetric::TraceContextTraceStateNoNrEntry);
        }

        let mut state = TracingState {
            trace_id: traceparent.trace_id,
            parent_id: Some(traceparent.parent_id),
            transaction_id: None,
            sampled: None,
            priority: None,
            timestamp_ms: None,
            parent_type: None,
            parent_account_id: None,
            parent_app_id: None,
            transport_type,
            transport_duration: None,
            vendor_state_entries,
            from_trace_context: true,
        };
        if let Some(entry) = entry {
            state.transaction_id = entry.transaction_id;
            state.sampled = entry.sampled;
            state.priority = entry.priority;
            state.timestamp_ms = Some(entry.timestamp_ms);
            state.transport_duration = transport_duration(entry.timestamp_ms, now_ms);
            state.parent_type = Some(entry.parent_type);
            state.parent_account_id = Some(entry.account_id);
            state.parent_app_id = Some(entry.app_id);
        }
        state
    }

    fn accept_payload(
        &self,
        payload: &str,
        transport_type: TransportType,
        now_ms: u64,
    ) -> Option<TracingState> {
        if payload.trim().is_empty() {
            self.report(SupportabilityMetric::DistributedTraceAcceptIgnoredNull);
            return None;
        }

        let payload = match DistributedTracePayload::decode(payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("{e}");
                self.report(SupportabilityMetric::DistributedTraceAcceptParseException);
                return None;
            }
        };

        match payload.v.first() {
            Some(major) if *major > PAYLOAD_MAJOR_VERSION => {
                debug!("Ignoring distributed trace payload with major version {major}");
                self.report(SupportabilityMetric::DistributedTraceAcceptIgnoredMajorVersion);
                return None;
            }
            Some(_) => {}
            None => {
                debug!("Ignoring distributed trace payload without a version");
                self.report(SupportabilityMetric::DistributedTraceAcceptParseException);
                return None;
            }
        }

        let data = payload.d;
        if data.id.is_none() && data.tx.is_none() {
            debug!("Ignoring distributed trace payload with neither a guid nor a transaction id");
            self.report(SupportabilityMetric::DistributedTraceAcceptParseException);
            return None;
        }

        let inbound_key = data.tk.as_deref().unwrap_or(&data.ac);
        if self.config.trust_key() != Some(inbound_key) {
            debug!("Ignoring distributed trace payload from untrusted account {inbound_key}");
            self.report(SupportabilityMetric::DistributedTraceAcceptIgnoredUntrustedAccount);
            return None;
        }

        if self.config.payload_success_metrics_enabled {
            self.report(SupportabilityMetric::DistributedTraceAcceptSuccess);
        }

        Some(TracingState {
            trace_id: data.tr,
            parent_id: data.id,
            transaction_id: data.tx,
            sampled: data.sa,
            priority: data.pr.and_then(inbound_priority),
            timestamp_ms: Some(data.ti),
            parent_type: ParentType::from_payload(&data.ty),
            parent_account_id: Some(data.ac),
            parent_app_id: Some(data.ap),
            transport_type,
            transport_duration: transport_duration(data.ti, now_ms),
            vendor_state_entries: Vec::new(),
            from_trace_context: false,
        })
    }

    fn parse_traceparent(traceparent: &str) -> Result<Traceparent, Error> {
        let captures = TRACEPARENT_REGEX
            .captures(traceparent.trim())
            .ok_or(Error::decode("invalid traceparent", TRACEPARENT_HEADER))?;

        let version = &captures[1];
        let trace_id = &captures[2];
        let parent_id = &captures[3];
        let flags = &captures[4];
        let tail = captures.get(5).map_or("", |m| m.as_str());

        if version.eq_ignore_ascii_case("ff") {
            return Err(Error::decode("`ff` is an invalid traceparent version", TRACEPARENT_HEADER));
        }
        if version == "00" && !tail.is_empty() {
            return Err(Error::decode(
                "traceparent with version `00` should contain only 4 values delimited by `-`",
                TRACEPARENT_HEADER,
            ));
        }
        if INVALID_SEGMENT_REGEX.is_match(trace_id) {
            return Err(Error::decode("`0` value for trace_id is invalid", TRACEPARENT_HEADER));
        }
        if INVALID_SEGMENT_REGEX.is_match(parent_id) {
            return Err(Error::decode("`0` value for parent_id is invalid", TRACEPARENT_HEADER));
        }
        u8::from_str_radix(flags, 16)
            .map_err(|_| Error::decode("failed to decode trace flags", TRACEPARENT_HEADER))?;

        Ok(Traceparent {
            trace_id: trace_id.to_lowercase(),
            parent_id: parent_id.to_lowercase(),
        })
    }

    /// Splits `tracestate` into our trusted entry and everybody else's.
    fn parse_tracestate(&self, values: &[String]) -> (Option<NrTraceStateEntry>, Vec<String>) {
        let joined = values.join(",");
        if INVALID_ASCII_CHARACTERS_REGEX.is_match(&joined) {
            debug!("Received invalid tracestate header {joined}");
            return (None, Vec::new());
        }

        let our_key = self.config.trust_key().map(|key| format!("{key}@nr"));
        let mut entry = None;
        let mut vendors = Vec::new();
        for item in joined.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            if our_key.as_deref() == Some(key.trim()) {
                if entry.is_none() {
                    match parse_nr_entry(value.trim()) {
                        Ok(parsed) => entry = Some(parsed),
                        Err(e) => debug!("{e}"),
                    }
                }
                continue;
            }
            if vendors.len() < MAX_VENDOR_ENTRIES {
                vendors.push(item.to_string());
            }
        }
        (entry, vendors)
    }

    /// Builds outbound headers. Without an account id, application id and
    /// trust key only `traceparent` can be produced.
    #[must_use]
    pub fn create_headers(&self, outbound: &OutboundTraceContext<'_>) -> Vec<(&'static str, String)> {
        let parent_id = outbound
            .span_id
            .map_or_else(generate_guid, str::to_string);
        let mut headers = vec![(
            TRACEPARENT_HEADER,
            format!(
                "00-{}-{parent_id}-{}",
                format_trace_id_for_w3c(outbound.trace_id),
                if outbound.sampled { "01" } else { "00" }
            ),
        )];
        self.report(SupportabilityMetric::TraceContextCreateSuccess);

        let (Some(account_id), Some(app_id), Some(trust_key)) = (
            self.config.account_id.as_deref(),
            self.config.primary_application_id.as_deref(),
            self.config.trust_key(),
        ) else {
            debug!("Account id, application id or trust key missing, only creating traceparent");
            self.report(SupportabilityMetric::DistributedTraceCreateException);
            return headers;
        };

        let our_prefix = format!("{trust_key}@nr=");
        let nr_entry = format!(
            "{our_prefix}{TRACESTATE_VERSION}-0-{account_id}-{app_id}-{}-{}-{}-{}-{}",
            outbound.span_id.unwrap_or_default(),
            outbound.transaction_id.unwrap_or_default(),
            u8::from(outbound.sampled),
            format_priority(outbound.priority),
            outbound.timestamp_ms
        );
        let tracestate = std::iter::once(nr_entry)
            .chain(
                outbound
                    .vendor_state_entries
                    .iter()
                    .filter(|entry| !entry.starts_with(&our_prefix))
                    .take(MAX_VENDOR_ENTRIES)
                    .cloned(),
            )
            .collect::<Vec<_>>()
            .join(",");
        headers.push((TRACESTATE_HEADER, tracestate));

        if self.config.exclude_newrelic_header {
            return headers;
        }
        let payload = DistributedTracePayload {
            v: vec![PAYLOAD_MAJOR_VERSION, PAYLOAD_MINOR_VERSION],
            d: PayloadData {
                ty: "App".to_string(),
                ac: account_id.to_string(),
                ap: app_id.to_string(),
                id: outbound.span_id.map(str::to_string),
                tx: outbound.transaction_id.map(str::to_string),
                tr: outbound.trace_id.to_string(),
                pr: Some(outbound.priority),
                sa: Some(outbound.sampled),
                ti: outbound.timestamp_ms,
                tk: (trust_key != account_id).then(|| trust_key.to_string()),
            },
        };
        match payload.encode() {
            Ok(encoded) => {
                headers.push((NEWRELIC_HEADER, encoded));
                self.report(SupportabilityMetric::DistributedTraceCreateSuccess);
            }
            Err(e) => {
                debug!("{e}");
                self.report(SupportabilityMetric::DistributedTraceCreateException);
            }
        }
        headers
    }
}

fn transport_duration(timestamp_ms: u64, now_ms: u64) -> Option<Duration> {
    now_ms
        .checked_sub(timestamp_ms)
        .map(Duration::from_millis)
}

/// `version-parentType-account-app-span-transaction-sampled-priority-timestamp`
fn parse_nr_entry(value: &str) -> Result<NrTraceStateEntry, Error> {
    let fields: Vec<&str> = value.split('-').collect();
    if fields.len() < 9 {
        return Err(Error::decode("too few fields in nr tracestate entry", TRACESTATE_HEADER));
    }
    fields[0]
        .parse::<u32>()
        .map_err(|_| Error::decode("invalid nr tracestate version", TRACESTATE_HEADER))?;
    let parent_type = ParentType::from_tracestate(fields[1])
        .ok_or(Error::decode("invalid nr tracestate parent type", TRACESTATE_HEADER))?;
    if fields[2].is_empty() || fields[3].is_empty() {
        return Err(Error::decode("missing nr tracestate account or app", TRACESTATE_HEADER));
    }
    let sampled = match fields[6] {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    };
    let timestamp_ms = fields[8]
        .parse::<u64>()
        .map_err(|_| Error::decode("invalid nr tracestate timestamp", TRACESTATE_HEADER))?;

    Ok(NrTraceStateEntry {
        parent_type,
        account_id: fields[2].to_string(),
        app_id: fields[3].to_string(),
        transaction_id: (!fields[5].is_empty()).then(|| fields[5].to_string()),
        sampled,
        priority: fields[7].parse::<f32>().ok().and_then(inbound_priority),
        timestamp_ms,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::health::AgentHealthReporter;
    use crate::propagation::carrier::extract;

    const NOW_MS: u64 = 1_700_000_000_500;

    fn config() -> Config {
        Config {
            distributed_tracing_enabled: true,
            account_id: Some("33".to_string()),
            primary_application_id: Some("5043".to_string()),
            trusted_account_key: Some("33".to_string()),
            ..Config::default()
        }
    }

    fn handler(config: Config) -> (DistributedTraceHandler, Arc<AgentHealthReporter>) {
        let health = Arc::new(AgentHealthReporter::new());
        (
            DistributedTraceHandler::new(Arc::new(config), health.clone()),
            health,
        )
    }

    fn payload(tk: Option<&str>, id: Option<&str>, tx: Option<&str>) -> DistributedTracePayload {
        DistributedTracePayload {
            v: vec![0, 1],
            d: PayloadData {
                ty: "App".to_string(),
                ac: "33".to_string(),
                ap: "2827902".to_string(),
                id: id.map(str::to_string),
                tx: tx.map(str::to_string),
                tr: "d6b4ba0c3a712ca".to_string(),
                pr: Some(1.234_567),
                sa: Some(true),
                ti: 1_700_000_000_000,
                tk: tk.map(str::to_string),
            },
        }
    }

    fn carrier(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_accept_newrelic_payload() {
        let (handler, health) = handler(config());
        let encoded = payload(None, Some("7d3efb1b173fecfa"), Some("e8b91a159289ff74"))
            .encode()
            .unwrap();
        let headers = carrier(&[(NEWRELIC_HEADER, &encoded)]);

        let state = handler
            .accept(&headers, extract, TransportType::Http, NOW_MS)
            .unwrap();
        assert_eq!(state.trace_id, "d6b4ba0c3a712ca");
        assert_eq!(state.parent_id.as_deref(), Some("7d3efb1b173fecfa"));
        assert_eq!(state.transaction_id.as_deref(), Some("e8b91a159289ff74"));
        assert_eq!(state.sampled, Some(true));
        assert_eq!(state.priority, Some(1.234_567));
        assert_eq!(state.parent_type, Some(ParentType::App));
        assert_eq!(state.transport_duration, Some(Duration::from_millis(500)));
        assert!(!state.from_trace_context);
        assert_eq!(
            health.count(SupportabilityMetric::DistributedTraceAcceptSuccess.name()),
            1
        );
    }

    #[test]
    fn test_raw_json_payload_is_accepted() {
        let (handler, _) = handler(config());
        let json = serde_json::to_string(&payload(None, Some("7d3efb1b173fecfa"), None)).unwrap();
        let headers = carrier(&[(NEWRELIC_HEADER, &json)]);
        assert!(handler
            .accept(&headers, extract, TransportType::Kafka, NOW_MS)
            .is_some());
    }

    #[test]
    fn test_untraceable_payload_is_rejected() {
        let (handler, health) = handler(config());
        let encoded = payload(None, None, None).encode().unwrap();
        let headers = carrier(&[(NEWRELIC_HEADER, &encoded)]);
        assert!(handler
            .accept(&headers, extract, TransportType::Http, NOW_MS)
            .is_none());
        assert_eq!(
            health.count(SupportabilityMetric::DistributedTraceAcceptParseException.name()),
            1
        );
    }

    #[test]
    fn test_untrusted_payload_is_rejected() {
        let (handler, health) = handler(config());
        let encoded = payload(Some("999"), Some("7d3efb1b173fecfa"), None)
            .encode()
            .unwrap();
        let headers = carrier(&[(NEWRELIC_HEADER, &encoded)]);
        assert!(handler
            .accept(&headers, extract, TransportType::Http, NOW_MS)
            .is_none());
        assert_eq!(
            health.count(SupportabilityMetric::DistributedTraceAcceptIgnoredUntrustedAccount.name()),
            1
        );
    }

    #[test]
    fn test_major_version_and_null_payloads_are_rejected() {
        let (handler, health) = handler(config());
        let mut future = payload(None, Some("7d3efb1b173fecfa"), None);
        future.v = vec![1, 0];
        let encoded = future.encode().unwrap();
        assert!(handler
            .accept(&carrier(&[(NEWRELIC_HEADER, &encoded)]), extract, TransportType::Http, NOW_MS)
            .is_none());
        assert!(handler
            .accept(&carrier(&[(NEWRELIC_HEADER, " ")]), extract, TransportType::Http, NOW_MS)
            .is_none());
        assert_eq!(
            health.count(SupportabilityMetric::DistributedTraceAcceptIgnoredMajorVersion.name()),
            1
        );
        assert_eq!(
            health.count(SupportabilityMetric::DistributedTraceAcceptIgnoredNull.name()),
            1
        );
    }

    #[test]
    fn test_traceparent_wins_over_newrelic_payload() {
        let (handler, _) = handler(config());
        let encoded = payload(None, Some("7d3efb1b173fecfa"), None).encode().unwrap();
        let headers = carrier(&[
            (
                TRACEPARENT_HEADER,
                "00-0af7651916cd43dd8448eb211c80319c-00f067aa0ba902b7-01",
            ),
            (
                TRACESTATE_HEADER,
                "33@nr=0-0-33-2827902-00f067aa0ba902b7-e8b91a159289ff74-1-0.657283-1700000000000,congo=t61rcWkgMzE",
            ),
            (NEWRELIC_HEADER, &encoded),
        ]);

        let state = handler
            .accept(&headers, extract, TransportType::Https, NOW_MS)
            .unwrap();
        assert!(state.from_trace_context);
        assert_eq!(state.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(state.parent_id.as_deref(), Some("00f067aa0ba902b7"));
        assert_eq!(state.transaction_id.as_deref(), Some("e8b91a159289ff74"));
        assert_eq!(state.sampled, Some(true));
        assert_eq!(state.priority, Some(0.657_283));
        assert_eq!(state.parent_app_id.as_deref(), Some("2827902"));
        assert_eq!(state.vendor_state_entries, vec!["congo=t61rcWkgMzE".to_string()]);
    }

    #[test]
    fn test_traceparent_without_our_entry() {
        let (handler, health) = handler(config());
        let headers = carrier(&[
            (
                TRACEPARENT_HEADER,
                "00-0af7651916cd43dd8448eb211c80319c-00f067aa0ba902b7-00",
            ),
            (TRACESTATE_HEADER, "44@nr=0-0-44-1-a-b-1-0.5-1,rojo=00f067aa0ba902b7"),
        ]);
        let state = handler
            .accept(&headers, extract, TransportType::Http, NOW_MS)
            .unwrap();
        assert_eq!(state.sampled, None);
        assert_eq!(state.priority, None);
        assert_eq!(state.vendor_state_entries.len(), 2);
        assert_eq!(
            health.count(SupportabilityMetric::TraceContextTraceStateNoNrEntry.name()),
            1
        );
    }

    #[test]
    fn test_out_of_range_priorities_are_dropped() {
        let (handler, _) = handler(config());
        let headers = carrier(&[
            (
                TRACEPARENT_HEADER,
                "00-0af7651916cd43dd8448eb211c80319c-00f067aa0ba902b7-01",
            ),
            (
                TRACESTATE_HEADER,
                "33@nr=0-0-33-2827902-00f067aa0ba902b7-e8b91a159289ff74-1-NaN-1700000000000",
            ),
        ]);
        let state = handler
            .accept(&headers, extract, TransportType::Http, NOW_MS)
            .unwrap();
        assert_eq!(state.sampled, Some(true));
        assert_eq!(state.priority, None);

        for priority in [-1.0, 1e9] {
            let mut inbound = payload(None, Some("7d3efb1b173fecfa"), None);
            inbound.d.pr = Some(priority);
            let headers = carrier(&[(NEWRELIC_HEADER, &inbound.encode().unwrap())]);
            let state = handler
                .accept(&headers, extract, TransportType::Http, NOW_MS)
                .unwrap();
            assert_eq!(state.priority, None);
        }
    }

    #[test]
    fn test_invalid_traceparent_falls_back_to_payload() {
        let (handler, health) = handler(config());
        let encoded = payload(None, Some("7d3efb1b173fecfa"), None).encode().unwrap();
        let headers = carrier(&[
            (
                TRACEPARENT_HEADER,
                "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            ),
            (NEWRELIC_HEADER, &encoded),
        ]);
        let state = handler
            .accept(&headers, extract, TransportType::Http, NOW_MS)
            .unwrap();
        assert!(!state.from_trace_context);
        assert_eq!(
            health.count(SupportabilityMetric::TraceContextAcceptException.name()),
            1
        );
    }

    #[test]
    fn test_create_headers() {
        let (handler, health) = handler(config());
        let vendors = vec![
            "33@nr=0-0-33-1-old-old-0-0.1-1".to_string(),
            "congo=t61rcWkgMzE".to_string(),
        ];
        let headers: HashMap<&str, String> = handler
            .create_headers(&OutboundTraceContext {
                trace_id: "d6b4ba0c3a712ca",
                span_id: Some("5f474d64b9cc9b2a"),
                transaction_id: Some("e8b91a159289ff74"),
                sampled: true,
                priority: 1.5,
                timestamp_ms: 1_700_000_000_000,
                vendor_state_entries: &vendors,
            })
            .into_iter()
            .collect();

        assert_eq!(
            headers[TRACEPARENT_HEADER],
            "00-00000000000000000d6b4ba0c3a712ca-5f474d64b9cc9b2a-01"
        );
        assert_eq!(
            headers[TRACESTATE_HEADER],
            "33@nr=0-0-33-5043-5f474d64b9cc9b2a-e8b91a159289ff74-1-1.5-1700000000000,congo=t61rcWkgMzE"
        );
        let decoded = DistributedTracePayload::decode(&headers[NEWRELIC_HEADER]).unwrap();
        assert_eq!(decoded.v, vec![0, 1]);
        assert_eq!(decoded.d.ty, "App");
        assert_eq!(decoded.d.id.as_deref(), Some("5f474d64b9cc9b2a"));
        assert_eq!(decoded.d.tk, None);
        assert_eq!(
            health.count(SupportabilityMetric::DistributedTraceCreateSuccess.name()),
            1
        );
    }

    #[test]
    fn test_create_headers_without_account() {
        let (handler, health) = handler(Config {
            exclude_newrelic_header: true,
            ..Config::default()
        });
        let headers = handler.create_headers(&OutboundTraceContext {
            trace_id: "0af7651916cd43dd8448eb211c80319c",
            span_id: None,
            transaction_id: None,
            sampled: false,
            priority: 0.2,
            timestamp_ms: 1,
            vendor_state_entries: &[],
        });
        assert_eq!(headers.len(), 1);
        assert!(headers[0].1.ends_with("-00"));
        assert_eq!(
            health.count(SupportabilityMetric::DistributedTraceCreateException.name()),
            1
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(10_000))]

        #[test]
        fn prop_random_headers_never_panic(
            traceparent in ".*",
            tracestate in ".*",
            newrelic in ".*",
            json in "\\{.*\\}",
            bytes in proptest::collection::vec(any::<u8>(), 0..96),
        ) {
            let (handler, _) = handler(config());
            let headers = carrier(&[
                (TRACEPARENT_HEADER, &traceparent),
                (TRACESTATE_HEADER, &tracestate),
                (NEWRELIC_HEADER, &newrelic),
            ]);
            let _ = handler.accept(&headers, extract, TransportType::Unknown, NOW_MS);

            let encoded = BASE64_STANDARD.encode(&bytes);
            let headers = carrier(&[(NEWRELIC_HEADER, &encoded)]);
            let _ = handler.accept(&headers, extract, TransportType::Unknown, NOW_MS);
            let headers = carrier(&[(NEWRELIC_HEADER, &json)]);
            let _ = handler.accept(&headers, extract, TransportType::Unknown, NOW_MS);
        }
    }
}
