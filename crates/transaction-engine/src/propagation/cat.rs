// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross application tracing (CAT) headers.
//!
//! Every header value is a JSON document XOR-ed with the account encoding key
//! and base64 encoded. Requests carry `X-NewRelic-ID` (the caller's
//! `accountId#appId`) and `X-NewRelic-Transaction`; responses carry
//! `X-NewRelic-App-Data`.

use std::sync::Arc;

use base64::prelude::*;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::Config;
use crate::health::{HealthReporter, SupportabilityMetric};
use crate::propagation::error::Error;

pub const NEWRELIC_ID_HEADER: &str = "X-NewRelic-ID";
pub const TRANSACTION_DATA_HEADER: &str = "X-NewRelic-Transaction";
pub const APP_DATA_HEADER: &str = "X-NewRelic-App-Data";
pub const CONTENT_LENGTH_HEADER: &str = "Content-Length";

/// Content length reported when the inbound request carried none.
pub const UNKNOWN_CONTENT_LENGTH: i64 = -1;

/// `[transactionGuid, unused, tripId, pathHash]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossApplicationRequestData {
    pub transaction_guid: String,
    pub unused: bool,
    pub trip_id: Option<String>,
    pub path_hash: Option<String>,
}

impl CrossApplicationRequestData {
    fn to_json(&self) -> String {
        json!([
            self.transaction_guid,
            self.unused,
            self.trip_id,
            self.path_hash
        ])
        .to_string()
    }

    fn from_json(json: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(json)
            .map_err(|_| Error::decode("invalid json", TRANSACTION_DATA_HEADER))?;
        let items = value
            .as_array()
            .ok_or(Error::decode("expected a json array", TRANSACTION_DATA_HEADER))?;
        let transaction_guid = items
            .first()
            .and_then(Value::as_str)
            .filter(|guid| !guid.is_empty())
            .ok_or(Error::decode("missing transaction guid", TRANSACTION_DATA_HEADER))?;

        Ok(CrossApplicationRequestData {
            transaction_guid: transaction_guid.to_string(),
            unused: items.get(1).and_then(Value::as_bool).unwrap_or(false),
            trip_id: items.get(2).and_then(Value::as_str).map(str::to_string),
            path_hash: items.get(3).and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// `[crossProcessId, transactionName, queueTimeSeconds, responseTimeSeconds,
/// contentLength, transactionGuid, unused]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossApplicationResponseData {
    pub cross_process_id: String,
    pub transaction_name: String,
    pub queue_time_seconds: f64,
    pub response_time_seconds: f64,
    pub content_length: i64,
    pub transaction_guid: Option<String>,
    pub unused: bool,
}

impl CrossApplicationResponseData {
    fn to_json(&self) -> String {
        json!([
            self.cross_process_id,
            self.transaction_name,
            self.queue_time_seconds,
            self.response_time_seconds,
            self.content_length,
            self.transaction_guid,
            self.unused
        ])
        .to_string()
    }

    fn from_json(json: &str) -> Result<Self, Error> {
        let value: Value =
            serde_json::from_str(json).map_err(|_| Error::decode("invalid json", APP_DATA_HEADER))?;
        let items = value
            .as_array()
            .ok_or(Error::decode("expected a json array", APP_DATA_HEADER))?;
        if items.len() < 5 {
            return Err(Error::decode("too few elements", APP_DATA_HEADER));
        }
        let text = |index: usize| items.get(index).and_then(Value::as_str);

        Ok(CrossApplicationResponseData {
            cross_process_id: text(0)
                .ok_or(Error::decode("missing cross process id", APP_DATA_HEADER))?
                .to_string(),
            transaction_name: text(1)
                .ok_or(Error::decode("missing transaction name", APP_DATA_HEADER))?
                .to_string(),
            queue_time_seconds: items[2]
                .as_f64()
                .ok_or(Error::decode("invalid queue time", APP_DATA_HEADER))?,
            response_time_seconds: items[3]
                .as_f64()
                .ok_or(Error::decode("invalid response time", APP_DATA_HEADER))?,
            content_length: items[4].as_i64().unwrap_or(UNKNOWN_CONTENT_LENGTH),
            transaction_guid: text(5).map(str::to_string),
            unused: items.get(6).and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// A decoded and trusted inbound CAT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCatRequest {
    pub referrer_process_id: String,
    pub request: Option<CrossApplicationRequestData>,
    pub content_length: i64,
}

#[must_use]
pub fn obfuscate(value: &str, key: Option<&str>) -> String {
    BASE64_STANDARD.encode(xor_with_key(value.as_bytes(), key))
}

pub fn deobfuscate(encoded: &str, key: Option<&str>) -> Result<String, Error> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|_| Error::decode("invalid base64", "cat"))?;
    String::from_utf8(xor_with_key(&bytes, key))
        .map_err(|_| Error::decode("invalid utf-8 after deobfuscation", "cat"))
}

fn xor_with_key(bytes: &[u8], key: Option<&str>) -> Vec<u8> {
    match key.map(str::as_bytes) {
        Some(key) if !key.is_empty() => bytes
            .iter()
            .zip(key.iter().cycle())
            .map(|(byte, k)| byte ^ k)
            .collect(),
        _ => bytes.to_vec(),
    }
}

/// Content length of an inbound request. Unparseable values count as zero.
fn parse_content_length(values: &[String]) -> i64 {
    match values.first() {
        Some(value) => value.trim().parse::<i64>().unwrap_or(0),
        None => UNKNOWN_CONTENT_LENGTH,
    }
}

pub struct CatHeaderHandler {
    config: Arc<Config>,
    health: Arc<dyn HealthReporter>,
}

impl CatHeaderHandler {
    #[must_use]
    pub fn new(config: Arc<Config>, health: Arc<dyn HealthReporter>) -> Self {
        CatHeaderHandler { config, health }
    }

    fn encoding_key(&self) -> Option<&str> {
        self.config.encoding_key.as_deref()
    }

    fn is_trusted(&self, cross_process_id: &str) -> bool {
        if self.config.trusted_account_ids.is_empty() {
            return true;
        }
        cross_process_id
            .split('#')
            .next()
            .and_then(|account| account.trim().parse::<u64>().ok())
            .is_some_and(|account| self.config.trusted_account_ids.contains(&account))
    }

    /// Decodes the CAT request headers, if any. Never fails: anything that
    /// cannot be decoded or is not trusted yields `None`.
    pub fn try_decode_inbound_request<C: ?Sized>(
        &self,
        carrier: &C,
        getter: impl Fn(&C, &str) -> Vec<String>,
    ) -> Option<InboundCatRequest> {
        let encoded_id = getter(carrier, NEWRELIC_ID_HEADER).into_iter().next()?;

        let referrer_process_id = match deobfuscate(&encoded_id, self.encoding_key()) {
            Ok(id) if !id.trim().is_empty() => id,
            Ok(_) | Err(_) => {
                debug!("Unable to decode {NEWRELIC_ID_HEADER} header, ignoring CAT request");
                self.health
                    .report_supportability(SupportabilityMetric::CatRequestAcceptUnableToDecode);
                return None;
            }
        };

        if !self.is_trusted(&referrer_process_id) {
            debug!("Ignoring CAT request from untrusted process {referrer_process_id}");
            self.health
                .report_supportability(SupportabilityMetric::CatRequestAcceptNotTrusted);
            return None;
        }

        let request = match getter(carrier, TRANSACTION_DATA_HEADER).into_iter().next() {
            Some(encoded) => match deobfuscate(&encoded, self.encoding_key())
                .and_then(|json| CrossApplicationRequestData::from_json(&json))
            {
                Ok(request) => Some(request),
                Err(e) => {
                    debug!("{e}");
                    self.health.report_supportability(
                        SupportabilityMetric::CatRequestAcceptUnableToDecode,
                    );
                    return None;
                }
            },
            None => None,
        };

        Some(InboundCatRequest {
            referrer_process_id,
            request,
            content_length: parse_content_length(&getter(carrier, CONTENT_LENGTH_HEADER)),
        })
    }

    /// Headers for an outbound request, empty when no cross process id is set.
    #[must_use]
    pub fn outbound_request_headers(
        &self,
        request: &CrossApplicationRequestData,
    ) -> Vec<(&'static str, String)> {
        let Some(cross_process_id) = self.config.cross_process_id.as_deref() else {
            debug!("No cross process id configured, not creating CAT request headers");
            self.health.report_supportability(
                SupportabilityMetric::CatRequestCreateMissingCrossProcessId,
            );
            return Vec::new();
        };

        self.health
            .report_supportability(SupportabilityMetric::CatRequestCreateSuccess);
        vec![
            (
                NEWRELIC_ID_HEADER,
                obfuscate(cross_process_id, self.encoding_key()),
            ),
            (
                TRANSACTION_DATA_HEADER,
                obfuscate(&request.to_json(), self.encoding_key()),
            ),
        ]
    }

    /// Builds response data for this process. `None` without a cross process id.
    #[must_use]
    pub fn response_data(
        &self,
        transaction_name: String,
        queue_time_seconds: f64,
        response_time_seconds: f64,
        content_length: i64,
        transaction_guid: &str,
    ) -> Option<CrossApplicationResponseData> {
        let cross_process_id = self.config.cross_process_id.clone()?;
        Some(CrossApplicationResponseData {
            cross_process_id,
            transaction_name,
            queue_time_seconds,
            response_time_seconds,
            content_length,
            transaction_guid: Some(transaction_guid.to_string()),
            unused: false,
        })
    }

    #[must_use]
    pub fn outbound_response_headers(
        &self,
        response: &CrossApplicationResponseData,
    ) -> Vec<(&'static str, String)> {
        self.health
            .report_supportability(SupportabilityMetric::CatResponseCreateSuccess);
        vec![(
            APP_DATA_HEADER,
            obfuscate(&response.to_json(), self.encoding_key()),
        )]
    }

    /// Decodes `X-NewRelic-App-Data` from a downstream response. When the
    /// header holds several comma separated blobs only the first is used.
    pub fn try_decode_inbound_response<C: ?Sized>(
        &self,
        carrier: &C,
        getter: impl Fn(&C, &str) -> Vec<String>,
    ) -> Option<CrossApplicationResponseData> {
        let header = getter(carrier, APP_DATA_HEADER).into_iter().next()?;
        let first = header.split(',').next().unwrap_or_default();

        let response = match deobfuscate(first, self.encoding_key())
            .and_then(|json| CrossApplicationResponseData::from_json(&json))
        {
            Ok(response) => response,
            Err(e) => {
                debug!("{e}");
                self.health
                    .report_supportability(SupportabilityMetric::CatResponseAcceptUnableToDecode);
                return None;
            }
        };

        if !self.is_trusted(&response.cross_process_id) {
            debug!(
                "Ignoring CAT response from untrusted process {}",
                response.cross_process_id
            );
            self.health
                .report_supportability(SupportabilityMetric::CatResponseAcceptNotTrusted);
            return None;
        }

        self.health
            .report_supportability(SupportabilityMetric::CatResponseAcceptSuccess);
        Some(response)
    }
}
