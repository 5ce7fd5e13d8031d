// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mutable per-transaction metadata bag.
//!
//! Every accessor takes the internal lock for the duration of one read or
//! write, so callers on different threads never observe a half-applied update.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Most alternate path hashes kept per transaction.
const MAX_PATH_HASHES: usize = 10;
const MAX_ATTRIBUTE_KEY_LENGTH: usize = 255;
const MAX_CUSTOM_ATTRIBUTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Validates an attribute key, logging the reason it was dropped.
pub(crate) fn valid_attribute_key(key: &str) -> bool {
    if key.trim().is_empty() {
        debug!("Dropping attribute with an empty key");
        return false;
    }
    if key.len() > MAX_ATTRIBUTE_KEY_LENGTH {
        debug!("Dropping attribute {key}: key longer than {MAX_ATTRIBUTE_KEY_LENGTH} bytes");
        return false;
    }
    true
}

/// Point-in-time copy of a transaction's metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImmutableTransactionMetadata {
    pub uri: Option<String>,
    pub original_uri: Option<String>,
    pub referrer_uri: Option<String>,
    pub request_method: Option<String>,
    pub http_response_status_code: Option<u16>,
    pub http_response_sub_status_code: Option<u16>,
    pub queue_time: Option<Duration>,
    pub cross_application_referrer_process_id: Option<String>,
    pub cross_application_referrer_transaction_guid: Option<String>,
    pub cross_application_referrer_trip_id: Option<String>,
    pub cross_application_referrer_path_hash: Option<String>,
    pub cross_application_referrer_content_length: Option<i64>,
    pub cross_application_path_hash: Option<String>,
    pub cross_application_alternate_path_hashes: Vec<String>,
    pub has_outgoing_trace_headers: bool,
    pub has_cat_response_headers: bool,
    pub custom_attributes: BTreeMap<String, AttributeValue>,
    pub request_headers: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct TransactionMetadata {
    state: Mutex<ImmutableTransactionMetadata>,
}

impl TransactionMetadata {
    fn lock(&self) -> MutexGuard<'_, ImmutableTransactionMetadata> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot(&self) -> ImmutableTransactionMetadata {
        self.lock().clone()
    }

    pub fn set_uri(&self, uri: &str) {
        let path = uri.split(['?', '#']).next().unwrap_or_default();
        self.lock().uri = Some(path.to_string());
    }

    pub fn set_original_uri(&self, uri: &str) {
        let mut state = self.lock();
        if state.original_uri.is_none() {
            state.original_uri = Some(strip_query(uri));
        }
    }

    pub fn set_referrer_uri(&self, uri: &str) {
        self.lock().referrer_uri = Some(strip_query(uri));
    }

    pub fn set_request_method(&self, method: &str) {
        self.lock().request_method = Some(method.to_string());
    }

    pub fn set_http_response_status_code(&self, status: u16, sub_status: Option<u16>) {
        let mut state = self.lock();
        state.http_response_status_code = Some(status);
        state.http_response_sub_status_code = sub_status;
    }

    #[must_use]
    pub fn http_response_status_code(&self) -> Option<u16> {
        self.lock().http_response_status_code
    }

    pub fn set_queue_time(&self, queue_time: Duration) {
        self.lock().queue_time = Some(queue_time);
    }

    #[must_use]
    pub fn queue_time(&self) -> Option<Duration> {
        self.lock().queue_time
    }

    pub fn add_custom_attribute(&self, key: &str, value: AttributeValue) {
        if !valid_attribute_key(key) {
            return;
        }
        let mut state = self.lock();
        if state.custom_attributes.len() >= MAX_CUSTOM_ATTRIBUTES
            && !state.custom_attributes.contains_key(key)
        {
            debug!("Dropping custom attribute {key}: limit of {MAX_CUSTOM_ATTRIBUTES} reached");
            return;
        }
        state.custom_attributes.insert(key.to_string(), value);
    }

    pub fn add_request_header(&self, key: &str, value: String) {
        self.lock()
            .request_headers
            .insert(key.to_lowercase(), value);
    }

    /// Stores the referrer fields of an accepted CAT request.
    ///
    /// Returns `false` without touching anything when a referrer was already
    /// recorded, so the first inbound request always wins.
    pub fn try_set_cross_application_referrer(
        &self,
        process_id: &str,
        transaction_guid: Option<&str>,
        trip_id: Option<&str>,
        path_hash: Option<&str>,
        content_length: i64,
    ) -> bool {
        let mut state = self.lock();
        if state.cross_application_referrer_process_id.is_some()
            || state.cross_application_referrer_transaction_guid.is_some()
        {
            return false;
        }
        state.cross_application_referrer_process_id = Some(process_id.to_string());
        state.cross_application_referrer_transaction_guid = transaction_guid.map(str::to_string);
        state.cross_application_referrer_trip_id = trip_id.map(str::to_string);
        state.cross_application_referrer_path_hash = path_hash.map(str::to_string);
        state.cross_application_referrer_content_length = Some(content_length);
        true
    }

    #[must_use]
    pub fn cross_application_referrer_process_id(&self) -> Option<String> {
        self.lock().cross_application_referrer_process_id.clone()
    }

    #[must_use]
    pub fn cross_application_referrer_trip_id(&self) -> Option<String> {
        self.lock().cross_application_referrer_trip_id.clone()
    }

    #[must_use]
    pub fn cross_application_referrer_path_hash(&self) -> Option<String> {
        self.lock().cross_application_referrer_path_hash.clone()
    }

    #[must_use]
    pub fn cross_application_referrer_content_length(&self) -> Option<i64> {
        self.lock().cross_application_referrer_content_length
    }

    pub fn set_cross_application_path_hash(&self, path_hash: String) {
        let mut state = self.lock();
        if !state.cross_application_alternate_path_hashes.contains(&path_hash)
            && state.cross_application_alternate_path_hashes.len() < MAX_PATH_HASHES
        {
            state
                .cross_application_alternate_path_hashes
                .push(path_hash.clone());
        }
        state.cross_application_path_hash = Some(path_hash);
    }

    #[must_use]
    pub fn cross_application_path_hash(&self) -> Option<String> {
        self.lock().cross_application_path_hash.clone()
    }

    pub fn mark_has_outgoing_trace_headers(&self) {
        self.lock().has_outgoing_trace_headers = true;
    }

    #[must_use]
    pub fn has_outgoing_trace_headers(&self) -> bool {
        self.lock().has_outgoing_trace_headers
    }

    pub fn mark_has_cat_response_headers(&self) {
        self.lock().has_cat_response_headers = true;
    }
}

fn strip_query(uri: &str) -> String {
    uri.split(['?', '#']).next().unwrap_or_default().to_string()
}

/// Headers whose values may carry credentials in their query strings.
pub(crate) fn strip_query_for_header(key: &str, value: &str) -> String {
    match key.to_lowercase().as_str() {
        "referer" | "location" | "refresh" => strip_query(value),
        _ => value.to_string(),
    }
}
