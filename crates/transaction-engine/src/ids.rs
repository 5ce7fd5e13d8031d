// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;

/// 16 lowercase hex chars, used for transaction guids and span ids.
#[must_use]
pub fn generate_guid() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// 32 lowercase hex chars.
#[must_use]
pub fn generate_trace_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// Left-pads a trace id to the 32 chars W3C `traceparent` requires.
#[must_use]
pub(crate) fn format_trace_id_for_w3c(trace_id: &str) -> String {
    format!("{:0>32}", trace_id.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_format() {
        let guid = generate_guid();
        assert_eq!(guid.len(), 16);
        assert!(guid.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_trace_id_format() {
        let trace_id = generate_trace_id();
        assert_eq!(trace_id.len(), 32);
        assert!(trace_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(trace_id, generate_trace_id());
    }

    #[test]
    fn test_w3c_padding() {
        assert_eq!(
            format_trace_id_for_w3c("ABC123"),
            "00000000000000000000000000abc123"
        );
    }
}
