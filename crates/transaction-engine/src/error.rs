// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced to instrumentation call sites.
///
/// Only programmer errors are reported this way. Races, malformed headers and
/// other environmental conditions are logged and absorbed by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        name: &'static str,
        reason: &'static str,
    },
}

impl Error {
    #[must_use]
    pub fn empty(name: &'static str) -> Self {
        Error::InvalidArgument {
            name,
            reason: "must not be empty",
        }
    }
}

/// Rejects empty or whitespace-only required arguments.
pub(crate) fn require_non_empty(name: &'static str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::empty(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let err = Error::empty("segment_name");
        assert_eq!(
            err.to_string(),
            "invalid argument `segment_name`: must not be empty"
        );
    }

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty("vendor", "MySQL").is_ok());
        assert_eq!(require_non_empty("vendor", "  "), Err(Error::empty("vendor")));
    }
}
