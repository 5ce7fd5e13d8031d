// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Errors raised while decoding or encoding cross-process headers.
//!
//! These never reach instrumentation: the handlers log them and carry on as
//! if no header had been present.

use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("Cannot {} from {}, {}", operation, message, header)]
pub struct Error {
    message: &'static str,
    /// Header (or header family) being processed.
    header: &'static str,
    operation: &'static str,
}

impl Error {
    #[must_use]
    pub fn decode(message: &'static str, header: &'static str) -> Self {
        Self {
            message,
            header,
            operation: "decode",
        }
    }

    #[must_use]
    pub fn encode(message: &'static str, header: &'static str) -> Self {
        Self {
            message,
            header,
            operation: "encode",
        }
    }

    #[must_use]
    pub fn message(&self) -> &'static str {
        self.message
    }
}
