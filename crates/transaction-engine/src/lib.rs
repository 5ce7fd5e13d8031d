// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction and segment tracking engine.
//!
//! Instrumentation call sites obtain a [`Transaction`] from the
//! [`TransactionService`], open and close [`SegmentHandle`]s on it, and end it
//! once the unit of work completes. Finished (or abandoned) transactions are
//! converted into an [`ImmutableTransaction`] and handed to a
//! [`TransactionTransformer`].
//!
//! Cross-process tracing metadata is exchanged through the
//! [`propagation`] module, which implements both cross application tracing
//! (CAT) headers and distributed tracing (`newrelic`, `traceparent`,
//! `tracestate`) headers.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod call_stack;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
mod finalizer;
pub mod health;
pub mod ids;
pub mod logger;
pub mod metadata;
pub mod name;
pub mod priority;
pub mod propagation;
pub mod segment;
pub mod service;
pub mod snapshot;
pub mod transaction;
pub mod transform;

pub use context::ExecutionContext;
pub use error::Error;
pub use segment::{MethodCall, SegmentHandle};
pub use service::TransactionService;
pub use snapshot::ImmutableTransaction;
pub use transaction::Transaction;
pub use transform::TransactionTransformer;
