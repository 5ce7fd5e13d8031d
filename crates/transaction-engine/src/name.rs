// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction names and the precedence rules that decide which one sticks.

use std::fmt;

use serde::Serialize;

use crate::segment::data::{clamp_name, DestinationType};

/// Sources of a transaction name, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TransactionNamePriority {
    Uri,
    StatusCode,
    Handler,
    Route,
    FrameworkLow,
    FrameworkHigh,
    CustomTransactionName,
    UserTransactionName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FreezeReason {
    CrossApplicationTracing,
    AutoBrowserScriptInjection,
    ManualBrowserScriptInjection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransactionName {
    Web {
        category: String,
        name: String,
    },
    Other {
        category: String,
        name: String,
    },
    MessageBroker {
        destination_type: DestinationType,
        vendor: String,
        destination: Option<String>,
    },
    Uri {
        uri: String,
    },
    Custom {
        is_web: bool,
        name: String,
    },
}

impl TransactionName {
    #[must_use]
    pub fn web(category: &str, name: &str) -> Self {
        TransactionName::Web {
            category: category.to_string(),
            name: name.to_string(),
        }
    }

    #[must_use]
    pub fn other(category: &str, name: &str) -> Self {
        TransactionName::Other {
            category: category.to_string(),
            name: name.to_string(),
        }
    }

    /// The query string and fragment are never part of the name.
    #[must_use]
    pub fn uri(uri: &str) -> Self {
        let path = uri.split(['?', '#']).next().unwrap_or_default();
        TransactionName::Uri {
            uri: path.to_string(),
        }
    }

    #[must_use]
    pub fn custom(is_web: bool, name: &str) -> Self {
        TransactionName::Custom {
            is_web,
            name: clamp_name(name.trim()),
        }
    }

    #[must_use]
    pub fn message_broker(
        destination_type: DestinationType,
        vendor: &str,
        destination: Option<&str>,
    ) -> Self {
        TransactionName::MessageBroker {
            destination_type,
            vendor: vendor.to_string(),
            destination: destination.map(str::to_string),
        }
    }

    #[must_use]
    pub fn is_web(&self) -> bool {
        match self {
            TransactionName::Web { .. } | TransactionName::Uri { .. } => true,
            TransactionName::Custom { is_web, .. } => *is_web,
            TransactionName::Other { .. } | TransactionName::MessageBroker { .. } => false,
        }
    }

    /// Fully prefixed metric name, e.g. `WebTransaction/MVC/Home/Index`.
    #[must_use]
    pub fn metric_name(&self) -> String {
        let prefix = if self.is_web() {
            "WebTransaction"
        } else {
            "OtherTransaction"
        };
        match self {
            TransactionName::Web { category, name } | TransactionName::Other { category, name } => {
                format!("{prefix}/{category}/{name}")
            }
            TransactionName::Uri { uri } => format!("{prefix}/Uri{}", with_leading_slash(uri)),
            TransactionName::Custom { name, .. } => format!("{prefix}/Custom/{name}"),
            TransactionName::MessageBroker {
                destination_type,
                vendor,
                destination,
            } => {
                let named = match destination {
                    Some(destination) if !destination_type.is_temporary() => {
                        format!("Named/{destination}")
                    }
                    _ => "Temp".to_string(),
                };
                format!(
                    "{prefix}/Message/{vendor}/{}/{named}",
                    destination_type.category()
                )
            }
        }
    }
}

fn with_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

impl fmt::Display for TransactionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric_name())
    }
}

/// The current best name of a transaction.
///
/// A new name replaces the current one when its priority is at least the
/// current priority and the name has not been frozen. The initial name has no
/// priority, so any explicit name replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateTransactionName {
    name: TransactionName,
    priority: Option<TransactionNamePriority>,
    frozen: Option<FreezeReason>,
}

impl CandidateTransactionName {
    #[must_use]
    pub fn new(initial: TransactionName) -> Self {
        CandidateTransactionName {
            name: initial,
            priority: None,
            frozen: None,
        }
    }

    /// Returns the next state if `name` wins, `None` if it is rejected.
    #[must_use]
    pub fn try_apply(
        &self,
        name: TransactionName,
        priority: TransactionNamePriority,
    ) -> Option<CandidateTransactionName> {
        if self.frozen.is_some() {
            return None;
        }
        if self.priority.is_some_and(|current| priority < current) {
            return None;
        }
        Some(CandidateTransactionName {
            name,
            priority: Some(priority),
            frozen: None,
        })
    }

    pub fn try_set(&mut self, name: TransactionName, priority: TransactionNamePriority) -> bool {
        match self.try_apply(name, priority) {
            Some(next) => {
                *self = next;
                true
            }
            None => false,
        }
    }

    /// Freezing an already frozen name keeps the first reason.
    pub fn freeze(&mut self, reason: FreezeReason) {
        self.frozen.get_or_insert(reason);
    }

    #[must_use]
    pub fn name(&self) -> &TransactionName {
        &self.name
    }

    #[must_use]
    pub fn priority(&self) -> Option<TransactionNamePriority> {
        self.priority
    }

    #[must_use]
    pub fn frozen_reason(&self) -> Option<FreezeReason> {
        self.frozen
    }
}
