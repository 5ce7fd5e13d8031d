// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed segment payloads.

use serde::Serialize;

use crate::propagation::cat::CrossApplicationResponseData;

/// Segment and custom transaction names are clamped to this many bytes.
pub const MAX_NAME_LENGTH: usize = 255;

/// Truncates `name` to [`MAX_NAME_LENGTH`] bytes on a char boundary.
#[must_use]
pub fn clamp_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LENGTH {
        return name.to_string();
    }
    let mut end = MAX_NAME_LENGTH;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DestinationType {
    Queue,
    Topic,
    TempQueue,
    TempTopic,
}

impl DestinationType {
    #[must_use]
    pub fn is_temporary(self) -> bool {
        matches!(self, DestinationType::TempQueue | DestinationType::TempTopic)
    }

    #[must_use]
    pub fn category(self) -> &'static str {
        match self {
            DestinationType::Queue | DestinationType::TempQueue => "Queue",
            DestinationType::Topic | DestinationType::TempTopic => "Topic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageBrokerAction {
    Produce,
    Consume,
    Peek,
    Purge,
}

impl MessageBrokerAction {
    fn as_str(self) -> &'static str {
        match self {
            MessageBrokerAction::Produce => "Produce",
            MessageBrokerAction::Consume => "Consume",
            MessageBrokerAction::Peek => "Peek",
            MessageBrokerAction::Purge => "Purge",
        }
    }
}

/// Operation and model of a parsed datastore statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedStatement {
    pub vendor: String,
    pub operation: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionInfo {
    pub host: Option<String>,
    pub port_path_or_id: Option<String>,
    pub database_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SegmentData {
    Custom {
        name: String,
    },
    Datastore {
        statement: ParsedStatement,
        command_text: Option<String>,
        connection: ConnectionInfo,
    },
    External {
        uri: String,
        method: String,
        cross_application_response: Option<CrossApplicationResponseData>,
    },
    MessageBroker {
        vendor: String,
        destination: Option<String>,
        destination_type: DestinationType,
        action: MessageBrokerAction,
    },
    Method {
        type_name: String,
        method_name: String,
    },
    Simple {
        name: String,
    },
}

impl SegmentData {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            SegmentData::Custom { name } => format!("Custom/{name}"),
            SegmentData::Datastore { statement, .. } => match &statement.model {
                Some(model) => format!(
                    "Datastore/statement/{}/{model}/{}",
                    statement.vendor, statement.operation
                ),
                None => format!(
                    "Datastore/operation/{}/{}",
                    statement.vendor, statement.operation
                ),
            },
            SegmentData::External { uri, method, .. } => {
                format!("External/{}/Stream/{method}", host_of(uri))
            }
            SegmentData::MessageBroker {
                vendor,
                destination,
                destination_type,
                action,
            } => {
                let named = match destination {
                    Some(destination) if !destination_type.is_temporary() => {
                        format!("Named/{destination}")
                    }
                    _ => "Temp".to_string(),
                };
                format!(
                    "MessageBroker/{vendor}/{}/{}/{named}",
                    destination_type.category(),
                    action.as_str()
                )
            }
            SegmentData::Method {
                type_name,
                method_name,
            } => format!("Method/{type_name}/{method_name}"),
            SegmentData::Simple { name } => name.clone(),
        }
    }

    /// Payload-level half of the combinability check. Different variants are
    /// never combinable.
    #[must_use]
    pub fn is_combinable_with(&self, other: &SegmentData) -> bool {
        match (self, other) {
            (SegmentData::Custom { name: a }, SegmentData::Custom { name: b })
            | (SegmentData::Simple { name: a }, SegmentData::Simple { name: b }) => a == b,
            (
                SegmentData::Datastore {
                    statement: a,
                    command_text: a_text,
                    ..
                },
                SegmentData::Datastore {
                    statement: b,
                    command_text: b_text,
                    ..
                },
            ) => a == b && a_text == b_text,
            (
                SegmentData::External {
                    uri: a_uri,
                    method: a_method,
                    ..
                },
                SegmentData::External {
                    uri: b_uri,
                    method: b_method,
                    ..
                },
            ) => a_uri == b_uri && a_method == b_method,
            (
                SegmentData::MessageBroker {
                    vendor: a_vendor,
                    destination: a_destination,
                    destination_type: a_type,
                    action: a_action,
                },
                SegmentData::MessageBroker {
                    vendor: b_vendor,
                    destination: b_destination,
                    destination_type: b_type,
                    action: b_action,
                },
            ) => {
                a_vendor == b_vendor
                    && a_destination == b_destination
                    && a_type == b_type
                    && a_action == b_action
            }
            (
                SegmentData::Method {
                    type_name: a_type,
                    method_name: a_method,
                },
                SegmentData::Method {
                    type_name: b_type,
                    method_name: b_method,
                },
            ) => a_type == b_type && a_method == b_method,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self, SegmentData::External { .. })
    }
}

/// Host part of a URI, or `Unknown` when none can be found.
fn host_of(uri: &str) -> &str {
    let without_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_and_port = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);
    let host = host_and_port
        .split_once(':')
        .map_or(host_and_port, |(host, _)| host);
    if host.is_empty() {
        "Unknown"
    } else {
        host
    }
}
