// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Header carriers.
//!
//! The engine never touches a transport directly. Inbound headers are read
//! through a getter `Fn(&C, &str) -> Vec<String>` and outbound headers are
//! written through a setter `FnMut(&mut C, &str, String)`, so any transport
//! (HTTP headers, message properties, ...) can be plugged in.
//!
//! [`extract`] and [`inject`] adapt the [`Extractor`] and [`Injector`] traits to
//! that shape for the carriers implemented here. All of them match keys
//! case-insensitively, since HTTP stacks disagree on header casing.

use std::collections::HashMap;

use serde_json::Value;

pub trait Injector {
    /// Sets `key` (lowercased) to `value`.
    fn set(&mut self, key: &str, value: String);
}

pub trait Extractor {
    /// Every value stored under `key`, compared case-insensitively.
    fn get(&self, key: &str) -> Vec<&str>;

    fn keys(&self) -> Vec<&str>;
}

/// Getter over any [`Extractor`].
pub fn extract<C: Extractor + ?Sized>(carrier: &C, key: &str) -> Vec<String> {
    carrier.get(key).into_iter().map(str::to_string).collect()
}

/// Setter over any [`Injector`].
pub fn inject<C: Injector + ?Sized>(carrier: &mut C, key: &str, value: String) {
    carrier.set(key, value);
}

fn lookup<'a, V, S: std::hash::BuildHasher>(
    map: &'a HashMap<String, V, S>,
    key: &str,
) -> Option<&'a V> {
    map.get(&key.to_lowercase()).or_else(|| {
        map.iter()
            .find(|(stored, _)| stored.eq_ignore_ascii_case(key))
            .map(|(_, value)| value)
    })
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Vec<&str> {
        lookup(self, key).map(String::as_str).into_iter().collect()
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect::<Vec<_>>()
    }
}

/// Multi-valued headers, e.g. repeated `tracestate` lines.
impl<S: std::hash::BuildHasher> Injector for HashMap<String, Vec<String>, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), vec![value]);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, Vec<String>, S> {
    fn get(&self, key: &str) -> Vec<&str> {
        lookup(self, key)
            .map(|values| values.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect::<Vec<_>>()
    }
}

/// Only `Value::Object` carriers hold headers; anything else is ignored.
impl Injector for Value {
    fn set(&mut self, key: &str, value: String) {
        if let Value::Object(map) = self {
            map.insert(key.to_lowercase(), Value::String(value));
        }
    }
}

impl Extractor for Value {
    fn get(&self, key: &str) -> Vec<&str> {
        let Value::Object(map) = self else {
            return Vec::new();
        };
        let value = map.get(&key.to_lowercase()).or_else(|| {
            map.iter()
                .find(|(stored, _)| stored.eq_ignore_ascii_case(key))
                .map(|(_, value)| value)
        });
        match value {
            Some(Value::String(value)) => vec![value.as_str()],
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    fn keys(&self) -> Vec<&str> {
        if let Value::Object(map) = self {
            map.keys().map(String::as_str).collect::<Vec<_>>()
        } else {
            Vec::new()
        }
    }
}
