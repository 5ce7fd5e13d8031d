// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Path hashes link a transaction to the chain of CAT callers before it.

use sha2::{Digest, Sha256};

pub trait PathHashMaker: Send + Sync {
    /// Mixes `app_name;transaction_name` with the caller's path hash.
    ///
    /// A missing or malformed referring hash counts as zero.
    fn calculate_path_hash(
        &self,
        app_name: &str,
        transaction_name: &str,
        referring_path_hash: Option<&str>,
    ) -> String;
}

/// `rotl(referring, 1) ^ low32(sha256("app;name"))`, as 8 lowercase hex chars.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256PathHashMaker;

impl PathHashMaker for Sha256PathHashMaker {
    fn calculate_path_hash(
        &self,
        app_name: &str,
        transaction_name: &str,
        referring_path_hash: Option<&str>,
    ) -> String {
        let referring = referring_path_hash
            .and_then(|hash| u32::from_str_radix(hash.trim(), 16).ok())
            .unwrap_or(0);

        let digest = Sha256::digest(format!("{app_name};{transaction_name}").as_bytes());
        let low = u32::from_be_bytes([digest[28], digest[29], digest[30], digest[31]]);

        format!("{:08x}", referring.rotate_left(1) ^ low)
    }
}
