// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hand-off of finished transactions to the harvest side.

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::snapshot::ImmutableTransaction;

/// Consumes finished transactions. Called at most once per transaction.
pub trait TransactionTransformer: Send + Sync {
    fn transform(&self, transaction: ImmutableTransaction);
}

/// Drops every transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingTransformer;

impl TransactionTransformer for DiscardingTransformer {
    fn transform(&self, transaction: ImmutableTransaction) {
        trace!("Discarding transaction {}", transaction.guid);
    }
}

/// Forwards transactions to a receiver owned by a harvest task.
#[derive(Debug, Clone)]
pub struct ChannelTransformer {
    tx: mpsc::UnboundedSender<ImmutableTransaction>,
}

impl ChannelTransformer {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ImmutableTransaction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelTransformer { tx }, rx)
    }
}

impl TransactionTransformer for ChannelTransformer {
    fn transform(&self, transaction: ImmutableTransaction) {
        if let Err(e) = self.tx.send(transaction) {
            debug!("Harvest receiver dropped, transaction {} lost", e.0.guid);
        }
    }
}
