// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point for instrumentation: resolves or creates the transaction of
//! an execution context.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::context::{ExecutionContext, TransactionContextStore};
use crate::finalizer::TransactionFinalizer;
use crate::health::{AgentHealthReporter, HealthReporter};
use crate::name::TransactionName;
use crate::priority::{PrioritySampler, Sampler};
use crate::propagation::cat::CatHeaderHandler;
use crate::propagation::distributed_trace::DistributedTraceHandler;
use crate::propagation::path_hash::{PathHashMaker, Sha256PathHashMaker};
use crate::transaction::Transaction;
use crate::transform::{DiscardingTransformer, TransactionTransformer};

/// Past this many nested `get_or_create` calls the current transaction is
/// assumed to be leaked and is replaced.
pub const MAX_NESTED_TRANSACTION_ATTEMPTS: u32 = 100;

/// Collaborators shared by every transaction of a service.
pub(crate) struct EngineComponents {
    pub(crate) config: Arc<Config>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sampler: Arc<dyn Sampler>,
    pub(crate) health: Arc<dyn HealthReporter>,
    pub(crate) path_hash_maker: Arc<dyn PathHashMaker>,
    pub(crate) cat: CatHeaderHandler,
    pub(crate) dt: DistributedTraceHandler,
    pub(crate) finalizer: TransactionFinalizer,
}

pub struct TransactionServiceBuilder {
    config: Config,
    transformer: Option<Arc<dyn TransactionTransformer>>,
    health: Option<Arc<dyn HealthReporter>>,
    clock: Option<Arc<dyn Clock>>,
    sampler: Option<Arc<dyn Sampler>>,
    path_hash_maker: Option<Arc<dyn PathHashMaker>>,
}

impl TransactionServiceBuilder {
    #[must_use]
    pub fn transformer(mut self, transformer: Arc<dyn TransactionTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    #[must_use]
    pub fn health(mut self, health: Arc<dyn HealthReporter>) -> Self {
        self.health = Some(health);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    #[must_use]
    pub fn path_hash_maker(mut self, path_hash_maker: Arc<dyn PathHashMaker>) -> Self {
        self.path_hash_maker = Some(path_hash_maker);
        self
    }

    #[must_use]
    pub fn build(self) -> TransactionService {
        let config = Arc::new(self.config);
        let health = self
            .health
            .unwrap_or_else(|| Arc::new(AgentHealthReporter::new()));
        let transformer = self
            .transformer
            .unwrap_or_else(|| Arc::new(DiscardingTransformer));
        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(PrioritySampler::new(config.sampling_ratio)));

        let components = EngineComponents {
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            sampler,
            path_hash_maker: self
                .path_hash_maker
                .unwrap_or_else(|| Arc::new(Sha256PathHashMaker)),
            cat: CatHeaderHandler::new(Arc::clone(&config), Arc::clone(&health)),
            dt: DistributedTraceHandler::new(Arc::clone(&config), Arc::clone(&health)),
            finalizer: TransactionFinalizer::new(
                Arc::clone(&config),
                Arc::clone(&health),
                transformer,
            ),
            health,
            config,
        };
        TransactionService {
            components: Arc::new(components),
            store: Arc::new(TransactionContextStore::default()),
        }
    }
}

pub struct TransactionService {
    components: Arc<EngineComponents>,
    store: Arc<TransactionContextStore>,
}

impl TransactionService {
    #[must_use]
    pub fn builder(config: Config) -> TransactionServiceBuilder {
        TransactionServiceBuilder {
            config,
            transformer: None,
            health: None,
            clock: None,
            sampler: None,
            path_hash_maker: None,
        }
    }

    /// A service with the default collaborators, discarding finished
    /// transactions.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.components.config
    }

    #[must_use]
    pub fn health(&self) -> Arc<dyn HealthReporter> {
        Arc::clone(&self.components.health)
    }

    /// The transaction visible from `ctx`, thread entries first.
    #[must_use]
    pub fn current(&self, ctx: &ExecutionContext) -> Option<Transaction> {
        self.store.get(ctx)
    }

    /// Returns the transaction of `ctx`, creating it (and calling
    /// `on_create`) when there is none.
    ///
    /// Unless `must_be_root` is set, reusing an existing transaction counts
    /// as a new unit of work on it, which must be ended before the
    /// transaction finishes.
    pub fn get_or_create(
        &self,
        ctx: &ExecutionContext,
        initial_name: TransactionName,
        on_create: impl FnOnce(&Transaction),
        must_be_root: bool,
    ) -> Transaction {
        let Some(existing) = self.store.get(ctx) else {
            return self.create(ctx, initial_name, on_create);
        };

        let attempts = existing.notice_nested_transaction_attempt();
        if !must_be_root {
            existing.notice_unit_of_work_begins();
        }
        if attempts <= MAX_NESTED_TRANSACTION_ATTEMPTS {
            return existing;
        }

        warn!("Releasing the transaction because there were too many nested transaction attempts.");
        let was_async = self.store.is_attached_to_async(ctx);
        drop(existing);
        self.remove_outstanding_internal_transactions(ctx, true, true);
        let transaction = self.create(ctx, initial_name, on_create);
        if was_async {
            transaction.attach_to_async(ctx);
            // Async continuations on other threads must not find it through
            // this thread.
            self.remove_outstanding_internal_transactions(ctx, false, true);
        }
        transaction
    }

    fn create(
        &self,
        ctx: &ExecutionContext,
        initial_name: TransactionName,
        on_create: impl FnOnce(&Transaction),
    ) -> Transaction {
        self.remove_outstanding_internal_transactions(ctx, true, true);
        let transaction = Transaction::new(
            Arc::clone(&self.components),
            Arc::downgrade(&self.store),
            initial_name,
        );
        self.store.set_primary(ctx, transaction.clone());
        debug!("Created transaction {}", transaction.guid());
        on_create(&transaction);
        transaction
    }

    /// Clears the context entries of `ctx`. Safe to call with nothing stored.
    pub fn remove_outstanding_internal_transactions(
        &self,
        ctx: &ExecutionContext,
        remove_async: bool,
        remove_primary: bool,
    ) {
        self.store.remove(ctx, remove_async, remove_primary);
    }

    /// Stores `transaction` on the async flow of `ctx` unless one is already
    /// there. Returns `false` outside of an async flow.
    pub fn set_transaction_on_async_context(
        &self,
        ctx: &ExecutionContext,
        transaction: &Transaction,
    ) -> bool {
        if ctx.flow().is_none() {
            debug!("No async flow available, transaction not attached to async storage");
            return false;
        }
        if !self.store.is_attached_to_async(ctx) {
            return self.store.set_async(ctx, transaction.clone());
        }
        true
    }

    #[must_use]
    pub fn is_attached_to_async_storage(&self, ctx: &ExecutionContext) -> bool {
        self.store.is_attached_to_async(ctx)
    }
}
