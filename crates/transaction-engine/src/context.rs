// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Execution contexts and the store mapping them to active transactions.
//!
//! Engine APIs take an explicit [`ExecutionContext`]. Instrumentation resolves
//! the ambient one with [`ExecutionContext::current`], which combines a
//! per-thread key with the key of the enclosing async flow, if any. Async flows
//! are opened with [`in_async_flow`], backed by a tokio task-local.
//!
//! Transactions set on a context are held by that context's slot, not by a
//! shared map. A thread's slot is dropped when the thread exits, a flow's slot
//! when its [`in_async_flow`] future completes or is dropped, and a detached
//! context's slot with its last copy. Dropping a slot drops the transactions it
//! holds, so one left unfinished there goes down the abandoned path.

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tracing::debug;

use crate::transaction::Transaction;

static NEXT_CONTEXT_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextKey(u64);

impl ContextKey {
    #[must_use]
    pub fn next() -> Self {
        ContextKey(NEXT_CONTEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transactions set on one context, at most one per store.
pub(crate) struct ContextSlot {
    key: ContextKey,
    entries: Mutex<Vec<(u64, Transaction)>>,
}

impl ContextSlot {
    fn new() -> Arc<Self> {
        Arc::new(ContextSlot {
            key: ContextKey::next(),
            entries: Mutex::new(Vec::new()),
        })
    }

    fn get(&self, store: u64) -> Option<Transaction> {
        lock(&self.entries)
            .iter()
            .find(|(id, _)| *id == store)
            .map(|(_, transaction)| transaction.clone())
    }

    fn contains(&self, store: u64) -> bool {
        lock(&self.entries).iter().any(|(id, _)| *id == store)
    }

    /// Returns the replaced transaction so it is dropped after the lock.
    fn insert(&self, store: u64, transaction: Transaction) -> Option<Transaction> {
        let mut entries = lock(&self.entries);
        match entries.iter_mut().find(|(id, _)| *id == store) {
            Some((_, stored)) => Some(std::mem::replace(stored, transaction)),
            None => {
                entries.push((store, transaction));
                None
            }
        }
    }

    fn remove_where(
        &self,
        store: u64,
        matches: impl Fn(&Transaction) -> bool,
    ) -> Option<Transaction> {
        let mut entries = lock(&self.entries);
        let position = entries
            .iter()
            .position(|(id, stored)| *id == store && matches(stored))?;
        Some(entries.swap_remove(position).1)
    }
}

thread_local! {
    static THREAD_SLOT: Arc<ContextSlot> = ContextSlot::new();
}

tokio::task_local! {
    static ASYNC_FLOW: Arc<ContextSlot>;
}

/// Runs `future` inside a fresh async flow.
///
/// Code awaited inside the flow sees the same flow key from every worker
/// thread it is polled on, so transactions attached to the async context
/// follow the work across threads. They are released when the flow ends.
pub async fn in_async_flow<F: Future>(future: F) -> F::Output {
    ASYNC_FLOW.scope(ContextSlot::new(), future).await
}

/// One side of an [`ExecutionContext`]: a key and the slot behind it.
#[derive(Clone)]
struct ContextHandle {
    key: ContextKey,
    slot: Weak<ContextSlot>,
    /// Detached contexts keep their own slot alive.
    owned: Option<Arc<ContextSlot>>,
}

impl ContextHandle {
    fn ambient(slot: &Arc<ContextSlot>) -> Self {
        ContextHandle {
            key: slot.key,
            slot: Arc::downgrade(slot),
            owned: None,
        }
    }

    fn owned() -> Self {
        let slot = ContextSlot::new();
        ContextHandle {
            key: slot.key,
            slot: Arc::downgrade(&slot),
            owned: Some(slot),
        }
    }

    fn slot(&self) -> Option<Arc<ContextSlot>> {
        self.slot.upgrade()
    }
}

#[derive(Clone)]
pub struct ExecutionContext {
    primary: ContextHandle,
    flow: Option<ContextHandle>,
}

impl ExecutionContext {
    /// The context of the calling thread and, inside [`in_async_flow`], its flow.
    #[must_use]
    pub fn current() -> Self {
        let primary = THREAD_SLOT
            .try_with(ContextHandle::ambient)
            .unwrap_or_else(|_| ContextHandle::owned());
        ExecutionContext {
            primary,
            flow: ASYNC_FLOW.try_with(ContextHandle::ambient).ok(),
        }
    }

    /// A context shared with nothing else. It lives as long as its copies.
    #[must_use]
    pub fn detached() -> Self {
        ExecutionContext {
            primary: ContextHandle::owned(),
            flow: None,
        }
    }

    /// Same thread, new async flow.
    #[must_use]
    pub fn with_new_flow(&self) -> Self {
        ExecutionContext {
            primary: self.primary.clone(),
            flow: Some(ContextHandle::owned()),
        }
    }

    /// The same flow observed from another thread.
    #[must_use]
    pub fn on_other_thread(&self) -> Self {
        ExecutionContext {
            primary: ContextHandle::owned(),
            flow: self.flow.clone(),
        }
    }

    #[must_use]
    pub fn primary(&self) -> ContextKey {
        self.primary.key
    }

    #[must_use]
    pub fn flow(&self) -> Option<ContextKey> {
        self.flow.as_ref().map(|flow| flow.key)
    }

    /// Key of the call stack segments started here are pushed onto.
    #[must_use]
    pub fn stack_key(&self) -> ContextKey {
        self.flow().unwrap_or(self.primary.key)
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.primary() == other.primary() && self.flow() == other.flow()
    }
}

impl Eq for ExecutionContext {}

impl Hash for ExecutionContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.primary().hash(state);
        self.flow().hash(state);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("primary", &self.primary())
            .field("flow", &self.flow())
            .finish()
    }
}

/// Maps execution contexts to the transaction active on them.
///
/// Primary (thread) entries are consulted before async flow entries. Entries
/// live in the slots of the contexts themselves; the store only names them.
pub struct TransactionContextStore {
    id: u64,
}

impl Default for TransactionContextStore {
    fn default() -> Self {
        TransactionContextStore {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl TransactionContextStore {
    #[must_use]
    pub fn get(&self, ctx: &ExecutionContext) -> Option<Transaction> {
        if let Some(transaction) = ctx
            .primary
            .slot()
            .and_then(|slot| slot.get(self.id))
        {
            return Some(transaction);
        }
        ctx.flow.as_ref()?.slot()?.get(self.id)
    }

    pub fn set_primary(&self, ctx: &ExecutionContext, transaction: Transaction) {
        self.set(&ctx.primary, transaction);
    }

    /// Returns `false` when `ctx` is not inside a live async flow.
    pub fn set_async(&self, ctx: &ExecutionContext, transaction: Transaction) -> bool {
        let Some(flow) = &ctx.flow else {
            debug!("No async flow available, transaction not attached to async storage");
            return false;
        };
        self.set(flow, transaction)
    }

    fn set(&self, handle: &ContextHandle, transaction: Transaction) -> bool {
        let Some(slot) = handle.slot() else {
            debug!(
                "Context {:?} has already ended, transaction {} not stored",
                handle.key,
                transaction.guid()
            );
            return false;
        };
        transaction.note_held_by(&slot);
        let previous = slot.insert(self.id, transaction);
        drop(previous);
        true
    }

    #[must_use]
    pub fn is_attached_to_async(&self, ctx: &ExecutionContext) -> bool {
        ctx.flow
            .as_ref()
            .and_then(ContextHandle::slot)
            .is_some_and(|slot| slot.contains(self.id))
    }

    /// Removes the entries for `ctx`. Safe to call when nothing is stored.
    pub fn remove(&self, ctx: &ExecutionContext, remove_async: bool, remove_primary: bool) {
        // Removed transactions are dropped after the slot locks are released,
        // since dropping the last reference may run the abandoned-transaction
        // path.
        let mut removed = Vec::with_capacity(2);
        if remove_primary {
            if let Some(slot) = ctx.primary.slot() {
                removed.extend(slot.remove_where(self.id, |_| true));
            }
        }
        if remove_async {
            if let Some(slot) = ctx.flow.as_ref().and_then(ContextHandle::slot) {
                removed.extend(slot.remove_where(self.id, |_| true));
            }
        }
        drop(removed);
    }

    /// Removes every entry that refers to `transaction`.
    pub fn release(&self, transaction: &Transaction) {
        let mut removed = Vec::new();
        for slot in transaction.take_holders() {
            if let Some(slot) = slot.upgrade() {
                removed.extend(slot.remove_where(self.id, |stored| stored.ptr_eq(transaction)));
            }
        }
        drop(removed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::name::TransactionName;
    use crate::service::TransactionService;

    fn name() -> TransactionName {
        TransactionName::other("Job", "nightly")
    }

    #[test]
    fn test_current_is_stable_per_thread() {
        let a = ExecutionContext::current();
        let b = ExecutionContext::current();
        assert_eq!(a, b);
        assert!(a.flow().is_none());

        let other = std::thread::spawn(ExecutionContext::current).join().unwrap();
        assert_ne!(a.primary(), other.primary());
    }

    #[tokio::test]
    async fn test_async_flow_is_visible_inside_scope() {
        assert!(ExecutionContext::current().flow().is_none());
        let flow = in_async_flow(async { ExecutionContext::current().flow() }).await;
        assert!(flow.is_some());

        let (first, second) = in_async_flow(async {
            let first = ExecutionContext::current().flow();
            tokio::task::yield_now().await;
            (first, ExecutionContext::current().flow())
        })
        .await;
        assert_eq!(first, second);
    }

    #[test]
    fn test_stack_key_prefers_flow() {
        let ctx = ExecutionContext::detached();
        assert_eq!(ctx.stack_key(), ctx.primary());
        let flow = ctx.with_new_flow();
        assert_eq!(flow.primary(), ctx.primary());
        assert_eq!(Some(flow.stack_key()), flow.flow());
        let moved = flow.on_other_thread();
        assert_eq!(moved.flow(), flow.flow());
        assert_ne!(moved.primary(), flow.primary());
    }

    #[test]
    fn test_detached_slot_lives_with_its_copies() {
        let service = TransactionService::new(Config::default());
        let ctx = ExecutionContext::detached();
        let copy = ctx.clone();
        let tx = service.get_or_create(&ctx, name(), |_| {}, true);
        drop(ctx);
        assert!(service
            .current(&copy)
            .is_some_and(|found| found.ptr_eq(&tx)));
    }

    #[test]
    fn test_ended_thread_context_stores_nothing() {
        let service = TransactionService::new(Config::default());
        let tx = service.get_or_create(&ExecutionContext::detached(), name(), |_| {}, true);
        let ended = std::thread::spawn(ExecutionContext::current).join().unwrap();

        let store = TransactionContextStore::default();
        store.set_primary(&ended, tx);
        assert!(store.get(&ended).is_none());
    }

    #[test]
    fn test_stores_do_not_share_entries() {
        let first = TransactionService::new(Config::default());
        let second = TransactionService::new(Config::default());
        let ctx = ExecutionContext::detached();
        let tx = first.get_or_create(&ctx, name(), |_| {}, true);
        assert!(second.current(&ctx).is_none());
        let other = second.get_or_create(&ctx, name(), |_| {}, true);
        assert!(!other.ptr_eq(&tx));
        assert!(first.current(&ctx).is_some_and(|found| found.ptr_eq(&tx)));
    }
}
