// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-context stacks of open segment ids.
//!
//! Each transaction owns one manager. The stack used for a call is keyed by
//! [`ExecutionContext::stack_key`]; an async flow without a stack of its own
//! inherits the primary stack of the thread it started from.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::context::{ContextKey, ExecutionContext};

/// Deeper pushes are refused. Segments are still recorded, they just never
/// become the parent of anything.
pub const MAX_CALL_STACK_DEPTH: usize = 1000;

#[derive(Debug, Default)]
pub struct CallStackManager {
    stacks: Mutex<HashMap<ContextKey, Vec<usize>>>,
}

impl CallStackManager {
    fn lock(&self) -> MutexGuard<'_, HashMap<ContextKey, Vec<usize>>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, ctx: &ExecutionContext, id: usize) {
        let mut stacks = self.lock();
        let inherited = match ctx.flow() {
            Some(flow) if !stacks.contains_key(&flow) => stacks.get(&ctx.primary()).cloned(),
            _ => None,
        };
        let stack = stacks
            .entry(ctx.stack_key())
            .or_insert_with(|| inherited.unwrap_or_default());
        if stack.len() >= MAX_CALL_STACK_DEPTH {
            warn!("Call stack overflow, segment {id} will not be tracked as a parent");
            return;
        }
        stack.push(id);
    }

    /// Removes `id`, normally from the top of the stack of `ctx`.
    ///
    /// Segments ending out of order, or on a different context than the one
    /// they started on (`started_on`), are removed from wherever they are.
    pub fn try_pop(&self, ctx: &ExecutionContext, id: usize, started_on: ContextKey) {
        let mut stacks = self.lock();
        let key = ctx.stack_key();

        for candidate in [key, started_on] {
            let Some(stack) = stacks.get_mut(&candidate) else {
                continue;
            };
            if stack.last() == Some(&id) {
                stack.pop();
            } else if let Some(position) = stack.iter().rposition(|open| *open == id) {
                debug!("Segment {id} ended out of order, removing it from the middle of the call stack");
                stack.remove(position);
            } else {
                continue;
            }
            if stack.is_empty() {
                stacks.remove(&candidate);
            }
            return;
        }
        debug!("Segment {id} was not found on any call stack");
    }

    /// Id of the segment a new segment started on `ctx` would be a child of.
    #[must_use]
    pub fn current_parent_id(&self, ctx: &ExecutionContext) -> Option<usize> {
        let stacks = self.lock();
        if let Some(stack) = stacks.get(&ctx.stack_key()) {
            return stack.last().copied();
        }
        if ctx.flow().is_some() {
            return stacks.get(&ctx.primary()).and_then(|stack| stack.last().copied());
        }
        None
    }

    /// Copies the primary stack of `ctx` onto its async flow.
    pub fn attach_to_async(&self, ctx: &ExecutionContext) {
        let Some(flow) = ctx.flow() else {
            return;
        };
        let mut stacks = self.lock();
        match stacks.get(&ctx.primary()).cloned() {
            Some(primary) => {
                stacks.insert(flow, primary);
            }
            None => {
                stacks.remove(&flow);
            }
        }
    }

    #[must_use]
    pub fn depth(&self, ctx: &ExecutionContext) -> usize {
        self.lock().get(&ctx.stack_key()).map_or(0, Vec::len)
    }
}
