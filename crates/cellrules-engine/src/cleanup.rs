//! Scoped cleanup
//!
//! A stack of named scopes, each collecting teardown callbacks. Everything a
//! reload unit registers while its scope is on top of the stack is undone,
//! in registration order, when that scope's cleanups run.

use indexmap::IndexMap;
use tracing::{debug, trace};

/// A teardown callback receiving the owner of the cleanup stack
pub type CleanupFn<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Anything that owns a [`ScopedCleanup`] over itself
pub trait CleanupOwner: Sized {
    fn cleanup_mut(&mut self) -> &mut ScopedCleanup<Self>;
}

/// Cleanup callbacks grouped by scope
pub struct ScopedCleanup<C> {
    lists: IndexMap<String, Vec<CleanupFn<C>>>,
    stack: Vec<String>,
}

impl<C> ScopedCleanup<C> {
    pub fn new() -> Self {
        Self {
            lists: IndexMap::new(),
            stack: Vec::new(),
        }
    }

    /// Make `scope` the target of subsequent registrations
    ///
    /// # Panics
    ///
    /// Panics if `scope` is empty.
    pub fn push_scope(&mut self, scope: impl Into<String>) {
        let scope = scope.into();
        if scope.is_empty() {
            panic!("trying to push an empty scope");
        }
        trace!(scope = %scope, "Pushing cleanup scope");
        self.stack.push(scope);
    }

    /// Leave `scope`, which must be on top of the stack
    ///
    /// # Panics
    ///
    /// Panics if `scope` is not the current top.
    pub fn pop_scope(&mut self, scope: &str) {
        match self.stack.last() {
            Some(top) if top == scope => {
                self.stack.pop();
            }
            _ => panic!("scoped cleanup stack error"),
        }
    }

    pub fn current_scope(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    /// Register a cleanup for the current scope
    ///
    /// Outside of any scope the registration is dropped.
    pub fn add_cleanup(&mut self, cleanup: CleanupFn<C>) {
        let Some(scope) = self.stack.last() else {
            return;
        };
        self.lists.entry(scope.clone()).or_default().push(cleanup);
    }

    /// Remove and return the cleanups registered for `scope`
    pub fn take_cleanups(&mut self, scope: &str) -> Vec<CleanupFn<C>> {
        self.lists.shift_remove(scope).unwrap_or_default()
    }

    /// Number of cleanups pending for `scope`
    pub fn pending(&self, scope: &str) -> usize {
        self.lists.get(scope).map(Vec::len).unwrap_or(0)
    }

    /// Scopes that have pending cleanups, in first-registration order
    pub fn scopes(&self) -> Vec<String> {
        self.lists.keys().cloned().collect()
    }
}

impl<C> Default for ScopedCleanup<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run and discard every cleanup registered for `scope`, FIFO
pub fn run_cleanups<C: CleanupOwner>(owner: &mut C, scope: &str) {
    let cleanups = owner.cleanup_mut().take_cleanups(scope);
    if cleanups.is_empty() {
        return;
    }
    debug!(scope = %scope, count = cleanups.len(), "Running cleanups");
    for cleanup in cleanups {
        cleanup(owner);
    }
}

/// Run the cleanups of every scope
pub fn run_all_cleanups<C: CleanupOwner>(owner: &mut C) {
    for scope in owner.cleanup_mut().scopes() {
        run_cleanups(owner, &scope);
    }
}
