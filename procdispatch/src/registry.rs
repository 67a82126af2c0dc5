// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! §4.8 process-wide weak registry. Every [`crate::dispatcher::Dispatcher`]
//! registers its shared inner state here on construction. When a forked
//! child starts running, [`reset_after_fork`] walks the registry and asks
//! each still-live dispatcher to forget the children it inherited from the
//! parent's address space — those pids belong to the parent, not to this
//! process, and waiting on them here would hang forever.

use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Implemented by a dispatcher's shared inner state. Kept as a trait (rather
/// than `registry` depending on `dispatcher` concretely) the way the
/// teacher's `resilient_reactor_thread` module depends on `RRTWorker`/
/// `RRTFactory` traits instead of a concrete worker type.
pub trait ResetAfterFork: Send + Sync {
    /// Drops any state describing children forked before this process image
    /// was replaced: pending pids, open read ends, queued work.
    fn reset_after_fork(&self);
}

type Slot = Weak<dyn ResetAfterFork>;

fn registry() -> &'static Mutex<Vec<Slot>> {
    static REGISTRY: OnceLock<Mutex<Vec<Slot>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registers a dispatcher's inner state. Called once, from inside
/// `Dispatcher::new`. Dead entries are pruned opportunistically on each
/// registration (§4.8), the same way `reset_after_fork` prunes them.
pub(crate) fn register(inner: &Arc<dyn ResetAfterFork>) {
    let mut guard = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.retain(|weak| weak.upgrade().is_some());
    guard.push(Arc::downgrade(inner));
}

/// Walks every still-live registered dispatcher and resets it. Called once,
/// immediately after `fork()` returns `0` in the child, before the child
/// runner executes the submitted work.
pub(crate) fn reset_after_fork() {
    let mut guard = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.retain(|weak| match weak.upgrade() {
        Some(inner) => {
            inner.reset_after_fork();
            true
        }
        None => false,
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serial_test::serial;

    use super::*;

    struct Counter(AtomicUsize);

    impl ResetAfterFork for Counter {
        fn reset_after_fork(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    #[serial]
    fn reset_after_fork_visits_live_entries_and_prunes_dead_ones() {
        let alive_concrete = Arc::new(Counter(AtomicUsize::new(0)));
        let alive: Arc<dyn ResetAfterFork> = alive_concrete.clone();
        register(&alive);
        {
            let dying: Arc<dyn ResetAfterFork> = Arc::new(Counter(AtomicUsize::new(0)));
            register(&dying);
        }

        reset_after_fork();

        assert_eq!(alive_concrete.0.load(Ordering::SeqCst), 1);
        let guard = registry().lock().unwrap();
        assert_eq!(guard.len(), 1, "dead entry should have been pruned");
    }

    #[test]
    #[serial]
    fn register_prunes_dead_entries_without_waiting_for_a_fork() {
        {
            let dying: Arc<dyn ResetAfterFork> = Arc::new(Counter(AtomicUsize::new(0)));
            register(&dying);
        }
        assert_eq!(registry().lock().unwrap().len(), 1, "dying entry is still registered until the next register()");

        let alive: Arc<dyn ResetAfterFork> = Arc::new(Counter(AtomicUsize::new(0)));
        register(&alive);

        assert_eq!(registry().lock().unwrap().len(), 1, "register() pruned the dead entry before adding the live one");
    }
}
