// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! §6: "A façade may provide the same operations over an implicit
//! process-singleton dispatcher; it introduces no new semantics." This
//! module is exactly that — pure delegation to a lazily-constructed,
//! per-result-type default [`Dispatcher`], keyed by `(T, C)` since Rust has
//! no single process-wide dispatcher that could hold every result type at
//! once.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::codec::{Codec, DefaultCodec};
use crate::dispatcher::{Dispatcher, DispatcherConfig, SubmissionId};
use crate::error::DispatchResult;

fn registry() -> &'static Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The process-singleton dispatcher for result type `T`, using
/// [`DefaultCodec`]. Constructed with [`DispatcherConfig::default`] on first
/// use.
#[must_use]
pub fn dispatcher<T>() -> Dispatcher<T>
where
    T: Send + 'static,
{
    dispatcher_with::<T, DefaultCodec>()
}

/// As [`dispatcher`], parameterized over a custom [`Codec`].
#[must_use]
pub fn dispatcher_with<T, C>() -> Dispatcher<T, C>
where
    T: Send + 'static,
    C: Codec<T> + Send + Sync + 'static,
{
    let mut guard = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let boxed = guard.entry(TypeId::of::<(T, C)>()).or_insert_with(|| {
        let dispatcher = Dispatcher::<T, C>::new(DispatcherConfig::default())
            .expect("DispatcherConfig::default always has a positive max_children");
        Box::new(dispatcher)
    });
    boxed
        .downcast_ref::<Dispatcher<T, C>>()
        .expect("TypeId uniquely identifies (T, C) here")
        .clone()
}

/// Submits `work` to the process-singleton dispatcher for `T`.
///
/// # Errors
/// See [`Dispatcher::submit_async`].
#[track_caller]
pub fn submit_async<T>(work: impl FnOnce() -> T + Send + 'static) -> DispatchResult<SubmissionId>
where
    T: Send + 'static,
{
    dispatcher::<T>().submit_async(work)
}

/// Blocks until the process-singleton dispatcher for `T` has no running or
/// queued work left, returning every result.
///
/// # Errors
/// See [`Dispatcher::wait_all`].
pub fn wait_all<T>() -> DispatchResult<Vec<T>>
where
    T: Send + 'static,
{
    dispatcher::<T>().wait_all()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn global_submit_and_wait_all_round_trips() {
        submit_async(|| 99_i64).unwrap();
        let results = wait_all::<i64>().unwrap();
        assert_eq!(results, vec![99]);
    }

    #[test]
    #[serial]
    fn repeated_calls_return_the_same_underlying_dispatcher() {
        let a = dispatcher::<u8>();
        let b = dispatcher::<u8>();
        a.submit_async(|| 1u8).unwrap();
        assert_eq!(b.count() + b.pending_count(), 1);
        let _ = b.wait_all().unwrap();
    }
}
