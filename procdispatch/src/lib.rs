// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Submit closures to run in isolated forked subprocesses, collect their
//! results over a framed pipe protocol, bound the number of children running
//! at once, and optionally hand waiting off to an event loop instead of
//! blocking.
//!
//! ```no_run
//! use procdispatch::{Dispatcher, DispatcherConfig};
//!
//! # fn main() -> miette::Result<()> {
//! let dispatcher: Dispatcher<i32> = Dispatcher::new(DispatcherConfig::default())?;
//! dispatcher.submit_async(|| 2 + 2)?;
//! let results = dispatcher.wait_all()?;
//! assert_eq!(results, vec![4]);
//! # Ok(())
//! # }
//! ```
//!
//! A dispatcher is generic over the single result type its work items
//! produce; see [`dispatcher`] for why. Children are real forked processes —
//! the work closure runs in its own address space, so it may not share
//! mutable state with the host beyond what the [`Codec`] carries back.

pub mod child;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod fork;
pub mod frame;
pub mod global;
pub mod multiplexer;
pub mod origin;
pub mod registry;

pub use codec::{Codec, DefaultCodec, FreezeThaw, HookedCodec};
pub use dispatcher::{Dispatcher, DispatcherConfig, MaxChildren, SubmissionId};
pub use error::{DispatchError, DispatchResult};
pub use event_loop::{EventLoopAdapter, MioEventLoop, TokioEventLoop};
pub use origin::Origin;

#[cfg(test)]
mod integration_tests;
