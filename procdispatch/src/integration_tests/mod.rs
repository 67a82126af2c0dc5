// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! End-to-end round-trip scenarios (§8), each driving a real
//! [`crate::dispatcher::Dispatcher`] across a real `fork()` boundary rather
//! than exercising a single module in isolation.

mod batch_and_detached;
mod bounded_queue;
mod child_failure;
mod codec_hook;
mod ordered_mode;
