// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use std::sync::mpsc;
use std::time::Duration;

use serial_test::serial;

use crate::dispatcher::{Dispatcher, DispatcherConfig, MaxChildren};

#[test]
#[serial]
fn queue_drains_into_free_slots_as_children_complete() {
    let dispatcher: Dispatcher<i32> =
        Dispatcher::new(DispatcherConfig { max_children: MaxChildren::Bounded(2), event_loop: None }).unwrap();

    for i in 0..6 {
        dispatcher.queue(move || i).unwrap();
    }
    assert!(dispatcher.count() <= 2, "never more than max_children run at once");
    assert_eq!(dispatcher.count() + dispatcher.pending_count(), 6);

    let mut results = dispatcher.wait_all().unwrap();
    results.sort_unstable();
    assert_eq!(results, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(dispatcher.count(), 0);
    assert_eq!(dispatcher.pending_count(), 0);
}

#[test]
#[serial]
fn submit_async_bypasses_the_bound_that_queue_respects() {
    let dispatcher: Dispatcher<i32> =
        Dispatcher::new(DispatcherConfig { max_children: MaxChildren::Bounded(2), event_loop: None }).unwrap();

    for _ in 0..5 {
        dispatcher.submit_async(|| 1).unwrap();
    }
    assert_eq!(dispatcher.count(), 5, "direct async submissions are not counted against max_children");
    assert_eq!(dispatcher.pending_count(), 0, "submit_async never queues");

    let results = dispatcher.wait_all().unwrap();
    assert_eq!(results.len(), 5);
}

#[test]
#[serial]
fn wait_all_completes_within_a_wall_clock_bound() {
    let dispatcher: Dispatcher<i32> =
        Dispatcher::new(DispatcherConfig { max_children: MaxChildren::Bounded(2), event_loop: None }).unwrap();
    for _ in 0..4 {
        dispatcher.queue(|| 7).unwrap();
    }

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(dispatcher.wait_all());
    });

    let results = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("wait_all should finish well within the bounded queue's drain time")
        .unwrap();
    assert_eq!(results, vec![7; 4]);
}
