// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use std::time::{Duration, Instant};

use serial_test::serial;

use crate::dispatcher::{Dispatcher, DispatcherConfig};

#[test]
#[serial]
fn submit_batch_gives_every_item_its_own_index() {
    let dispatcher: Dispatcher<usize> = Dispatcher::new(DispatcherConfig::default()).unwrap();
    let ids = dispatcher.submit_batch(5, |i| i * i).unwrap();
    assert_eq!(ids.len(), 5);

    let mut results = dispatcher.wait_all().unwrap();
    results.sort_unstable();
    assert_eq!(results, vec![0, 1, 4, 9, 16]);
}

#[test]
#[serial]
fn start_detached_runs_for_side_effects_and_leaves_no_zombie() {
    let dispatcher: Dispatcher<i32> = Dispatcher::new(DispatcherConfig::default()).unwrap();
    let marker = std::env::temp_dir().join(format!("procdispatch-detached-{}", std::process::id()));
    let _ = std::fs::remove_file(&marker);

    let marker_for_child = marker.clone();
    dispatcher
        .start_detached(move || {
            let _ = std::fs::write(&marker_for_child, b"ran");
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !marker.exists() {
        assert!(Instant::now() < deadline, "detached child never wrote its marker file");
        std::thread::sleep(Duration::from_millis(20));
    }
    let contents = std::fs::read(&marker).unwrap();
    assert_eq!(contents, b"ran");
    let _ = std::fs::remove_file(&marker);

    assert_eq!(dispatcher.count(), 0, "detached children are not counted against max_children");
}
