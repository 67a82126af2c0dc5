// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use serial_test::serial;

use crate::dispatcher::{Dispatcher, DispatcherConfig};

#[test]
#[serial]
fn wait_all_collects_every_submitted_result_in_submission_order() {
    let dispatcher: Dispatcher<i32> = Dispatcher::new(DispatcherConfig::default()).unwrap();
    for i in 1..=4 {
        dispatcher.submit_async(move || i * 2).unwrap();
    }
    let results = dispatcher.wait_all().unwrap();
    assert_eq!(results, vec![2, 4, 6, 8], "position i holds the i-th submission's value regardless of completion order");
}

#[test]
#[serial]
fn wait_pid_waits_for_its_target_while_other_children_complete_around_it() {
    let dispatcher: Dispatcher<i32> = Dispatcher::new(DispatcherConfig::default()).unwrap();

    let first = dispatcher.submit_async(|| 10).unwrap();
    dispatcher.submit_async(|| 20).unwrap();
    let last = dispatcher.submit_async(|| 30).unwrap();

    // Waiting specifically for the last submission must still process (not
    // drop) whichever of the other two completes first along the way.
    let value = dispatcher.wait_pid(last).unwrap();
    assert_eq!(value, Some(30));

    let first_value = dispatcher.wait_pid(first).unwrap();
    assert_eq!(first_value, Some(10));

    let remaining = dispatcher.wait_all().unwrap();
    assert_eq!(remaining, vec![20]);
}
