// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use serial_test::serial;

use crate::dispatcher::{Dispatcher, DispatcherConfig, MaxChildren};
use crate::error::DispatchError;

#[test]
#[serial]
fn a_panicking_work_item_surfaces_its_origin_and_message() {
    let dispatcher: Dispatcher<i32> = Dispatcher::new(DispatcherConfig::default()).unwrap();
    let line = line!() + 1;
    dispatcher.submit_async(|| panic!("boom")).unwrap();

    let err = dispatcher.wait_one().unwrap_err();
    match err {
        DispatchError::ChildFailure { origin, detail } => {
            assert!(detail.contains("boom"));
            assert!(origin.file.ends_with("child_failure.rs"));
            assert_eq!(origin.line, line);
        }
        other => panic!("unexpected error variant: {other:?}"),
    }
}

#[test]
#[serial]
fn one_failing_child_does_not_stop_siblings_from_being_reaped() {
    let dispatcher: Dispatcher<i32> =
        Dispatcher::new(DispatcherConfig { max_children: MaxChildren::Bounded(3), event_loop: None }).unwrap();
    dispatcher.submit_async(|| 1).unwrap();
    dispatcher.submit_async(|| panic!("deliberate")).unwrap();
    dispatcher.submit_async(|| 3).unwrap();

    let mut saw_failure = false;
    let mut values = Vec::new();
    for _ in 0..3 {
        match dispatcher.wait_one() {
            Ok(Some(v)) => values.push(v),
            Ok(None) => break,
            Err(DispatchError::ChildFailure { .. }) => saw_failure = true,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(saw_failure);
    values.sort_unstable();
    assert_eq!(values, vec![1, 3]);
}
