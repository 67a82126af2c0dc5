// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use serde::{Deserialize, Serialize};
use serial_test::serial;

use crate::codec::{FreezeThaw, HookedCodec};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{DispatchError, DispatchResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    celsius: i32,
}

impl FreezeThaw for Reading {
    const TAG: &'static str = "reading";

    fn freeze(&self) -> DispatchResult<Vec<u8>> {
        Ok(self.celsius.to_le_bytes().to_vec())
    }

    fn thaw(bytes: &[u8]) -> DispatchResult<Self> {
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| DispatchError::TransportError { detail: "bad width".into() })?;
        Ok(Self { celsius: i32::from_le_bytes(arr) })
    }
}

struct HeldHandle;

impl FreezeThaw for HeldHandle {
    const TAG: &'static str = "held-handle";

    fn freeze(&self) -> DispatchResult<Vec<u8>> {
        Err(DispatchError::UnserializableResult {
            origin: crate::origin::Origin::here(),
            detail: "holds a live file handle".to_string(),
        })
    }

    fn thaw(_bytes: &[u8]) -> DispatchResult<Self> {
        unreachable!("never produced on the wire")
    }
}

#[test]
#[serial]
fn a_hooked_codec_round_trips_through_a_real_child() {
    let dispatcher: Dispatcher<Reading, HookedCodec> =
        Dispatcher::new(DispatcherConfig::default()).unwrap();
    dispatcher.submit_async(|| Reading { celsius: 21 }).unwrap();
    let results = dispatcher.wait_all().unwrap();
    assert_eq!(results, vec![Reading { celsius: 21 }]);
}

#[test]
#[serial]
fn a_value_that_refuses_to_freeze_surfaces_as_child_failure() {
    let dispatcher: Dispatcher<HeldHandle, HookedCodec> =
        Dispatcher::new(DispatcherConfig::default()).unwrap();
    dispatcher.submit_async(|| HeldHandle).unwrap();

    let err = dispatcher.wait_one().unwrap_err();
    match err {
        DispatchError::ChildFailure { detail, .. } => assert!(detail.contains("live file handle")),
        other => panic!("unexpected error variant: {other:?}"),
    }
}
