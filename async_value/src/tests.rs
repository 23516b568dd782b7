// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::Duration;

use tokio::time::sleep;

use crate::AsyncValue;

#[tokio::test]
async fn send_and_receive() {
    let (_value, sender, receiver) = AsyncValue::<usize>::new();
    sender.send(42);
    assert_eq!(Some(42), receiver.recv().await);
}

#[tokio::test]
async fn receive_joined() {
    let (value, sender, receiver) = AsyncValue::<usize>::new();
    let joined = value.receiver().expect("Work was still live.");
    sender.send(42);
    assert_eq!(Some(42), receiver.recv().await);
    assert_eq!(Some(42), joined.recv().await);
}

#[tokio::test]
async fn dropping_handle_aborts() {
    let (value, mut sender, receiver) = AsyncValue::<usize>::new();
    let work = tokio::spawn(async move {
        tokio::select! {
          _ = sender.aborted() => true,
          _ = sleep(Duration::from_secs(10)) => false,
        }
    });
    std::mem::drop(value);
    assert!(work.await.unwrap());
    assert_eq!(None, receiver.recv().await);
}

#[tokio::test]
async fn dropping_receivers_aborts() {
    let (value, mut sender, receiver) = AsyncValue::<usize>::new();
    let work = tokio::spawn(async move {
        tokio::select! {
          _ = sender.aborted() => true,
          _ = sleep(Duration::from_secs(10)) => false,
        }
    });
    std::mem::drop(receiver);
    assert!(work.await.unwrap());
    // After the last receiver is gone, no further receivers can be minted.
    assert!(value.receiver().is_none());
}
