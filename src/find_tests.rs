// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;

use regex::Regex;
use serde_json::json;

use crate::find::{find, FindPredicates};
use crate::testutil::{dir_descriptor, fake_core, file_descriptor, FakeInvoker};
use entries::Context;
use journal::JournalId;

fn populate(fake: &Arc<FakeInvoker>) {
    fake.listings.lock().insert(
        "/fake".to_owned(),
        vec![dir_descriptor("vms"), file_descriptor("readme", 5)],
    );
    fake.listings.lock().insert(
        "/fake/vms".to_owned(),
        vec![file_descriptor("vm1", 0), file_descriptor("vm2", 0)],
    );
    fake.metadata.lock().insert(
        "/fake/vms/vm1".to_owned(),
        json!({"zone": "us-east-1a"}).as_object().unwrap().clone(),
    );
}

fn context() -> Context {
    Context::new(JournalId::new("find-test"))
}

#[tokio::test]
async fn visits_depth_first_in_listing_order() {
    let fake = FakeInvoker::new();
    populate(&fake);
    let (core, _dir) = fake_core(&fake);

    let matched = find(&core.registry, &context(), "/fake", &FindPredicates::default())
        .await
        .unwrap();
    assert_eq!(
        vec!["/fake", "/fake/vms", "/fake/vms/vm1", "/fake/vms/vm2", "/fake/readme"],
        matched
    );
    // Without metadata predicates, metadata is never pulled.
    assert!(fake.metadata_calls.lock().is_empty());
}

#[tokio::test]
async fn filters_by_name_regex() {
    let fake = FakeInvoker::new();
    populate(&fake);
    let (core, _dir) = fake_core(&fake);

    let predicates = FindPredicates {
        name: Some(Regex::new(r"^vm\d$").unwrap()),
        ..FindPredicates::default()
    };
    let matched = find(&core.registry, &context(), "/fake", &predicates)
        .await
        .unwrap();
    assert_eq!(vec!["/fake/vms/vm1", "/fake/vms/vm2"], matched);
}

#[tokio::test]
async fn filters_by_size() {
    let fake = FakeInvoker::new();
    populate(&fake);
    let (core, _dir) = fake_core(&fake);

    let predicates = FindPredicates {
        min_size: Some(1),
        ..FindPredicates::default()
    };
    let matched = find(&core.registry, &context(), "/fake", &predicates)
        .await
        .unwrap();
    assert_eq!(vec!["/fake/readme"], matched);
}

#[tokio::test]
async fn respects_max_depth() {
    let fake = FakeInvoker::new();
    populate(&fake);
    let (core, _dir) = fake_core(&fake);

    let predicates = FindPredicates {
        max_depth: Some(1),
        ..FindPredicates::default()
    };
    let matched = find(&core.registry, &context(), "/fake", &predicates)
        .await
        .unwrap();
    assert_eq!(vec!["/fake", "/fake/vms", "/fake/readme"], matched);
    // Nothing below the depth limit was listed.
    assert!(!fake.list_calls.lock().contains(&"/fake/vms".to_owned()));
}

#[tokio::test]
async fn metadata_predicates_pull_metadata_lazily() {
    let fake = FakeInvoker::new();
    populate(&fake);
    let (core, _dir) = fake_core(&fake);

    let predicates = FindPredicates {
        metadata: vec![("zone".to_owned(), json!("us-east-1a"))],
        ..FindPredicates::default()
    };
    let matched = find(&core.registry, &context(), "/fake", &predicates)
        .await
        .unwrap();
    assert_eq!(vec!["/fake/vms/vm1"], matched);
}

#[tokio::test]
async fn starts_at_the_virtual_root() {
    let fake = FakeInvoker::new();
    populate(&fake);
    let (core, _dir) = fake_core(&fake);

    let predicates = FindPredicates {
        name: Some(Regex::new("^readme$").unwrap()),
        ..FindPredicates::default()
    };
    let matched = find(&core.registry, &context(), "/", &predicates)
        .await
        .unwrap();
    assert_eq!(vec!["/fake/readme"], matched);
}

#[tokio::test]
async fn missing_start_is_not_found() {
    let fake = FakeInvoker::new();
    populate(&fake);
    let (core, _dir) = fake_core(&fake);

    let err = find(
        &core.registry,
        &context(),
        "/fake/gone",
        &FindPredicates::default(),
    )
    .await
    .expect_err("Expected failure");
    assert_eq!(entries::WashError::NotFound("/fake/gone".to_owned()), err);
}
