// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::{Duration, UNIX_EPOCH};

use crate::descriptor::{
    parse_listing, parse_metadata, parse_mode, unix_seconds_to_time, Attributes, CacheTtls,
    EntryDescriptor,
};
use crate::{Action, WashError};

fn decode_one(json: &str) -> EntryDescriptor {
    let listing = parse_listing(format!("[{json}]").as_bytes()).expect("Valid descriptor");
    listing.into_iter().next().unwrap()
}

fn decode_err(json: &str) -> WashError {
    parse_listing(format!("[{json}]").as_bytes()).expect_err("Expected a decode failure")
}

#[test]
fn minimal_descriptor() {
    let entry = decode_one(r#"{"name":"vm1","supported_actions":["list","metadata"]}"#);
    assert_eq!("vm1", entry.name);
    assert_eq!(vec![Action::List, Action::Metadata], entry.supported_actions);
    assert_eq!(None, entry.state);
    assert_eq!(None, entry.attributes);
    assert_eq!(None, entry.cache_ttls);
}

#[test]
fn unknown_fields_are_ignored() {
    let entry = decode_one(
        r#"{"name":"vm1","supported_actions":["read"],"vendor_specific":{"x":1},"color":"red"}"#,
    );
    assert_eq!("vm1", entry.name);
}

#[test]
fn missing_name_mentions_the_field() {
    let err = decode_err(r#"{"supported_actions":["read"]}"#);
    assert!(matches!(err, WashError::Decode(_)));
    assert!(err.to_string().contains("name"), "was: {err}");
}

#[test]
fn missing_supported_actions_mentions_actions() {
    let err = decode_err(r#"{"name":"vm1"}"#);
    assert!(err.to_string().contains("action"), "was: {err}");
}

#[test]
fn empty_supported_actions_mentions_actions() {
    let err = decode_err(r#"{"name":"vm1","supported_actions":[]}"#);
    assert!(err.to_string().contains("action"), "was: {err}");
}

#[test]
fn non_array_stdout_mentions_stdout() {
    let err = parse_listing(br#"{"name":"vm1"}"#).expect_err("Expected a decode failure");
    assert!(matches!(err, WashError::Decode(_)));
    assert!(err.to_string().contains("stdout"), "was: {err}");

    let err = parse_listing(b"not json at all").expect_err("Expected a decode failure");
    assert!(err.to_string().contains("stdout"), "was: {err}");
}

#[test]
fn unparseable_mode_fails() {
    let err = decode_err(
        r#"{"name":"vm1","supported_actions":["read"],"attributes":{"mode":"not a number"}}"#,
    );
    assert!(matches!(err, WashError::Decode(_)));
}

#[test]
fn mode_accepts_all_strtoul_bases() {
    assert_eq!(255, parse_mode("0xff").unwrap());
    assert_eq!(255, parse_mode("255").unwrap());
    assert_eq!(255, parse_mode("0377").unwrap());
    assert_eq!(0, parse_mode("0").unwrap());
    assert_eq!(0o644, parse_mode("0644").unwrap());
    assert!(parse_mode("").is_err());
    assert!(parse_mode("0x").is_err());
    assert!(parse_mode("-1").is_err());
}

#[test]
fn times_are_unix_seconds() {
    assert_eq!(UNIX_EPOCH, unix_seconds_to_time(0));
    assert_eq!(
        UNIX_EPOCH + Duration::from_secs(1234567890),
        unix_seconds_to_time(1234567890)
    );

    let entry = decode_one(
        r#"{"name":"f","supported_actions":["read"],
            "attributes":{"atime":10,"mtime":20,"ctime":30,"size":4,"mode":"0644","valid":60}}"#,
    );
    let attrs = entry.attributes.unwrap();
    assert_eq!(Some(unix_seconds_to_time(10)), attrs.atime);
    assert_eq!(Some(unix_seconds_to_time(20)), attrs.mtime);
    assert_eq!(Some(unix_seconds_to_time(30)), attrs.ctime);
    assert_eq!(Some(4), attrs.size);
    assert_eq!(Some(0o644), attrs.mode);
    assert_eq!(Some(Duration::from_secs(60)), attrs.valid);
}

#[test]
fn size_without_read_is_rejected() {
    let err = decode_err(
        r#"{"name":"f","supported_actions":["metadata"],"attributes":{"size":10}}"#,
    );
    assert!(err.to_string().contains("read"), "was: {err}");

    // A zero size does not imply readability.
    decode_one(r#"{"name":"f","supported_actions":["metadata"],"attributes":{"size":0}}"#);
}

#[test]
fn semantic_fields_roundtrip() {
    let entry = decode_one(
        r#"{"name":"vm1","supported_actions":["list","read"],
            "state":"{\"region\":\"us-east-1\"}",
            "attributes":{"mtime":20,"size":4,"mode":"0xff"},
            "cache_ttls":{"list":30},
            "partial_metadata":{"provider":"aws"},
            "unknown_field":true}"#,
    );
    let reencoded = serde_json::to_string(&entry).unwrap();
    let reparsed = parse_listing(format!("[{reencoded}]").as_bytes()).unwrap();
    // Unknown fields dropped; everything semantic identical.
    assert_eq!(vec![entry], reparsed);
}

#[test]
fn ttl_slots_inherit_per_slot() {
    let parent = CacheTtls {
        list: Some(10),
        read: Some(20),
        metadata: Some(30),
        open: Some(40),
    };
    let child = CacheTtls {
        read: Some(5),
        ..CacheTtls::default()
    };
    let merged = child.inherit(&parent);
    assert_eq!(Some(10), merged.list);
    assert_eq!(Some(5), merged.read);
    assert_eq!(Some(30), merged.metadata);
    assert_eq!(Some(40), merged.open);
}

#[test]
fn ttl_lookup_by_action() {
    let ttls = CacheTtls {
        list: Some(10),
        read: None,
        metadata: Some(0),
        open: Some(40),
    };
    assert_eq!(Duration::from_secs(10), ttls.ttl_for(Action::List));
    // `read` falls back to the `open` slot when unset.
    assert_eq!(Duration::from_secs(40), ttls.ttl_for(Action::Read));
    // Zero means uncached.
    assert_eq!(Duration::ZERO, ttls.ttl_for(Action::Metadata));
    // Non-cacheable actions are always zero.
    assert_eq!(Duration::ZERO, ttls.ttl_for(Action::Exec));
    assert_eq!(Duration::ZERO, ttls.ttl_for(Action::Stream));
    assert_eq!(Duration::ZERO, ttls.ttl_for(Action::Write));
}

#[test]
fn metadata_object_parses() {
    let map = parse_metadata(br#"{"provider":"gcp","zone":"us-central1-a"}"#).unwrap();
    assert_eq!(Some("gcp"), map.get("provider").and_then(|v| v.as_str()));

    let err = parse_metadata(b"[1,2,3]").expect_err("Expected a decode failure");
    assert!(err.to_string().contains("stdout"), "was: {err}");
}

#[test]
fn numeric_mode_is_accepted() {
    let entry = decode_one(
        r#"{"name":"f","supported_actions":["read"],"attributes":{"mode":493}}"#,
    );
    assert_eq!(Some(493), entry.attributes.unwrap().mode);
}

#[test]
fn duplicate_safe_attributes_default() {
    assert!(Attributes::default().is_empty());
    let attrs = Attributes {
        size: Some(1),
        ..Attributes::default()
    };
    assert!(!attrs.is_empty());
}
