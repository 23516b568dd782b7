// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Action, WashError};

///
/// Convert unix seconds to a SystemTime. Zero is the zero time (the epoch).
///
pub fn unix_seconds_to_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn time_to_unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

///
/// Parse a C-style integer literal in any base `strtoul` accepts with base 0: `0x`/`0X` prefixed
/// hex, `0` prefixed octal, decimal otherwise.
///
pub fn parse_mode(raw: &str) -> Result<u32, WashError> {
    let s = raw.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|_| WashError::Decode(format!("mode {raw:?} is not an integer literal")))
}

///
/// File-like attributes of an entry, as optionally declared by its plugin. Times are unix
/// seconds on the wire; `mode` is a stringly-encoded integer literal; `valid` is an
/// attribute-validity hint in seconds.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub valid: Option<Duration>,
}

impl Attributes {
    pub fn is_empty(&self) -> bool {
        *self == Attributes::default()
    }
}

///
/// The wire form of `Attributes`. Decoding accepts `mode` as either a string literal or a raw
/// integer; re-serialization always emits the decimal string.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RawAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    atime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mtime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ctime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<RawMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    valid: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawMode {
    Literal(String),
    Numeric(u32),
}

impl TryFrom<RawAttributes> for Attributes {
    type Error = WashError;

    fn try_from(raw: RawAttributes) -> Result<Attributes, WashError> {
        let mode = match raw.mode {
            None => None,
            Some(RawMode::Numeric(mode)) => Some(mode),
            Some(RawMode::Literal(s)) => Some(parse_mode(&s)?),
        };
        Ok(Attributes {
            atime: raw.atime.map(unix_seconds_to_time),
            mtime: raw.mtime.map(unix_seconds_to_time),
            ctime: raw.ctime.map(unix_seconds_to_time),
            size: raw.size,
            mode,
            valid: raw.valid.map(Duration::from_secs),
        })
    }
}

impl From<Attributes> for RawAttributes {
    fn from(attrs: Attributes) -> RawAttributes {
        RawAttributes {
            atime: attrs.atime.map(time_to_unix_seconds),
            mtime: attrs.mtime.map(time_to_unix_seconds),
            ctime: attrs.ctime.map(time_to_unix_seconds),
            size: attrs.size,
            mode: attrs.mode.map(|m| RawMode::Literal(m.to_string())),
            valid: attrs.valid.map(|d| d.as_secs()),
        }
    }
}

impl Serialize for Attributes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawAttributes::from(*self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Attributes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Attributes, D::Error> {
        let raw = RawAttributes::deserialize(deserializer)?;
        Attributes::try_from(raw).map_err(serde::de::Error::custom)
    }
}

///
/// Per-entry cache configuration: a TTL in seconds for each cacheable action slot. The slots
/// mirror the wire schema (`list`, `read`, `metadata`, `open`); `read` falls back to `open`
/// when its own slot is unset.
///
/// The configuration is frozen at decode time: slots a child's decoded form omits inherit
/// exactly the parent's corresponding slot.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTtls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<u64>,
}

impl CacheTtls {
    pub fn uniform(secs: u64) -> CacheTtls {
        CacheTtls {
            list: Some(secs),
            read: Some(secs),
            metadata: Some(secs),
            open: Some(secs),
        }
    }

    ///
    /// Fill unset slots from a parent configuration.
    ///
    pub fn inherit(self, parent: &CacheTtls) -> CacheTtls {
        CacheTtls {
            list: self.list.or(parent.list),
            read: self.read.or(parent.read),
            metadata: self.metadata.or(parent.metadata),
            open: self.open.or(parent.open),
        }
    }

    ///
    /// The TTL to front the given action with. Zero means uncached (in-flight duplicates still
    /// coalesce); actions outside the cacheable slots are always zero.
    ///
    pub fn ttl_for(&self, action: Action) -> Duration {
        let secs = match action {
            Action::List => self.list,
            Action::Read => self.read.or(self.open),
            Action::Metadata => self.metadata,
            _ => None,
        };
        Duration::from_secs(secs.unwrap_or(0))
    }
}

///
/// The decoded form of one element of a plugin's `list` output.
///
/// Unknown fields are ignored; `name` and a non-empty `supported_actions` are required.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub name: String,
    pub supported_actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttls: Option<CacheTtls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_metadata: Option<Map<String, Value>>,
}

impl EntryDescriptor {
    pub fn new<S: AsRef<str>>(name: S, supported_actions: Vec<Action>) -> EntryDescriptor {
        EntryDescriptor {
            name: name.as_ref().to_owned(),
            supported_actions,
            ..EntryDescriptor::default()
        }
    }

    pub fn supports(&self, action: Action) -> bool {
        self.supported_actions.contains(&action)
    }

    fn validate(&self) -> Result<(), WashError> {
        if self.name.is_empty() {
            return Err(WashError::Decode(
                "entry descriptor has an empty name".to_owned(),
            ));
        }
        if self.name.contains('/') {
            return Err(WashError::Decode(format!(
                "entry name {:?} contains a path separator",
                self.name
            )));
        }
        if self.supported_actions.is_empty() {
            return Err(WashError::Decode(format!(
                "entry descriptor {:?} must support at least one action",
                self.name
            )));
        }
        let declared_size = self.attributes.and_then(|a| a.size).unwrap_or(0);
        if declared_size > 0 && !self.supports(Action::Read) {
            return Err(WashError::Decode(format!(
                "entry descriptor {:?} declares a size but does not support the read action",
                self.name
            )));
        }
        Ok(())
    }
}

///
/// Decode a plugin's `list` stdout: a JSON array of entry descriptors.
///
pub fn parse_listing(stdout: &[u8]) -> Result<Vec<EntryDescriptor>, WashError> {
    let descriptors: Vec<EntryDescriptor> = serde_json::from_slice(stdout).map_err(|e| {
        WashError::Decode(format!(
            "plugin stdout was not a JSON array of entry descriptors: {e}"
        ))
    })?;
    for descriptor in &descriptors {
        descriptor.validate()?;
    }
    Ok(descriptors)
}

///
/// Decode a plugin's `metadata` stdout: a JSON object.
///
pub fn parse_metadata(stdout: &[u8]) -> Result<Map<String, Value>, WashError> {
    serde_json::from_slice(stdout)
        .map_err(|e| WashError::Decode(format!("plugin stdout was not a JSON object: {e}")))
}
