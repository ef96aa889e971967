//! Host-side snapshot of one device, fed by polls and pushes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Counter and valve channels on the device.
pub const CHANNELS: usize = 3;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValveData {
    /// Position in percent; `None` until the device knows it.
    pub state: Option<u8>,
    pub is_opening: bool,
    pub is_closing: bool,
}

/// Last known device state, as published to the entity layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceData {
    pub valve: [ValveData; CHANNELS],
    pub counter: [Option<u64>; CHANNELS],
    /// Boot epoch in seconds once recorded, otherwise negative seconds
    /// since boot.
    pub uptime: Option<f64>,
    pub reset_cause: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub booted_at: Option<OffsetDateTime>,
    pub unique_id: Option<String>,
    pub firmware: Option<String>,
}

// ---------------------------------------------------------------------------
// Push updates
// ---------------------------------------------------------------------------

/// A push key that updates one field of [`DeviceData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKey {
    Counter(usize),
    Valve(usize),
    Opening(usize),
    Closing(usize),
}

impl PushKey {
    pub fn parse(key: &str) -> Option<Self> {
        let (name, n) = key.rsplit_once('_')?;
        let n: usize = n.parse().ok().filter(|n| *n < CHANNELS)?;
        match name {
            "counter" => Some(Self::Counter(n)),
            "valve" => Some(Self::Valve(n)),
            "opening" => Some(Self::Opening(n)),
            "closing" => Some(Self::Closing(n)),
            _ => None,
        }
    }

    pub fn all() -> impl Iterator<Item = Self> {
        (0..CHANNELS).flat_map(|n| {
            [
                Self::Counter(n),
                Self::Valve(n),
                Self::Opening(n),
                Self::Closing(n),
            ]
        })
    }

    pub fn key(&self) -> String {
        match self {
            Self::Counter(n) => format!("counter_{n}"),
            Self::Valve(n) => format!("valve_{n}"),
            Self::Opening(n) => format!("opening_{n}"),
            Self::Closing(n) => format!("closing_{n}"),
        }
    }
}

impl DeviceData {
    /// Apply a pushed value. Returns false if it did not fit the key.
    pub fn apply(&mut self, key: PushKey, value: &Value) -> bool {
        match key {
            PushKey::Counter(n) => match value {
                Value::Null => self.counter[n] = None,
                v => match v.as_u64() {
                    Some(count) => self.counter[n] = Some(count),
                    None => return false,
                },
            },
            PushKey::Valve(n) => match value {
                Value::Null => self.valve[n].state = None,
                v => match v.as_u64().and_then(|p| u8::try_from(p).ok()) {
                    Some(position) if position <= 100 => self.valve[n].state = Some(position),
                    _ => return false,
                },
            },
            PushKey::Opening(n) => match value.as_bool() {
                Some(on) => self.valve[n].is_opening = on,
                None => return false,
            },
            PushKey::Closing(n) => match value.as_bool() {
                Some(on) => self.valve[n].is_closing = on,
                None => return false,
            },
        }
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================
