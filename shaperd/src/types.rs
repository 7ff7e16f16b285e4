//! Value types exchanged with clients and persisted to the store.
//!
//! Field names on the wire follow the camel case used by existing clients
//! (`controlledIP`, `iptablesOptions`, ...).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::ReturnCode;

/// Random packet loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Loss {
    pub percentage: f32,
    pub correlation: f32,
}

/// Added latency, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delay {
    pub delay: u32,
    pub jitter: u32,
    pub correlation: f32,
}

/// Random single-bit corruption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Corruption {
    pub percentage: f32,
    pub correlation: f32,
}

/// Packet reordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reorder {
    pub percentage: f32,
    pub correlation: f32,
    pub gap: u32,
}

/// Shaping applied to one direction of traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Shaping {
    /// Rate limit in kbit/s. `0` is unlimited.
    pub rate: u32,
    pub loss: Loss,
    pub delay: Delay,
    pub corruption: Corruption,
    pub reorder: Reorder,
    /// Extra match clauses, one marking rule each. Empty installs a single rule.
    #[serde(alias = "iptables_options")]
    pub iptables_options: Vec<String>,
}

/// Upload (`up`, shaped on the WAN side) and download (`down`, LAN side) shaping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub up: Shaping,
    pub down: Shaping,
}

/// A (controlling, controlled) pair of addresses.
///
/// A device may control itself, in which case both addresses are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "controllingIP")]
    pub controlling_ip: String,
    #[serde(rename = "controlledIP")]
    pub controlled_ip: String,
}

impl Device {
    pub fn new(controlling_ip: impl Into<String>, controlled_ip: impl Into<String>) -> Self {
        Self { controlling_ip: controlling_ip.into(), controlled_ip: controlled_ip.into() }
    }

    /// A device controlling itself.
    pub fn itself(ip: impl Into<String>) -> Self {
        let ip = ip.into();
        Self { controlling_ip: ip.clone(), controlled_ip: ip }
    }
}

/// A request to shape a device for `timeout` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapingSession {
    pub device: Device,
    pub settings: Settings,
    /// Seconds from now until the shaping expires. Negative values are rejected.
    pub timeout: i64,
}

/// Outcome of a mutating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapingRc {
    pub code: ReturnCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ShapingRc {
    pub fn ok() -> Self {
        Self { code: ReturnCode::Ok, message: String::new() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ReturnCode::Ok
    }
}

/// A one-time code letting another device control `ip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub token: String,
    /// Seconds between two codes.
    pub interval: u64,
    /// Unix time at which `token` stops being the current code.
    pub valid_until: u64,
}

/// One side of an access grant and when it lapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteControlInstance {
    pub device: Device,
    /// Unix time at which the grant lapses.
    pub valid_until: u64,
}

/// Parses a textual IPv4 address.
pub(crate) fn parse_ip(ip: &str) -> Option<Ipv4Addr> {
    ip.trim().parse().ok()
}
