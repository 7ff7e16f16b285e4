//! Access control between devices.
//!
//! In secure mode a device may only shape itself, unless another device hands it a
//! one-time code. Presenting a valid code grants control for the duration chosen by the
//! device that generated it.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use shaper_common::{unix_secs, Clock};

use crate::{
    error::AccessError,
    types::{parse_ip, AccessToken, Device, RemoteControlInstance},
};

mod totp;
use totp::Totp;

/// Seconds between two codes. Longer than the usual 30 so a person has time to carry the
/// code from one device to the other.
pub const ACCESS_TOKEN_INTERVAL: u64 = 60;

/// Whether access control is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessMode {
    /// A device may only shape itself, or devices that granted it control.
    #[default]
    Secure,
    /// Every device may shape every other device.
    Unsecure,
}

#[derive(Debug)]
struct AccessCode {
    totp: Totp,
    /// How long a grant obtained with this code lasts.
    duration: Duration,
}

#[derive(Debug, Default)]
struct AccessState {
    codes: HashMap<Ipv4Addr, AccessCode>,
    /// `(controlling, controlled)` to grant expiry.
    grants: HashMap<(Ipv4Addr, Ipv4Addr), SystemTime>,
}

/// Issues one-time codes and tracks the grants obtained with them.
#[derive(Debug)]
pub struct AccessManager {
    mode: AccessMode,
    interval: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<AccessState>,
}

impl AccessManager {
    /// A manager issuing codes every [`ACCESS_TOKEN_INTERVAL`] seconds.
    pub fn new(mode: AccessMode, clock: Arc<dyn Clock>) -> Self {
        Self::with_interval(mode, ACCESS_TOKEN_INTERVAL, clock)
    }

    /// A manager issuing codes every `interval` seconds, at least one.
    pub fn with_interval(mode: AccessMode, interval: u64, clock: Arc<dyn Clock>) -> Self {
        Self { mode, interval: interval.max(1), clock, state: Mutex::default() }
    }

    /// Whether access control is enforced.
    pub const fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Returns the current code for `ip`, creating its secret on first use.
    ///
    /// A grant obtained with the code lasts `duration`. Asking again keeps the secret and
    /// only updates the duration.
    pub fn generate_code(&self, ip: &str, duration: Duration) -> Result<AccessToken, AccessError> {
        let addr = parse_ip(ip).ok_or_else(|| AccessError::InvalidIp(ip.to_string()))?;
        let now = self.clock.now();
        if now.checked_add(duration).is_none() {
            return Err(AccessError::InvalidDuration(duration.as_secs()));
        }
        let now = unix_secs(now);

        let mut state = self.state.lock();
        let code = state
            .codes
            .entry(addr)
            .and_modify(|code| code.duration = duration)
            .or_insert_with(|| AccessCode { totp: Totp::random(self.interval), duration });

        tracing::debug!(%addr, ?duration, "generated access code");

        Ok(AccessToken {
            token: code.totp.at(now),
            interval: code.totp.interval(),
            valid_until: code.totp.valid_until(now),
        })
    }

    /// Grants `device.controlling_ip` control over `device.controlled_ip` if `token` is the
    /// controlled device's current code.
    pub fn validate_and_grant(&self, device: &Device, token: &str) -> Result<(), AccessError> {
        if device.controlling_ip == device.controlled_ip {
            return Ok(());
        }

        let (controlling, controlled) = parse_pair(device)?;
        let now = self.clock.now();

        let mut state = self.state.lock();
        let Some(code) = state.codes.get(&controlled) else {
            return Err(AccessError::NoCode(device.controlled_ip.clone()));
        };

        if !code.totp.verify(token, unix_secs(now)) {
            return Err(AccessError::Denied {
                controlling: device.controlling_ip.clone(),
                controlled: device.controlled_ip.clone(),
            });
        }

        let expiry = now
            .checked_add(code.duration)
            .ok_or(AccessError::InvalidDuration(code.duration.as_secs()))?;
        state.grants.insert((controlling, controlled), expiry);
        tracing::info!(%controlling, %controlled, valid_until = unix_secs(expiry), "access granted");

        Ok(())
    }

    /// Whether the controlling device of `device` may shape its controlled device.
    pub fn is_allowed(&self, device: &Device) -> bool {
        if self.mode == AccessMode::Unsecure || device.controlling_ip == device.controlled_ip {
            return true;
        }

        let Ok(key) = parse_pair(device) else {
            return false;
        };

        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.grants.get(&key) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                state.grants.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Live grants held by `controlling_ip` over other devices.
    pub fn grants_held(&self, controlling_ip: &str) -> Vec<RemoteControlInstance> {
        match parse_ip(controlling_ip) {
            Some(ip) => self.live_grants(|(controlling, _)| *controlling == ip),
            None => Vec::new(),
        }
    }

    /// Live grants given by `controlled_ip` to other devices.
    pub fn grants_given(&self, controlled_ip: &str) -> Vec<RemoteControlInstance> {
        match parse_ip(controlled_ip) {
            Some(ip) => self.live_grants(|(_, controlled)| *controlled == ip),
            None => Vec::new(),
        }
    }

    fn live_grants(
        &self,
        filter: impl Fn(&(Ipv4Addr, Ipv4Addr)) -> bool,
    ) -> Vec<RemoteControlInstance> {
        let now = self.clock.now();
        let mut grants: Vec<_> = self
            .state
            .lock()
            .grants
            .iter()
            .filter(|(key, expiry)| filter(key) && **expiry > now)
            .map(|((controlling, controlled), expiry)| RemoteControlInstance {
                device: Device::new(controlling.to_string(), controlled.to_string()),
                valid_until: unix_secs(*expiry),
            })
            .collect();
        grants.sort_by(|a, b| a.device.controlled_ip.cmp(&b.device.controlled_ip));
        grants
    }
}

fn parse_pair(device: &Device) -> Result<(Ipv4Addr, Ipv4Addr), AccessError> {
    let controlling = parse_ip(&device.controlling_ip)
        .ok_or_else(|| AccessError::InvalidIp(device.controlling_ip.clone()))?;
    let controlled = parse_ip(&device.controlled_ip)
        .ok_or_else(|| AccessError::InvalidIp(device.controlled_ip.clone()))?;
    Ok((controlling, controlled))
}
