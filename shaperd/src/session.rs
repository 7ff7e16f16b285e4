//! The live session table.

use std::{collections::HashMap, net::Ipv4Addr, time::SystemTime};

use parking_lot::RwLock;

use crate::{idpool::Mark, types::ShapingSession};

/// A device currently shaped under `mark`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSession {
    pub mark: Mark,
    /// The request as accepted, with the controlled IP normalized.
    pub session: ShapingSession,
    /// When the sweeper stops the session.
    pub expiry: SystemTime,
}

/// Live sessions keyed by controlled IP.
#[derive(Debug, Default)]
pub struct SessionTable {
    by_ip: RwLock<HashMap<Ipv4Addr, LiveSession>>,
}

impl SessionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `ip` to `live`, returning the session it replaces.
    pub fn insert(&self, ip: Ipv4Addr, live: LiveSession) -> Option<LiveSession> {
        self.by_ip.write().insert(ip, live)
    }

    /// Unbinds `ip`, returning its session if it had one.
    pub fn remove(&self, ip: Ipv4Addr) -> Option<LiveSession> {
        self.by_ip.write().remove(&ip)
    }

    /// A copy of the session of `ip`.
    pub fn get(&self, ip: Ipv4Addr) -> Option<LiveSession> {
        self.by_ip.read().get(&ip).cloned()
    }

    /// Whether `ip` is currently shaped.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.by_ip.read().contains_key(&ip)
    }

    /// Number of shaped devices.
    pub fn len(&self) -> usize {
        self.by_ip.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Devices whose session expired at or before `now`.
    pub fn expired(&self, now: SystemTime) -> Vec<Ipv4Addr> {
        self.by_ip
            .read()
            .iter()
            .filter(|(_, live)| live.expiry <= now)
            .map(|(ip, _)| *ip)
            .collect()
    }
}
