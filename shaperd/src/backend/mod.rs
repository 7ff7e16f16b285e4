//! Kernel shaping backends.
//!
//! A backend turns one direction of a [`Shaping`] into kernel objects on one interface,
//! keyed by a [`Mark`]. The orchestrator only talks to the [`ShapingBackend`] trait; the
//! concrete backend is picked once at startup.

use std::{fmt, future::Future, net::Ipv4Addr};

use crate::{error::ReturnCode, idpool::Mark, types::Shaping};

pub mod iptables;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod noop;

#[cfg(target_os = "linux")]
pub use linux::{LinuxOptions, LinuxShaper};
pub use noop::NoopShaper;

/// Marks usable by default: class `1:1` and qdisc `1:0` belong to the root, minor numbers
/// are 16 bits wide.
pub const DEFAULT_MARK_RANGE: (Mark, Mark) = (2, Mark::MAX);

/// Which side of the box an interface faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Faces the shaped devices. Their traffic arrives here with them as the source.
    Lan,
    /// Faces the uplink. Traffic to the shaped devices arrives here with them as the
    /// destination.
    Wan,
}

/// A network interface the backend shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interface {
    /// Kernel name, e.g. `eth0`.
    pub name: String,
    pub role: Role,
}

impl Interface {
    /// The interface facing the shaped devices.
    pub fn lan(name: impl Into<String>) -> Self {
        Self { name: name.into(), role: Role::Lan }
    }

    /// The interface facing the uplink.
    pub fn wan(name: impl Into<String>) -> Self {
        Self { name: name.into(), role: Role::Wan }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The LAN and WAN interfaces of the box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interfaces {
    pub lan: Interface,
    pub wan: Interface,
}

impl Interfaces {
    /// Pairs the interface names given on the command line.
    pub fn new(lan: impl Into<String>, wan: impl Into<String>) -> Self {
        Self { lan: Interface::lan(lan), wan: Interface::wan(wan) }
    }
}

/// A failed backend step. The netlink variants carry the kernel's message; the unknown
/// variants cover every other failure of the same step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("netlink error on htb class: {0}")]
    NetlinkHtb(String),
    #[error("unexpected error on htb class: {0}")]
    UnknownHtb(String),
    #[error("netlink error on netem qdisc: {0}")]
    NetlinkNetem(String),
    #[error("unexpected error on netem qdisc: {0}")]
    UnknownNetem(String),
    #[error("netlink error on fw filter: {0}")]
    NetlinkFw(String),
    #[error("unexpected error on fw filter: {0}")]
    UnknownFw(String),
    #[error("interface {name}: {reason}")]
    Interface { name: String, reason: String },
    #[error("backend initialization failed: {0}")]
    Init(String),
}

impl BackendError {
    /// The code reported to clients for this failure.
    pub fn code(&self) -> ReturnCode {
        match self {
            Self::NetlinkHtb(_) => ReturnCode::NetlinkHtbError,
            Self::NetlinkNetem(_) => ReturnCode::NetlinkNetemError,
            Self::UnknownNetem(_) => ReturnCode::UnknownNetemError,
            Self::NetlinkFw(_) => ReturnCode::NetlinkFwError,
            Self::UnknownFw(_) => ReturnCode::UnknownFwError,
            Self::UnknownHtb(_) | Self::Interface { .. } | Self::Init(_) => {
                ReturnCode::UnknownHtbError
            }
        }
    }
}

/// Programs the kernel for shaping sessions.
///
/// Implementations must be safe to call concurrently, but the orchestrator never issues
/// two mutating calls at once.
pub trait ShapingBackend: Send + Sync + 'static {
    /// The inclusive range of marks this backend can address.
    fn mark_range(&self) -> (Mark, Mark);

    /// Discards whatever shaping is installed on `interfaces` and installs a clean root.
    fn initialize_interfaces(
        &self,
        interfaces: &Interfaces,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Shapes traffic of `ip` on `iface` under `mark`.
    ///
    /// On error nothing created by this call is left behind, except marking rules.
    fn shape_interface(
        &self,
        mark: Mark,
        iface: &Interface,
        ip: Ipv4Addr,
        shaping: &Shaping,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Removes what [`ShapingBackend::shape_interface`] installed. Every step is attempted;
    /// the first failure is returned.
    fn unshape_interface(
        &self,
        mark: Mark,
        iface: &Interface,
        ip: Ipv4Addr,
        shaping: &Shaping,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Releases backend resources. Installed shaping is left in place.
    fn teardown(&self) -> impl Future<Output = ()> + Send;
}
