//! # shaperd
//!
//! A daemon shaping the traffic of individual devices behind a Linux box.
//!
//! A client asks for a device (by IPv4 address) to be shaped for some time with an upload
//! and a download [`Shaping`](types::Shaping): rate limit, delay, loss, corruption and
//! reordering. The [`Orchestrator`] gives the session a mark, has the
//! [`ShapingBackend`](backend::ShapingBackend) install it on the WAN and LAN interfaces,
//! and records it so that it survives a restart. Sessions are removed on request or by the
//! [`sweeper`] once they expire.
//!
//! A device may always shape itself. Shaping another device requires the one-time code
//! shown on that device, see [`access`].

pub mod access;
pub mod backend;
pub mod config;
pub mod error;
pub mod idpool;
pub mod orchestrator;
pub mod persistence;
pub mod rpc;
pub mod session;
pub mod store;
pub mod sweeper;
pub mod types;

pub use error::{ReturnCode, ShapingError};
pub use orchestrator::{Orchestrator, OrchestratorOptions, RestoreSummary};
pub use persistence::PersistenceQueue;
pub use store::{JsonFileStore, MemoryStore, Store};
