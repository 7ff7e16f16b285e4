//! # Traffic Control Requests
//!
//! Builders for the rtnetlink messages that implement per-device shaping on a Linux
//! interface, plus async helpers that send them on an [`rtnetlink::Handle`].
//!
//! ## Layout
//!
//! Every shaped interface carries the same hierarchy. Each shaping session owns one
//! *mark* (`2..=65535`) which is stamped on its packets by a `MARK` rule in the mangle
//! table, and which names every kernel object belonging to that session.
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!                    │     HTB root qdisc (1:0)     │
//!                    │  defcls 0: unmarked traffic  │
//!                    │  is sent unshaped            │
//!                    └──────────────────────────────┘
//!                       │ fw filter, prio 1       │
//!                       │ handle = mark           │
//!                       ▼                         ▼
//!            ┌────────────────────┐    ┌────────────────────┐
//!            │ HTB class 1:mark   │    │ HTB class 1:mark'  │
//!            │ rate = ceil        │    │                    │
//!            └────────────────────┘    └────────────────────┘
//!                       │                         │
//!                       ▼                         ▼
//!            ┌────────────────────┐    ┌────────────────────┐
//!            │ netem (mark:0)     │    │ netem (mark':0)    │
//!            │ delay, loss, ...   │    │                    │
//!            └────────────────────┘    └────────────────────┘
//! ```
//!
//! Deleting a class also deletes the netem qdisc attached below it, so tearing down a
//! session only needs to remove the filter and the class.
//!
//! ## Time units
//!
//! The kernel expresses delays and token-bucket buffers in packet scheduler ticks. The
//! conversion factor is read once from `/proc/net/psched` into a [`psched::Psched`] and
//! passed to every builder that needs it.

#![doc(issue_tracker_base_url = "https://github.com/chainbound/shaperd/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod psched;
pub mod filter;
pub mod handle;
pub mod htb;
pub mod impairment;
pub mod netem;
pub(crate) mod nla;
pub mod qdisc;
pub mod rate;
pub mod requests;
pub mod wrappers;

pub use psched::Psched;
pub use impairment::Impairment;
