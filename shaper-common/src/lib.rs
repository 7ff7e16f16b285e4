#![doc(issue_tracker_base_url = "https://github.com/chainbound/shaperd/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::time::{Duration, SystemTime};

pub mod clock;
pub mod command;

pub use clock::{Clock, ManualClock, SystemClock};

/// Returns the number of whole seconds between the UNIX epoch and `time`.
///
/// Times before the epoch are clamped to zero.
#[inline]
pub fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

/// Returns the [`SystemTime`] that is `secs` seconds after the UNIX epoch.
#[inline]
pub fn from_unix_secs(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}
