//! Packet scheduler time base.
//!
//! The Linux kernel's traffic control subsystem uses its own time units ("ticks").
//! [`Psched`] converts between microseconds and ticks.

use std::io;

/// Path to the kernel's packet scheduler timing information.
pub const PSCHED_PATH: &str = "/proc/net/psched";

/// Standard Ethernet MTU in bytes.
pub const MTU_ETHERNET: u32 = 1_500;

/// Ticks-per-microsecond conversion factor of the running kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Psched {
    tick_in_usec: f64,
}

impl Psched {
    /// Creates a time base with an explicit conversion factor.
    pub const fn from_tick_in_usec(tick_in_usec: f64) -> Self {
        Self { tick_in_usec }
    }

    /// Reads the conversion factor from [`PSCHED_PATH`].
    pub fn read() -> io::Result<Self> {
        let contents = std::fs::read_to_string(PSCHED_PATH)?;
        let psched = Self::parse(&contents)?;
        tracing::debug!(tick_in_usec = psched.tick_in_usec, "read {PSCHED_PATH}");
        Ok(psched)
    }

    /// Parses the contents of `/proc/net/psched`.
    ///
    /// The file holds four hex values, `t2us us2t clock resolution`. The ratio of the first
    /// two is the number of ticks in a microsecond.
    ///
    /// Adapted from `iproute2/tc/tc_core.c`.
    pub fn parse(contents: &str) -> io::Result<Self> {
        let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidData, format!("psched: bad {what}"));

        let mut iter = contents.split_whitespace();
        let t2us = iter
            .next()
            .and_then(|v| u32::from_str_radix(v, 16).ok())
            .ok_or_else(|| invalid("t2us"))?;
        let us2t = iter
            .next()
            .and_then(|v| u32::from_str_radix(v, 16).ok())
            .filter(|v| *v != 0)
            .ok_or_else(|| invalid("us2t"))?;

        Ok(Self { tick_in_usec: t2us as f64 / us2t as f64 })
    }

    /// Number of ticks in a microsecond.
    pub const fn tick_in_usec(&self) -> f64 {
        self.tick_in_usec
    }

    /// Converts microseconds to scheduler ticks.
    pub fn usec_to_ticks(&self, usec: u32) -> u32 {
        (usec as f64 * self.tick_in_usec) as u32
    }

    /// Time, in ticks, to transmit `size_bytes` at `rate_bytes_per_sec`.
    ///
    /// `ticks = size * tick_in_usec * 1_000_000 / rate`, the iproute2 `tc_calc_xmittime`.
    pub fn xmit_ticks(&self, size_bytes: u32, rate_bytes_per_sec: u32) -> u32 {
        if rate_bytes_per_sec == 0 {
            return 0;
        }
        (size_bytes as f64 * self.tick_in_usec * 1_000_000.0 / rate_bytes_per_sec as f64) as u32
    }
}

impl Default for Psched {
    /// The time base of current kernels (`t2us = 1000`, `us2t = 64`).
    fn default() -> Self {
        Self::from_tick_in_usec(15.625)
    }
}
