//! Rate specifications shared by HTB classes and policers.

use crate::psched::MTU_ETHERNET;

/// Default rate table (256 x 4-byte zero entries = 1024 bytes).
///
/// Modern kernels compute transmission times from precomputed mult/shift values. The
/// zeroed table triggers the `rtab[0] == 0` fast path in `__detect_linklayer()`.
pub const DEFAULT_RATE_TABLE: [u8; 1024] = [0u8; 1024];

/// Link layer type "ethernet".
const TC_LINKLAYER_ETHERNET: u8 = 1;

/// Converts kilobits per second to bytes per second, saturating at [`u32::MAX`].
pub fn kbit_to_bytes_per_sec(kbit: u32) -> u32 {
    u32::try_from(u64::from(kbit) * 1_000 / 8).unwrap_or(u32::MAX)
}

/// The kernel's `tc_ratespec` structure.
///
/// ```c
/// struct tc_ratespec {
///     unsigned char  cell_log;
///     __u8           linklayer;
///     unsigned short overhead;
///     short          cell_align;
///     unsigned short mpu;
///     __u32          rate;
/// };
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcRateSpec {
    /// Log2 of the cell size.
    pub cell_log: u8,
    /// Link layer type (0 = unaware, 1 = ethernet, 2 = ATM).
    pub linklayer: u8,
    /// Overhead added by link layer framing (bytes).
    pub overhead: u16,
    /// Cell alignment for ATM networks (-1 for Ethernet).
    pub cell_align: i16,
    /// Minimum packet unit.
    pub mpu: u16,
    /// Rate in bytes per second.
    pub rate: u32,
}

impl TcRateSpec {
    /// A rate spec for an Ethernet link at `rate_bytes_per_sec`.
    pub fn ethernet(rate_bytes_per_sec: u32) -> Self {
        Self {
            rate: rate_bytes_per_sec,
            linklayer: TC_LINKLAYER_ETHERNET,
            cell_log: Self::compute_cell_log(MTU_ETHERNET),
            cell_align: -1,
            ..Default::default()
        }
    }

    /// Smallest `cell_log` with `mtu >> cell_log <= 255`.
    pub fn compute_cell_log(mtu: u32) -> u8 {
        let mut cell_log = 0u8;
        while (mtu >> cell_log) > 255 {
            cell_log += 1;
        }
        cell_log
    }

    /// Serialize to bytes in kernel format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(12);
        vec.push(self.cell_log);
        vec.push(self.linklayer);
        vec.extend_from_slice(&self.overhead.to_ne_bytes());
        vec.extend_from_slice(&self.cell_align.to_ne_bytes());
        vec.extend_from_slice(&self.mpu.to_ne_bytes());
        vec.extend_from_slice(&self.rate.to_ne_bytes());
        vec
    }
}
