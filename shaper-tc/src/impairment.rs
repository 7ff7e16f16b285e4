//! Impairment configuration for a netem qdisc.
//!
//! This is the user-facing side of [`crate::netem::NetemQopt`]: delays in milliseconds,
//! probabilities and correlations in percent.

/// Default maximum number of packets queued in a netem qdisc.
pub const DEFAULT_NETEM_LIMIT: u32 = 1_000;

/// Configuration for the impairments applied to one direction of a shaped device.
///
/// # Example
///
/// ```
/// use shaper_tc::Impairment;
///
/// // A lossy, high-latency link.
/// let satellite = Impairment {
///     delay_ms: 300,
///     jitter_ms: 50,
///     loss: 1.0,
///     ..Default::default()
/// };
/// assert!(!satellite.is_transparent());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impairment {
    /// Base delay added to all packets, in milliseconds.
    pub delay_ms: u32,
    /// Random variation around `delay_ms`, in milliseconds.
    pub jitter_ms: u32,
    /// Correlation of each delay with the previous one (0.0 to 100.0).
    pub delay_correlation: f32,

    /// Packet loss percentage (0.0 to 100.0).
    pub loss: f32,
    /// Correlation of each loss decision with the previous one.
    pub loss_correlation: f32,

    /// Percentage of packets sent immediately, ahead of the delayed ones (0.0 to 100.0).
    pub reorder: f32,
    /// Correlation of each reorder decision with the previous one.
    pub reorder_correlation: f32,
    /// Number of packets delayed between two reordered ones.
    ///
    /// Netem only reorders when the gap is non-zero, so a gap of `0` with a reorder
    /// percentage set is sent as `1`. See [`Impairment::effective_gap`].
    pub reorder_gap: u32,

    /// Percentage of packets with a single bit flipped (0.0 to 100.0).
    pub corruption: f32,
    /// Correlation of each corruption decision with the previous one.
    pub corruption_correlation: f32,

    /// Maximum number of packets queued in the netem qdisc.
    pub limit: u32,
}

impl Default for Impairment {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            jitter_ms: 0,
            delay_correlation: 0.0,
            loss: 0.0,
            loss_correlation: 0.0,
            reorder: 0.0,
            reorder_correlation: 0.0,
            reorder_gap: 0,
            corruption: 0.0,
            corruption_correlation: 0.0,
            limit: DEFAULT_NETEM_LIMIT,
        }
    }
}

impl Impairment {
    /// The reorder gap actually sent to the kernel.
    pub fn effective_gap(&self) -> u32 {
        if self.reorder > 0.0 && self.reorder_gap == 0 {
            1
        } else {
            self.reorder_gap
        }
    }

    /// Returns `true` if this configuration leaves packets untouched.
    pub fn is_transparent(&self) -> bool {
        self.delay_ms == 0 &&
            self.jitter_ms == 0 &&
            self.loss == 0.0 &&
            self.reorder == 0.0 &&
            self.corruption == 0.0
    }
}
