//! Time-based one-time codes (RFC 6238, HMAC-SHA1, six digits).

use hmac::{Hmac, Mac};
use rand::Rng as _;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Number of digits in a code.
const DIGITS: u32 = 6;

/// Length of a generated secret, the size of an HMAC-SHA1 output.
const SECRET_LEN: usize = 20;

/// A shared secret and the interval at which its codes rotate.
#[derive(Clone)]
pub(crate) struct Totp {
    secret: Vec<u8>,
    interval: u64,
}

impl std::fmt::Debug for Totp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Totp").field("interval", &self.interval).finish_non_exhaustive()
    }
}

impl Totp {
    /// A fresh random secret rotating every `interval` seconds.
    pub(crate) fn random(interval: u64) -> Self {
        let mut secret = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill(&mut secret[..]);
        Self::from_secret(secret, interval)
    }

    pub(crate) fn from_secret(secret: impl Into<Vec<u8>>, interval: u64) -> Self {
        Self { secret: secret.into(), interval: interval.max(1) }
    }

    pub(crate) const fn interval(&self) -> u64 {
        self.interval
    }

    /// Index of the window containing `unix_secs`.
    pub(crate) const fn timecode(&self, unix_secs: u64) -> u64 {
        unix_secs / self.interval
    }

    /// End of the window containing `unix_secs`.
    pub(crate) const fn valid_until(&self, unix_secs: u64) -> u64 {
        (self.timecode(unix_secs) + 1) * self.interval
    }

    /// The code for the window containing `unix_secs`.
    pub(crate) fn at(&self, unix_secs: u64) -> String {
        self.generate(self.timecode(unix_secs))
    }

    /// Checks `code` against the window containing `unix_secs` and its two neighbours.
    pub(crate) fn verify(&self, code: &str, unix_secs: u64) -> bool {
        let current = self.timecode(unix_secs);
        [current.checked_sub(1), Some(current), current.checked_add(1)]
            .into_iter()
            .flatten()
            .any(|counter| self.generate(counter) == code.trim())
    }

    fn generate(&self, counter: u64) -> String {
        let mut mac =
            HmacSha1::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(&counter.to_be_bytes());
        let hash = mac.finalize().into_bytes();

        // Dynamic truncation, RFC 4226 section 5.3.
        let offset = (hash[hash.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            hash[offset] & 0x7f,
            hash[offset + 1],
            hash[offset + 2],
            hash[offset + 3],
        ]);

        format!("{:0width$}", binary % 10u32.pow(DIGITS), width = DIGITS as usize)
    }
}
