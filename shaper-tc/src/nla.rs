//! Netlink attribute building utilities.

use nix::libc::TCA_OPTIONS;
use rtnetlink::packet_core::{DefaultNla, NLA_HEADER_SIZE};

/// Build a single NLA (header + value + padding to 4 bytes).
///
/// ```text
/// ┌─────────────────────────────────────────┐
/// │  Length (2 bytes) │  Type (2 bytes)     │
/// ├─────────────────────────────────────────┤
/// │  Value (variable length, padded to 4)   │
/// └─────────────────────────────────────────┘
/// ```
pub(crate) fn build_nla(nla_type: u16, value: &[u8]) -> Vec<u8> {
    let nla_len = NLA_HEADER_SIZE + value.len();
    let padded_len = (nla_len + 3) & !3;

    let mut buf = vec![0u8; padded_len];
    buf[0..2].copy_from_slice(&(nla_len as u16).to_ne_bytes());
    buf[2..4].copy_from_slice(&nla_type.to_ne_bytes());
    buf[NLA_HEADER_SIZE..NLA_HEADER_SIZE + value.len()].copy_from_slice(value);

    buf
}

/// Wrap already-formatted sub-attributes in a `TCA_OPTIONS` container.
pub(crate) fn build_nested_options(sub_attrs: Vec<u8>) -> DefaultNla {
    DefaultNla::new(TCA_OPTIONS, sub_attrs)
}

/// Wrap a raw payload (a kernel struct possibly followed by NLAs) in `TCA_OPTIONS`.
///
/// Netem is the odd one out: its options start with a bare `tc_netem_qopt` rather than
/// with a nested attribute.
pub(crate) fn build_raw_options(payload: Vec<u8>) -> DefaultNla {
    DefaultNla::new(TCA_OPTIONS, payload)
}
