//! Packet marking rules in the mangle table.
//!
//! Marking is best effort: failures are logged and never undo the rest of the shaping.

use std::net::Ipv4Addr;

use shaper_common::command::Runner;

use super::{Interface, Role};
use crate::idpool::Mark;

/// Chain the marking rules live in.
const CHAIN: &str = "FORWARD";

/// Whether a rule is appended or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// `-A`, installed when shaping starts.
    Append,
    /// `-D`, removed when shaping stops.
    Delete,
}

impl Action {
    const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

/// Arguments marking traffic of `ip` entering `iface` with `mark`.
///
/// On the LAN side the device is the source, on the WAN side the destination. `option` is
/// an extra match clause split on whitespace.
pub fn rule_args(
    action: Action,
    iface: &Interface,
    ip: Ipv4Addr,
    option: &str,
    mark: Mark,
) -> Vec<String> {
    let direction = match iface.role {
        Role::Lan => "-s",
        Role::Wan => "-d",
    };

    let mut args: Vec<String> = ["-t", "mangle", action.flag(), CHAIN, direction]
        .into_iter()
        .map(String::from)
        .collect();
    args.push(ip.to_string());
    args.push("-i".to_string());
    args.push(iface.name.clone());
    args.extend(option.split_whitespace().map(String::from));
    args.extend(["-j", "MARK", "--set-mark"].into_iter().map(String::from));
    args.push(mark.to_string());
    args
}

/// Runs the mangle-table rules for one shaping direction.
#[derive(Debug, Clone)]
pub struct Marker {
    iptables: String,
}

impl Marker {
    /// Runs rules through the `iptables` binary at `iptables`.
    pub fn new(iptables: impl Into<String>) -> Self {
        Self { iptables: iptables.into() }
    }

    /// Flushes every marking rule.
    pub async fn flush(&self) -> Result<(), shaper_common::command::Error> {
        Runner::by_args(&self.iptables, ["-t", "mangle", "-F", CHAIN]).await.map(|_| ())
    }

    /// Appends or deletes one rule per option, or a single unconditional rule if there are
    /// none. Returns the number of rules that failed.
    pub async fn apply(
        &self,
        action: Action,
        iface: &Interface,
        ip: Ipv4Addr,
        options: &[String],
        mark: Mark,
    ) -> usize {
        let unconditional = [String::new()];
        let options = if options.is_empty() { &unconditional[..] } else { options };

        let mut failed = 0;
        for option in options {
            let args = rule_args(action, iface, ip, option, mark);
            if let Err(e) = Runner::by_args(&self.iptables, &args).await {
                tracing::warn!(%ip, %iface, mark, ?action, error = %e, "marking rule failed");
                failed += 1;
            }
        }
        failed
    }
}
