//! Command line configuration of the daemon.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};

use crate::{
    access::{AccessMode, ACCESS_TOKEN_INTERVAL},
    backend::Interfaces,
    orchestrator::OrchestratorOptions,
    persistence::DEFAULT_QUEUE_CAPACITY,
};

/// Access control mode, as spelled on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Devices may only shape themselves, or others after presenting their code.
    #[default]
    Secure,
    /// Any device may shape any other.
    Unsecure,
}

impl From<Mode> for AccessMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Secure => Self::Secure,
            Mode::Unsecure => Self::Unsecure,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "shaperd", version, about = "Per-device traffic shaping daemon", long_about = None)]
pub struct Args {
    /// Interface facing the shaped devices.
    #[arg(long, value_name = "IFACE", default_value = "eth1")]
    pub lan: String,

    /// Interface facing the uplink.
    #[arg(long, value_name = "IFACE", default_value = "eth0")]
    pub wan: String,

    /// Path to the iptables binary.
    #[arg(long, value_name = "PATH", default_value = "/sbin/iptables")]
    pub iptables: String,

    /// Police burst when dropping packets above the rate (bytes).
    #[arg(long, value_name = "BYTES", default_value_t = 12_000)]
    pub burst_size: u32,

    /// Queue packets above the rate instead of dropping them.
    #[arg(long)]
    pub dont_drop_packets: bool,

    /// Do not restore saved shapings at startup.
    #[arg(long)]
    pub fresh_start: bool,

    #[arg(long, value_enum, default_value_t = Mode::Secure)]
    pub mode: Mode,

    /// File saved shapings are kept in.
    #[arg(long, value_name = "PATH", default_value = "/var/lib/shaperd/shapings.json")]
    pub store_file: PathBuf,

    /// Address of the JSON-lines RPC listener.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:9090")]
    pub listen: SocketAddr,

    /// Seconds between two sweeps of expired shapings.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub sweep_interval: u64,

    /// Store operations buffered before the oldest is dropped.
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Log shaping calls instead of programming the kernel.
    #[arg(long)]
    pub dry_run: bool,

    /// Log filter directive, e.g. `info` or `shaperd=debug,shaper_tc=trace`.
    #[arg(long, value_name = "FILTER", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// The LAN and WAN interfaces to shape.
    pub fn interfaces(&self) -> Interfaces {
        Interfaces::new(&self.lan, &self.wan)
    }

    /// Orchestrator options from the interface and mode flags.
    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            interfaces: self.interfaces(),
            mode: self.mode.into(),
            token_interval: ACCESS_TOKEN_INTERVAL,
        }
    }

    /// Period of the expiry sweep, at least one second.
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    /// Options of the Linux backend.
    #[cfg(target_os = "linux")]
    pub fn linux_options(&self) -> crate::backend::LinuxOptions {
        crate::backend::LinuxOptions {
            iptables: self.iptables.clone(),
            burst_size: self.burst_size,
            drop_packets: !self.dont_drop_packets,
        }
    }
}
