//! Linux backend: HTB classes, netem qdiscs and fw filters over rtnetlink, packet marks
//! through `iptables`.

use std::{future::Future, net::Ipv4Addr};

use parking_lot::Mutex;
use shaper_tc::{
    filter::Police,
    handle::{MARK_MAX, MARK_MIN},
    htb::UNLIMITED_RATE_KBIT,
    rate::kbit_to_bytes_per_sec,
    requests, wrappers, Impairment, Psched,
};
use tokio::task::JoinHandle;

use super::{
    iptables::{Action, Marker},
    BackendError, Interface, Interfaces, ShapingBackend,
};
use crate::{idpool::Mark, types::Shaping};

/// Default police burst, in bytes.
pub const DEFAULT_BURST_SIZE: u32 = 12_000;

/// Options of the Linux backend.
#[derive(Debug, Clone)]
pub struct LinuxOptions {
    /// Path to the `iptables` binary.
    pub iptables: String,
    /// Police burst in bytes, used when dropping packets.
    pub burst_size: u32,
    /// Drop packets above the rate instead of queueing them.
    pub drop_packets: bool,
}

impl Default for LinuxOptions {
    fn default() -> Self {
        Self {
            iptables: "/sbin/iptables".to_string(),
            burst_size: DEFAULT_BURST_SIZE,
            drop_packets: true,
        }
    }
}

/// Which sub-step of shaping failed, to pick the error variant.
#[derive(Debug, Clone, Copy)]
enum Step {
    Htb,
    Netem,
    Fw,
}

impl Step {
    fn error(self, err: rtnetlink::Error) -> BackendError {
        let is_netlink = matches!(err, rtnetlink::Error::NetlinkError(_));
        let msg = err.to_string();
        match (self, is_netlink) {
            (Self::Htb, true) => BackendError::NetlinkHtb(msg),
            (Self::Htb, false) => BackendError::UnknownHtb(msg),
            (Self::Netem, true) => BackendError::NetlinkNetem(msg),
            (Self::Netem, false) => BackendError::UnknownNetem(msg),
            (Self::Fw, true) => BackendError::NetlinkFw(msg),
            (Self::Fw, false) => BackendError::UnknownFw(msg),
        }
    }
}

impl From<&Shaping> for Impairment {
    fn from(shaping: &Shaping) -> Self {
        Self {
            delay_ms: shaping.delay.delay,
            jitter_ms: shaping.delay.jitter,
            delay_correlation: shaping.delay.correlation,
            loss: shaping.loss.percentage,
            loss_correlation: shaping.loss.correlation,
            reorder: shaping.reorder.percentage,
            reorder_correlation: shaping.reorder.correlation,
            reorder_gap: shaping.reorder.gap,
            corruption: shaping.corruption.percentage,
            corruption_correlation: shaping.corruption.correlation,
            ..Default::default()
        }
    }
}

/// The traffic control steps one session needs on one interface.
///
/// [`install`] and [`remove`] sequence these; [`Netlink`] sends them to the kernel.
pub(crate) trait TrafficControl: Send + Sync {
    fn add_class(
        &self,
        if_index: i32,
        mark: Mark,
        rate_kbit: u32,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;

    fn add_netem(
        &self,
        if_index: i32,
        mark: Mark,
        impairment: &Impairment,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;

    fn add_filter(
        &self,
        if_index: i32,
        mark: Mark,
        police: Option<Police>,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;

    fn delete_filter(
        &self,
        if_index: i32,
        mark: Mark,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;

    /// Deletes the class and the netem qdisc below it.
    fn delete_class(
        &self,
        if_index: i32,
        mark: Mark,
    ) -> impl Future<Output = Result<(), rtnetlink::Error>> + Send;
}

/// [`TrafficControl`] over an rtnetlink connection.
#[derive(Debug, Clone)]
pub(crate) struct Netlink {
    handle: rtnetlink::Handle,
    psched: Psched,
}

impl TrafficControl for Netlink {
    async fn add_class(
        &self,
        if_index: i32,
        mark: Mark,
        rate_kbit: u32,
    ) -> Result<(), rtnetlink::Error> {
        let mut handle = self.handle.clone();
        requests::configure_htb_class(&mut handle, if_index, mark, rate_kbit, self.psched).await
    }

    async fn add_netem(
        &self,
        if_index: i32,
        mark: Mark,
        impairment: &Impairment,
    ) -> Result<(), rtnetlink::Error> {
        let mut handle = self.handle.clone();
        requests::configure_netem(&mut handle, if_index, mark, impairment, self.psched).await
    }

    async fn add_filter(
        &self,
        if_index: i32,
        mark: Mark,
        police: Option<Police>,
    ) -> Result<(), rtnetlink::Error> {
        let mut handle = self.handle.clone();
        requests::configure_fw_filter(&mut handle, if_index, mark, police, self.psched).await
    }

    async fn delete_filter(&self, if_index: i32, mark: Mark) -> Result<(), rtnetlink::Error> {
        let mut handle = self.handle.clone();
        requests::delete_fw_filter(&mut handle, if_index, mark).await
    }

    async fn delete_class(&self, if_index: i32, mark: Mark) -> Result<(), rtnetlink::Error> {
        let mut handle = self.handle.clone();
        requests::delete_htb_class(&mut handle, if_index, mark).await
    }
}

/// Creates class, netem qdisc and filter for `mark`. A failure after the class exists
/// deletes the class again, so nothing is left behind.
pub(crate) async fn install<T: TrafficControl>(
    tc: &T,
    iface: &Interface,
    if_index: i32,
    mark: Mark,
    rate_kbit: u32,
    impairment: &Impairment,
    police: Option<Police>,
) -> Result<(), BackendError> {
    if let Err(e) = tc.add_class(if_index, mark, rate_kbit).await {
        let err = Step::Htb.error(e);
        tracing::error!(%iface, mark, %err, "adding htb class");
        return Err(err);
    }

    let result = match tc.add_netem(if_index, mark, impairment).await {
        Err(e) => Err((Step::Netem.error(e), "adding netem qdisc")),
        Ok(()) => tc
            .add_filter(if_index, mark, police)
            .await
            .map_err(|e| (Step::Fw.error(e), "adding fw filter")),
    };

    if let Err((err, step)) = result {
        tracing::error!(%iface, mark, %err, "{step}");
        if let Err(e) = tc.delete_class(if_index, mark).await {
            tracing::warn!(%iface, mark, ?e, "rolling back htb class");
        }
        return Err(err);
    }

    Ok(())
}

/// Deletes filter and class for `mark`. Both deletions are attempted; the first error is
/// returned.
pub(crate) async fn remove<T: TrafficControl>(
    tc: &T,
    iface: &Interface,
    if_index: i32,
    mark: Mark,
) -> Result<(), BackendError> {
    let mut first_error = None;

    if let Err(e) = tc.delete_filter(if_index, mark).await {
        let err = Step::Fw.error(e);
        tracing::error!(%iface, mark, %err, "deleting fw filter");
        first_error.get_or_insert(err);
    }

    if let Err(e) = tc.delete_class(if_index, mark).await {
        let err = Step::Htb.error(e);
        tracing::error!(%iface, mark, %err, "deleting htb class");
        first_error.get_or_insert(err);
    }

    first_error.map_or(Ok(()), Err)
}

/// Shapes traffic with Linux traffic control.
#[derive(Debug)]
pub struct LinuxShaper {
    tc: Netlink,
    connection: Mutex<Option<JoinHandle<()>>>,
    marker: Marker,
    options: LinuxOptions,
}

impl LinuxShaper {
    /// Opens a netlink connection and reads the scheduler time base.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(options: LinuxOptions) -> Result<Self, BackendError> {
        let psched = Psched::read().map_err(|e| BackendError::Init(format!("psched: {e}")))?;
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| BackendError::Init(format!("netlink socket: {e}")))?;
        let task = tokio::spawn(connection);

        Ok(Self {
            tc: Netlink { handle, psched },
            connection: Mutex::new(Some(task)),
            marker: Marker::new(options.iptables.clone()),
            options,
        })
    }

    fn if_index(iface: &Interface) -> Result<i32, BackendError> {
        wrappers::if_nametoindex(&iface.name)
            .map_err(|e| BackendError::Interface { name: iface.name.clone(), reason: e.to_string() })
    }

    fn police(&self, shaping: &Shaping) -> Option<Police> {
        if !self.options.drop_packets {
            return None;
        }
        let rate_kbit = if shaping.rate == 0 { UNLIMITED_RATE_KBIT } else { shaping.rate };
        Some(Police {
            rate_bytes_per_sec: kbit_to_bytes_per_sec(rate_kbit),
            burst_bytes: self.options.burst_size,
        })
    }

    async fn reset_root(&self, iface: &Interface) -> Result<(), BackendError> {
        let if_index = Self::if_index(iface)?;
        let mut handle = self.tc.handle.clone();

        requests::delete_root_qdisc(&mut handle, if_index).await.map_err(|e| Step::Htb.error(e))?;
        requests::install_htb_root(&mut handle, if_index).await.map_err(|e| Step::Htb.error(e))?;

        tracing::info!(%iface, "installed htb root qdisc");
        Ok(())
    }
}

impl ShapingBackend for LinuxShaper {
    fn mark_range(&self) -> (Mark, Mark) {
        (MARK_MIN, MARK_MAX)
    }

    async fn initialize_interfaces(&self, interfaces: &Interfaces) -> Result<(), BackendError> {
        self.reset_root(&interfaces.lan).await?;
        self.reset_root(&interfaces.wan).await?;

        self.marker.flush().await.map_err(|e| BackendError::Init(format!("iptables: {e}")))?;
        Ok(())
    }

    async fn shape_interface(
        &self,
        mark: Mark,
        iface: &Interface,
        ip: Ipv4Addr,
        shaping: &Shaping,
    ) -> Result<(), BackendError> {
        tracing::info!(%ip, %iface, mark, "shaping");

        let if_index = Self::if_index(iface)?;
        let impairment = Impairment::from(shaping);
        install(&self.tc, iface, if_index, mark, shaping.rate, &impairment, self.police(shaping))
            .await?;

        self.marker.apply(Action::Append, iface, ip, &shaping.iptables_options, mark).await;

        Ok(())
    }

    async fn unshape_interface(
        &self,
        mark: Mark,
        iface: &Interface,
        ip: Ipv4Addr,
        shaping: &Shaping,
    ) -> Result<(), BackendError> {
        tracing::info!(%ip, %iface, mark, "unshaping");

        self.marker.apply(Action::Delete, iface, ip, &shaping.iptables_options, mark).await;

        let if_index = Self::if_index(iface)?;
        remove(&self.tc, iface, if_index, mark).await
    }

    async fn teardown(&self) {
        let task = self.connection.lock().take();
        if let Some(task) = task {
            task.abort();
            tracing::debug!("netlink connection closed");
        }
    }
}
