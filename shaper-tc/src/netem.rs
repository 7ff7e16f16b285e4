//! Netem (Network Emulator) qdisc support.
//!
//! Netem injects delay, jitter, loss, reordering and corruption. It is attached below
//! a session's HTB class, so it only sees packets the class lets through.

use rtnetlink::packet_core::{
    NetlinkMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST,
};
use rtnetlink::packet_route::{
    tc::{TcAttribute, TcMessage},
    RouteNetlinkMessage,
};

use crate::handle::QdiscRequestInner;
use crate::impairment::Impairment;
use crate::nla::{build_nla, build_raw_options};
use crate::psched::Psched;

// Netem TCA_OPTIONS trailing attributes (from linux/pkt_sched.h)
const TCA_NETEM_CORR: u16 = 1;
const TCA_NETEM_REORDER: u16 = 3;
const TCA_NETEM_CORRUPT: u16 = 4;

/// Convert a percentage (0-100) to the kernel's probability representation, where
/// [`u32::MAX`] is 100%.
pub fn u32_probability(percent: f32) -> u32 {
    (f64::from(percent.clamp(0.0, 100.0)) / 100.0 * u32::MAX as f64) as u32
}

/// The kernel's `tc_netem_qopt` structure.
///
/// ```c
/// struct tc_netem_qopt {
///     __u32 latency;    /* Delay in scheduler ticks */
///     __u32 limit;      /* Queue size limit in packets */
///     __u32 loss;       /* Loss probability (0 to 2^32-1) */
///     __u32 gap;        /* Reordering gap */
///     __u32 duplicate;  /* Duplication probability */
///     __u32 jitter;     /* Jitter in scheduler ticks */
/// };
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetemQopt {
    pub latency: u32,
    pub limit: u32,
    pub loss: u32,
    pub gap: u32,
    pub duplicate: u32,
    pub jitter: u32,
}

impl NetemQopt {
    /// Serialize this structure to bytes for the netlink message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(4 * 6);
        vec.extend_from_slice(&self.latency.to_ne_bytes());
        vec.extend_from_slice(&self.limit.to_ne_bytes());
        vec.extend_from_slice(&self.loss.to_ne_bytes());
        vec.extend_from_slice(&self.gap.to_ne_bytes());
        vec.extend_from_slice(&self.duplicate.to_ne_bytes());
        vec.extend_from_slice(&self.jitter.to_ne_bytes());
        vec
    }
}

/// `tc_netem_corr`: correlations of delay, loss and duplication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetemCorr {
    pub delay_corr: u32,
    pub loss_corr: u32,
    pub dup_corr: u32,
}

impl NetemCorr {
    fn to_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(12);
        vec.extend_from_slice(&self.delay_corr.to_ne_bytes());
        vec.extend_from_slice(&self.loss_corr.to_ne_bytes());
        vec.extend_from_slice(&self.dup_corr.to_ne_bytes());
        vec
    }
}

/// `tc_netem_reorder` and `tc_netem_corrupt` share this layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetemProbability {
    pub probability: u32,
    pub correlation: u32,
}

impl NetemProbability {
    fn new(percent: f32, correlation: f32) -> Self {
        Self { probability: u32_probability(percent), correlation: u32_probability(correlation) }
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(8);
        vec.extend_from_slice(&self.probability.to_ne_bytes());
        vec.extend_from_slice(&self.correlation.to_ne_bytes());
        vec
    }
}

/// Kernel-format netem options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetemOptions {
    pub qopt: NetemQopt,
    pub corr: NetemCorr,
    pub reorder: NetemProbability,
    pub corrupt: NetemProbability,
}

impl NetemOptions {
    /// Convert a user-facing [`Impairment`] to kernel format.
    pub fn from_impairment(impairment: &Impairment, psched: Psched) -> Self {
        Self {
            qopt: NetemQopt {
                latency: psched.usec_to_ticks(impairment.delay_ms.saturating_mul(1_000)),
                limit: impairment.limit,
                loss: u32_probability(impairment.loss),
                gap: impairment.effective_gap(),
                duplicate: 0,
                jitter: psched.usec_to_ticks(impairment.jitter_ms.saturating_mul(1_000)),
            },
            corr: NetemCorr {
                delay_corr: u32_probability(impairment.delay_correlation),
                loss_corr: u32_probability(impairment.loss_correlation),
                dup_corr: 0,
            },
            reorder: NetemProbability::new(impairment.reorder, impairment.reorder_correlation),
            corrupt: NetemProbability::new(
                impairment.corruption,
                impairment.corruption_correlation,
            ),
        }
    }

    /// The `TCA_OPTIONS` payload: the bare qopt followed by the nested attributes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = self.qopt.to_bytes();
        payload.extend(build_nla(TCA_NETEM_CORR, &self.corr.to_bytes()));
        payload.extend(build_nla(TCA_NETEM_REORDER, &self.reorder.to_bytes()));
        payload.extend(build_nla(TCA_NETEM_CORRUPT, &self.corrupt.to_bytes()));
        payload
    }
}

/// Builder for creating a netem qdisc below a session's HTB class.
///
/// # Example
///
/// ```
/// use shaper_tc::handle::{class_handle, netem_handle, QdiscRequestInner};
/// use shaper_tc::netem::QdiscNetemRequest;
/// use shaper_tc::{Impairment, Psched};
/// use rtnetlink::packet_route::tc::TcHandle;
///
/// let impairment = Impairment { delay_ms: 100, jitter_ms: 10, loss: 1.0, ..Default::default() };
///
/// let request = QdiscNetemRequest::from_impairment(
///     QdiscRequestInner::new(1)
///         .with_parent(TcHandle::from(class_handle(2)))
///         .with_handle(TcHandle::from(netem_handle(2))),
///     &impairment,
///     Psched::default(),
/// )
/// .build();
/// ```
#[derive(Debug)]
pub struct QdiscNetemRequest {
    pub inner: QdiscRequestInner,
    pub options: NetemOptions,
}

impl QdiscNetemRequest {
    /// Create a new netem qdisc request.
    pub fn new(inner: QdiscRequestInner, options: NetemOptions) -> Self {
        Self { inner, options }
    }

    /// Create from an [`Impairment`], converting to kernel format.
    pub fn from_impairment(
        inner: QdiscRequestInner,
        impairment: &Impairment,
        psched: Psched,
    ) -> Self {
        Self::new(inner, NetemOptions::from_impairment(impairment, psched))
    }

    /// Build the netlink message to create this netem qdisc.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = self.inner.parent;
        tc_message.header.handle = self.inner.handle;

        tc_message.attributes.push(TcAttribute::Kind("netem".to_string()));
        tc_message
            .attributes
            .push(TcAttribute::Other(build_raw_options(self.options.to_bytes())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}
