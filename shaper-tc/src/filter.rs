//! fw filter support.
//!
//! An fw filter matches the firewall mark set by the mangle table and sends the packet
//! to a class. The filter handle is the mark it matches.

use rtnetlink::packet_core::{NetlinkMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST};
use rtnetlink::packet_route::{
    tc::{TcAttribute, TcHandle, TcMessage},
    RouteNetlinkMessage,
};

use crate::handle::{QdiscRequestInner, FW_FILTER_PRIORITY};
use crate::nla::{build_nested_options, build_nla};
use crate::psched::Psched;
use crate::rate::{TcRateSpec, DEFAULT_RATE_TABLE};

/// EtherType for IPv4 packets (0x0800).
const ETH_P_IP: u16 = nix::libc::ETH_P_IP as u16;

// fw filter TCA_OPTIONS sub-attributes (from linux/pkt_cls.h)
const TCA_FW_CLASSID: u16 = 1;
const TCA_FW_POLICE: u16 = 2;

// Legacy police attributes (from linux/pkt_cls.h)
const TCA_POLICE_TBF: u16 = 1;
const TCA_POLICE_RATE: u16 = 2;

/// Police verdict: drop the packet.
const TC_POLICE_SHOT: i32 = 2;

/// The `info` field of a filter message: priority in the upper half, protocol in network
/// byte order in the lower half.
fn filter_info(priority: u16, protocol: u16) -> u32 {
    (u32::from(priority) << 16) | u32::from(protocol.to_be())
}

/// A policer that drops packets exceeding a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Police {
    /// Allowed rate in bytes per second.
    pub rate_bytes_per_sec: u32,
    /// Bucket size in bytes.
    pub burst_bytes: u32,
}

/// The kernel's `tc_police` structure.
///
/// ```c
/// struct tc_police {
///     __u32              index;
///     int                action;
///     __u32              limit;
///     __u32              burst;
///     __u32              mtu;
///     struct tc_ratespec rate;
///     struct tc_ratespec peakrate;
///     int                refcnt;
///     int                bindcnt;
///     __u32              capab;
/// };
/// ```
#[derive(Debug, Clone, Copy)]
struct TcPolice {
    index: u32,
    action: i32,
    limit: u32,
    burst: u32,
    mtu: u32,
    rate: TcRateSpec,
    peakrate: TcRateSpec,
    refcnt: i32,
    bindcnt: i32,
    capab: u32,
}

impl TcPolice {
    fn as_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(56);
        vec.extend_from_slice(&self.index.to_ne_bytes());
        vec.extend_from_slice(&self.action.to_ne_bytes());
        vec.extend_from_slice(&self.limit.to_ne_bytes());
        vec.extend_from_slice(&self.burst.to_ne_bytes());
        vec.extend_from_slice(&self.mtu.to_ne_bytes());
        vec.extend_from_slice(&self.rate.to_bytes());
        vec.extend_from_slice(&self.peakrate.to_bytes());
        vec.extend_from_slice(&self.refcnt.to_ne_bytes());
        vec.extend_from_slice(&self.bindcnt.to_ne_bytes());
        vec.extend_from_slice(&self.capab.to_ne_bytes());
        vec
    }
}

impl Police {
    /// The nested `TCA_FW_POLICE` payload.
    fn to_nla_payload(self, psched: Psched) -> Vec<u8> {
        let police = TcPolice {
            index: 0,
            action: TC_POLICE_SHOT,
            limit: 0,
            burst: psched.xmit_ticks(self.burst_bytes, self.rate_bytes_per_sec),
            mtu: 0,
            rate: TcRateSpec::ethernet(self.rate_bytes_per_sec),
            peakrate: TcRateSpec::default(),
            refcnt: 0,
            bindcnt: 0,
            capab: 0,
        };

        let mut payload = build_nla(TCA_POLICE_TBF, &police.as_bytes());
        payload.extend(build_nla(TCA_POLICE_RATE, &DEFAULT_RATE_TABLE));
        payload
    }
}

/// Builder for an fw filter that routes `mark` to `class_id`.
///
/// # Example
///
/// ```
/// use shaper_tc::filter::FwFilterRequest;
/// use shaper_tc::handle::{root_handle, QdiscRequestInner};
/// use shaper_tc::Psched;
/// use rtnetlink::packet_route::tc::TcHandle;
///
/// let request = FwFilterRequest::new(
///     QdiscRequestInner::new(1).with_parent(TcHandle::from(root_handle())),
///     2,
///     Psched::default(),
/// )
/// .build();
/// ```
#[derive(Debug, Clone)]
pub struct FwFilterRequest {
    pub inner: QdiscRequestInner,
    pub mark: u16,
    pub class_id: u32,
    pub priority: u16,
    pub police: Option<Police>,
    pub psched: Psched,
}

impl FwFilterRequest {
    /// Create a filter for `mark`, routing into class `1:mark` at the default priority.
    pub fn new(inner: QdiscRequestInner, mark: u16, psched: Psched) -> Self {
        Self {
            inner,
            mark,
            class_id: crate::handle::class_handle(mark),
            priority: FW_FILTER_PRIORITY,
            police: None,
            psched,
        }
    }

    /// Drop packets above the policer's rate instead of queueing them.
    pub fn with_police(mut self, police: Option<Police>) -> Self {
        self.police = police;
        self
    }

    /// Build the netlink message to create this fw filter.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_msg = TcMessage::with_index(self.inner.interface_index);
        tc_msg.header.parent = self.inner.parent;
        tc_msg.header.handle = TcHandle::from(u32::from(self.mark));
        tc_msg.header.info = filter_info(self.priority, ETH_P_IP);

        tc_msg.attributes.push(TcAttribute::Kind("fw".to_string()));

        let mut opts = build_nla(TCA_FW_CLASSID, &self.class_id.to_ne_bytes());
        if let Some(police) = self.police {
            opts.extend(build_nla(TCA_FW_POLICE, &police.to_nla_payload(self.psched)));
        }
        tc_msg.attributes.push(TcAttribute::Other(build_nested_options(opts)));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewTrafficFilter(tc_msg));
        nl_req.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;

        nl_req
    }
}

/// Builder for deleting the fw filter matching `mark`.
#[derive(Debug, Clone)]
pub struct FwFilterDeleteRequest {
    pub inner: QdiscRequestInner,
    pub mark: u16,
    pub priority: u16,
}

impl FwFilterDeleteRequest {
    pub fn new(inner: QdiscRequestInner, mark: u16) -> Self {
        Self { inner, mark, priority: FW_FILTER_PRIORITY }
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_msg = TcMessage::with_index(self.inner.interface_index);
        tc_msg.header.parent = self.inner.parent;
        tc_msg.header.handle = TcHandle::from(u32::from(self.mark));
        tc_msg.header.info = filter_info(self.priority, ETH_P_IP);

        tc_msg.attributes.push(TcAttribute::Kind("fw".to_string()));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::DelTrafficFilter(tc_msg));
        nl_req.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}
