//! HTB (Hierarchical Token Bucket) qdisc and class support.
//!
//! The root HTB qdisc classifies marked traffic into one class per shaping session. Each
//! class enforces the session's rate and serves as the parent of its netem qdisc.

use rtnetlink::packet_core::{
    NetlinkMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST,
};
use rtnetlink::packet_route::{
    tc::{TcAttribute, TcHandle, TcMessage},
    RouteNetlinkMessage,
};

use crate::handle::{root_handle, QdiscRequestInner};
use crate::nla::{build_nested_options, build_nla};
use crate::psched::{Psched, MTU_ETHERNET};
use crate::rate::{TcRateSpec, DEFAULT_RATE_TABLE};

// HTB-specific TCA_OPTIONS sub-attributes (from linux/pkt_sched.h)
const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
const TCA_HTB_CTAB: u16 = 3;
const TCA_HTB_RTAB: u16 = 4;

/// HTB protocol version (current kernel version).
const HTB_VERSION: u32 = 3;

/// Rate-to-quantum conversion factor, `quantum = rate / rate2quantum`.
const HTB_RATE2QUANTUM: u32 = 10;

/// Rate used for classes that should not limit throughput, in kbit/s (`2^22 - 1`).
pub const UNLIMITED_RATE_KBIT: u32 = (1 << 22) - 1;

/// The kernel's `tc_htb_glob` structure for HTB qdisc initialization.
///
/// ```c
/// struct tc_htb_glob {
///     __u32 version;
///     __u32 rate2quantum;
///     __u32 defcls;
///     __u32 debug;
///     __u32 direct_pkts;
/// };
/// ```
#[derive(Debug, Clone, Copy)]
struct HtbGlob {
    version: u32,
    rate2quantum: u32,
    defcls: u32,
    debug: u32,
    direct_pkts: u32,
}

impl HtbGlob {
    fn as_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(20);
        vec.extend_from_slice(&self.version.to_ne_bytes());
        vec.extend_from_slice(&self.rate2quantum.to_ne_bytes());
        vec.extend_from_slice(&self.defcls.to_ne_bytes());
        vec.extend_from_slice(&self.debug.to_ne_bytes());
        vec.extend_from_slice(&self.direct_pkts.to_ne_bytes());
        vec
    }
}

/// The kernel's `tc_htb_opt` structure for HTB class configuration.
///
/// ```c
/// struct tc_htb_opt {
///     struct tc_ratespec rate;
///     struct tc_ratespec ceil;
///     __u32 buffer;
///     __u32 cbuffer;
///     __u32 quantum;
///     __u32 level;
///     __u32 prio;
/// };
/// ```
#[derive(Debug, Clone, Copy)]
struct HtbOpt {
    rate: TcRateSpec,
    ceil: TcRateSpec,
    buffer: u32,
    cbuffer: u32,
    quantum: u32,
    level: u32,
    prio: u32,
}

impl HtbOpt {
    fn as_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(44);
        vec.extend_from_slice(&self.rate.to_bytes());
        vec.extend_from_slice(&self.ceil.to_bytes());
        vec.extend_from_slice(&self.buffer.to_ne_bytes());
        vec.extend_from_slice(&self.cbuffer.to_ne_bytes());
        vec.extend_from_slice(&self.quantum.to_ne_bytes());
        vec.extend_from_slice(&self.level.to_ne_bytes());
        vec.extend_from_slice(&self.prio.to_ne_bytes());
        vec
    }
}

/// Builder for the root HTB qdisc (`1:0`).
///
/// Traffic that matches no filter goes to `defcls`. With the default of `0` there is no
/// such class and unclassified packets are sent directly, unshaped.
#[derive(Debug, Clone)]
pub struct QdiscHtbRequest {
    pub inner: QdiscRequestInner,
    pub default_class: u32,
}

impl QdiscHtbRequest {
    /// Create a new root HTB qdisc request for the given interface.
    pub fn new(inner: QdiscRequestInner) -> Self {
        Self { inner, default_class: 0 }
    }

    /// Build the netlink message to create this HTB qdisc.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = TcHandle::ROOT;
        tc_message.header.handle = TcHandle::from(root_handle());

        tc_message.attributes.push(TcAttribute::Kind("htb".to_string()));

        let glob = HtbGlob {
            version: HTB_VERSION,
            rate2quantum: HTB_RATE2QUANTUM,
            defcls: self.default_class,
            debug: 0,
            direct_pkts: 0,
        };
        let init_nla = build_nla(TCA_HTB_INIT, &glob.as_bytes());
        tc_message.attributes.push(TcAttribute::Other(build_nested_options(init_nla)));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_REPLACE | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}

/// Builder for a rate-limited HTB class.
///
/// Rate and ceil are equal, so a class never borrows bandwidth from its siblings. The
/// burst defaults to one jiffy of traffic plus an MTU (`rate / 1000 + mtu` bytes), the
/// same default `tc` applies.
///
/// # Example
///
/// ```
/// use shaper_tc::handle::{class_handle, root_handle, QdiscRequestInner};
/// use shaper_tc::htb::HtbClassRequest;
/// use shaper_tc::Psched;
/// use rtnetlink::packet_route::tc::TcHandle;
///
/// let request = HtbClassRequest::new(
///     QdiscRequestInner::new(1)
///         .with_parent(TcHandle::from(root_handle()))
///         .with_handle(TcHandle::from(class_handle(2))),
///     Psched::default(),
/// )
/// .with_rate_kbit(1_000)
/// .build();
/// ```
#[derive(Debug, Clone)]
pub struct HtbClassRequest {
    pub inner: QdiscRequestInner,
    pub psched: Psched,
    /// Rate and ceil, in kbit/s.
    pub rate_kbit: u32,
}

impl HtbClassRequest {
    /// Create a new HTB class request with an unlimited rate.
    pub fn new(inner: QdiscRequestInner, psched: Psched) -> Self {
        Self { inner, psched, rate_kbit: UNLIMITED_RATE_KBIT }
    }

    /// Set the class rate in kbit/s. `0` means unlimited.
    pub fn with_rate_kbit(mut self, rate_kbit: u32) -> Self {
        self.rate_kbit = if rate_kbit == 0 { UNLIMITED_RATE_KBIT } else { rate_kbit };
        self
    }

    /// Rate in bytes per second.
    pub fn rate_bytes_per_sec(&self) -> u32 {
        crate::rate::kbit_to_bytes_per_sec(self.rate_kbit)
    }

    /// The burst in bytes sent to the kernel: one millisecond at the rate, plus an MTU.
    pub fn effective_burst_bytes(&self) -> u32 {
        (self.rate_bytes_per_sec() / 1_000).saturating_add(MTU_ETHERNET)
    }

    /// Build the netlink message to create this HTB class.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = self.inner.parent;
        tc_message.header.handle = self.inner.handle;

        tc_message.attributes.push(TcAttribute::Kind("htb".to_string()));

        let rate = self.rate_bytes_per_sec();
        let buffer_ticks = self.psched.xmit_ticks(self.effective_burst_bytes(), rate);
        let rate_spec = TcRateSpec::ethernet(rate);

        let opt = HtbOpt {
            rate: rate_spec,
            ceil: rate_spec,
            buffer: buffer_ticks,
            cbuffer: buffer_ticks,
            quantum: 0,
            level: 0,
            prio: 0,
        };

        let mut combined = build_nla(TCA_HTB_PARMS, &opt.as_bytes());
        combined.extend(build_nla(TCA_HTB_RTAB, &DEFAULT_RATE_TABLE));
        combined.extend(build_nla(TCA_HTB_CTAB, &DEFAULT_RATE_TABLE));
        tc_message.attributes.push(TcAttribute::Other(build_nested_options(combined)));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewTrafficClass(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}

/// Builder for deleting an HTB class, along with any qdisc attached below it.
#[derive(Debug, Clone)]
pub struct HtbClassDeleteRequest {
    pub inner: QdiscRequestInner,
}

impl HtbClassDeleteRequest {
    pub fn new(inner: QdiscRequestInner) -> Self {
        Self { inner }
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = self.inner.parent;
        tc_message.header.handle = self.inner.handle;

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::DelTrafficClass(tc_message));
        nl_req.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}
