//! Generic qdisc requests.

use rtnetlink::packet_core::{NetlinkMessage, NLM_F_ACK, NLM_F_REQUEST};
use rtnetlink::packet_route::{
    tc::{TcHandle, TcMessage},
    RouteNetlinkMessage,
};

use crate::handle::QdiscRequestInner;

/// Builder for deleting the root qdisc of an interface, and with it every class, filter and
/// child qdisc below.
#[derive(Debug, Clone)]
pub struct QdiscDeleteRootRequest {
    pub inner: QdiscRequestInner,
}

impl QdiscDeleteRootRequest {
    pub fn new(inner: QdiscRequestInner) -> Self {
        Self { inner }
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = TcHandle::ROOT;
        tc_message.header.handle = TcHandle::default();

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::DelQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}
