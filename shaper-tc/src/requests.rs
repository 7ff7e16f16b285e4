//! Helpers to make traffic control requests, given a [`rtnetlink::Handle`].
//!
//! Each helper sends one request and waits for the kernel's acknowledgement.

use futures::StreamExt as _;
use rtnetlink::packet_core::{NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::{tc::TcHandle, RouteNetlinkMessage};

use crate::filter::{FwFilterDeleteRequest, FwFilterRequest, Police};
use crate::handle::{class_handle, display, netem_handle, root_handle, QdiscRequestInner};
use crate::htb::{HtbClassDeleteRequest, HtbClassRequest, QdiscHtbRequest};
use crate::impairment::Impairment;
use crate::netem::QdiscNetemRequest;
use crate::psched::Psched;
use crate::qdisc::QdiscDeleteRootRequest;

type Result<T> = std::result::Result<T, rtnetlink::Error>;

/// Sends `request` and drains the response stream, failing on the first error message.
async fn execute(
    handle: &mut rtnetlink::Handle,
    request: NetlinkMessage<RouteNetlinkMessage>,
) -> Result<()> {
    let mut res = handle.request(request)?;
    while let Some(res) = res.next().await {
        if let NetlinkPayload::Error(e) = res.payload {
            // An error message without a code is the acknowledgement.
            if e.code.is_some() {
                return Err(rtnetlink::Error::NetlinkError(e));
            }
        }
    }

    Ok(())
}

/// Returns `true` if `err` is the kernel reporting `errno`.
pub fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(e) if e.code.map(|c| c.get()) == Some(-errno))
}

/// Delete the root qdisc of an interface.
///
/// Returns `false` if there was nothing to delete.
pub async fn delete_root_qdisc(handle: &mut rtnetlink::Handle, if_index: i32) -> Result<bool> {
    tracing::debug!(if_index, "deleting root qdisc");

    let request = QdiscDeleteRootRequest::new(QdiscRequestInner::new(if_index)).build();
    match execute(handle, request).await {
        Ok(()) => Ok(true),
        Err(e) if is_errno(&e, nix::libc::ENOENT) => {
            tracing::debug!(if_index, "no root qdisc to delete");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Install the HTB root qdisc (`1:0`). Unclassified traffic is not shaped.
pub async fn install_htb_root(handle: &mut rtnetlink::Handle, if_index: i32) -> Result<()> {
    tracing::debug!(if_index, "installing htb root qdisc");

    let request = QdiscHtbRequest::new(QdiscRequestInner::new(if_index)).build();
    execute(handle, request).await
}

/// Create the HTB class `1:mark` limited to `rate_kbit` (`0` for unlimited).
pub async fn configure_htb_class(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    mark: u16,
    rate_kbit: u32,
    psched: Psched,
) -> Result<()> {
    let class = class_handle(mark);
    tracing::debug!(if_index, mark, class = display(class), rate_kbit, "creating htb class");

    let request = HtbClassRequest::new(
        QdiscRequestInner::new(if_index)
            .with_parent(TcHandle::from(root_handle()))
            .with_handle(TcHandle::from(class)),
        psched,
    )
    .with_rate_kbit(rate_kbit)
    .build();

    execute(handle, request).await
}

/// Attach a netem qdisc (`mark:0`) below the class `1:mark`.
pub async fn configure_netem(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    mark: u16,
    impairment: &Impairment,
    psched: Psched,
) -> Result<()> {
    let parent = class_handle(mark);
    tracing::debug!(if_index, mark, parent = display(parent), ?impairment, "creating netem qdisc");

    let request = QdiscNetemRequest::from_impairment(
        QdiscRequestInner::new(if_index)
            .with_parent(TcHandle::from(parent))
            .with_handle(TcHandle::from(netem_handle(mark))),
        impairment,
        psched,
    )
    .build();

    execute(handle, request).await
}

/// Route packets carrying `mark` into the class `1:mark`, optionally through a policer.
pub async fn configure_fw_filter(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    mark: u16,
    police: Option<Police>,
    psched: Psched,
) -> Result<()> {
    tracing::debug!(if_index, mark, ?police, "creating fw filter");

    let request = FwFilterRequest::new(
        QdiscRequestInner::new(if_index).with_parent(TcHandle::from(root_handle())),
        mark,
        psched,
    )
    .with_police(police)
    .build();

    execute(handle, request).await
}

/// Delete the fw filter for `mark`.
pub async fn delete_fw_filter(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    mark: u16,
) -> Result<()> {
    tracing::debug!(if_index, mark, "deleting fw filter");

    let request = FwFilterDeleteRequest::new(
        QdiscRequestInner::new(if_index).with_parent(TcHandle::from(root_handle())),
        mark,
    )
    .build();

    execute(handle, request).await
}

/// Delete the class `1:mark` and the netem qdisc below it.
pub async fn delete_htb_class(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    mark: u16,
) -> Result<()> {
    tracing::debug!(if_index, mark, "deleting htb class");

    let request = HtbClassDeleteRequest::new(
        QdiscRequestInner::new(if_index)
            .with_parent(TcHandle::from(root_handle()))
            .with_handle(TcHandle::from(class_handle(mark))),
    )
    .build();

    execute(handle, request).await
}
