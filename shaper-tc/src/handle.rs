//! TC handle computation and common request infrastructure.
//!
//! TC handles are 32-bit values split into major:minor (16:16 bits). The root HTB qdisc
//! is `1:0`; a session with mark `m` owns class `1:m` and netem qdisc `m:0`.

use rtnetlink::packet_route::tc::TcHandle;

/// Major number of the root HTB qdisc.
pub const ROOT_MAJOR: u32 = 1;

/// Priority of the fw filters attached to the root qdisc.
pub const FW_FILTER_PRIORITY: u16 = 1;

/// Smallest usable mark. Class `1:1` and qdisc `1:0` belong to the root.
pub const MARK_MIN: u16 = 2;

/// Largest usable mark, bounded by the 16-bit minor number.
pub const MARK_MAX: u16 = u16::MAX;

/// Common fields shared by all qdisc/class/filter requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QdiscRequestInner {
    /// The network interface index (from `if_nametoindex`).
    pub interface_index: i32,
    /// The parent handle (where this qdisc/class/filter attaches).
    pub parent: TcHandle,
    /// This object's own handle.
    pub handle: TcHandle,
}

impl QdiscRequestInner {
    /// Create a new request for the given interface, defaulting to root parent.
    pub fn new(index: i32) -> Self {
        Self { interface_index: index, parent: TcHandle::ROOT, handle: TcHandle::default() }
    }

    /// Set the parent handle.
    pub fn with_parent(mut self, parent: TcHandle) -> Self {
        self.parent = parent;
        self
    }

    /// Set this object's handle.
    pub fn with_handle(mut self, handle: TcHandle) -> Self {
        self.handle = handle;
        self
    }
}

/// The root HTB qdisc handle, `1:0`.
pub const fn root_handle() -> u32 {
    ROOT_MAJOR << 16
}

/// The HTB class handle for `mark`, `1:mark`.
///
/// ```
/// use shaper_tc::handle::class_handle;
/// assert_eq!(class_handle(2), 0x0001_0002);
/// ```
pub const fn class_handle(mark: u16) -> u32 {
    (ROOT_MAJOR << 16) | mark as u32
}

/// The netem qdisc handle for `mark`, `mark:0`.
pub const fn netem_handle(mark: u16) -> u32 {
    (mark as u32) << 16
}

/// Formats a handle the way `tc` prints it, e.g. `1:a`.
pub fn display(handle: u32) -> String {
    format!("{:x}:{:x}", handle >> 16, handle & 0xffff)
}
