//! A backend that only logs.

use std::net::Ipv4Addr;

use super::{BackendError, Interface, Interfaces, ShapingBackend, DEFAULT_MARK_RANGE};
use crate::{idpool::Mark, types::Shaping};

/// A backend that logs every call and touches nothing.
///
/// Used for dry runs and on platforms without a native backend.
#[derive(Debug, Clone, Copy)]
pub struct NoopShaper {
    mark_range: (Mark, Mark),
}

impl NoopShaper {
    /// A backend over [`DEFAULT_MARK_RANGE`].
    pub const fn new() -> Self {
        Self { mark_range: DEFAULT_MARK_RANGE }
    }

    /// A backend handing out marks in `[min, max]`.
    pub const fn with_mark_range(min: Mark, max: Mark) -> Self {
        Self { mark_range: (min, max) }
    }
}

impl Default for NoopShaper {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapingBackend for NoopShaper {
    fn mark_range(&self) -> (Mark, Mark) {
        self.mark_range
    }

    async fn initialize_interfaces(&self, interfaces: &Interfaces) -> Result<(), BackendError> {
        tracing::info!(lan = %interfaces.lan, wan = %interfaces.wan, "dry run: initialize interfaces");
        Ok(())
    }

    async fn shape_interface(
        &self,
        mark: Mark,
        iface: &Interface,
        ip: Ipv4Addr,
        shaping: &Shaping,
    ) -> Result<(), BackendError> {
        tracing::info!(mark, %iface, %ip, ?shaping, "dry run: shape");
        Ok(())
    }

    async fn unshape_interface(
        &self,
        mark: Mark,
        iface: &Interface,
        ip: Ipv4Addr,
        _shaping: &Shaping,
    ) -> Result<(), BackendError> {
        tracing::info!(mark, %iface, %ip, "dry run: unshape");
        Ok(())
    }

    async fn teardown(&self) {
        tracing::info!("dry run: teardown");
    }
}
