//! The shaping orchestrator.
//!
//! Owns the live sessions and drives the handle pool and the backend to start, update and
//! stop shaping. Every mutating operation runs under a single async lock, so the
//! allocate/shape/record steps of two requests never interleave.

use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use shaper_common::{unix_secs, Clock};
use tracing::Instrument as _;

use crate::{
    access::{AccessManager, AccessMode, ACCESS_TOKEN_INTERVAL},
    backend::{BackendError, Interfaces, ShapingBackend},
    error::{AccessError, RestoreError, ShapingError},
    idpool::HandlePool,
    persistence::PersistenceQueue,
    session::{LiveSession, SessionTable},
    store::Store,
    types::{parse_ip, AccessToken, Device, RemoteControlInstance, Settings, ShapingSession},
};

/// Construction options of an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Interfaces shaped in each direction.
    pub interfaces: Interfaces,
    pub mode: AccessMode,
    /// Seconds between two access codes.
    pub token_interval: u64,
}

impl OrchestratorOptions {
    /// Options with the default access code interval.
    pub fn new(interfaces: Interfaces, mode: AccessMode) -> Self {
        Self { interfaces, mode, token_interval: ACCESS_TOKEN_INTERVAL }
    }
}

/// What [`Orchestrator::restore_at_startup`] did with the saved records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Records shaped again.
    pub restored: usize,
    /// Records past their expiry, queued for removal.
    pub expired: usize,
    /// Records refused by access control, queued for removal.
    pub denied: usize,
    /// Records that could not be decoded, queued for removal.
    pub corrupt: usize,
}

/// The stateful core of the daemon.
#[derive(Debug)]
pub struct Orchestrator<B> {
    backend: B,
    interfaces: Interfaces,
    pool: HandlePool,
    access: AccessManager,
    sessions: SessionTable,
    persistence: PersistenceQueue,
    clock: Arc<dyn Clock>,
    /// Serialises mutating operations.
    op_lock: tokio::sync::Mutex<()>,
}

impl<B: ShapingBackend> Orchestrator<B> {
    /// Initializes the backend interfaces and returns an orchestrator with no live session.
    pub async fn new(
        backend: B,
        options: OrchestratorOptions,
        persistence: PersistenceQueue,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BackendError> {
        backend.initialize_interfaces(&options.interfaces).await?;

        let (min, max) = backend.mark_range();
        tracing::info!(
            lan = %options.interfaces.lan,
            wan = %options.interfaces.wan,
            mode = ?options.mode,
            min,
            max,
            "orchestrator ready"
        );

        Ok(Self {
            backend,
            interfaces: options.interfaces,
            pool: HandlePool::new(min, max),
            access: AccessManager::with_interval(
                options.mode,
                options.token_interval,
                Arc::clone(&clock),
            ),
            sessions: SessionTable::new(),
            persistence,
            clock,
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The kernel backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Marks of the live sessions.
    pub const fn pool(&self) -> &HandlePool {
        &self.pool
    }

    /// Access codes and remote-control grants.
    pub const fn access(&self) -> &AccessManager {
        &self.access
    }

    /// Live sessions by controlled IP.
    pub const fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Queue of pending store writes.
    pub const fn persistence(&self) -> &PersistenceQueue {
        &self.persistence
    }

    /// Starts shaping `session.device`, replacing any shaping it already has.
    ///
    /// The new shaping is installed before the old one is removed, so an update never
    /// leaves the device unshaped. A failure leaves any previous shaping untouched.
    pub async fn start_shaping(&self, mut session: ShapingSession) -> Result<(), ShapingError> {
        let span = tracing::info_span!("start_shaping", ip = %session.device.controlled_ip);
        async {
            tracing::info!(?session, "request");

            let ip = parse_ip(&session.device.controlled_ip)
                .ok_or_else(|| ShapingError::InvalidIp(session.device.controlled_ip.clone()))?;
            // Negative timeouts and expiries past what the clock can represent.
            let expiry = u64::try_from(session.timeout)
                .ok()
                .and_then(|secs| self.clock.now().checked_add(Duration::from_secs(secs)))
                .ok_or(ShapingError::InvalidTimeout(session.timeout))?;
            self.check_access(&session.device)?;
            // Keys the persisted record the same way as the live table.
            session.device.controlled_ip = ip.to_string();

            let _guard = self.op_lock.lock().await;
            self.shape_locked(ip, session, expiry).await
        }
        .instrument(span)
        .await
    }

    async fn shape_locked(
        &self,
        ip: Ipv4Addr,
        session: ShapingSession,
        expiry: SystemTime,
    ) -> Result<(), ShapingError> {
        let mark = self.pool.acquire().map_err(|e| {
            tracing::warn!(%e, "no mark available");
            ShapingError::IdExhaust
        })?;
        let settings = &session.settings;

        if let Err(e) = self.backend.shape_interface(mark, &self.interfaces.wan, ip, &settings.up).await {
            tracing::error!(mark, error = %e, "shaping wan side");
            self.pool.release(mark);
            return Err(e.into());
        }

        if let Err(e) =
            self.backend.shape_interface(mark, &self.interfaces.lan, ip, &settings.down).await
        {
            tracing::error!(mark, error = %e, "shaping lan side");
            if let Err(undo) =
                self.backend.unshape_interface(mark, &self.interfaces.wan, ip, &settings.up).await
            {
                tracing::warn!(mark, error = %undo, "rolling back wan side");
            }
            self.pool.release(mark);
            return Err(e.into());
        }

        let previous =
            self.sessions.insert(ip, LiveSession { mark, session: session.clone(), expiry });
        self.persistence.add_shaping(session, unix_secs(expiry));
        tracing::info!(mark, expiry = unix_secs(expiry), "shaped");

        if let Some(old) = previous {
            tracing::debug!(old_mark = old.mark, "removing previous shaping");
            self.unshape_both(ip, &old).await;
            self.pool.release(old.mark);
        }

        Ok(())
    }

    /// Stops shaping `device`.
    ///
    /// Kernel cleanup is best effort: the session is forgotten even if some objects could
    /// not be removed.
    pub async fn stop_shaping(&self, device: &Device) -> Result<(), ShapingError> {
        let span = tracing::info_span!("stop_shaping", ip = %device.controlled_ip);
        async {
            tracing::info!("request");

            let ip = parse_ip(&device.controlled_ip)
                .ok_or_else(|| ShapingError::InvalidIp(device.controlled_ip.clone()))?;
            self.check_access(device)?;

            let _guard = self.op_lock.lock().await;
            self.unshape_locked(ip).await
        }
        .instrument(span)
        .await
    }

    async fn unshape_locked(&self, ip: Ipv4Addr) -> Result<(), ShapingError> {
        let Some(live) = self.sessions.get(ip) else {
            return Err(ShapingError::UnknownSession(ip.to_string()));
        };

        self.unshape_both(ip, &live).await;

        self.sessions.remove(ip);
        self.persistence.remove_shaping(ip.to_string());
        self.pool.release(live.mark);
        tracing::info!(mark = live.mark, "unshaped");

        Ok(())
    }

    async fn unshape_both(&self, ip: Ipv4Addr, live: &LiveSession) {
        let settings = &live.session.settings;
        if let Err(e) =
            self.backend.unshape_interface(live.mark, &self.interfaces.wan, ip, &settings.up).await
        {
            tracing::warn!(mark = live.mark, error = %e, code = ?e.code(), "unshaping wan side");
        }
        if let Err(e) = self
            .backend
            .unshape_interface(live.mark, &self.interfaces.lan, ip, &settings.down)
            .await
        {
            tracing::warn!(mark = live.mark, error = %e, code = ?e.code(), "unshaping lan side");
        }
    }

    fn check_access(&self, device: &Device) -> Result<(), ShapingError> {
        if self.access.is_allowed(device) {
            return Ok(());
        }
        tracing::warn!(controlling = %device.controlling_ip, "access denied");
        Err(ShapingError::AccessDenied {
            controlling: device.controlling_ip.clone(),
            controlled: device.controlled_ip.clone(),
        })
    }

    /// The settings `device` is currently shaped with.
    pub fn get_current_shaping(&self, device: &Device) -> Result<Settings, ShapingError> {
        parse_ip(&device.controlled_ip)
            .and_then(|ip| self.sessions.get(ip))
            .map(|live| live.session.settings)
            .ok_or_else(|| ShapingError::UnknownIp(device.controlled_ip.clone()))
    }

    /// Whether `device` has a live session.
    pub fn is_shaped(&self, device: &Device) -> bool {
        parse_ip(&device.controlled_ip).is_some_and(|ip| self.sessions.contains(ip))
    }

    /// Number of devices with a live session.
    pub fn shaped_device_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stops every session whose expiry has passed. Returns how many were stopped.
    ///
    /// This path skips access control: the daemon, not a device, reclaims the session.
    pub async fn stop_expired_shapings(&self) -> usize {
        let expired = self.sessions.expired(self.clock.now());
        let mut stopped = 0;

        for ip in expired {
            let _guard = self.op_lock.lock().await;
            // Refreshed while we waited for the lock.
            if !self.sessions.get(ip).is_some_and(|live| live.expiry <= self.clock.now()) {
                continue;
            }

            tracing::info!(%ip, "shaping expired");
            if self.unshape_locked(ip).await.is_ok() {
                stopped += 1;
            }
        }

        stopped
    }

    /// Returns a one-time code letting another device control `ip` for `duration` seconds.
    pub fn request_token(&self, ip: &str, duration: u64) -> Result<AccessToken, AccessError> {
        tracing::info!(ip, duration, "request token");
        self.access.generate_code(ip, Duration::from_secs(duration))
    }

    /// Grants `device.controlling_ip` control over `device.controlled_ip` if `token` is
    /// valid. Returns whether access was granted.
    pub fn request_remote_control(&self, device: &Device, token: &str) -> bool {
        tracing::info!(?device, "request remote control");
        match self.access.validate_and_grant(device, token) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "remote control refused");
                false
            }
        }
    }

    /// Live grants `ip` holds over other devices.
    pub fn devices_controlled_by(&self, ip: &str) -> Vec<RemoteControlInstance> {
        self.access.grants_held(ip)
    }

    /// Live grants other devices hold over `ip`.
    pub fn devices_controlling(&self, ip: &str) -> Vec<RemoteControlInstance> {
        self.access.grants_given(ip)
    }

    /// Shapes again every saved session that has not expired yet.
    ///
    /// Expired and undecodable records are queued for removal. In secure mode a record
    /// refused by access control is dropped too; any other failure aborts the restore.
    pub async fn restore_at_startup<S: Store>(
        &self,
        store: &S,
    ) -> Result<RestoreSummary, RestoreError> {
        let records = match store.saved_shapings() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "unable to read saved shapings, starting fresh");
                Vec::new()
            }
        };

        let mut summary = RestoreSummary::default();
        let now = unix_secs(self.clock.now());

        for record in records {
            if record.timeout <= now {
                tracing::debug!(ip = %record.ip, "saved shaping expired");
                self.persistence.remove_shaping_waiting(record.ip).await;
                summary.expired += 1;
                continue;
            }

            let mut session = match record.decode() {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(ip = %record.ip, error = %e, "dropping undecodable saved shaping");
                    self.persistence.remove_shaping_waiting(record.ip).await;
                    summary.corrupt += 1;
                    continue;
                }
            };
            // Too far out for the clock: rejected below and dropped like a corrupt record.
            session.timeout = i64::try_from(record.timeout - now).unwrap_or(i64::MAX);

            match self.start_shaping(session).await {
                Ok(()) => summary.restored += 1,
                Err(e @ ShapingError::AccessDenied { .. })
                    if self.access.mode() == AccessMode::Secure =>
                {
                    tracing::warn!(ip = %record.ip, error = %e, "shaping denied in secure mode, dropping");
                    self.persistence.remove_shaping_waiting(record.ip).await;
                    summary.denied += 1;
                }
                Err(e @ ShapingError::InvalidTimeout(_)) => {
                    tracing::warn!(ip = %record.ip, error = %e, "dropping saved shaping with unusable expiry");
                    self.persistence.remove_shaping_waiting(record.ip).await;
                    summary.corrupt += 1;
                }
                Err(source) => return Err(RestoreError::Shaping { ip: record.ip, source }),
            }
        }

        tracing::info!(?summary, "restored saved shapings");
        Ok(summary)
    }

    /// Releases backend resources.
    pub async fn teardown(&self) {
        self.backend.teardown().await;
    }
}
