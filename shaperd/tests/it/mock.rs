use std::{collections::BTreeSet, net::Ipv4Addr, sync::Arc};

use parking_lot::Mutex;
use shaper_common::ManualClock;
use shaperd::{
    access::AccessMode,
    backend::{BackendError, Interface, Interfaces, Role, ShapingBackend},
    idpool::Mark,
    types::{Delay, Device, Loss, Settings, Shaping, ShapingSession},
    Orchestrator, OrchestratorOptions, PersistenceQueue,
};

/// Unix time every test clock starts at.
pub(crate) const START: u64 = 1_700_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Init,
    Shape(Mark, Role, Ipv4Addr),
    Unshape(Mark, Role, Ipv4Addr),
    Teardown,
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<Call>,
    /// `(mark, role)` pairs currently installed.
    installed: BTreeSet<(Mark, u8)>,
    fail_wan: Option<BackendError>,
    fail_lan: Option<BackendError>,
    fail_unshape_wan: Option<BackendError>,
    fail_unshape_lan: Option<BackendError>,
}

/// A backend that records calls and fails on demand.
#[derive(Debug)]
pub(crate) struct ScriptedShaper {
    range: (Mark, Mark),
    script: Mutex<Script>,
}

const fn role_key(role: Role) -> u8 {
    match role {
        Role::Lan => 0,
        Role::Wan => 1,
    }
}

impl ScriptedShaper {
    pub(crate) fn new(min: Mark, max: Mark) -> Self {
        Self { range: (min, max), script: Mutex::default() }
    }

    /// Makes every shape call on `role` fail with `err` until cleared with `None`.
    pub(crate) fn fail_shape(&self, role: Role, err: Option<BackendError>) {
        let mut script = self.script.lock();
        match role {
            Role::Wan => script.fail_wan = err,
            Role::Lan => script.fail_lan = err,
        }
    }

    /// Makes every unshape call on `role` fail with `err`, leaving its objects installed.
    pub(crate) fn fail_unshape(&self, role: Role, err: Option<BackendError>) {
        let mut script = self.script.lock();
        match role {
            Role::Wan => script.fail_unshape_wan = err,
            Role::Lan => script.fail_unshape_lan = err,
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.script.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.script.lock().calls.clear();
    }

    /// Number of (mark, interface) shapings currently installed.
    pub(crate) fn installed(&self) -> usize {
        self.script.lock().installed.len()
    }

    pub(crate) fn is_installed(&self, mark: Mark, role: Role) -> bool {
        self.script.lock().installed.contains(&(mark, role_key(role)))
    }
}

impl ShapingBackend for ScriptedShaper {
    fn mark_range(&self) -> (Mark, Mark) {
        self.range
    }

    async fn initialize_interfaces(&self, _interfaces: &Interfaces) -> Result<(), BackendError> {
        let mut script = self.script.lock();
        script.calls.push(Call::Init);
        script.installed.clear();
        Ok(())
    }

    async fn shape_interface(
        &self,
        mark: Mark,
        iface: &Interface,
        ip: Ipv4Addr,
        _shaping: &Shaping,
    ) -> Result<(), BackendError> {
        // Yield so that concurrent callers get a chance to interleave.
        tokio::task::yield_now().await;

        let mut script = self.script.lock();
        script.calls.push(Call::Shape(mark, iface.role, ip));

        let failure = match iface.role {
            Role::Wan => script.fail_wan.clone(),
            Role::Lan => script.fail_lan.clone(),
        };
        if let Some(err) = failure {
            return Err(err);
        }

        script.installed.insert((mark, role_key(iface.role)));
        Ok(())
    }

    async fn unshape_interface(
        &self,
        mark: Mark,
        iface: &Interface,
        ip: Ipv4Addr,
        _shaping: &Shaping,
    ) -> Result<(), BackendError> {
        let mut script = self.script.lock();
        script.calls.push(Call::Unshape(mark, iface.role, ip));

        let failure = match iface.role {
            Role::Wan => script.fail_unshape_wan.clone(),
            Role::Lan => script.fail_unshape_lan.clone(),
        };
        if let Some(err) = failure {
            return Err(err);
        }

        script.installed.remove(&(mark, role_key(iface.role)));
        Ok(())
    }

    async fn teardown(&self) {
        self.script.lock().calls.push(Call::Teardown);
    }
}

pub(crate) async fn orchestrator(
    mode: AccessMode,
    range: (Mark, Mark),
) -> (Orchestrator<ScriptedShaper>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_unix(START));
    let orch = Orchestrator::new(
        ScriptedShaper::new(range.0, range.1),
        OrchestratorOptions::new(Interfaces::new("eth1", "eth0"), mode),
        PersistenceQueue::default(),
        clock.clone(),
    )
    .await
    .unwrap();

    (orch, clock)
}

pub(crate) fn settings(rate: u32, delay: u32, loss: f32) -> Settings {
    let shaping = Shaping {
        rate,
        delay: Delay { delay, ..Default::default() },
        loss: Loss { percentage: loss, correlation: 0.0 },
        ..Default::default()
    };
    Settings { up: shaping.clone(), down: shaping }
}

pub(crate) fn session(device: Device, settings: Settings, timeout: i64) -> ShapingSession {
    ShapingSession { device, settings, timeout }
}

pub(crate) fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}
