use std::{sync::Arc, time::Duration};

use shaper_common::{from_unix_secs, ManualClock};
use shaperd::{
    access::AccessMode,
    backend::{BackendError, Interfaces, Role},
    error::{RestoreError, ReturnCode},
    persistence::PersistOp,
    store::PersistedRecord,
    types::Device,
    JsonFileStore, MemoryStore, Orchestrator, OrchestratorOptions, PersistenceQueue,
    RestoreSummary, Store,
};

use crate::mock::{ip, orchestrator, session, settings, ScriptedShaper, START};

fn record(device: Device, expires_at: u64) -> PersistedRecord {
    PersistedRecord::new(&session(device, settings(800, 40, 2.0), 0), expires_at).unwrap()
}

#[tokio::test]
async fn replays_live_records_and_drops_the_rest() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = Arc::new(MemoryStore::new());
    store.upsert(record(Device::itself("10.0.0.1"), START + 100)).unwrap();
    store.upsert(record(Device::itself("10.0.0.2"), START - 1)).unwrap();
    store.upsert(record(Device::itself("10.0.0.3"), START)).unwrap();
    store
        .upsert(PersistedRecord { ip: "10.0.0.4".into(), session: "{not json".into(), timeout: START + 5 })
        .unwrap();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let summary = orch.restore_at_startup(store.as_ref()).await.unwrap();

    assert_eq!(summary, RestoreSummary { restored: 1, expired: 2, denied: 0, corrupt: 1 });
    assert_eq!(orch.shaped_device_count(), 1);

    let live = orch.sessions().get(ip("10.0.0.1")).unwrap();
    assert_eq!(live.expiry, from_unix_secs(START + 100));
    assert_eq!(live.session.settings, settings(800, 40, 2.0));

    let pending = orch.persistence().pending();
    for gone in ["10.0.0.2", "10.0.0.3", "10.0.0.4"] {
        assert!(pending.contains(&PersistOp::Remove { ip: gone.into() }), "{gone} not removed");
    }
    assert!(pending.iter().any(|op| matches!(
        op,
        PersistOp::Add { session, timeout } if session.device.controlled_ip == "10.0.0.1" && *timeout == START + 100
    )));

    let worker = orch.persistence().spawn_worker(Arc::clone(&store));
    orch.persistence().close();
    worker.await.unwrap();

    let saved = store.saved_shapings().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].ip, "10.0.0.1");
    assert_eq!(saved[0].timeout, START + 100);
}

#[tokio::test]
async fn unreachable_expiry_is_dropped_as_corrupt() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = MemoryStore::new();
    store.upsert(record(Device::itself("10.0.0.1"), u64::MAX)).unwrap();
    store.upsert(record(Device::itself("10.0.0.2"), START + 100)).unwrap();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let summary = orch.restore_at_startup(&store).await.unwrap();

    assert_eq!(summary, RestoreSummary { restored: 1, expired: 0, denied: 0, corrupt: 1 });
    assert!(!orch.is_shaped(&Device::itself("10.0.0.1")));
    assert!(orch.is_shaped(&Device::itself("10.0.0.2")));
    assert_eq!(orch.pool().in_use(), 1);
    assert!(orch.persistence().pending().contains(&PersistOp::Remove { ip: "10.0.0.1".into() }));
}

#[tokio::test]
async fn stale_records_all_reach_the_store_through_a_small_queue() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = Arc::new(MemoryStore::new());
    for i in 1..=6 {
        store.upsert(record(Device::itself(format!("10.0.0.{i}")), START - i)).unwrap();
    }

    let orch = Orchestrator::new(
        ScriptedShaper::new(1, 10),
        OrchestratorOptions::new(Interfaces::new("eth1", "eth0"), AccessMode::Secure),
        PersistenceQueue::new(1),
        Arc::new(ManualClock::at_unix(START)),
    )
    .await
    .unwrap();

    let worker = orch.persistence().spawn_worker(Arc::clone(&store));
    let summary = orch.restore_at_startup(store.as_ref()).await.unwrap();
    assert_eq!(summary.expired, 6);

    orch.persistence().close();
    worker.await.unwrap();
    assert!(store.saved_shapings().unwrap().is_empty());
}

#[tokio::test]
async fn secure_mode_drops_denied_records() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = MemoryStore::new();
    store.upsert(record(Device::new("10.0.0.9", "10.0.0.1"), START + 100)).unwrap();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let summary = orch.restore_at_startup(&store).await.unwrap();

    assert_eq!(summary.denied, 1);
    assert_eq!(summary.restored, 0);
    assert_eq!(orch.shaped_device_count(), 0);
    assert_eq!(orch.persistence().pending(), vec![PersistOp::Remove { ip: "10.0.0.1".into() }]);
}

#[tokio::test]
async fn unsecure_mode_restores_remote_records() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = MemoryStore::new();
    store.upsert(record(Device::new("10.0.0.9", "10.0.0.1"), START + 100)).unwrap();

    let (orch, _) = orchestrator(AccessMode::Unsecure, (1, 10)).await;
    let summary = orch.restore_at_startup(&store).await.unwrap();

    assert_eq!(summary.restored, 1);
    assert!(orch.is_shaped(&Device::itself("10.0.0.1")));
}

#[tokio::test]
async fn backend_failure_aborts_restore() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = MemoryStore::new();
    store.upsert(record(Device::itself("10.0.0.1"), START + 100)).unwrap();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    orch.backend().fail_shape(Role::Wan, Some(BackendError::UnknownNetem("no netem".into())));

    let err = orch.restore_at_startup(&store).await.unwrap_err();
    match err {
        RestoreError::Shaping { ip, source } => {
            assert_eq!(ip, "10.0.0.1");
            assert_eq!(source.code(), ReturnCode::UnknownNetemError);
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn sessions_survive_a_restart() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("shapings.json");
    let clock = Arc::new(ManualClock::at_unix(START));
    let wanted = settings(2_000, 25, 0.5);

    {
        let store = Arc::new(JsonFileStore::open(&path).unwrap());
        let persistence = PersistenceQueue::default();
        let worker = persistence.spawn_worker(Arc::clone(&store));

        let orch = Orchestrator::new(
            ScriptedShaper::new(1, 10),
            OrchestratorOptions::new(Interfaces::new("eth1", "eth0"), AccessMode::Secure),
            persistence.clone(),
            clock.clone(),
        )
        .await
        .unwrap();

        orch.start_shaping(session(Device::itself("10.0.0.1"), wanted.clone(), 120)).await.unwrap();
        orch.start_shaping(session(Device::itself("10.0.0.2"), wanted.clone(), 120)).await.unwrap();
        orch.stop_shaping(&Device::itself("10.0.0.2")).await.unwrap();

        persistence.close();
        worker.await.unwrap();
    }

    clock.advance(Duration::from_secs(20));

    let store = JsonFileStore::open(&path).unwrap();
    let orch = Orchestrator::new(
        ScriptedShaper::new(1, 10),
        OrchestratorOptions::new(Interfaces::new("eth1", "eth0"), AccessMode::Secure),
        PersistenceQueue::default(),
        clock.clone(),
    )
    .await
    .unwrap();

    let summary = orch.restore_at_startup(&store).await.unwrap();
    assert_eq!(summary.restored, 1);

    let dev = Device::itself("10.0.0.1");
    assert_eq!(orch.get_current_shaping(&dev).unwrap(), wanted);
    assert_eq!(orch.sessions().get(ip("10.0.0.1")).unwrap().expiry, from_unix_secs(START + 120));
    assert!(!orch.is_shaped(&Device::itself("10.0.0.2")));
}
