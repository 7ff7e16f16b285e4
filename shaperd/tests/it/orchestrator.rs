use std::{sync::Arc, time::Duration};

use shaperd::{
    access::AccessMode,
    backend::{BackendError, Role},
    error::ReturnCode,
    persistence::PersistOp,
    types::{Device, ShapingRc},
    ShapingError,
};

use crate::mock::{ip, orchestrator, session, settings, Call};

#[tokio::test]
async fn start_stop_and_reuse_mark() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let dev = Device::itself("10.0.0.1");
    let wanted = settings(1_000, 50, 1.0);

    orch.start_shaping(session(dev.clone(), wanted.clone(), 60)).await.unwrap();

    assert!(orch.is_shaped(&dev));
    assert_eq!(orch.shaped_device_count(), 1);
    assert_eq!(orch.get_current_shaping(&dev).unwrap(), wanted);
    assert_eq!(orch.sessions().get(ip("10.0.0.1")).unwrap().mark, 1);
    assert_eq!(
        orch.backend().calls()[1..],
        [Call::Shape(1, Role::Wan, ip("10.0.0.1")), Call::Shape(1, Role::Lan, ip("10.0.0.1"))]
    );

    orch.stop_shaping(&dev).await.unwrap();

    assert!(!orch.is_shaped(&dev));
    assert_eq!(orch.shaped_device_count(), 0);
    assert_eq!(orch.backend().installed(), 0);
    assert_eq!(orch.pool().in_use(), 0);

    orch.start_shaping(session(dev.clone(), wanted, 60)).await.unwrap();
    assert_eq!(orch.sessions().get(ip("10.0.0.1")).unwrap().mark, 1);
}

#[tokio::test]
async fn update_installs_new_before_removing_old() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let dev = Device::itself("10.0.0.1");
    let addr = ip("10.0.0.1");

    orch.start_shaping(session(dev.clone(), settings(1_000, 0, 0.0), 60)).await.unwrap();
    orch.backend().clear_calls();

    let updated = settings(500, 100, 5.0);
    orch.start_shaping(session(dev.clone(), updated.clone(), 60)).await.unwrap();

    assert_eq!(
        orch.backend().calls(),
        [
            Call::Shape(2, Role::Wan, addr),
            Call::Shape(2, Role::Lan, addr),
            Call::Unshape(1, Role::Wan, addr),
            Call::Unshape(1, Role::Lan, addr),
        ]
    );
    assert_eq!(orch.get_current_shaping(&dev).unwrap(), updated);
    assert_eq!(orch.shaped_device_count(), 1);
    assert_eq!(orch.pool().in_use(), 1);
    assert_eq!(orch.backend().installed(), 2);
}

#[tokio::test]
async fn stop_rejects_unknown_and_invalid() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;

    let err = orch.stop_shaping(&Device::itself("10.0.0.7")).await.unwrap_err();
    assert_eq!(err.code(), ReturnCode::UnknownSession);

    let err = orch.stop_shaping(&Device::itself("10.0.0")).await.unwrap_err();
    assert_eq!(err.code(), ReturnCode::InvalidIp);

    let rc = ShapingRc::from(orch.stop_shaping(&Device::itself("10.0.0.7")).await);
    assert_eq!(rc.code, ReturnCode::UnknownSession);
}

#[tokio::test]
async fn stop_forgets_the_session_when_cleanup_fails() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let dev = Device::itself("10.0.0.1");
    let addr = ip("10.0.0.1");

    orch.start_shaping(session(dev.clone(), settings(1_000, 0, 0.0), 60)).await.unwrap();
    orch.backend().fail_unshape(Role::Wan, Some(BackendError::NetlinkFw("No such file".into())));
    orch.backend().fail_unshape(Role::Lan, Some(BackendError::UnknownHtb("boom".into())));
    orch.backend().clear_calls();

    orch.stop_shaping(&dev).await.unwrap();

    // Both sides were attempted even though the first one failed.
    assert_eq!(orch.backend().calls(), [Call::Unshape(1, Role::Wan, addr), Call::Unshape(1, Role::Lan, addr)]);
    assert!(!orch.is_shaped(&dev));
    assert_eq!(orch.shaped_device_count(), 0);
    assert_eq!(orch.pool().in_use(), 0);
    assert_eq!(orch.persistence().pending().last(), Some(&PersistOp::Remove { ip: "10.0.0.1".into() }));

    let rc = ShapingRc::from(orch.stop_shaping(&dev).await);
    assert_eq!(rc.code, ReturnCode::UnknownSession);
}

#[tokio::test]
async fn out_of_range_timeout_is_rejected_before_any_work() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let dev = Device::itself("10.0.0.1");
    orch.backend().clear_calls();

    let err = orch.start_shaping(session(dev.clone(), settings(0, 0, 0.0), i64::MAX)).await.unwrap_err();
    assert_eq!(err, ShapingError::InvalidTimeout(i64::MAX));
    assert_eq!(err.code(), ReturnCode::InvalidTimeout);

    assert!(orch.backend().calls().is_empty());
    assert_eq!(orch.backend().installed(), 0);
    assert_eq!(orch.pool().in_use(), 0);
    assert!(!orch.is_shaped(&dev));
    assert!(orch.persistence().is_empty());
}

#[tokio::test]
async fn out_of_range_token_duration_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let remote = Device::new("10.0.0.1", "10.0.0.2");

    let err = orch.request_token("10.0.0.2", u64::MAX).unwrap_err();
    assert_eq!(err.code(), ReturnCode::InvalidTimeout);

    assert!(!orch.request_remote_control(&remote, "000000"));
    assert!(orch.devices_controlled_by("10.0.0.1").is_empty());

    // A sane duration still works afterwards.
    let token = orch.request_token("10.0.0.2", 30).unwrap();
    assert!(orch.request_remote_control(&remote, &token.token));
}

#[tokio::test]
async fn wan_failure_does_not_leak_marks() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    orch.backend().fail_shape(Role::Wan, Some(BackendError::NetlinkHtb("File exists".into())));

    // More attempts than the pool has marks.
    for i in 0..20 {
        let dev = Device::itself(format!("10.0.1.{i}"));
        let err = orch.start_shaping(session(dev, settings(0, 0, 0.0), 60)).await.unwrap_err();
        assert_eq!(err.code(), ReturnCode::NetlinkHtbError);
    }

    assert_eq!(orch.pool().in_use(), 0);
    assert_eq!(orch.shaped_device_count(), 0);
    assert!(orch.persistence().is_empty());

    orch.backend().fail_shape(Role::Wan, None);
    orch.start_shaping(session(Device::itself("10.0.1.1"), settings(0, 0, 0.0), 60))
        .await
        .unwrap();
    assert_eq!(orch.sessions().get(ip("10.0.1.1")).unwrap().mark, 1);
}

#[tokio::test]
async fn lan_failure_rolls_back_wan() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let addr = ip("10.0.0.1");
    orch.backend().clear_calls();
    orch.backend().fail_shape(Role::Lan, Some(BackendError::NetlinkNetem("Invalid argument".into())));

    let err = orch
        .start_shaping(session(Device::itself("10.0.0.1"), settings(0, 10, 0.0), 60))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ReturnCode::NetlinkNetemError);
    assert_eq!(
        orch.backend().calls(),
        [
            Call::Shape(1, Role::Wan, addr),
            Call::Shape(1, Role::Lan, addr),
            Call::Unshape(1, Role::Wan, addr),
        ]
    );
    assert_eq!(orch.backend().installed(), 0);
    assert_eq!(orch.pool().in_use(), 0);
    assert!(!orch.is_shaped(&Device::itself("10.0.0.1")));
}

#[tokio::test]
async fn failed_update_keeps_previous_shaping() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let dev = Device::itself("10.0.0.1");
    let original = settings(1_000, 20, 0.0);

    orch.start_shaping(session(dev.clone(), original.clone(), 60)).await.unwrap();
    orch.backend().fail_shape(Role::Lan, Some(BackendError::UnknownFw("boom".into())));

    let err = orch.start_shaping(session(dev.clone(), settings(10, 0, 0.0), 60)).await.unwrap_err();
    assert_eq!(err.code(), ReturnCode::UnknownFwError);

    assert_eq!(orch.get_current_shaping(&dev).unwrap(), original);
    assert!(orch.backend().is_installed(1, Role::Wan));
    assert!(orch.backend().is_installed(1, Role::Lan));
    assert!(!orch.backend().is_installed(2, Role::Wan));
    assert_eq!(orch.pool().in_use(), 1);
}

#[tokio::test]
async fn exhaustion_and_recovery() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;

    for i in 1..=10 {
        let dev = Device::itself(format!("10.0.0.{i}"));
        orch.start_shaping(session(dev, settings(0, 0, 0.0), 60)).await.unwrap();
    }

    let late = Device::itself("10.0.0.11");
    let err = orch.start_shaping(session(late.clone(), settings(0, 0, 0.0), 60)).await.unwrap_err();
    assert_eq!(err, ShapingError::IdExhaust);
    assert_eq!(orch.shaped_device_count(), 10);

    orch.stop_shaping(&Device::itself("10.0.0.4")).await.unwrap();
    orch.start_shaping(session(late, settings(0, 0, 0.0), 60)).await.unwrap();
    assert_eq!(orch.sessions().get(ip("10.0.0.11")).unwrap().mark, 4);
}

#[tokio::test]
async fn remote_control_with_token() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, clock) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let remote = Device::new("10.0.0.1", "10.0.0.2");

    let err = orch.start_shaping(session(remote.clone(), settings(0, 0, 0.0), 30)).await.unwrap_err();
    assert_eq!(err.code(), ReturnCode::AccessDenied);

    let token = orch.request_token("10.0.0.2", 15).unwrap();
    assert_eq!(token.token.len(), 6);
    assert_eq!(token.interval, 60);
    assert!(token.valid_until > crate::mock::START);

    assert!(!orch.request_remote_control(&remote, "not a code"));
    assert!(orch.request_remote_control(&remote, &token.token));

    let held = orch.devices_controlled_by("10.0.0.1");
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].device, remote);
    assert_eq!(held[0].valid_until, crate::mock::START + 15);
    assert_eq!(orch.devices_controlling("10.0.0.2"), held);

    orch.start_shaping(session(remote.clone(), settings(0, 0, 0.0), 10)).await.unwrap();

    clock.advance(Duration::from_secs(16));
    assert!(orch.devices_controlled_by("10.0.0.1").is_empty());

    let err = orch.stop_shaping(&remote).await.unwrap_err();
    assert_eq!(err.code(), ReturnCode::AccessDenied);
    assert!(orch.is_shaped(&remote));

    // The session expired at +10s and the sweeper needs no grant.
    assert_eq!(orch.stop_expired_shapings().await, 1);
    assert!(!orch.is_shaped(&remote));
}

#[tokio::test]
async fn unsecure_mode_allows_everyone() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Unsecure, (1, 10)).await;
    let remote = Device::new("10.0.0.1", "10.0.0.2");

    orch.start_shaping(session(remote.clone(), settings(0, 0, 0.0), 30)).await.unwrap();
    orch.stop_shaping(&remote).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_for_one_device() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let orch = Arc::new(orch);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move {
                let dev = Device::itself("10.0.0.1");
                orch.start_shaping(session(dev, settings(100 * (i + 1), 0, 0.0), 60)).await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(orch.shaped_device_count(), 1);
    assert_eq!(orch.pool().in_use(), 1);
    assert_eq!(orch.backend().installed(), 2);
}

#[tokio::test]
async fn teardown_reaches_backend() {
    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    orch.teardown().await;
    assert_eq!(orch.backend().calls().last(), Some(&Call::Teardown));
}
