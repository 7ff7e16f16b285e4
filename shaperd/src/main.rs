//! The `shaperd` daemon: restores saved sessions, then serves JSON-lines requests until
//! interrupted.

use std::{io, sync::Arc};

use anyhow::Context;
use clap::Parser;
use shaper_common::{Clock, SystemClock};
use shaperd::{
    backend::{NoopShaper, ShapingBackend},
    config::Args,
    rpc, sweeper, JsonFileStore, Orchestrator, PersistenceQueue,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    #[cfg(target_os = "linux")]
    if !args.dry_run {
        let backend = shaperd::backend::LinuxShaper::new(args.linux_options())
            .context("starting the linux backend")?;
        return run(args, backend).await;
    }

    #[cfg(not(target_os = "linux"))]
    if !args.dry_run {
        tracing::warn!("no native backend on this platform, shaping calls are only logged");
    }

    run(args, NoopShaper::new()).await
}

async fn run<B: ShapingBackend>(args: Args, backend: B) -> anyhow::Result<()> {
    let store = JsonFileStore::open(args.store_file.clone())
        .with_context(|| format!("opening store {}", args.store_file.display()))?;
    let store = Arc::new(store);
    tracing::info!(path = %store.path().display(), "opened store");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let persistence = PersistenceQueue::new(args.queue_capacity);

    let orch = Orchestrator::new(backend, args.orchestrator_options(), persistence.clone(), clock)
        .await
        .context("initializing interfaces")?;
    let orch = Arc::new(orch);

    // Running before the restore, so removals of stale records drain instead of
    // overflowing the queue.
    let worker = persistence.spawn_worker(Arc::clone(&store));

    if args.fresh_start {
        tracing::info!("fresh start, saved shapings are not restored");
    } else if let Err(e) = orch.restore_at_startup(store.as_ref()).await {
        persistence.close();
        if let Err(join) = worker.await {
            tracing::warn!(error = %join, "persistence worker ended abnormally");
        }
        return Err(e).context("restoring saved shapings");
    }

    let cancel = CancellationToken::new();
    let sweeper = sweeper::spawn(Arc::clone(&orch), args.sweep_period(), cancel.clone());

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding rpc listener on {}", args.listen))?;
    let server = rpc::serve(listener, Arc::clone(&orch), cancel.clone());

    shutdown_signal().await.context("installing signal handlers")?;
    tracing::info!(shaped = orch.shaped_device_count(), "shutting down");

    cancel.cancel();
    for (name, task) in [("sweeper", sweeper), ("rpc server", server)] {
        if let Err(e) = task.await {
            tracing::warn!(task = name, error = %e, "task ended abnormally");
        }
    }

    persistence.close();
    if let Err(e) = worker.await {
        tracing::warn!(error = %e, "persistence worker ended abnormally");
    }

    orch.teardown().await;

    Ok(())
}

async fn shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await
}
