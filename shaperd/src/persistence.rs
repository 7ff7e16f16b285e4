//! Background persistence of session starts and stops.
//!
//! Shaping never waits on the store. Operations are queued and applied in order by a
//! single worker; a failed operation is logged and dropped.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    error::StoreError,
    store::{PersistedRecord, Store},
    types::ShapingSession,
};

/// Default number of operations the queue holds before dropping the oldest.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A queued store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    /// Record `session`, expiring at unix time `timeout`.
    Add { session: ShapingSession, timeout: u64 },
    /// Forget the session of `ip`.
    Remove { ip: String },
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<VecDeque<PersistOp>>,
    notify: Notify,
    /// Signalled each time the worker takes an operation out of the queue.
    room: Notify,
    capacity: usize,
    closed: AtomicBool,
    /// Set while a worker is running.
    draining: AtomicBool,
}

/// Producer side of the persistence queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PersistenceQueue {
    shared: Arc<Shared>,
}

impl Default for PersistenceQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl PersistenceQueue {
    /// Creates a queue holding at most `capacity` operations.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                room: Notify::new(),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Queues the record of a started session.
    pub fn add_shaping(&self, session: ShapingSession, timeout: u64) {
        self.push(PersistOp::Add { session, timeout });
    }

    /// Queues the removal of the session of `ip`.
    pub fn remove_shaping(&self, ip: impl Into<String>) {
        self.push(PersistOp::Remove { ip: ip.into() });
    }

    /// Queues the removal of the session of `ip`. While a worker is running, waits for room
    /// instead of dropping the oldest operation.
    pub async fn remove_shaping_waiting(&self, ip: impl Into<String>) {
        let op = PersistOp::Remove { ip: ip.into() };
        loop {
            // Registered before the check so a pop in between is not missed.
            let room = self.shared.room.notified();
            {
                let mut queue = self.shared.queue.lock();
                if queue.len() < self.shared.capacity
                    || !self.shared.draining.load(Ordering::Acquire)
                {
                    self.enqueue(&mut queue, op);
                    break;
                }
            }
            room.await;
        }
        self.shared.notify.notify_one();
    }

    fn push(&self, op: PersistOp) {
        self.enqueue(&mut self.shared.queue.lock(), op);
        self.shared.notify.notify_one();
    }

    fn enqueue(&self, queue: &mut VecDeque<PersistOp>, op: PersistOp) {
        if queue.len() >= self.shared.capacity {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(?dropped, capacity = self.shared.capacity, "persistence queue full, dropping oldest operation");
            }
        }
        queue.push_back(op);
    }

    /// Operations not yet picked up by the worker.
    pub fn pending(&self) -> Vec<PersistOp> {
        self.shared.queue.lock().iter().cloned().collect()
    }

    /// Number of operations not yet applied.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the worker once the queue is drained.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    /// Spawns the single worker applying queued operations to `store`.
    ///
    /// The worker exits after [`PersistenceQueue::close`] once every queued operation has
    /// been applied.
    pub fn spawn_worker<S: Store>(&self, store: Arc<S>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        shared.draining.store(true, Ordering::Release);
        tokio::spawn(async move {
            loop {
                let next = shared.queue.lock().pop_front();
                match next {
                    Some(op) => {
                        shared.room.notify_waiters();
                        apply(Arc::clone(&store), op).await;
                    }
                    None if shared.closed.load(Ordering::Acquire) => break,
                    None => shared.notify.notified().await,
                }
            }
            shared.draining.store(false, Ordering::Release);
            shared.room.notify_waiters();
            tracing::debug!("persistence worker stopped");
        })
    }
}

async fn apply<S: Store>(store: Arc<S>, op: PersistOp) {
    let desc = match &op {
        PersistOp::Add { session, .. } => format!("add {}", session.device.controlled_ip),
        PersistOp::Remove { ip } => format!("remove {ip}"),
    };

    let res = tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        match op {
            PersistOp::Add { session, timeout } => store.upsert(PersistedRecord::new(&session, timeout)?),
            PersistOp::Remove { ip } => store.remove(&ip),
        }
    })
    .await;

    match res {
        Ok(Ok(())) => tracing::debug!(op = desc, "persisted"),
        Ok(Err(e)) => tracing::warn!(op = desc, error = %e, "persistence failed, dropping operation"),
        Err(e) => tracing::warn!(op = desc, error = %e, "persistence task panicked, dropping operation"),
    }
}
