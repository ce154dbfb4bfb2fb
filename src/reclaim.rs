//! Background reclamation
//!
//! Freeing a large sorted set member by member is not something a shard
//! should do while commands wait behind it. The owning store unlinks the key
//! synchronously, so no later command can observe it, and ships the detached
//! value here; a dedicated worker thread frees it off the foreground path.
//! Nothing observable depends on when that happens.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::store::Value;

/// An unlinked key and its detached value, queued for freeing.
#[derive(Debug)]
pub struct Teardown {
    /// The key the value was unlinked from (for logging only; the key is
    /// already gone from the keyspace).
    pub key: Bytes,

    /// The detached value to free.
    pub value: Value,
}

/// Handle to the teardown worker.
#[derive(Debug)]
pub struct DropPool {
    tx: mpsc::UnboundedSender<Teardown>,
    worker: std::thread::JoinHandle<()>,
}

impl DropPool {
    /// Spawn the worker thread and return a handle to it.
    ///
    /// The worker exits once every sender clone has been dropped and the
    /// queue is drained.
    pub fn spawn() -> anyhow::Result<DropPool> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Teardown>();

        let worker = std::thread::Builder::new()
            .name("drop-pool".to_string())
            .spawn(move || {
                info!("drop pool worker started");
                while let Some(job) = rx.blocking_recv() {
                    debug!(key = ?job.key, bytes = job.value.memory_usage(), "freeing detached value");
                    drop(job);
                }
                info!("drop pool worker stopped");
            })?;

        Ok(DropPool { tx, worker })
    }

    /// Sender clone for a store to enqueue teardown jobs on.
    pub fn handle(&self) -> mpsc::UnboundedSender<Teardown> {
        self.tx.clone()
    }

    /// Drop the pool's own sender and wait for the worker to drain.
    ///
    /// Only meaningful once every store holding a handle is gone too.
    pub fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.join();
    }
}
