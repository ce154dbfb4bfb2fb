//! Shard implementation
//!
//! Each shard runs in its own thread with a dedicated [`SortedSetStore`].
//! One owner per slice of the keyspace means every operation on a key is
//! serialized with no locks, while different shards proceed in parallel.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::command::Command;
use crate::clock::Clock;
use crate::reclaim::Teardown;
use crate::store::{SortedSetStore, StoreStats};

/// Configuration for a shard.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Unique shard identifier
    pub shard_id: usize,

    /// Cardinality at or above which teardown is deferred to the drop pool
    pub async_del_threshold: usize,

    /// Time source shared by the whole engine
    pub clock: Arc<dyn Clock>,

    /// Queue to the drop pool worker
    pub teardown_tx: mpsc::UnboundedSender<Teardown>,
}

/// A shard that processes commands in its own thread.
pub struct Shard {
    /// Shard ID
    id: usize,

    /// Channel to send commands to the shard thread
    command_tx: mpsc::UnboundedSender<Command>,

    /// Channel to request stats
    stats_tx: mpsc::UnboundedSender<oneshot::Sender<StoreStats>>,
}

impl Shard {
    /// Create a new shard and start its thread.
    pub fn new(config: ShardConfig) -> anyhow::Result<Self> {
        let shard_id = config.shard_id;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name(format!("shard-{}", shard_id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Shard {} failed to build its runtime: {}", shard_id, e);
                        return;
                    }
                };

                runtime.block_on(Self::run_shard_loop(config, command_rx, stats_rx));
            })?;

        info!("Shard {} started", shard_id);

        Ok(Shard {
            id: shard_id,
            command_tx,
            stats_tx,
        })
    }

    /// Queue a command for this shard.
    pub fn send(&self, command: Command) -> anyhow::Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| anyhow::anyhow!("Shard {} channel closed", self.id))
    }

    /// Get statistics from this shard.
    pub async fn stats(&self) -> StoreStats {
        let (tx, rx) = oneshot::channel();

        if self.stats_tx.send(tx).is_err() {
            error!("Failed to request stats from shard {}", self.id);
            return StoreStats::default();
        }

        rx.await.unwrap_or_default()
    }

    /// The main loop that runs in the shard's thread.
    async fn run_shard_loop(
        config: ShardConfig,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut stats_rx: mpsc::UnboundedReceiver<oneshot::Sender<StoreStats>>,
    ) {
        let shard_id = config.shard_id;
        info!("Shard {} loop starting", shard_id);

        let mut store = SortedSetStore::with_teardown(
            config.clock,
            config.teardown_tx,
            config.async_del_threshold,
        );

        loop {
            tokio::select! {
                Some(command) = command_rx.recv() => {
                    Self::dispatch(&mut store, command);
                }

                Some(stats_tx) = stats_rx.recv() => {
                    let _ = stats_tx.send(store.stats());
                }

                // Both channels closed, exit
                else => {
                    info!("Shard {} shutting down", shard_id);
                    break;
                }
            }
        }
    }

    /// Execute one decoded command against the shard-local store.
    ///
    /// A dropped responder just means the caller gave up waiting; the store
    /// mutation already happened, so the send result is ignored.
    fn dispatch(store: &mut SortedSetStore, command: Command) {
        match command {
            Command::ZAdd { key, pairs, mode, changed, resp } => {
                let _ = resp.send(store.zadd(&key, &pairs, mode, changed));
            }
            Command::ZCard { key, resp } => {
                let _ = resp.send(store.zcard(&key));
            }
            Command::ZScore { key, member, resp } => {
                let _ = resp.send(store.zscore(&key, &member));
            }
            Command::ZIncrBy { key, delta, member, resp } => {
                let _ = resp.send(store.zincrby(&key, delta, &member));
            }
            Command::ZRem { key, members, resp } => {
                let _ = resp.send(store.zrem(&key, &members));
            }
            Command::ZRange { key, start, stop, reverse, resp } => {
                let _ = resp.send(store.zrange(&key, start, stop, reverse));
            }
            Command::ZRangeByScore { key, min, max, reverse, offset, count, resp } => {
                let _ = resp.send(store.zrange_by_score(&key, min, max, reverse, offset, count));
            }
            Command::ZCount { key, min, max, resp } => {
                let _ = resp.send(store.zcount(&key, min, max));
            }
            Command::ZRank { key, member, resp } => {
                let _ = resp.send(store.zrank(&key, &member));
            }
            Command::ZRemRangeByRank { key, start, stop, resp } => {
                let _ = resp.send(store.zremrangebyrank(&key, start, stop));
            }
            Command::ZRemRangeByScore { key, min, max, resp } => {
                let _ = resp.send(store.zremrangebyscore(&key, min, max));
            }
            Command::ZPopMin { key, count, resp } => {
                let _ = resp.send(store.zpopmin(&key, count));
            }
            Command::ZPopMax { key, count, resp } => {
                let _ = resp.send(store.zpopmax(&key, count));
            }
            Command::Del { key, resp } => {
                let _ = resp.send(Ok(store.del(&key)));
            }
            Command::Exists { key, resp } => {
                let _ = resp.send(Ok(store.exists(&key)));
            }
            Command::Type { key, resp } => {
                let _ = resp.send(Ok(store.key_type(&key)));
            }
            Command::ExpireAt { key, at_ms, resp } => {
                let _ = resp.send(Ok(store.expire_at(&key, at_ms)));
            }
            Command::TtlMillis { key, resp } => {
                let _ = resp.send(Ok(store.ttl_millis(&key)));
            }
            Command::Persist { key, resp } => {
                let _ = resp.send(Ok(store.persist(&key)));
            }
            Command::Sweep { resp } => {
                let removed = store.reap_expired();
                if removed > 0 {
                    debug!("sweep removed {} expired keys", removed);
                }
                let _ = resp.send(Ok(removed));
            }
        }
    }

    /// Get shard ID.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        info!("Shard {} dropped", self.id);
    }
}
