//! Sharded engine front-end
//!
//! Keys are spread across shards by SipHash; each shard owns its slice of
//! the keyspace outright, so commands for one key always land on the same
//! single-threaded loop and are serialized there, while commands for
//! different keys run in parallel. The manager owns the shards, the drop
//! pool and the periodic expiry sweeper, and exposes the typed async
//! command surface.

mod command;
#[allow(clippy::module_inception)]
mod shard;

pub use command::{Command, Responder};
pub use shard::{Shard, ShardConfig};

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use siphasher::sip::SipHasher13;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::reclaim::DropPool;
use crate::store::{ScoreBound, UpdateMode};

/// Engine facade: owns all shards and routes commands to them.
pub struct ShardManager {
    shards: Vec<Arc<Shard>>,

    /// Keeps the teardown worker reachable for as long as the engine lives
    _drop_pool: DropPool,

    /// Dropping this sender is what stops the sweeper thread
    _sweep_stop: mpsc::UnboundedSender<()>,
}

/// Aggregated statistics across all shards.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub num_shards: usize,
    pub keys: usize,
    pub tracked_expiries: usize,
    pub used_memory_bytes: usize,
}

impl ShardManager {
    /// Start an engine on the wall clock.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Start an engine with an injected time source (deterministic tests).
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        anyhow::ensure!(config.num_shards > 0, "num_shards must be > 0");
        info!("Initializing engine with {} shards", config.num_shards);

        let drop_pool = DropPool::spawn()?;

        let mut shards = Vec::with_capacity(config.num_shards);
        for shard_id in 0..config.num_shards {
            let shard = Shard::new(ShardConfig {
                shard_id,
                async_del_threshold: config.async_del_threshold,
                clock: clock.clone(),
                teardown_tx: drop_pool.handle(),
            })?;
            shards.push(Arc::new(shard));
        }

        let (sweep_stop_tx, sweep_stop_rx) = mpsc::unbounded_channel();
        if config.sweep_interval_ms > 0 {
            spawn_sweeper(shards.clone(), config.sweep_interval_ms, sweep_stop_rx)?;
        }

        info!("Engine initialized with {} shards", config.num_shards);

        Ok(ShardManager {
            shards,
            _drop_pool: drop_pool,
            _sweep_stop: sweep_stop_tx,
        })
    }

    // --- ZSET commands ---

    /// ZADD: add or reprice members. Returns the added count, or the
    /// added-plus-repriced count when `changed` is set (CH).
    pub async fn zadd(
        &self,
        key: impl Into<Bytes>,
        pairs: Vec<(Bytes, f64)>,
        mode: UpdateMode,
        changed: bool,
    ) -> Result<i64, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZAdd {
            key,
            pairs,
            mode,
            changed,
            resp,
        })
        .await
    }

    /// ZCARD.
    pub async fn zcard(&self, key: impl Into<Bytes>) -> Result<usize, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZCard { key, resp }).await
    }

    /// ZSCORE.
    pub async fn zscore(
        &self,
        key: impl Into<Bytes>,
        member: impl Into<Bytes>,
    ) -> Result<Option<f64>, StoreError> {
        let key = key.into();
        let member = member.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZScore { key, member, resp })
            .await
    }

    /// ZINCRBY.
    pub async fn zincrby(
        &self,
        key: impl Into<Bytes>,
        delta: f64,
        member: impl Into<Bytes>,
    ) -> Result<f64, StoreError> {
        let key = key.into();
        let member = member.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZIncrBy {
            key,
            delta,
            member,
            resp,
        })
        .await
    }

    /// ZREM.
    pub async fn zrem(
        &self,
        key: impl Into<Bytes>,
        members: Vec<Bytes>,
    ) -> Result<usize, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZRem { key, members, resp })
            .await
    }

    /// ZRANGE / ZREVRANGE by rank.
    pub async fn zrange(
        &self,
        key: impl Into<Bytes>,
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZRange {
            key,
            start,
            stop,
            reverse,
            resp,
        })
        .await
    }

    /// ZRANGEBYSCORE / ZREVRANGEBYSCORE.
    pub async fn zrange_by_score(
        &self,
        key: impl Into<Bytes>,
        min: ScoreBound,
        max: ScoreBound,
        reverse: bool,
        offset: usize,
        count: Option<usize>,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZRangeByScore {
            key,
            min,
            max,
            reverse,
            offset,
            count,
            resp,
        })
        .await
    }

    /// ZCOUNT.
    pub async fn zcount(
        &self,
        key: impl Into<Bytes>,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<usize, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZCount { key, min, max, resp })
            .await
    }

    /// ZRANK.
    pub async fn zrank(
        &self,
        key: impl Into<Bytes>,
        member: impl Into<Bytes>,
    ) -> Result<Option<usize>, StoreError> {
        let key = key.into();
        let member = member.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZRank { key, member, resp })
            .await
    }

    /// ZREMRANGEBYRANK.
    pub async fn zremrangebyrank(
        &self,
        key: impl Into<Bytes>,
        start: i64,
        stop: i64,
    ) -> Result<usize, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZRemRangeByRank {
            key,
            start,
            stop,
            resp,
        })
        .await
    }

    /// ZREMRANGEBYSCORE.
    pub async fn zremrangebyscore(
        &self,
        key: impl Into<Bytes>,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<usize, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZRemRangeByScore {
            key,
            min,
            max,
            resp,
        })
        .await
    }

    /// ZPOPMIN.
    pub async fn zpopmin(
        &self,
        key: impl Into<Bytes>,
        count: usize,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZPopMin { key, count, resp })
            .await
    }

    /// ZPOPMAX.
    pub async fn zpopmax(
        &self,
        key: impl Into<Bytes>,
        count: usize,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ZPopMax { key, count, resp })
            .await
    }

    // --- Generic key commands ---

    /// DEL over any number of keys; returns how many existed.
    pub async fn del(&self, keys: &[Bytes]) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for key in keys {
            let owned = key.clone();
            if self
                .ask(key, move |resp| Command::Del { key: owned, resp })
                .await?
            {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// EXISTS.
    pub async fn exists(&self, key: impl Into<Bytes>) -> Result<bool, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::Exists { key, resp }).await
    }

    /// TYPE tag: "zset", "string", or "none".
    pub async fn key_type(&self, key: impl Into<Bytes>) -> Result<&'static str, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::Type { key, resp }).await
    }

    /// PEXPIREAT: absolute deadline in milliseconds since the epoch.
    /// Relative EXPIRE/PEXPIRE forms are converted upstream.
    pub async fn expire_at(
        &self,
        key: impl Into<Bytes>,
        at_ms: u64,
    ) -> Result<bool, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::ExpireAt { key, at_ms, resp })
            .await
    }

    /// PTTL: remaining milliseconds, -1 without a deadline, -2 when absent.
    pub async fn ttl_millis(&self, key: impl Into<Bytes>) -> Result<i64, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::TtlMillis { key, resp })
            .await
    }

    /// PERSIST.
    pub async fn persist(&self, key: impl Into<Bytes>) -> Result<bool, StoreError> {
        let key = key.into();
        let route = key.clone();
        self.ask(&route, move |resp| Command::Persist { key, resp }).await
    }

    /// Run one expiry pass over every shard; returns keys removed.
    ///
    /// The background sweeper calls the same per-shard command on its own
    /// schedule; this entry point exists for tests and operational tooling.
    pub async fn sweep(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            if shard.send(Command::Sweep { resp: tx }).is_err() {
                continue;
            }
            if let Ok(Ok(count)) = rx.await {
                removed += count;
            }
        }
        removed
    }

    /// Aggregated statistics across all shards.
    pub async fn stats(&self) -> EngineStats {
        let mut totals = EngineStats {
            num_shards: self.shards.len(),
            ..EngineStats::default()
        };
        for shard in &self.shards {
            let stats = shard.stats().await;
            totals.keys += stats.keys;
            totals.tracked_expiries += stats.tracked_expiries;
            totals.used_memory_bytes += stats.used_memory_bytes;
        }
        totals
    }

    /// Number of shards.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    // --- Internals ---

    /// The shard owning a key.
    fn shard_for(&self, key: &Bytes) -> &Shard {
        let mut hasher = SipHasher13::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Send a command to a key's shard and wait for the typed reply.
    async fn ask<T>(
        &self,
        route: &Bytes,
        build: impl FnOnce(Responder<T>) -> Command,
    ) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        let shard = self.shard_for(route);

        if let Err(e) = shard.send(build(tx)) {
            error!("failed to queue command: {}", e);
            return Err(StoreError::Closed);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                error!("shard dropped a command responder");
                Err(StoreError::Closed)
            }
        }
    }
}

/// Spawn the periodic sweeper thread.
///
/// It asks every shard to reap past-due keys each tick and stops when the
/// manager drops its end of the stop channel.
fn spawn_sweeper(
    shards: Vec<Arc<Shard>>,
    interval_ms: u64,
    mut stop_rx: mpsc::UnboundedReceiver<()>,
) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("expiry-sweeper".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("expiry sweeper failed to build its runtime: {}", e);
                    return;
                }
            };

            runtime.block_on(async move {
                info!("expiry sweeper running every {}ms", interval_ms);
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let mut removed = 0usize;
                            for shard in &shards {
                                let (tx, rx) = oneshot::channel();
                                if shard.send(Command::Sweep { resp: tx }).is_err() {
                                    continue;
                                }
                                if let Ok(Ok(count)) = rx.await {
                                    removed += count;
                                }
                            }
                            if removed > 0 {
                                debug!("proactive sweep removed {} keys", removed);
                            }
                        }

                        _ = stop_rx.recv() => {
                            info!("expiry sweeper stopping");
                            break;
                        }
                    }
                }
            });
        })?;
    Ok(())
}
