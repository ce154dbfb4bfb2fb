//! Typed command vocabulary between the manager and its shards
//!
//! The dispatch layer upstream owns raw-argument parsing: by the time a
//! command reaches a shard it is already decomposed into keys, members and
//! scores. Every variant carries the oneshot responder its reply travels on,
//! so the shard loop stays a single match with no reply-type bookkeeping.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::store::{ScoreBound, UpdateMode};

/// Channel a shard answers a command on.
pub type Responder<T> = oneshot::Sender<Result<T, StoreError>>;

/// A decoded command addressed to a single key's shard.
#[derive(Debug)]
pub enum Command {
    ZAdd {
        key: Bytes,
        pairs: Vec<(Bytes, f64)>,
        mode: UpdateMode,
        changed: bool,
        resp: Responder<i64>,
    },
    ZCard {
        key: Bytes,
        resp: Responder<usize>,
    },
    ZScore {
        key: Bytes,
        member: Bytes,
        resp: Responder<Option<f64>>,
    },
    ZIncrBy {
        key: Bytes,
        delta: f64,
        member: Bytes,
        resp: Responder<f64>,
    },
    ZRem {
        key: Bytes,
        members: Vec<Bytes>,
        resp: Responder<usize>,
    },
    ZRange {
        key: Bytes,
        start: i64,
        stop: i64,
        reverse: bool,
        resp: Responder<Vec<(Bytes, f64)>>,
    },
    ZRangeByScore {
        key: Bytes,
        min: ScoreBound,
        max: ScoreBound,
        reverse: bool,
        offset: usize,
        count: Option<usize>,
        resp: Responder<Vec<(Bytes, f64)>>,
    },
    ZCount {
        key: Bytes,
        min: ScoreBound,
        max: ScoreBound,
        resp: Responder<usize>,
    },
    ZRank {
        key: Bytes,
        member: Bytes,
        resp: Responder<Option<usize>>,
    },
    ZRemRangeByRank {
        key: Bytes,
        start: i64,
        stop: i64,
        resp: Responder<usize>,
    },
    ZRemRangeByScore {
        key: Bytes,
        min: ScoreBound,
        max: ScoreBound,
        resp: Responder<usize>,
    },
    ZPopMin {
        key: Bytes,
        count: usize,
        resp: Responder<Vec<(Bytes, f64)>>,
    },
    ZPopMax {
        key: Bytes,
        count: usize,
        resp: Responder<Vec<(Bytes, f64)>>,
    },
    Del {
        key: Bytes,
        resp: Responder<bool>,
    },
    Exists {
        key: Bytes,
        resp: Responder<bool>,
    },
    Type {
        key: Bytes,
        resp: Responder<&'static str>,
    },
    ExpireAt {
        key: Bytes,
        at_ms: u64,
        resp: Responder<bool>,
    },
    TtlMillis {
        key: Bytes,
        resp: Responder<i64>,
    },
    Persist {
        key: Bytes,
        resp: Responder<bool>,
    },
    /// Proactive expiry pass over the whole shard.
    Sweep {
        resp: Responder<usize>,
    },
}
