//! In-process collective communication
//!
//! Worker operations synchronize through a small collective surface:
//! a barrier and a byte-level all-gather. The in-process group runs
//! every rank as a task inside one process and matches calls by
//! per-rank sequence number, so rank r's nth collective always joins
//! the nth round of every other rank.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Default upper bound on how long a rank waits for its peers
pub const DEFAULT_COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Collective operations available to worker code.
///
/// Implementations must order all-gather results by rank.
#[async_trait]
pub trait CollectiveGroup: Send + Sync {
    /// Rank of the calling process within this group
    fn rank(&self) -> usize;

    /// Number of ranks in this group
    fn world_size(&self) -> usize;

    /// Blocks until every rank in the group has arrived
    async fn barrier(&self) -> Result<()>;

    /// Gathers one payload from every rank, returned in rank order
    async fn all_gather(&self, payload: Bytes) -> Result<Vec<Bytes>>;
}

struct Round {
    slots: Vec<Option<Bytes>>,
    arrived: usize,
    drained: usize,
}

impl Round {
    fn new(world_size: usize) -> Self {
        Self {
            slots: vec![None; world_size],
            arrived: 0,
            drained: 0,
        }
    }
}

struct GroupBus {
    world_size: usize,
    timeout: Duration,
    rounds: Mutex<HashMap<u64, Round>>,
    notify: Notify,
}

/// A rank's handle onto an in-process collective group.
///
/// Created in sets via [`LocalGroup::new_group`]; each participating
/// task owns exactly one handle.
pub struct LocalGroup {
    rank: usize,
    next_seq: AtomicU64,
    bus: Arc<GroupBus>,
}

impl LocalGroup {
    /// Creates one handle per rank, all sharing a bus
    pub fn new_group(world_size: usize, timeout: Duration) -> Result<Vec<LocalGroup>> {
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "collective group world size must be at least 1".to_string(),
            });
        }
        let bus = Arc::new(GroupBus {
            world_size,
            timeout,
            rounds: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });
        Ok((0..world_size)
            .map(|rank| LocalGroup {
                rank,
                next_seq: AtomicU64::new(0),
                bus: Arc::clone(&bus),
            })
            .collect())
    }

    /// A single-rank group where every collective completes immediately
    pub fn solo() -> LocalGroup {
        LocalGroup {
            rank: 0,
            next_seq: AtomicU64::new(0),
            bus: Arc::new(GroupBus {
                world_size: 1,
                timeout: DEFAULT_COLLECTIVE_TIMEOUT,
                rounds: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    async fn gather_round(&self, operation: &str, payload: Bytes) -> Result<Vec<Bytes>> {
        let world = self.bus.world_size;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if world == 1 {
            return Ok(vec![payload]);
        }

        {
            let mut rounds = self.bus.rounds.lock();
            let round = rounds.entry(seq).or_insert_with(|| Round::new(world));
            if round.slots[self.rank].is_some() {
                return Err(Error::Internal {
                    message: format!("rank {} joined round {} twice", self.rank, seq),
                });
            }
            round.slots[self.rank] = Some(payload);
            round.arrived += 1;
            if round.arrived == world {
                self.bus.notify.notify_waiters();
            }
        }

        let deadline = Instant::now() + self.bus.timeout;
        loop {
            let notified = self.bus.notify.notified();
            {
                let mut rounds = self.bus.rounds.lock();
                let round = rounds.get_mut(&seq).ok_or_else(|| Error::Internal {
                    message: format!("round {} drained before rank {} read it", seq, self.rank),
                })?;
                if round.arrived == world {
                    let gathered: Vec<Bytes> = round
                        .slots
                        .iter()
                        .map(|s| s.clone().unwrap_or_default())
                        .collect();
                    round.drained += 1;
                    if round.drained == world {
                        rounds.remove(&seq);
                    }
                    return Ok(gathered);
                }
            }
            let remaining =
                deadline
                    .checked_duration_since(Instant::now())
                    .ok_or(Error::CollectiveTimeout {
                        operation: operation.to_string(),
                        rank: self.rank,
                        timeout_ms: self.bus.timeout.as_millis() as u64,
                    })?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(Error::CollectiveTimeout {
                    operation: operation.to_string(),
                    rank: self.rank,
                    timeout_ms: self.bus.timeout.as_millis() as u64,
                });
            }
        }
    }
}

#[async_trait]
impl CollectiveGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.bus.world_size
    }

    async fn barrier(&self) -> Result<()> {
        self.gather_round("barrier", Bytes::new()).await?;
        Ok(())
    }

    async fn all_gather(&self, payload: Bytes) -> Result<Vec<Bytes>> {
        self.gather_round("all_gather", payload).await
    }
}
