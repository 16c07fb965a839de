//! Protocol timers and block timestamp arithmetic
//!
//! Timers run as spawned tokio tasks that deliver a [`TimeoutEvent`] over an
//! unbounded channel when they fire. At most one timer per [`TimeoutKind`]
//! is live; scheduling a kind again for the same (height, round) is refused,
//! and scheduling it for another (height, round) replaces the old timer.

use crate::config::TimeoutConfig;
use chain_core::{Height, Round, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// The round's block timestamp has been reached; the proposer proposes
    BlockPrepare,
    Propose,
    Prevote,
    Precommit,
}

/// A fired timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub kind: TimeoutKind,
    pub height: Height,
    pub round: Round,
}

struct Timer {
    height: Height,
    round: Round,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    config: TimeoutConfig,
    sender: mpsc::UnboundedSender<TimeoutEvent>,
    timers: Mutex<HashMap<TimeoutKind, Timer>>,
}

impl Scheduler {
    pub fn new(config: TimeoutConfig) -> (Self, mpsc::UnboundedReceiver<TimeoutEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            config,
            sender,
            timers: Mutex::new(HashMap::new()),
        };
        (scheduler, receiver)
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Length of the propose, prevote and precommit stages of `round`
    pub fn stage_duration(&self, round: Round) -> Duration {
        Duration::from_millis(stage_millis(&self.config, round))
    }

    /// `max(parent + block_time, round_start + block_prepare_time)`
    pub fn next_block_timestamp(&self, parent: Timestamp, round_start: Timestamp) -> Timestamp {
        parent
            .saturating_add(self.config.block_time)
            .max(round_start.saturating_add(self.config.block_prepare_time))
    }

    /// Earliest acceptable timestamp for a block first proposed in `round`
    pub fn minimal_timestamp(&self, parent: Timestamp, round: Round) -> Timestamp {
        minimal_timestamp(&self.config, parent, round)
    }

    /// Arm a timer. Returns false when `kind` is already armed for this
    /// (height, round).
    pub fn schedule(&self, kind: TimeoutKind, height: Height, round: Round, delay: Duration) -> bool {
        let mut timers = self.timers.lock();
        if let Some(timer) = timers.get(&kind) {
            if timer.height == height && timer.round == round {
                return false;
            }
            timer.handle.abort();
        }

        let sender = self.sender.clone();
        let event = TimeoutEvent {
            kind,
            height,
            round,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the engine was disposed
            let _ = sender.send(event);
        });
        debug!(
            "Scheduled {:?} timeout for {}/{} in {}ms",
            kind,
            height,
            round,
            delay.as_millis()
        );
        timers.insert(
            kind,
            Timer {
                height,
                round,
                handle,
            },
        );
        true
    }

    /// Fire [`TimeoutKind::BlockPrepare`] at wall-clock time `at`
    pub fn schedule_block_prepare(&self, height: Height, round: Round, at: Timestamp) -> bool {
        let delay = Duration::from_millis(at.saturating_sub(now_millis()));
        self.schedule(TimeoutKind::BlockPrepare, height, round, delay)
    }

    pub fn schedule_propose(&self, height: Height, round: Round) -> bool {
        self.schedule(TimeoutKind::Propose, height, round, self.stage_duration(round))
    }

    pub fn schedule_prevote(&self, height: Height, round: Round) -> bool {
        self.schedule(TimeoutKind::Prevote, height, round, self.stage_duration(round))
    }

    pub fn schedule_precommit(&self, height: Height, round: Round) -> bool {
        self.schedule(TimeoutKind::Precommit, height, round, self.stage_duration(round))
    }

    pub fn is_scheduled(&self, kind: TimeoutKind, height: Height, round: Round) -> bool {
        self.timers
            .lock()
            .get(&kind)
            .is_some_and(|t| t.height == height && t.round == round && !t.handle.is_finished())
    }

    pub fn cancel(&self, kind: TimeoutKind) {
        if let Some(timer) = self.timers.lock().remove(&kind) {
            timer.handle.abort();
        }
    }

    /// Cancel every timer
    pub fn clear(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("armed", &self.timers.lock().len())
            .finish()
    }
}

fn stage_millis(config: &TimeoutConfig, round: Round) -> u64 {
    config
        .stage_timeout
        .saturating_add((round as u64).saturating_mul(config.stage_timeout_increase))
}

/// `parent + block_time + Σ_{i<round} stage_duration(i)`
pub fn minimal_timestamp(config: &TimeoutConfig, parent: Timestamp, round: Round) -> Timestamp {
    let r = round as u128;
    let growth = (config.stage_timeout_increase as u128)
        .saturating_mul(r * r.saturating_sub(1) / 2);
    let stages = (config.stage_timeout as u128 * r).saturating_add(growth);
    parent
        .saturating_add(config.block_time)
        .saturating_add(u64::try_from(stages).unwrap_or(u64::MAX))
}
