//! How retry workers wait.
//!
//! Between redelivery cycles a retry worker pauses for whatever
//! [`retry_delay`](crate::Sink::retry_delay) its sink suggests: ten seconds
//! for a wedged terminal, two seconds while a broker connection attempt is
//! in flight, thirty once it gave up. Those waits sit behind this trait so
//! tests can collapse them to nothing and still assert which schedule the
//! sink asked for.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A pause between redelivery attempts.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// The production sleeper: a real wait on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Returns immediately, so a retry queue drains as fast as its sink accepts
/// writes. Yields once per call; a sink stuck in a failure loop must not
/// starve its own connect and reader tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

/// Returns immediately and records every delay that was requested. Lets a
/// test confirm that a sink switched between its retry schedules, without
/// waiting out a single one of them.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in request order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// The most recently requested delay, if any.
    pub fn last(&self) -> Option<Duration> {
        self.delays.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).last().copied()
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
        tokio::task::yield_now().await;
    }
}
