//! The sink contract.
//!
//! A sink is a delivery target with a stable name, its own minimum level, and
//! a suggested retry delay. `write` reports transient transport failure by
//! returning `false`; the delivery worker reacts by moving the sink into
//! retry mode. A sink is only ever written to from one task at a time: the
//! delivery worker, or its retry worker while the sink is in retry mode.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::event::LogEvent;
use crate::level::{Level, STATIC_MIN_LEVEL};

/// A log delivery target.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable identity, used for lookup and removal.
    fn name(&self) -> String;

    /// Suggested pause between redelivery attempts while this sink is in
    /// retry mode.
    fn retry_delay(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn min_level(&self) -> Level;

    fn set_min_level(&self, level: Level);

    /// Transport-specific delivery. Only called for events at or above the
    /// sink's minimum level.
    async fn send(&self, event: &LogEvent) -> bool;

    /// Deliver one event. Events below the sink's minimum level are filtered
    /// and count as delivered.
    async fn write(&self, event: &LogEvent) -> bool {
        if event.level < self.min_level() {
            return true;
        }
        self.send(event).await
    }

    /// Human-readable configuration summary, one entry of the logger dump.
    fn describe(&self) -> String {
        format!("   - {}\n     min. log level: {}\n", self.name(), self.min_level())
    }
}

/// Atomic minimum-level holder for sink implementations. `set_min_level` can
/// race with a delivery in progress; the gate makes that benign.
#[derive(Debug)]
pub struct LevelGate(AtomicU8);

impl LevelGate {
    pub fn new(level: Level) -> Self {
        Self(AtomicU8::new(level as u8))
    }

    pub fn get(&self) -> Level {
        Level::from_index(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, level: Level) {
        self.0.store(level as u8, Ordering::Relaxed);
    }
}

impl Default for LevelGate {
    fn default() -> Self {
        Self::new(STATIC_MIN_LEVEL)
    }
}
