#![allow(dead_code)]

//! Shared sink and sleeper doubles for the integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use logcourier::{Level, LevelGate, LogEvent, Sink, Sleeper};

static TRACING: Once = Once::new();

/// Route the library's `tracing` diagnostics (retry cycles, reconnects,
/// heartbeat loss) into the captured test output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// In-memory sink that can be told to fail specific write attempts
/// (1-indexed over the lifetime of the sink).
pub struct RecordingSink {
    name: String,
    gate: LevelGate,
    fail_on: HashSet<usize>,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<String>>,
    functions: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new(name: &str) -> Arc<Self> {
        Self::failing_on(name, &[])
    }

    pub fn failing_on(name: &str, fail_on: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            gate: LevelGate::new(Level::Finest),
            fail_on: fail_on.iter().copied().collect(),
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
            functions: Mutex::new(Vec::new()),
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn functions(&self) -> Vec<String> {
        self.functions.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn min_level(&self) -> Level {
        self.gate.get()
    }

    fn set_min_level(&self, level: Level) {
        self.gate.set(level);
    }

    async fn send(&self, event: &LogEvent) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&attempt) {
            return false;
        }
        self.delivered.lock().unwrap().push(event.message.clone());
        self.functions.lock().unwrap().push(event.function.clone());
        true
    }
}

/// Sleeper that compresses every wait to a few milliseconds so retry cycles
/// run promptly without busy-spinning.
#[derive(Debug, Clone, Copy)]
pub struct ShortSleeper;

#[async_trait]
impl Sleeper for ShortSleeper {
    async fn sleep(&self, _duration: Duration) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Block the calling (non-runtime) thread until `predicate` holds.
pub fn wait_for(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
