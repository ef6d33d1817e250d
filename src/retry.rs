//! Per-sink redelivery worker.
//!
//! When a sink reports a transient failure the delivery worker routes all of
//! that sink's traffic through a [`RetryWorker`]: a task that sleeps for the
//! sink's retry delay, redelivers from the head of its queue while writes
//! succeed, expires events that have grown too old for their level, and exits
//! once the queue drains. Because new events funnel through the tail of the
//! queue until the worker is gone, per-sink submission order survives the
//! round trip through retry mode.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::event::LogEvent;
use crate::level::Level;
use crate::sink::Sink;
use crate::sleeper::Sleeper;

/// Maximum age in seconds an event may reach while waiting for redelivery.
/// `severe` events never expire.
fn expiry_ceiling(level: Level) -> Option<i64> {
    match level {
        Level::Finest | Level::Finer => Some(900),
        Level::Fine | Level::Config => Some(1800),
        Level::Info => Some(3600),
        Level::Warning => Some(36_000),
        Level::Severe => None,
    }
}

struct QueueState {
    events: VecDeque<Arc<LogEvent>>,
    /// Set by the worker just before it exits; once closed, no further events
    /// are accepted and the worker is ready to be joined.
    closed: bool,
}

pub(crate) struct RetryWorker {
    queue: Arc<Mutex<QueueState>>,
    handle: JoinHandle<()>,
}

impl RetryWorker {
    /// Start a retry worker for `sink`. The worker exits on its own when its
    /// queue is empty after a redelivery cycle.
    pub(crate) fn spawn(
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let queue = Arc::new(Mutex::new(QueueState { events: VecDeque::new(), closed: false }));
        tracing::debug!(sink = %sink.name(), "starting retry worker");
        let handle = tokio::spawn(run(sink, clock, sleeper, queue.clone()));
        Self { queue, handle }
    }

    /// Append an event, or hand it back if the worker has already shut down.
    pub(crate) fn enqueue(&self, event: Arc<LogEvent>) -> Result<(), Arc<LogEvent>> {
        let mut state = lock(&self.queue);
        if state.closed {
            return Err(event);
        }
        state.events.push_back(event);
        Ok(())
    }

    /// Whether the worker still has undelivered events in flight.
    pub(crate) fn active(&self) -> bool {
        !lock(&self.queue).closed
    }

    pub(crate) async fn join(self) {
        if self.handle.await.is_err() {
            tracing::error!("retry worker panicked");
        }
    }

    /// Stop immediately, dropping any undelivered events. Used when the sink
    /// itself is being removed.
    pub(crate) fn abort(self) {
        let pending = lock(&self.queue).events.len();
        if pending > 0 {
            tracing::warn!(pending, "dropping undelivered events with the sink");
        }
        self.handle.abort();
    }
}

fn lock(queue: &Mutex<QueueState>) -> std::sync::MutexGuard<'_, QueueState> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run(
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    queue: Arc<Mutex<QueueState>>,
) {
    loop {
        sleeper.sleep(sink.retry_delay()).await;

        // redeliver from the head while the sink accepts
        loop {
            let head = lock(&queue).events.front().cloned();
            let Some(event) = head else { break };
            if !sink.write(&event).await {
                break;
            }
            lock(&queue).events.pop_front();
        }

        // expire what has not been written
        let now = clock.now();
        let expired = {
            let mut state = lock(&queue);
            let before = state.events.len();
            state.events.retain(|event| match expiry_ceiling(event.level) {
                None => true,
                Some(limit) => (now - event.timestamp).num_seconds() <= limit,
            });
            before - state.events.len()
        };
        if expired > 0 {
            tracing::warn!(sink = %sink.name(), expired, "expired undeliverable events");
        }

        // done once the queue is empty; close under the lock so the delivery
        // worker cannot slip an event in after the last emptiness check
        let mut state = lock(&queue);
        if state.events.is_empty() {
            state.closed = true;
            break;
        }
    }
    tracing::debug!(sink = %sink.name(), "stopping retry worker");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::logger::SubsystemId;
    use crate::sink::LevelGate;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct FlakySink {
        gate: LevelGate,
        healthy: AtomicBool,
        attempts: AtomicUsize,
        delivered: Mutex<Vec<String>>,
    }

    impl FlakySink {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: LevelGate::new(Level::Finest),
                healthy: AtomicBool::new(healthy),
                attempts: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Sink for FlakySink {
        fn name(&self) -> String {
            "flaky".to_owned()
        }

        fn retry_delay(&self) -> Duration {
            Duration::from_secs(30)
        }

        fn min_level(&self) -> Level {
            self.gate.get()
        }

        fn set_min_level(&self, level: Level) {
            self.gate.set(level);
        }

        async fn send(&self, event: &LogEvent) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                self.delivered.lock().unwrap().push(event.message.clone());
                true
            } else {
                false
            }
        }
    }

    /// Sleeper that parks until the test hands out a permit, making each
    /// retry cycle explicit.
    #[derive(Debug, Clone)]
    struct StepSleeper(Arc<Semaphore>);

    #[async_trait]
    impl Sleeper for StepSleeper {
        async fn sleep(&self, _duration: Duration) {
            self.0
                .acquire()
                .await
                .expect("test semaphore closed")
                .forget();
        }
    }

    fn event(clock: &ManualClock, level: Level, message: &str) -> Arc<LogEvent> {
        Arc::new(LogEvent {
            level,
            subsystem: SubsystemId::for_tests(0),
            message: message.to_owned(),
            timestamp: clock.now(),
            function: "/UNKNOWN/".to_owned(),
            subsystem_name: "test".to_owned(),
            time_string: String::new(),
        })
    }

    #[tokio::test]
    async fn delivers_in_order_and_exits_when_drained() {
        let sink = FlakySink::new(true);
        let clock = ManualClock::new();
        let steps = Arc::new(Semaphore::new(0));
        let worker = RetryWorker::spawn(
            sink.clone(),
            Arc::new(clock.clone()),
            Arc::new(StepSleeper(steps.clone())),
        );

        worker.enqueue(event(&clock, Level::Info, "one")).unwrap();
        worker.enqueue(event(&clock, Level::Info, "two")).unwrap();

        steps.add_permits(1);
        worker.join().await;

        assert_eq!(*sink.delivered.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn failed_head_stays_at_the_front() {
        let sink = FlakySink::new(false);
        let clock = ManualClock::new();
        let steps = Arc::new(Semaphore::new(0));
        let worker = RetryWorker::spawn(
            sink.clone(),
            Arc::new(clock.clone()),
            Arc::new(StepSleeper(steps.clone())),
        );

        worker.enqueue(event(&clock, Level::Severe, "head")).unwrap();
        worker.enqueue(event(&clock, Level::Severe, "tail")).unwrap();

        // two failing cycles: one attempt each, nothing delivered, queue keeps order
        steps.add_permits(1);
        while sink.attempts.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        steps.add_permits(1);
        while sink.attempts.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert!(worker.active());
        assert!(sink.delivered.lock().unwrap().is_empty());

        // sink recovers: one more cycle drains both in order
        sink.healthy.store(true, Ordering::SeqCst);
        steps.add_permits(1);
        worker.join().await;
        assert_eq!(*sink.delivered.lock().unwrap(), vec!["head", "tail"]);
    }

    #[tokio::test]
    async fn old_events_expire_by_level() {
        let sink = FlakySink::new(false);
        let clock = ManualClock::new();
        let steps = Arc::new(Semaphore::new(0));
        let worker = RetryWorker::spawn(
            sink.clone(),
            Arc::new(clock.clone()),
            Arc::new(StepSleeper(steps.clone())),
        );

        worker.enqueue(event(&clock, Level::Finest, "stale")).unwrap();

        // first cycle: one failed attempt, event survives (age 0)
        steps.add_permits(1);
        while sink.attempts.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        assert!(worker.active());

        // 901 seconds later the finest-level ceiling (900 s) has passed; the
        // next cycle drops the event and the worker exits without another
        // successful write ever happening
        clock.advance(Duration::from_secs(901));
        steps.add_permits(1);
        worker.join().await;

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn severe_events_never_expire() {
        let sink = FlakySink::new(false);
        let clock = ManualClock::new();
        let steps = Arc::new(Semaphore::new(0));
        let worker = RetryWorker::spawn(
            sink.clone(),
            Arc::new(clock.clone()),
            Arc::new(StepSleeper(steps.clone())),
        );

        worker.enqueue(event(&clock, Level::Severe, "keep me")).unwrap();
        clock.advance(Duration::from_secs(1_000_000));

        steps.add_permits(1);
        while sink.attempts.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        assert!(worker.active(), "severe event must survive any age");

        sink.healthy.store(true, Ordering::SeqCst);
        steps.add_permits(1);
        worker.join().await;
        assert_eq!(*sink.delivered.lock().unwrap(), vec!["keep me"]);
    }

    #[tokio::test]
    async fn worker_asks_the_sink_for_its_delay_every_cycle() {
        // a sink that behaves like the broker sink: fast retry schedule
        // while connecting, slow schedule once settled
        struct SchedulingSink {
            gate: LevelGate,
            connecting: AtomicBool,
            delivered: AtomicUsize,
        }

        #[async_trait]
        impl Sink for SchedulingSink {
            fn name(&self) -> String {
                "scheduling".to_owned()
            }
            fn retry_delay(&self) -> Duration {
                if self.connecting.load(Ordering::SeqCst) {
                    Duration::from_secs(2)
                } else {
                    Duration::from_secs(30)
                }
            }
            fn min_level(&self) -> Level {
                self.gate.get()
            }
            fn set_min_level(&self, level: Level) {
                self.gate.set(level);
            }
            async fn send(&self, _event: &LogEvent) -> bool {
                // first attempt fails and finishes "connecting"
                if self.connecting.swap(false, Ordering::SeqCst) {
                    return false;
                }
                self.delivered.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let sink = Arc::new(SchedulingSink {
            gate: LevelGate::new(Level::Finest),
            connecting: AtomicBool::new(true),
            delivered: AtomicUsize::new(0),
        });
        let clock = ManualClock::new();
        let sleeper = crate::sleeper::TrackingSleeper::new();
        let worker = RetryWorker::spawn(
            sink.clone(),
            Arc::new(clock.clone()),
            Arc::new(sleeper.clone()),
        );

        worker.enqueue(event(&clock, Level::Info, "queued")).unwrap();
        worker.join().await;

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        // one fast cycle while connecting, one slow cycle to redeliver
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(2), Duration::from_secs(30)]
        );
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_returns_the_event() {
        let sink = FlakySink::new(true);
        let clock = ManualClock::new();
        let steps = Arc::new(Semaphore::new(0));
        let worker = RetryWorker::spawn(
            sink.clone(),
            Arc::new(clock.clone()),
            Arc::new(StepSleeper(steps.clone())),
        );

        worker.enqueue(event(&clock, Level::Info, "only")).unwrap();
        steps.add_permits(1);
        while worker.active() {
            tokio::task::yield_now().await;
        }

        let rejected = worker.enqueue(event(&clock, Level::Info, "late"));
        assert!(rejected.is_err(), "closed queue must hand the event back");
        worker.join().await;
    }

    #[test]
    fn expiry_table_matches_the_contract() {
        assert_eq!(expiry_ceiling(Level::Finest), Some(900));
        assert_eq!(expiry_ceiling(Level::Finer), Some(900));
        assert_eq!(expiry_ceiling(Level::Fine), Some(1800));
        assert_eq!(expiry_ceiling(Level::Config), Some(1800));
        assert_eq!(expiry_ceiling(Level::Info), Some(3600));
        assert_eq!(expiry_ceiling(Level::Warning), Some(36_000));
        assert_eq!(expiry_ceiling(Level::Severe), None);
    }
}
