//! The logger facade: subsystem registry, sink management, and the
//! process-wide singleton.
//!
//! The singleton owns a small dedicated runtime so submission works from both
//! plain threads and async applications; [`logger()`] is safe to call from
//! any initialization order.

use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use crate::clock::{Clock, SystemClock};
use crate::delivery::{DeliveryHandle, WorkerMsg};
use crate::event::LogEvent;
use crate::level::{Level, STATIC_MIN_LEVEL};
use crate::sink::Sink;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stdout::StdoutSink;

/// Opaque subsystem handle. Stable for the process lifetime once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubsystemId(u32);

impl SubsystemId {
    #[cfg(test)]
    pub(crate) fn for_tests(raw: u32) -> Self {
        Self(raw)
    }
}

/// Errors from name-based lookups on the facade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown subsystem: {0:?}")]
    UnknownSubsystem(String),
}

struct SubsystemInfo {
    name: String,
    min_level: Level,
}

#[derive(Default)]
struct Registry {
    subsystems: Vec<SubsystemInfo>,
}

/// Front door of the logging pipeline.
///
/// Most applications use the process-wide [`logger()`]; tests and embedders
/// can build private instances through [`Logger::builder`].
pub struct Logger {
    runtime: Mutex<Option<Runtime>>,
    delivery: DeliveryHandle,
    registry: RwLock<Registry>,
    clock: Arc<dyn Clock>,
}

/// Configuration for a [`Logger`] instance.
pub struct LoggerBuilder {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    with_stdout: bool,
}

impl LoggerBuilder {
    fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            with_stdout: true,
        }
    }

    /// Replace the clock used for event timestamps and retry expiry.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the sleeper used by retry workers.
    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Skip pre-registering the `"stdout"` sink.
    pub fn without_stdout(mut self) -> Self {
        self.with_stdout = false;
        self
    }

    pub fn build(self) -> Logger {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("logcourier")
            .enable_all()
            .build()
            .expect("logcourier runtime");

        let delivery = {
            let _guard = runtime.enter();
            DeliveryHandle::spawn(self.clock.clone(), self.sleeper)
        };

        let logger = Logger {
            runtime: Mutex::new(Some(runtime)),
            delivery,
            registry: RwLock::new(Registry::default()),
            clock: self.clock,
        };
        if self.with_stdout {
            logger.add_sink(Arc::new(StdoutSink::new()));
        }
        logger
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// The process-wide logger, lazily created on first use. A stdout sink named
/// `"stdout"` is pre-registered; on unix a crash reporter is installed that
/// flushes the pipeline after logging a backtrace.
pub fn logger() -> &'static Logger {
    LOGGER.get_or_init(|| {
        let logger = Logger::builder().build();
        #[cfg(unix)]
        crate::crash::install();
        logger
    })
}

impl Logger {
    pub fn builder() -> LoggerBuilder {
        LoggerBuilder::new()
    }

    /// Submit an event with no known function name.
    pub fn log(&self, level: Level, subsystem: SubsystemId, message: impl Into<String>) {
        self.log_from(level, subsystem, message, "/UNKNOWN/");
    }

    /// Submit an event. Events below the subsystem's minimum level are
    /// discarded before any allocation for the queue happens.
    pub fn log_from(
        &self,
        level: Level,
        subsystem: SubsystemId,
        message: impl Into<String>,
        function: impl Into<String>,
    ) {
        let subsystem_name = {
            let registry = self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(info) = registry.subsystems.get(subsystem.0 as usize) else {
                return;
            };
            if level < info.min_level {
                return;
            }
            info.name.clone()
        };

        self.delivery.enqueue(LogEvent {
            level,
            subsystem,
            message: message.into(),
            timestamp: self.clock.now(),
            function: function.into(),
            subsystem_name,
            time_string: String::new(),
        });
    }

    /// Register a subsystem, or return the existing handle when the name is
    /// already known. The handle stays valid for the process lifetime.
    pub fn register_subsystem(&self, name: &str) -> SubsystemId {
        let mut registry = self.registry.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(index) = registry.subsystems.iter().position(|s| s.name == name) {
            return SubsystemId(index as u32);
        }
        registry.subsystems.push(SubsystemInfo {
            name: name.to_owned(),
            min_level: STATIC_MIN_LEVEL,
        });
        SubsystemId((registry.subsystems.len() - 1) as u32)
    }

    /// Look up a previously registered subsystem by name.
    pub fn find_subsystem(&self, name: &str) -> Result<SubsystemId, RegistryError> {
        let registry = self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        registry
            .subsystems
            .iter()
            .position(|s| s.name == name)
            .map(|index| SubsystemId(index as u32))
            .ok_or_else(|| RegistryError::UnknownSubsystem(name.to_owned()))
    }

    pub fn set_subsystem_min_level(&self, subsystem: SubsystemId, level: Level) {
        let mut registry = self.registry.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(info) = registry.subsystems.get_mut(subsystem.0 as usize) {
            info.min_level = level;
        }
    }

    /// Add a sink under its own name.
    pub fn add_sink(&self, sink: Arc<dyn Sink>) {
        let name = sink.name();
        self.add_sink_as(&name, sink);
    }

    /// Add a sink under an explicit name.
    pub fn add_sink_as(&self, name: &str, sink: Arc<dyn Sink>) {
        self.delivery.send(WorkerMsg::AddSink { name: name.to_owned(), sink });
    }

    /// Remove a sink by name. Returns `false` if no such sink exists.
    pub fn remove_sink(&self, name: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        self.delivery.send(WorkerMsg::RemoveSink { name: name.to_owned(), reply: tx });
        wait_reply(rx, Duration::from_secs(10)).unwrap_or(false)
    }

    /// Set the minimum level of a sink by name. Returns `false` if no such
    /// sink exists.
    pub fn set_sink_min_level(&self, name: &str, level: Level) -> bool {
        let (tx, rx) = oneshot::channel();
        self.delivery.send(WorkerMsg::SetSinkLevel {
            name: name.to_owned(),
            level,
            reply: tx,
        });
        wait_reply(rx, Duration::from_secs(10)).unwrap_or(false)
    }

    /// Wait until every event submitted before this call has been handed to
    /// the sinks (or their retry queues). Returns `false` on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        self.delivery.send(WorkerMsg::Flush { reply: tx });
        wait_reply(rx, timeout).is_some()
    }

    /// Overview of the current configuration: compile-time minimum level,
    /// active sinks, and known subsystems.
    pub fn dump_configuration(&self) -> String {
        let mut out = format!(
            "global min. log level (compile-time): {}\nactive output streams:\n",
            STATIC_MIN_LEVEL
        );

        let (tx, rx) = oneshot::channel();
        self.delivery.send(WorkerMsg::Describe { reply: tx });
        if let Some(sinks) = wait_reply(rx, Duration::from_secs(10)) {
            out.push_str(&sinks);
        }

        out.push_str("active logging subsystems\n");
        let registry = self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        for subsystem in &registry.subsystems {
            out.push_str(&format!(
                "   - {}\n     min. log level: {}\n",
                subsystem.name, subsystem.min_level
            ));
        }
        out
    }

    /// Drain the queue, wait for retry workers, stop the worker and tear the
    /// runtime down. Shutdown latency is bounded by the slowest retry queue.
    /// Events submitted afterwards are dropped. Idempotent.
    pub fn shutdown(&self) {
        self.delivery.terminate();
        let runtime = {
            let mut slot = self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        let runtime = {
            let mut slot = self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        if let Some(runtime) = runtime {
            // must not block here: Drop may run inside an async context
            runtime.shutdown_background();
        }
    }
}

/// Wait for a oneshot reply without ever calling `block_on`, so the facade
/// stays usable from inside foreign async runtimes.
fn wait_reply<T>(mut rx: oneshot::Receiver<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(value) => return Some(value),
            Err(oneshot::error::TryRecvError::Closed) => return None,
            Err(oneshot::error::TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
}
