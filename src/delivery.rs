//! The fanout worker between application threads and the sinks.
//!
//! Submission pushes onto an unbounded channel and returns; the worker drains
//! in batches, renders the timestamp once per event, and walks the sinks in
//! insertion order. Sink configuration (add/remove/set-level/describe) flows
//! through the same channel and is answered over oneshot replies, so
//! configuration changes are totally ordered with event traffic and the sink
//! map needs no lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::event::{format_time, LogEvent};
use crate::level::Level;
use crate::retry::RetryWorker;
use crate::sink::Sink;
use crate::sleeper::Sleeper;

pub(crate) enum WorkerMsg {
    Event(LogEvent),
    AddSink { name: String, sink: Arc<dyn Sink> },
    RemoveSink { name: String, reply: oneshot::Sender<bool> },
    SetSinkLevel { name: String, level: Level, reply: oneshot::Sender<bool> },
    Describe { reply: oneshot::Sender<String> },
    Flush { reply: oneshot::Sender<()> },
    Terminate,
}

/// Handle used by the logger facade to feed and control the worker.
pub(crate) struct DeliveryHandle {
    tx: mpsc::UnboundedSender<WorkerMsg>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryHandle {
    /// Spawn the worker on the ambient runtime.
    pub(crate) fn spawn(clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = DeliveryWorker {
            rx,
            sinks: Vec::new(),
            retries: HashMap::new(),
            clock,
            sleeper,
        };
        let handle = tokio::spawn(worker.run());
        Self { tx, handle: std::sync::Mutex::new(Some(handle)) }
    }

    /// Enqueue one event. Never blocks; events sent after termination are
    /// silently dropped.
    pub(crate) fn enqueue(&self, event: LogEvent) {
        let _ = self.tx.send(WorkerMsg::Event(event));
    }

    pub(crate) fn send(&self, msg: WorkerMsg) {
        let _ = self.tx.send(msg);
    }

    /// Request termination: the worker drains its queue, waits for all retry
    /// workers to finish, then exits. Returns once the worker is gone.
    pub(crate) fn terminate(&self) {
        let handle = {
            let mut slot = self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        let Some(handle) = handle else { return };
        let _ = self.tx.send(WorkerMsg::Terminate);
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

struct DeliveryWorker {
    rx: mpsc::UnboundedReceiver<WorkerMsg>,
    /// Sinks in insertion order, keyed by their registration name.
    sinks: Vec<(String, Arc<dyn Sink>)>,
    /// Sinks currently in retry mode.
    retries: HashMap<String, RetryWorker>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl DeliveryWorker {
    async fn run(mut self) {
        tracing::debug!("delivery worker started");
        let mut batch = Vec::with_capacity(64);
        loop {
            batch.clear();
            let received = self.rx.recv_many(&mut batch, 64).await;
            if received == 0 {
                // every sender is gone; nothing more can arrive
                break;
            }
            for msg in batch.drain(..) {
                if !self.handle_msg(msg).await {
                    self.drain_and_finish().await;
                    tracing::debug!("delivery worker stopped");
                    return;
                }
            }
        }
        self.drain_and_finish().await;
        tracing::debug!("delivery worker stopped");
    }

    /// Returns `false` once termination has been requested.
    async fn handle_msg(&mut self, msg: WorkerMsg) -> bool {
        match msg {
            WorkerMsg::Event(event) => self.deliver(event).await,
            WorkerMsg::AddSink { name, sink } => {
                if self.sinks.iter().any(|(n, _)| *n == name) {
                    tracing::warn!(sink = %name, "ignoring duplicate sink registration");
                } else {
                    self.sinks.push((name, sink));
                }
            }
            WorkerMsg::RemoveSink { name, reply } => {
                let removed = match self.sinks.iter().position(|(n, _)| *n == name) {
                    Some(index) => {
                        self.sinks.remove(index);
                        // a retry worker must not outlive its sink; whatever
                        // it still holds goes with it
                        if let Some(worker) = self.retries.remove(&name) {
                            worker.abort();
                        }
                        true
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }
            WorkerMsg::SetSinkLevel { name, level, reply } => {
                let found = self.sinks.iter().find(|(n, _)| *n == name);
                if let Some((_, sink)) = found {
                    sink.set_min_level(level);
                }
                let _ = reply.send(found.is_some());
            }
            WorkerMsg::Describe { reply } => {
                let mut out = String::new();
                for (_, sink) in &self.sinks {
                    out.push_str(&sink.describe());
                }
                let _ = reply.send(out);
            }
            WorkerMsg::Flush { reply } => {
                let _ = reply.send(());
            }
            WorkerMsg::Terminate => return false,
        }
        true
    }

    /// Fan one event out to every sink, honoring retry mode.
    async fn deliver(&mut self, mut event: LogEvent) {
        event.time_string = format_time(&event.timestamp);
        let event = Arc::new(event);

        for (name, sink) in &self.sinks {
            let mut event = event.clone();
            if let Some(worker) = self.retries.get(name) {
                match worker.enqueue(event) {
                    // still in retry mode: the queue keeps per-sink order
                    Ok(()) => continue,
                    Err(rejected) => {
                        // queue drained and worker gone: back to direct delivery
                        if let Some(worker) = self.retries.remove(name) {
                            worker.join().await;
                        }
                        event = rejected;
                    }
                }
            }

            if !sink.write(&event).await {
                let worker =
                    RetryWorker::spawn(sink.clone(), self.clock.clone(), self.sleeper.clone());
                if worker.enqueue(event).is_err() {
                    tracing::error!(sink = %name, "fresh retry worker rejected an event");
                }
                self.retries.insert(name.clone(), worker);
            }
        }
    }

    /// Termination path: process whatever is still queued, then wait for all
    /// retry workers to drain and join them.
    async fn drain_and_finish(&mut self) {
        loop {
            while let Ok(msg) = self.rx.try_recv() {
                // a second Terminate is idempotent here
                let _ = self.handle_msg(msg).await;
            }

            let finished: Vec<String> = self
                .retries
                .iter()
                .filter(|(_, worker)| !worker.active())
                .map(|(name, _)| name.clone())
                .collect();
            for name in finished {
                if let Some(worker) = self.retries.remove(&name) {
                    worker.join().await;
                }
            }

            if !self.retries.is_empty() {
                // avoid a tight loop while retry workers catch up
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            if self.rx.is_empty() {
                return;
            }
        }
    }
}
