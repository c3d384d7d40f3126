//! Active workflow stack and the kept-alive root session worker.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::telemetry::{self, Telemetry};

const STOP_POLL: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct StackEntry {
    id: u64,
    workflow: String,
}

/// Mutex-protected stack of active workflows.
#[derive(Debug, Clone, Default)]
pub struct WorkflowStack {
    entries: Arc<Mutex<Vec<StackEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl WorkflowStack {
    /// Empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes `workflow`; the returned guard removes it when dropped.
    #[must_use = "the workflow is popped as soon as the guard is dropped"]
    pub fn enter(&self, workflow: impl Into<String>) -> ActiveWorkflow {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let workflow = workflow.into();
        self.entries.lock().push(StackEntry {
            id,
            workflow: workflow.clone(),
        });
        ActiveWorkflow {
            stack: self.clone(),
            id,
            workflow,
        }
    }

    /// Most recently entered workflow still active.
    #[must_use]
    pub fn peek(&self) -> Option<String> {
        self.entries.lock().last().map(|entry| entry.workflow.clone())
    }

    /// Number of active workflows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no workflow is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn pop(&self, id: u64) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().rposition(|entry| entry.id == id) {
            entries.remove(pos);
        }
    }
}

/// Guard for one stack entry.
#[derive(Debug)]
pub struct ActiveWorkflow {
    stack: WorkflowStack,
    id: u64,
    workflow: String,
}

impl ActiveWorkflow {
    /// Workflow this guard keeps on the stack.
    #[must_use]
    pub fn workflow(&self) -> &str {
        &self.workflow
    }
}

impl Drop for ActiveWorkflow {
    fn drop(&mut self) {
        self.stack.pop(self.id);
    }
}

#[derive(Debug)]
enum Inbound {
    Message(String),
    Wake,
}

/// Root session served by one background worker.
///
/// Callers talk to the worker only through the inbound and outbound queues.
pub struct KeepAliveSession<T> {
    name: String,
    running: Arc<AtomicBool>,
    inbound: UnboundedSender<Inbound>,
    outbound: UnboundedReceiver<T>,
    worker: Option<JoinHandle<()>>,
    telemetry: Option<Telemetry>,
}

impl<T: Send + 'static> std::fmt::Debug for KeepAliveSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveSession")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> KeepAliveSession<T> {
    /// Starts the worker; it stays on `stack` until it exits.
    pub fn spawn<F>(
        name: impl Into<String>,
        stack: &WorkflowStack,
        telemetry: Option<Telemetry>,
        mut handler: F,
    ) -> std::io::Result<Self>
    where
        F: FnMut(String) -> T + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<T>();

        let worker_running = Arc::clone(&running);
        let worker_stack = stack.clone();
        let worker_name = name.clone();
        let worker = thread::Builder::new()
            .name(format!("session-{name}"))
            .spawn(move || {
                let _active = worker_stack.enter(worker_name);
                while worker_running.load(Ordering::Acquire) {
                    match inbound_rx.blocking_recv() {
                        Some(Inbound::Message(message)) => {
                            if outbound_tx.send(handler(message)).is_err() {
                                break;
                            }
                        }
                        Some(Inbound::Wake) => {}
                        None => break,
                    }
                }
                worker_running.store(false, Ordering::Release);
            })?;

        telemetry::log(
            telemetry.as_ref(),
            LogLevel::Debug,
            "session.started",
            json!({ "session": name }),
        );
        Ok(Self {
            name,
            running,
            inbound: inbound_tx,
            outbound: outbound_rx,
            worker: Some(worker),
            telemetry,
        })
    }

    /// Queues a user message; returns false once the worker has stopped.
    pub fn send(&self, message: impl Into<String>) -> bool {
        self.is_running() && self.inbound.send(Inbound::Message(message.into())).is_ok()
    }

    /// Next result if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        match self.outbound.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for the next result.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.outbound.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) if Instant::now() >= deadline => return None,
                Err(TryRecvError::Empty) => thread::sleep(STOP_POLL),
            }
        }
    }

    /// True while the worker accepts messages.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the worker and waits up to `timeout` for it to exit.
    ///
    /// Returns false (after logging a warning) when the worker is still busy; the
    /// thread is then detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::Release);
        let _ = self.inbound.send(Inbound::Wake);
        let Some(worker) = self.worker.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(STOP_POLL);
        }
        if worker.is_finished() {
            if worker.join().is_err() {
                telemetry::log(
                    self.telemetry.as_ref(),
                    LogLevel::Error,
                    "session.worker_panicked",
                    json!({ "session": self.name }),
                );
            }
            return true;
        }
        telemetry::log(
            self.telemetry.as_ref(),
            LogLevel::Warn,
            "session.stop_timeout",
            json!({ "session": self.name, "timeout_ms": timeout.as_millis() }),
        );
        false
    }
}

impl<T> Drop for KeepAliveSession<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.inbound.send(Inbound::Wake);
    }
}
