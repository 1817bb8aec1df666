//! Thread-to-UI bridge for background operations
//!
//! Each submitted operation runs on its own worker thread. The UI side calls
//! [`ThreadEventManager::poll`] on its timer tick (tens of milliseconds); when
//! a worker's outcome is available the registered callbacks run on the polling
//! thread, exactly once per operation, always in the same order:
//!
//! 1. error callbacks (only if the worker failed)
//! 2. the deferred UI message embedded in the output, if any
//! 3. the result callback with the payload (only if the worker succeeded)
//! 4. plain completion callbacks
//!
//! Worker panics and `Err` returns are both caught, logged, and delivered as
//! an error outcome with an empty payload; nothing ever unwinds across the
//! thread boundary.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, Receiver, TryRecvError};
use std::thread::JoinHandle;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error};

/// Deferred UI notification built by a worker, executed on the UI thread
/// (e.g. a dialog the worker wants shown once its outcome is dispatched).
pub type UiMessage = Box<dyn FnOnce() + Send>;

/// Plain completion/error callback; runs on the UI thread.
pub type Callback = Box<dyn FnMut()>;

/// Completion callback receiving the operation's result payload.
pub type ResultCallback = Box<dyn FnOnce(Value)>;

/// What a worker hands back on success.
pub struct OperationOutput {
    pub result: Value,
    pub message: Option<UiMessage>,
}

impl OperationOutput {
    pub fn empty() -> Self {
        Self {
            result: Value::Null,
            message: None,
        }
    }

    pub fn with_result(result: Value) -> Self {
        Self {
            result,
            message: None,
        }
    }

    pub fn message(mut self, message: impl FnOnce() + Send + 'static) -> Self {
        self.message = Some(Box::new(message));
        self
    }
}

/// Callback set registered when an operation is submitted.
#[derive(Default)]
pub struct OperationHooks {
    pub on_error: Vec<Callback>,
    pub on_result: Option<ResultCallback>,
    pub on_complete: Vec<Callback>,
}

impl OperationHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_error(mut self, callback: impl FnMut() + 'static) -> Self {
        self.on_error.push(Box::new(callback));
        self
    }

    pub fn on_result(mut self, callback: impl FnOnce(Value) + 'static) -> Self {
        self.on_result = Some(Box::new(callback));
        self
    }

    pub fn on_complete(mut self, callback: impl FnMut() + 'static) -> Self {
        self.on_complete.push(Box::new(callback));
        self
    }
}

struct WorkerOutcome {
    failed: bool,
    result: Value,
    message: Option<UiMessage>,
}

struct ActiveOperation {
    id: String,
    rx: Receiver<WorkerOutcome>,
    handle: Option<JoinHandle<()>>,
    hooks: OperationHooks,
}

/// Runs user-supplied jobs on background threads and marshals their outcomes
/// back to the polling (UI) thread. Not itself thread-safe: submit and poll
/// from the UI thread only.
#[derive(Default)]
pub struct ThreadEventManager {
    active: Vec<ActiveOperation>,
}

impl ThreadEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation and start it immediately on a fresh thread.
    pub fn submit<F>(&mut self, id: impl Into<String>, job: F, hooks: OperationHooks)
    where
        F: FnOnce() -> Result<OperationOutput> + Send + 'static,
    {
        let id = id.into();
        // Single-slot output channel; the worker writes its outcome exactly once.
        let (tx, rx) = sync_channel(1);
        let worker_id = id.clone();
        let handle = std::thread::spawn(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(output)) => WorkerOutcome {
                    failed: false,
                    result: output.result,
                    message: output.message,
                },
                Ok(Err(e)) => {
                    error!("operation '{}' failed: {:#}", worker_id, e);
                    WorkerOutcome {
                        failed: true,
                        result: Value::Null,
                        message: None,
                    }
                }
                Err(_) => {
                    error!("operation '{}' panicked", worker_id);
                    WorkerOutcome {
                        failed: true,
                        result: Value::Null,
                        message: None,
                    }
                }
            };
            let _ = tx.send(outcome);
        });

        debug!("operation '{}' submitted", id);
        self.active.push(ActiveOperation {
            id,
            rx,
            handle: Some(handle),
            hooks,
        });
    }

    /// Check every active operation for a finished worker and dispatch its
    /// callbacks. Non-blocking; call this from the UI loop's timer tick.
    /// Returns the number of operations dispatched.
    pub fn poll(&mut self) -> usize {
        let mut dispatched = 0;
        let mut index = 0;
        while index < self.active.len() {
            let outcome = match self.active[index].rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(TryRecvError::Empty) => None,
                // Worker gone without an outcome; treat as an error.
                Err(TryRecvError::Disconnected) => Some(WorkerOutcome {
                    failed: true,
                    result: Value::Null,
                    message: None,
                }),
            };
            match outcome {
                Some(outcome) => {
                    let operation = self.active.remove(index);
                    Self::dispatch(operation, outcome);
                    dispatched += 1;
                }
                None => index += 1,
            }
        }
        dispatched
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.iter().any(|op| op.id == id)
    }

    fn dispatch(mut operation: ActiveOperation, outcome: WorkerOutcome) {
        // The worker already sent its outcome, so the join is immediate.
        if let Some(handle) = operation.handle.take() {
            let _ = handle.join();
        }

        if outcome.failed {
            for callback in operation.hooks.on_error.iter_mut() {
                callback();
            }
        }
        if let Some(message) = outcome.message {
            message();
        }
        if !outcome.failed {
            if let Some(callback) = operation.hooks.on_result.take() {
                callback(outcome.result);
            }
        }
        for callback in operation.hooks.on_complete.iter_mut() {
            callback();
        }
        debug!(
            "operation '{}' dispatched (failed: {})",
            operation.id, outcome.failed
        );
    }
}
