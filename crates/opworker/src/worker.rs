//! The worker thread owning a queue handler.
//!
//! `WorkerThread` spawns the dedicated OS thread, hands it the handler's
//! event loop, and forwards the public submission and cancellation API.
//! Submissions made before `start_thread` or after `terminate_thread` are
//! silently dropped; that is the documented contract for a stopped worker.

use crate::handler::{EmptyQueueHook, QueueHandler};
use crate::operation::{Operation, OperationId, OperationStatus};
use crate::semaphore::Semaphore;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Configuration for a [`WorkerThread`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name given to the spawned OS thread.
    /// Default: `"operation-worker"`.
    pub thread_name: String,

    /// How long `terminate_thread` waits for the worker thread to exit
    /// after the handler has shut down. Exceeding the window is logged but
    /// is not fatal. Default: 1500 ms.
    pub shutdown_join_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: "operation-worker".to_string(),
            shutdown_join_timeout: Duration::from_millis(1500),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread's name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the bounded wait used when joining the worker thread at
    /// shutdown.
    pub fn with_shutdown_join_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_join_timeout = timeout;
        self
    }
}

/// Counters describing a worker's history, snapshot via
/// [`WorkerThread::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Operations accepted by the submission API.
    pub submitted: u64,
    /// Operations that finished with `Success` or `Failed`.
    pub completed: u64,
    /// Operations cancelled before or during execution.
    pub cancelled: u64,
    /// Operations reaped by their timeout.
    pub timed_out: u64,
    /// Entries currently queued (both priority classes).
    pub queued: usize,
}

struct WorkerRuntime {
    handler: Arc<QueueHandler>,
    thread: JoinHandle<()>,
    done: Receiver<()>,
}

/// A single-worker operation scheduler.
///
/// One dedicated thread dequeues and executes operations, high priority
/// before normal, FIFO within each class. See the crate documentation for
/// the full lifecycle.
///
/// # Example
///
/// ```
/// use opworker::{Operation, OperationState, WorkerThread};
/// use std::sync::Arc;
///
/// struct Noop {
///     state: OperationState,
/// }
///
/// impl Operation for Noop {
///     fn state(&self) -> &OperationState {
///         &self.state
///     }
///
///     fn execute(&self) {
///         self.started();
///         self.success();
///         self.finished();
///     }
/// }
///
/// let mut worker = WorkerThread::new();
/// worker.start_thread();
/// // no observer: the operation is dropped once it completes
/// worker.add_operation(Arc::new(Noop { state: OperationState::new() }));
/// worker.terminate_thread();
/// ```
pub struct WorkerThread {
    config: WorkerConfig,
    rendezvous: Arc<Semaphore>,
    empty_queue_hook: Option<EmptyQueueHook>,
    runtime: Option<WorkerRuntime>,
}

impl WorkerThread {
    /// Create a worker with the default configuration. The thread is not
    /// spawned until [`WorkerThread::start_thread`].
    pub fn new() -> Self {
        Self::with_config(WorkerConfig::default())
    }

    /// Create a worker with an explicit configuration.
    pub fn with_config(config: WorkerConfig) -> Self {
        Self {
            config,
            rendezvous: Arc::new(Semaphore::new(0)),
            empty_queue_hook: None,
            runtime: None,
        }
    }

    /// Register a hook invoked (on the worker thread) whenever both queues
    /// become empty after a completion. Must be called before
    /// `start_thread`.
    pub fn set_empty_queue_hook<F>(&mut self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.runtime.is_some() {
            warn!("empty-queue hook ignored: worker already started");
            return;
        }
        self.empty_queue_hook = Some(Box::new(hook));
    }

    /// Whether the worker thread is currently running.
    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Spawn the worker thread and block until it is live.
    pub fn start_thread(&mut self) {
        if self.runtime.is_some() {
            warn!("start_thread called on a running worker");
            return;
        }
        let (handler, handler_loop) =
            QueueHandler::new(self.rendezvous.clone(), self.empty_queue_hook.take());
        let (done_tx, done_rx) = mpsc::channel();
        let rendezvous = self.rendezvous.clone();
        let thread = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || {
                rendezvous.release(1);
                handler_loop.run();
                let _ = done_tx.send(());
            })
            .expect("Failed to spawn worker thread");

        self.runtime = Some(WorkerRuntime {
            handler,
            thread,
            done: done_rx,
        });
        // wait for the worker to signal readiness
        self.rendezvous.acquire();
        debug!(name = %self.config.thread_name, "worker thread started");
    }

    /// Stop the worker synchronously.
    ///
    /// Pending operations are drained as `Cancelled` (each still receives
    /// its completion callback), the in-flight operation is asked to stop,
    /// and the thread is joined with the configured bounded wait. A second
    /// call is a no-op.
    pub fn terminate_thread(&mut self) {
        let runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => return,
        };
        runtime.handler.terminate_thread();
        match runtime.done.recv_timeout(self.config.shutdown_join_timeout) {
            Ok(()) => {
                let _ = runtime.thread.join();
                debug!("worker thread joined");
            }
            Err(_) => {
                warn!(
                    timeout = ?self.config.shutdown_join_timeout,
                    "worker thread did not exit within the shutdown window"
                );
            }
        }
    }

    /// Submit a normal-priority operation. Dropped silently when the worker
    /// is not running.
    pub fn add_operation(&self, operation: Arc<dyn Operation>) {
        match &self.runtime {
            Some(runtime) => runtime.handler.add_operation(operation),
            None => debug!("worker not running; operation dropped"),
        }
    }

    /// Submit a high-priority operation. Any pending high-priority operation
    /// is selected before any normal-priority one; a steady high-priority
    /// stream can starve the normal queue.
    pub fn add_high_priority_operation(&self, operation: Arc<dyn Operation>) {
        match &self.runtime {
            Some(runtime) => runtime.handler.add_high_priority_operation(operation),
            None => debug!("worker not running; operation dropped"),
        }
    }

    /// Cancel one operation by id: removed from the queues if still pending,
    /// or flagged to stop cooperatively if currently executing.
    pub fn cancel_operation(&self, id: OperationId) {
        if let Some(runtime) = &self.runtime {
            runtime.handler.cancel_operation(id);
        }
    }

    /// Cancel every operation enqueued before this call. Operations
    /// submitted afterwards run normally.
    pub fn cancel_all_operations(&self) {
        if let Some(runtime) = &self.runtime {
            runtime.handler.cancel_all_operations();
        }
    }

    /// Entries currently queued across both priority classes.
    pub fn pending_operations(&self) -> usize {
        match &self.runtime {
            Some(runtime) => runtime.handler.pending_operations(),
            None => 0,
        }
    }

    /// Snapshot of the worker's counters. Zeroed when the worker is not
    /// running; counters do not survive a restart.
    pub fn stats(&self) -> WorkerStats {
        match &self.runtime {
            Some(runtime) => runtime.handler.stats(),
            None => WorkerStats::default(),
        }
    }
}

impl Default for WorkerThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.terminate_thread();
    }
}

/// Assess a finished operation, logging every non-success outcome. Returns
/// `true` only for `Success`.
pub fn operation_succeeded(operation: &dyn Operation) -> bool {
    match operation.status() {
        OperationStatus::Success => true,
        OperationStatus::Cancelled => {
            warn!(id = operation.id(), "operation was cancelled");
            false
        }
        OperationStatus::TimedOut => {
            warn!(id = operation.id(), "operation timed out");
            false
        }
        OperationStatus::Failed => {
            warn!(
                id = operation.id(),
                code = operation.custom_code(),
                "operation failed"
            );
            false
        }
        OperationStatus::NotStarted | OperationStatus::Running => {
            error!(
                id = operation.id(),
                "operation assessed in a non-terminal state"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct CountingOperation {
        state: OperationState,
        executed: Arc<AtomicUsize>,
    }

    impl CountingOperation {
        fn arc(executed: Arc<AtomicUsize>) -> Arc<dyn Operation> {
            Arc::new(Self {
                state: OperationState::new(),
                executed,
            })
        }
    }

    impl Operation for CountingOperation {
        fn state(&self) -> &OperationState {
            &self.state
        }

        fn execute(&self) {
            self.started();
            self.executed.fetch_add(1, Ordering::SeqCst);
            self.success();
            self.finished();
        }
    }

    fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.thread_name, "operation-worker");
        assert_eq!(config.shutdown_join_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::new()
            .with_thread_name("render-ops")
            .with_shutdown_join_timeout(Duration::from_millis(300));
        assert_eq!(config.thread_name, "render-ops");
        assert_eq!(config.shutdown_join_timeout, Duration::from_millis(300));
    }

    #[test]
    fn test_start_and_terminate() {
        let mut worker = WorkerThread::new();
        assert!(!worker.is_running());

        worker.start_thread();
        assert!(worker.is_running());

        worker.terminate_thread();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_terminate_without_start_is_a_noop() {
        let mut worker = WorkerThread::new();
        worker.terminate_thread();
        worker.terminate_thread();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_submission_before_start_is_dropped() {
        let worker = WorkerThread::new();
        let executed = Arc::new(AtomicUsize::new(0));
        worker.add_operation(CountingOperation::arc(executed.clone()));

        assert_eq!(worker.pending_operations(), 0);
        assert_eq!(worker.stats(), WorkerStats::default());
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_worker_executes_submitted_operations() {
        let mut worker = WorkerThread::new();
        worker.start_thread();

        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            worker.add_operation(CountingOperation::arc(executed.clone()));
        }

        assert!(wait_for(
            || executed.load(Ordering::SeqCst) == 5,
            Duration::from_secs(2)
        ));
        assert!(wait_for(
            || worker.stats().completed == 5,
            Duration::from_secs(2)
        ));

        worker.terminate_thread();
    }

    #[test]
    fn test_submission_after_terminate_is_dropped() {
        let mut worker = WorkerThread::new();
        worker.start_thread();
        worker.terminate_thread();

        let executed = Arc::new(AtomicUsize::new(0));
        worker.add_operation(CountingOperation::arc(executed.clone()));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_double_start_is_ignored() {
        let mut worker = WorkerThread::new();
        worker.start_thread();
        worker.start_thread();

        let executed = Arc::new(AtomicUsize::new(0));
        worker.add_operation(CountingOperation::arc(executed.clone()));
        assert!(wait_for(
            || executed.load(Ordering::SeqCst) == 1,
            Duration::from_secs(2)
        ));

        worker.terminate_thread();
    }

    #[test]
    fn test_drop_terminates_the_worker() {
        let mut worker = WorkerThread::new();
        worker.start_thread();
        drop(worker);
        // drop is successful if this returns without hanging
    }

    struct StatusOperation {
        state: OperationState,
    }

    impl Operation for StatusOperation {
        fn state(&self) -> &OperationState {
            &self.state
        }

        fn execute(&self) {}
    }

    fn with_status(status: OperationStatus, code: u16) -> StatusOperation {
        let operation = StatusOperation {
            state: OperationState::new(),
        };
        operation.state.set_custom_code(code);
        operation.state.set_status(status);
        operation
    }

    #[test]
    fn test_operation_succeeded_only_for_success() {
        assert!(operation_succeeded(&with_status(
            OperationStatus::Success,
            0
        )));
        assert!(!operation_succeeded(&with_status(
            OperationStatus::Failed,
            3
        )));
        assert!(!operation_succeeded(&with_status(
            OperationStatus::Cancelled,
            0
        )));
        assert!(!operation_succeeded(&with_status(
            OperationStatus::TimedOut,
            0
        )));
        assert!(!operation_succeeded(&with_status(
            OperationStatus::Running,
            0
        )));
    }
}
