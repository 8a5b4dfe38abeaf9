//! Single-worker operation scheduler.
//!
//! This crate serializes user-supplied units of work ("operations") onto one
//! dedicated worker thread. It provides two priority classes with FIFO order
//! inside each class, per-operation timeouts, cooperative cancellation of
//! the operation in flight, bulk cancellation that spares concurrently
//! submitted work, graceful shutdown that drains the queues, and completion
//! callbacks delivered on the observer's home thread.
//!
//! There is no preemption: a running operation stops only by polling
//! [`Operation::can_continue`] or by hitting its timeout. There is also no
//! fairness between the classes — any pending high-priority operation is
//! selected before any normal-priority one.
//!
//! # Example
//!
//! ```
//! use opworker::{Operation, OperationState, ObserverMailbox, WorkerThread};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Greet {
//!     state: OperationState,
//!     message: &'static str,
//! }
//!
//! impl Operation for Greet {
//!     fn state(&self) -> &OperationState {
//!         &self.state
//!     }
//!
//!     fn execute(&self) {
//!         self.started();
//!         println!("{}", self.message);
//!         self.success();
//!         self.finished();
//!     }
//! }
//!
//! // completions are pumped on the thread that builds the mailbox
//! let mailbox = ObserverMailbox::new(|operation| {
//!     println!("operation {} finished with {:?}", operation.id(), operation.status());
//! });
//!
//! let mut worker = WorkerThread::new();
//! worker.start_thread();
//! worker.add_operation(Arc::new(Greet {
//!     state: OperationState::with_observer(mailbox.observer()),
//!     message: "hello from the worker thread",
//! }));
//!
//! mailbox.pump_for(Duration::from_secs(1));
//! worker.terminate_thread();
//! ```

mod handler;
mod observer;
mod operation;
mod queue;
mod semaphore;
mod timer;
mod worker;

// Re-export public API
pub use observer::{Delivery, ObserverMailbox, OperationObserver};
pub use operation::{
    next_operation_id, Operation, OperationId, OperationState, OperationStatus, CUSTOM_CODE_MASK,
    DEFAULT_OPERATION_TIMEOUT, SENTINEL_OPERATION_ID, STATUS_MASK,
};
pub use worker::{operation_succeeded, WorkerConfig, WorkerStats, WorkerThread};
