//! Operations: the user-defined units of work the scheduler executes.
//!
//! An operation is any `Send + Sync` type implementing [`Operation`]. The
//! scheduler holds operations as `Arc<dyn Operation>`, so implementations
//! keep their mutable progress in atomics or locks. Every implementation
//! embeds an [`OperationState`], which carries the 32-bit status word, the
//! default identity, the optional completion observer, and the back-reference
//! to the scheduler that is currently executing the operation.
//!
//! # Lifecycle contract
//!
//! `execute` must:
//! 1. call [`Operation::started`] (or [`Operation::started_with_timeout`])
//!    first — this marks the operation `Running` and arms the scheduler's
//!    timeout timer;
//! 2. poll [`Operation::can_continue`] during long work and wind down
//!    promptly once it returns `false`;
//! 3. record the outcome with [`Operation::success`] or
//!    [`Operation::failed`];
//! 4. call [`Operation::finished`] last.
//!
//! An operation that skips `finished` is reaped by its timeout. One that
//! skips `started` as well has opted out of both completion paths; the worker
//! logs the violation and force-completes it to keep the queue moving.

use crate::handler::QueueHandler;
use crate::observer::OperationObserver;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::debug;

/// Stable identity of an operation, unique among live operations.
pub type OperationId = u64;

/// Reserved id of the internal bulk-cancel marker. User operations must
/// never report this id; submissions carrying it are rejected.
pub const SENTINEL_OPERATION_ID: OperationId = 0;

/// Timeout armed by [`Operation::started`] when none is given explicitly.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(4000);

/// Upper half of the status word: the [`OperationStatus`] value.
pub const STATUS_MASK: u32 = 0xFFFF_0000;

/// Lower half of the status word: the caller's custom code.
pub const CUSTOM_CODE_MASK: u32 = 0x0000_FFFF;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Hand out a fresh process-wide operation id. Never returns the reserved
/// sentinel id.
pub fn next_operation_id() -> OperationId {
    NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where an operation stands in its lifecycle.
///
/// Values occupy the upper 16 bits of the status word; the lower 16 bits
/// carry a caller-defined custom code and survive every status transition.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    /// Queued, not yet picked up by the worker.
    NotStarted = 0x0001_0000,
    /// Currently executing on the worker thread.
    Running = 0x0002_0000,
    /// Finished and reported success.
    Success = 0x0004_0000,
    /// The timeout timer fired before the operation finished.
    TimedOut = 0x0008_0000,
    /// Removed by a cancellation path before or during execution.
    Cancelled = 0x0010_0000,
    /// Finished and reported failure.
    Failed = 0x00F0_0000,
}

impl OperationStatus {
    /// Whether this status is terminal (the operation will not run again).
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }

    fn from_word(word: u32) -> Self {
        match word & STATUS_MASK {
            0x0001_0000 => Self::NotStarted,
            0x0002_0000 => Self::Running,
            0x0004_0000 => Self::Success,
            0x0008_0000 => Self::TimedOut,
            0x0010_0000 => Self::Cancelled,
            0x00F0_0000 => Self::Failed,
            other => {
                debug_assert!(false, "corrupt status word {other:#x}");
                Self::NotStarted
            }
        }
    }
}

/// Per-operation state embedded by every [`Operation`] implementation.
///
/// Holds the atomic status word, the default id, the optional observer
/// handle, and a weak back-reference to the scheduler set when the operation
/// is enqueued. Operations never own the scheduler; the scheduler outlives
/// every operation in its care.
pub struct OperationState {
    id: OperationId,
    status: AtomicU32,
    observer: Option<Arc<dyn OperationObserver>>,
    handler: Mutex<Weak<QueueHandler>>,
}

impl OperationState {
    /// State for an operation without an observer. The operation is dropped
    /// by the scheduler once its completion would have been delivered.
    pub fn new() -> Self {
        Self::build(next_operation_id(), None)
    }

    /// State for an operation whose completion is delivered to `observer`.
    pub fn with_observer(observer: Arc<dyn OperationObserver>) -> Self {
        Self::build(next_operation_id(), Some(observer))
    }

    pub(crate) fn sentinel() -> Self {
        Self::build(SENTINEL_OPERATION_ID, None)
    }

    fn build(id: OperationId, observer: Option<Arc<dyn OperationObserver>>) -> Self {
        Self {
            id,
            status: AtomicU32::new(OperationStatus::NotStarted as u32),
            observer,
            handler: Mutex::new(Weak::new()),
        }
    }

    /// The default identity handed out at construction.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Current status, read from the upper half of the status word.
    pub fn status(&self) -> OperationStatus {
        OperationStatus::from_word(self.status.load(Ordering::Acquire))
    }

    /// Caller-defined code carried in the lower half of the status word.
    pub fn custom_code(&self) -> u16 {
        (self.status.load(Ordering::Acquire) & CUSTOM_CODE_MASK) as u16
    }

    /// Store a custom code, preserving the status half of the word.
    pub fn set_custom_code(&self, code: u16) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((word & STATUS_MASK) | u32::from(code))
            });
    }

    /// Overwrite the status half of the word, preserving the custom code.
    pub(crate) fn set_status(&self, status: OperationStatus) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((status as u32) | (word & CUSTOM_CODE_MASK))
            });
    }

    /// Observer this operation's completion is delivered to, if any.
    pub fn observer(&self) -> Option<&Arc<dyn OperationObserver>> {
        self.observer.as_ref()
    }

    pub(crate) fn bind_handler(&self, handler: Weak<QueueHandler>) {
        *self.handler.lock().unwrap() = handler;
    }

    pub(crate) fn handler(&self) -> Option<Arc<QueueHandler>> {
        self.handler.lock().unwrap().upgrade()
    }
}

impl Default for OperationState {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of work scheduled on the worker thread.
///
/// Implementations provide `state` and `execute`, and may override `cancel`,
/// `clean_thread_specific_resources`, and `id`. The remaining methods are
/// lifecycle helpers with fixed behavior; overriding them breaks the
/// scheduler's bookkeeping.
///
/// # Example
///
/// ```
/// use opworker::{Operation, OperationState};
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// struct Checksum {
///     state: OperationState,
///     data: Vec<u8>,
///     result: AtomicU64,
/// }
///
/// impl Operation for Checksum {
///     fn state(&self) -> &OperationState {
///         &self.state
///     }
///
///     fn execute(&self) {
///         self.started();
///         let mut sum = 0u64;
///         for chunk in self.data.chunks(4096) {
///             if !self.can_continue() {
///                 self.finished();
///                 return;
///             }
///             sum = chunk.iter().fold(sum, |acc, &b| acc.wrapping_add(b as u64));
///         }
///         self.result.store(sum, Ordering::Release);
///         self.success();
///         self.finished();
///     }
/// }
/// ```
pub trait Operation: Send + Sync {
    /// The embedded scheduler-facing state.
    fn state(&self) -> &OperationState;

    /// Perform the work. See the module documentation for the lifecycle
    /// contract this body must follow.
    fn execute(&self);

    /// Hook invoked when the scheduler tears the operation down mid-flight —
    /// on timeout, or when a bulk cancel catches it executing. Release any
    /// in-flight resources here. May run on the timer thread.
    fn cancel(&self) {}

    /// Hook invoked after the operation leaves the worker, just before its
    /// completion is delivered (or before it is dropped, when it has no
    /// observer). Runs on the worker thread, except on the timeout path
    /// where it runs on the timer thread.
    fn clean_thread_specific_resources(&self) {}

    /// Identity used for queue deduplication and per-id cancellation.
    ///
    /// Defaults to the counter id assigned at state construction. Overrides
    /// must return a value that is stable for the operation's lifetime and
    /// never [`SENTINEL_OPERATION_ID`].
    fn id(&self) -> OperationId {
        self.state().id()
    }

    /// Current status.
    fn status(&self) -> OperationStatus {
        self.state().status()
    }

    /// Caller-defined code carried alongside the status.
    fn custom_code(&self) -> u16 {
        self.state().custom_code()
    }

    /// Store a custom code; the status half of the word is preserved.
    fn set_custom_code(&self, code: u16) {
        self.state().set_custom_code(code)
    }

    /// Mark the operation `Running` and arm the default timeout. Call first
    /// in `execute`.
    fn started(&self) {
        self.started_with_timeout(DEFAULT_OPERATION_TIMEOUT)
    }

    /// Mark the operation `Running` and arm a caller-chosen timeout.
    fn started_with_timeout(&self, timeout: Duration) {
        self.state().set_status(OperationStatus::Running);
        match self.state().handler() {
            Some(handler) => handler.start_timer(timeout),
            None => debug!(
                id = self.id(),
                "started an operation that is not under a scheduler"
            ),
        }
    }

    /// Whether the scheduler still wants this operation to keep going.
    /// Long-running bodies poll this and wind down once it returns `false`.
    fn can_continue(&self) -> bool {
        match self.state().handler() {
            Some(handler) => handler.current_can_continue(),
            None => false,
        }
    }

    /// Record a successful outcome. Does not notify; call
    /// [`Operation::finished`] afterwards.
    fn success(&self) {
        self.state().set_status(OperationStatus::Success)
    }

    /// Record a failed outcome. Does not notify; call
    /// [`Operation::finished`] afterwards.
    fn failed(&self) {
        self.state().set_status(OperationStatus::Failed)
    }

    /// Tell the scheduler this operation is complete. Call last in
    /// `execute` (or from an asynchronous continuation).
    ///
    /// A no-op when the operation already timed out: the timer drove
    /// completion and the callback has been delivered.
    fn finished(&self) {
        if self.status() == OperationStatus::TimedOut {
            return;
        }
        if let Some(handler) = self.state().handler() {
            handler.operation_finished();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct InertOperation {
        state: OperationState,
    }

    impl Operation for InertOperation {
        fn state(&self) -> &OperationState {
            &self.state
        }

        fn execute(&self) {}
    }

    #[test]
    fn test_counter_ids_are_unique_and_nonzero() {
        let a = OperationState::new();
        let b = OperationState::new();
        assert_ne!(a.id(), SENTINEL_OPERATION_ID);
        assert_ne!(b.id(), SENTINEL_OPERATION_ID);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_new_state_is_not_started() {
        let state = OperationState::new();
        assert_eq!(state.status(), OperationStatus::NotStarted);
        assert_eq!(state.custom_code(), 0);
    }

    #[test]
    fn test_set_status_preserves_custom_code() {
        let state = OperationState::new();
        state.set_custom_code(0xBEEF);
        state.set_status(OperationStatus::Failed);
        assert_eq!(state.status(), OperationStatus::Failed);
        assert_eq!(state.custom_code(), 0xBEEF);

        state.set_status(OperationStatus::Cancelled);
        assert_eq!(state.custom_code(), 0xBEEF);
    }

    #[test]
    fn test_set_custom_code_preserves_status() {
        let state = OperationState::new();
        state.set_status(OperationStatus::Running);
        state.set_custom_code(7);
        assert_eq!(state.status(), OperationStatus::Running);
        assert_eq!(state.custom_code(), 7);

        // overwriting the code must not disturb the status half either
        state.set_custom_code(0xFFFF);
        assert_eq!(state.status(), OperationStatus::Running);
        assert_eq!(state.custom_code(), 0xFFFF);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OperationStatus::NotStarted.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Success.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(OperationStatus::TimedOut.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_sentinel_state_uses_reserved_id() {
        let state = OperationState::sentinel();
        assert_eq!(state.id(), SENTINEL_OPERATION_ID);
    }

    #[test]
    fn test_unbound_operation_cannot_continue() {
        let operation = InertOperation {
            state: OperationState::new(),
        };
        // not enqueued anywhere: there is no scheduler flag to consult
        assert!(!operation.can_continue());
    }

    #[test]
    fn test_finished_without_handler_is_a_noop() {
        let operation = InertOperation {
            state: OperationState::new(),
        };
        operation.success();
        operation.finished();
        assert_eq!(operation.status(), OperationStatus::Success);
    }

    #[test]
    fn test_finished_after_timeout_keeps_timed_out_status() {
        let operation = InertOperation {
            state: OperationState::new(),
        };
        operation.state().set_status(OperationStatus::TimedOut);
        operation.finished();
        assert_eq!(operation.status(), OperationStatus::TimedOut);
    }

    #[test]
    fn test_status_word_round_trip() {
        for status in [
            OperationStatus::NotStarted,
            OperationStatus::Running,
            OperationStatus::Success,
            OperationStatus::TimedOut,
            OperationStatus::Cancelled,
            OperationStatus::Failed,
        ] {
            let state = OperationState::new();
            state.set_status(status);
            assert_eq!(state.status(), status);
        }
    }
}
