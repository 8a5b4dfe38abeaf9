//! The per-worker queue handler: dual-priority queues, the worker state
//! machine, timeouts, cancellation, and shutdown.
//!
//! One `QueueHandler` serves one worker thread. Producers on arbitrary
//! threads enqueue operations and release permits on the `ops_available`
//! semaphore; the worker loop consumes permits, dequeues (high priority
//! first), and executes one operation at a time. The machine is an explicit
//! state enum advanced by events on an mpsc channel the worker thread
//! drains:
//!
//! ```text
//!        OperationNeeded
//!       ┌─────────────┐
//!       ▼             │
//!   ┌────────┐  OperationRetrieved  ┌────────────┐
//!   │Waiting │ ───────────────────▶ │ Processing │
//!   └────────┘                      └────────────┘
//!       │                                 │
//!       │ CleanUpAndExit                  │ OperationNeeded
//!       ▼                                 ▼
//!   ┌────────┐                      (back to Waiting)
//!   │Exiting │ ──▶ terminal
//!   └────────┘
//! ```
//!
//! `CancelOperation` and `CancelAllRequested` are posted control events,
//! handled between state entries in any state — the worker thread is the
//! only place queue removals happen, which is what keeps the permit
//! accounting single-writer.
//!
//! Lock order where both are needed: `current` before `queues`, never the
//! reverse. Neither lock is held across user `execute()` or across callback
//! delivery.

use crate::observer::OperationObserver;
use crate::operation::{
    Operation, OperationId, OperationState, OperationStatus, SENTINEL_OPERATION_ID,
};
use crate::queue::OperationsQueue;
use crate::semaphore::Semaphore;
use crate::timer::TimeoutTimer;
use crate::worker::WorkerStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Hook invoked (on the worker thread) whenever both queues are empty after
/// a completion.
pub(crate) type EmptyQueueHook = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Waiting,
    Processing,
    Exiting,
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Re-enter Waiting and pull the next operation.
    OperationNeeded,
    /// An operation was staged in `current`; move to Processing.
    OperationRetrieved,
    /// Terminate was requested; drain and exit.
    CleanUpAndExit,
    /// Posted per-id cancel, serialized onto the worker thread.
    CancelOperation(OperationId),
    /// Posted bulk-cancel drain, serialized onto the worker thread.
    CancelAllRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    Normal,
    High,
}

struct Queues {
    normal: OperationsQueue,
    high: OperationsQueue,
}

impl Queues {
    fn select_mut(&mut self, kind: QueueKind) -> &mut OperationsQueue {
        match kind {
            QueueKind::Normal => &mut self.normal,
            QueueKind::High => &mut self.high,
        }
    }

    fn total(&self) -> usize {
        self.normal.len() + self.high.len()
    }
}

struct CurrentSlot {
    current: Option<Arc<dyn Operation>>,
    can_continue: bool,
    cancel_all_pending: bool,
    terminate_pending: bool,
}

#[derive(Default)]
struct StatsCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

impl StatsCounters {
    fn record_outcome(&self, status: OperationStatus) {
        let counter = match status {
            OperationStatus::Cancelled => &self.cancelled,
            OperationStatus::TimedOut => &self.timed_out,
            _ => &self.completed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marker operation delimiting the bulk-cancel high-water line. Carries no
/// work; never executed, only drained by `do_cancel_all`.
struct SentinelOperation {
    state: OperationState,
}

impl SentinelOperation {
    fn new() -> Self {
        Self {
            state: OperationState::sentinel(),
        }
    }
}

impl Operation for SentinelOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn execute(&self) {}
}

/// Shared half of the queue handler. Producers call the submission and
/// cancellation API through an `Arc` of this; the worker thread owns the
/// matching [`HandlerLoop`].
pub(crate) struct QueueHandler {
    queues: Mutex<Queues>,
    current: Mutex<CurrentSlot>,
    ops_available: Semaphore,
    events: Sender<WorkerEvent>,
    timer: TimeoutTimer,
    rendezvous: Arc<Semaphore>,
    empty_queue_hook: Option<EmptyQueueHook>,
    stats: StatsCounters,
}

/// Worker-thread half: the event receiver and the state machine driver.
pub(crate) struct HandlerLoop {
    handler: Arc<QueueHandler>,
    events: Receiver<WorkerEvent>,
}

impl QueueHandler {
    pub(crate) fn new(
        rendezvous: Arc<Semaphore>,
        empty_queue_hook: Option<EmptyQueueHook>,
    ) -> (Arc<QueueHandler>, HandlerLoop) {
        let (events_tx, events_rx) = mpsc::channel();
        let handler = Arc::new_cyclic(|weak: &Weak<QueueHandler>| {
            let timer_handler = weak.clone();
            QueueHandler {
                queues: Mutex::new(Queues {
                    normal: OperationsQueue::new(),
                    high: OperationsQueue::new(),
                }),
                current: Mutex::new(CurrentSlot {
                    current: None,
                    can_continue: false,
                    cancel_all_pending: false,
                    terminate_pending: false,
                }),
                ops_available: Semaphore::new(0),
                events: events_tx,
                timer: TimeoutTimer::new(move |generation| {
                    if let Some(handler) = timer_handler.upgrade() {
                        handler.on_timer_fired(generation);
                    }
                }),
                rendezvous,
                empty_queue_hook,
                stats: StatsCounters::default(),
            }
        });
        let handler_loop = HandlerLoop {
            handler: handler.clone(),
            events: events_rx,
        };
        (handler, handler_loop)
    }

    // ----- submission -------------------------------------------------

    pub(crate) fn add_operation(self: &Arc<Self>, operation: Arc<dyn Operation>) {
        self.enqueue_operation(operation, QueueKind::Normal);
    }

    pub(crate) fn add_high_priority_operation(self: &Arc<Self>, operation: Arc<dyn Operation>) {
        self.enqueue_operation(operation, QueueKind::High);
    }

    fn enqueue_operation(self: &Arc<Self>, operation: Arc<dyn Operation>, kind: QueueKind) {
        let id = operation.id();
        if id == SENTINEL_OPERATION_ID {
            error!("operation id 0 is reserved; submission rejected");
            return;
        }
        let displaced = {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues.select_mut(kind);
            // a queued operation with the same id is displaced as cancelled
            let displaced = self.remove_from_queue_locked(queue, id);
            operation.state().bind_handler(Arc::downgrade(self));
            operation.state().set_status(OperationStatus::NotStarted);
            queue.enqueue(id, operation);
            self.ops_available.release(1);
            displaced
        };
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(id, queue = ?kind, "operation enqueued");
        if let Some(previous) = displaced {
            debug!(id, "displaced a queued operation with the same id");
            self.end_operation(previous);
        }
    }

    /// Remove `id` from `queue`, marking the entry cancelled and taking back
    /// the permit its submission released. The caller delivers the returned
    /// operation after releasing the queue lock.
    fn remove_from_queue_locked(
        &self,
        queue: &mut OperationsQueue,
        id: OperationId,
    ) -> Option<Arc<dyn Operation>> {
        let operation = queue.remove(id)?;
        operation.state().set_status(OperationStatus::Cancelled);
        if !self.ops_available.try_acquire() {
            // the permit for this entry is missing; the Waiting-entry retry
            // absorbs the resulting spurious wakeup
            error!(id, "queue and semaphore out of sync while removing operation");
        }
        Some(operation)
    }

    // ----- cancellation -----------------------------------------------

    /// Cancel one operation by id. Posted to the worker thread so removal is
    /// serialized with the state machine.
    pub(crate) fn cancel_operation(&self, id: OperationId) {
        let _ = self.events.send(WorkerEvent::CancelOperation(id));
    }

    /// Cancel everything enqueued before this call. A sentinel marks the
    /// high-water line in each queue, so operations submitted concurrently
    /// with (or after) the call survive.
    pub(crate) fn cancel_all_operations(self: &Arc<Self>) {
        let displaced = {
            let mut slot = self.current.lock().unwrap();
            let displaced = {
                let mut queues = self.queues.lock().unwrap();
                // both sentinels enter their queues under one lock hold, and
                // the two matching permits with them
                let first = self.push_sentinel_locked(&mut queues.normal);
                let second = self.push_sentinel_locked(&mut queues.high);
                self.ops_available.release(2);
                (first, second)
            };
            // both flags change together, and the in-flight operation is
            // pre-marked so a cooperative yield is delivered as cancelled
            slot.can_continue = false;
            slot.cancel_all_pending = true;
            if let Some(current) = &slot.current {
                current.state().set_status(OperationStatus::Cancelled);
            }
            displaced
        };
        // sentinels displaced by an overlapping cancel-all; no observer, so
        // this only drops them
        if let Some(sentinel) = displaced.0 {
            self.end_operation(sentinel);
        }
        if let Some(sentinel) = displaced.1 {
            self.end_operation(sentinel);
        }
        debug!("cancel of all pending operations requested");
        let _ = self.events.send(WorkerEvent::CancelAllRequested);
    }

    fn push_sentinel_locked(
        self: &Arc<Self>,
        queue: &mut OperationsQueue,
    ) -> Option<Arc<dyn Operation>> {
        let displaced = self.remove_from_queue_locked(queue, SENTINEL_OPERATION_ID);
        let sentinel: Arc<dyn Operation> = Arc::new(SentinelOperation::new());
        sentinel.state().bind_handler(Arc::downgrade(self));
        queue.enqueue(SENTINEL_OPERATION_ID, sentinel);
        displaced
    }

    /// Worker-thread half of the bulk cancel: pop each queue up to and
    /// including its sentinel, delivering everything popped as cancelled,
    /// then cancel the in-flight operation and drive the machine forward.
    fn do_cancel_all(&self) {
        let removed = {
            let mut queues = self.queues.lock().unwrap();
            let queues = &mut *queues;
            let mut removed = Vec::new();
            for queue in [&mut queues.normal, &mut queues.high] {
                while let Some(head) = queue.head() {
                    if let Some(operation) = self.remove_from_queue_locked(queue, head) {
                        removed.push(operation);
                    }
                    if head == SENTINEL_OPERATION_ID {
                        break;
                    }
                }
            }
            removed
        };
        for operation in removed {
            self.end_operation(operation);
        }
        {
            let mut slot = self.current.lock().unwrap();
            if let Some(current) = &slot.current {
                current.state().set_status(OperationStatus::Cancelled);
                current.cancel();
            }
            slot.cancel_all_pending = false;
        }
        self.operation_finished();
    }

    fn do_cancel_operation(&self, id: OperationId) {
        let removed = {
            let mut slot = self.current.lock().unwrap();
            let removed = {
                let mut queues = self.queues.lock().unwrap();
                let mut removed = Vec::new();
                if let Some(operation) = self.remove_from_queue_locked(&mut queues.normal, id) {
                    removed.push(operation);
                }
                if let Some(operation) = self.remove_from_queue_locked(&mut queues.high, id) {
                    removed.push(operation);
                }
                removed
            };
            if let Some(current) = &slot.current {
                if current.id() == id {
                    // the operation observes this through can_continue and is
                    // expected to end itself; the timeout reaps it otherwise
                    current.state().set_status(OperationStatus::Cancelled);
                    slot.can_continue = false;
                }
            }
            removed
        };
        for operation in removed {
            debug!(id, "cancelled queued operation");
            self.end_operation(operation);
        }
    }

    // ----- completion -------------------------------------------------

    /// Called by the operation in flight (via `finished()`), by the timeout
    /// path, and by the bulk-cancel drain. Takes the current operation out,
    /// delivers its completion, and asks the state machine for the next one.
    pub(crate) fn operation_finished(&self) {
        let finished = {
            let mut slot = self.current.lock().unwrap();
            let operation = slot.current.take();
            if operation.is_some() {
                self.timer.disarm();
            }
            operation
        };
        if let Some(operation) = finished {
            debug!(id = operation.id(), status = ?operation.status(), "operation finished");
            self.end_operation(operation);
        }
        let empty = {
            let queues = self.queues.lock().unwrap();
            queues.normal.is_empty() && queues.high.is_empty()
        };
        if empty {
            if let Some(hook) = &self.empty_queue_hook {
                hook();
            }
        }
        let _ = self.events.send(WorkerEvent::OperationNeeded);
    }

    /// Run the thread-specific cleanup hook and deliver the completion to
    /// the observer, routed to its home thread. An operation without an
    /// observer is dropped here.
    fn end_operation(&self, operation: Arc<dyn Operation>) {
        if operation.id() != SENTINEL_OPERATION_ID {
            self.stats.record_outcome(operation.status());
        }
        operation.clean_thread_specific_resources();
        let observer = match operation.state().observer() {
            Some(observer) => observer.clone(),
            None => return,
        };
        if thread::current().id() == observer.home_thread() {
            observer.on_operation_finished(operation);
        } else {
            let target: Arc<dyn OperationObserver> = observer.clone();
            observer.post(Box::new(move || target.on_operation_finished(operation)));
        }
    }

    // ----- timeout ----------------------------------------------------

    /// Arm the single-shot timeout for the operation in flight. Called by
    /// `Operation::started`.
    pub(crate) fn start_timer(&self, timeout: Duration) {
        self.timer.arm(timeout);
    }

    fn on_timer_fired(&self, generation: u64) {
        let timed_out = {
            let slot = self.current.lock().unwrap();
            if !self.timer.disarm_if(generation) {
                // superseded by a re-arm or already finished normally
                return;
            }
            match &slot.current {
                Some(current) => {
                    warn!(id = current.id(), "operation timed out");
                    current.state().set_status(OperationStatus::TimedOut);
                    current.cancel();
                    true
                }
                None => {
                    error!("timeout fired with no operation in flight");
                    false
                }
            }
        };
        if timed_out {
            // completes the operation as if it had finished; its own later
            // finished() call becomes a no-op on the TimedOut status
            self.operation_finished();
        }
    }

    // ----- cooperative-cancel flag and shutdown -----------------------

    pub(crate) fn current_can_continue(&self) -> bool {
        self.current.lock().unwrap().can_continue
    }

    /// Synchronous shutdown: raise the terminate flag, wake the worker with
    /// a pseudo-permit, and wait until the worker loop has exited.
    pub(crate) fn terminate_thread(&self) {
        {
            let mut slot = self.current.lock().unwrap();
            slot.can_continue = false;
            slot.terminate_pending = true;
            // pre-mark, as in the bulk cancel: a cooperative yield must be
            // delivered with a terminal status
            if let Some(current) = &slot.current {
                current.state().set_status(OperationStatus::Cancelled);
            }
        }
        self.ops_available.release(1);
        self.rendezvous.acquire();
    }

    // ----- introspection ----------------------------------------------

    pub(crate) fn pending_operations(&self) -> usize {
        self.queues.lock().unwrap().total()
    }

    pub(crate) fn stats(&self) -> WorkerStats {
        WorkerStats {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
            queued: self.pending_operations(),
        }
    }
}

impl HandlerLoop {
    /// Drive the state machine until terminate. Runs on the worker thread;
    /// releases the rendezvous on the way out so `terminate_thread` callers
    /// unblock.
    pub(crate) fn run(self) {
        let mut state = WorkerState::Waiting;
        self.enter_waiting();
        while let Ok(event) = self.events.recv() {
            match (state, event) {
                (_, WorkerEvent::CancelOperation(id)) => self.handler.do_cancel_operation(id),
                (_, WorkerEvent::CancelAllRequested) => self.handler.do_cancel_all(),
                (WorkerState::Waiting, WorkerEvent::OperationNeeded) => self.enter_waiting(),
                (WorkerState::Processing, WorkerEvent::OperationNeeded) => {
                    state = WorkerState::Waiting;
                    self.enter_waiting();
                }
                (WorkerState::Waiting, WorkerEvent::OperationRetrieved) => {
                    state = WorkerState::Processing;
                    self.enter_processing();
                }
                (WorkerState::Waiting, WorkerEvent::CleanUpAndExit) => {
                    state = WorkerState::Exiting;
                    self.enter_exiting();
                    break;
                }
                (state, event) => {
                    error!(?state, ?event, "event outside the state machine; ignored");
                }
            }
        }
        debug!(final_state = ?state, "worker loop exited");
        self.handler.rendezvous.release(1);
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.handler.events.send(event);
    }

    /// Waiting entry: park until an operation (or pseudo-permit) is
    /// available, observe the cancel-all and terminate flags, then stage the
    /// next operation, high priority first.
    fn enter_waiting(&self) {
        {
            let slot = self.handler.current.lock().unwrap();
            if slot.current.is_some() {
                // stale wakeup: an operation is already staged and its
                // OperationRetrieved is behind us in the queue
                return;
            }
        }
        self.handler.ops_available.acquire();

        let mut slot = self.handler.current.lock().unwrap();
        if slot.cancel_all_pending {
            // this permit was consumed on behalf of a sentinel that
            // do_cancel_all has not drained yet; hand it back and let the
            // posted drain drive progress
            self.handler.ops_available.release(1);
            return;
        }
        if slot.terminate_pending {
            self.emit(WorkerEvent::CleanUpAndExit);
            return;
        }

        let next = {
            let mut queues = self.handler.queues.lock().unwrap();
            match Self::dequeue_from(&mut queues.high) {
                Some(operation) => Some(operation),
                None => Self::dequeue_from(&mut queues.normal),
            }
        };
        match next {
            Some(operation) => {
                debug!(id = operation.id(), "operation retrieved");
                slot.current = Some(operation);
                slot.can_continue = true;
                drop(slot);
                self.emit(WorkerEvent::OperationRetrieved);
            }
            None => {
                // a permit with nothing behind it; retry rather than park
                // the machine in a dead state
                error!("both queues empty after a permit acquire");
                drop(slot);
                self.emit(WorkerEvent::OperationNeeded);
            }
        }
    }

    /// Only the cancel-all drain may consume a sentinel; meeting one here is
    /// a protocol violation.
    fn dequeue_from(queue: &mut OperationsQueue) -> Option<Arc<dyn Operation>> {
        match queue.head() {
            Some(SENTINEL_OPERATION_ID) => {
                error!("sentinel at queue head outside the cancel-all drain");
                None
            }
            Some(_) => queue.dequeue(),
            None => None,
        }
    }

    /// Processing entry: run the staged operation on this thread, with no
    /// locks held.
    fn enter_processing(&self) {
        let staged = {
            let slot = self.handler.current.lock().unwrap();
            slot.current.clone()
        };
        let operation = match staged {
            Some(operation) => operation,
            None => {
                error!("entered processing with no operation staged");
                self.emit(WorkerEvent::OperationNeeded);
                return;
            }
        };
        debug!(id = operation.id(), "processing operation");
        operation.execute();

        // an operation that armed its timer may finish from an asynchronous
        // continuation, and the timeout backstops it; one that did neither
        // would park the machine forever
        let stalled = {
            let slot = self.handler.current.lock().unwrap();
            match &slot.current {
                Some(current) => {
                    Arc::ptr_eq(current, &operation)
                        && !self.handler.timer.is_armed()
                        && operation.status() != OperationStatus::TimedOut
                }
                None => false,
            }
        };
        if stalled {
            error!(
                id = operation.id(),
                "execute returned without starting a timer or finishing"
            );
            self.handler.operation_finished();
        }
    }

    /// Exiting entry: drain everything still queued, then fall through to
    /// the terminal state.
    fn enter_exiting(&self) {
        debug!("worker cleaning up before exit");
        self.handler.do_cancel_all();
    }
}
