//! Completion observers and delivery routing.
//!
//! An observer is the party notified when an operation reaches a terminal
//! status. Delivery is auto-routed: when the completing thread *is* the
//! observer's home thread the callback is invoked directly, otherwise a
//! closure is posted through [`OperationObserver::post`] for the observer's
//! event loop to run. Operations without an observer are dropped by the
//! scheduler after their thread-specific cleanup.
//!
//! [`ObserverMailbox`] is a ready-made observer for callers whose "event
//! loop" is a thread that can periodically drain a mailbox.

use crate::operation::Operation;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::debug;

/// A deferred completion delivery, posted to the observer's home thread.
pub type Delivery = Box<dyn FnOnce() + Send>;

/// Receives operation completions.
///
/// Implementations wrap some thread-owned event loop — a UI thread, an actor
/// mailbox, a channel drained by a service loop. The scheduler calls
/// [`OperationObserver::on_operation_finished`] exactly once per operation,
/// either directly (when completing on the home thread) or via a closure
/// handed to [`OperationObserver::post`].
pub trait OperationObserver: Send + Sync {
    /// The thread this observer's event loop runs on.
    fn home_thread(&self) -> ThreadId;

    /// Queue `delivery` to run on the home thread.
    fn post(&self, delivery: Delivery);

    /// The completion callback. The operation carries its terminal status
    /// and custom code; the observer discriminates on
    /// [`Operation::status`].
    fn on_operation_finished(&self, operation: Arc<dyn Operation>);
}

/// An [`OperationObserver`] backed by an mpsc mailbox.
///
/// Construct it on the thread that should receive completions, hand
/// [`ObserverMailbox::observer`] to the operations you submit, and drain
/// deliveries with [`ObserverMailbox::pump`] or
/// [`ObserverMailbox::pump_for`] from that same thread.
///
/// # Example
///
/// ```
/// use opworker::{ObserverMailbox, Operation};
/// use std::time::Duration;
///
/// let mailbox = ObserverMailbox::new(|operation| {
///     println!("operation {} ended with {:?}", operation.id(), operation.status());
/// });
/// let observer = mailbox.observer();
/// // ... submit operations constructed with OperationState::with_observer(observer) ...
/// mailbox.pump_for(Duration::from_millis(10));
/// ```
pub struct ObserverMailbox {
    observer: Arc<MailboxObserver>,
    deliveries: Receiver<Delivery>,
}

struct MailboxObserver {
    home: ThreadId,
    deliveries: Sender<Delivery>,
    callback: Box<dyn Fn(Arc<dyn Operation>) + Send + Sync>,
}

impl OperationObserver for MailboxObserver {
    fn home_thread(&self) -> ThreadId {
        self.home
    }

    fn post(&self, delivery: Delivery) {
        if self.deliveries.send(delivery).is_err() {
            // mailbox gone: the owner dropped it before shutdown finished
            debug!("completion delivery dropped, observer mailbox is closed");
        }
    }

    fn on_operation_finished(&self, operation: Arc<dyn Operation>) {
        (self.callback)(operation);
    }
}

impl ObserverMailbox {
    /// Create a mailbox homed on the calling thread. `callback` runs once
    /// per finished operation, on this thread, during `pump`.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Arc<dyn Operation>) + Send + Sync + 'static,
    {
        let (deliveries_tx, deliveries_rx) = mpsc::channel();
        Self {
            observer: Arc::new(MailboxObserver {
                home: thread::current().id(),
                deliveries: deliveries_tx,
                callback: Box::new(callback),
            }),
            deliveries: deliveries_rx,
        }
    }

    /// The observer handle to attach to operations.
    pub fn observer(&self) -> Arc<dyn OperationObserver> {
        self.observer.clone()
    }

    /// Run every delivery queued so far. Returns how many ran.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while let Ok(delivery) = self.deliveries.try_recv() {
            delivery();
            delivered += 1;
        }
        delivered
    }

    /// Wait up to `timeout` for a delivery, then drain whatever is queued.
    /// Returns how many deliveries ran.
    pub fn pump_for(&self, timeout: Duration) -> usize {
        match self.deliveries.recv_timeout(timeout) {
            Ok(delivery) => {
                delivery();
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }
}
