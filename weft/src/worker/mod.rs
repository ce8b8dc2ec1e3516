//! Per-worker cooperative scheduler.
//!
//! Each worker is an OS thread driving a single-threaded event loop: a
//! cross-thread event queue (transport frames and async-wait wakes), a
//! worker-local microtask queue drained to exhaustion between events, and a
//! deadline heap for asynchronous waits with finite timeouts. Router state
//! and shared objects never leave the worker thread; only `TaskSender`
//! crosses threads.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::backends::WaitStatus;
use crate::router::Envelope;

/// Identifies one registered asynchronous-wait continuation
pub type WakeToken = u64;

/// Events delivered into a worker's queue, possibly from another thread
#[derive(Debug)]
pub enum WorkerEvent {
    /// An envelope arriving from a registered peer transport
    Frame { peer: String, envelope: Envelope },
    /// An asynchronous wait resolved
    WaitResolved { token: WakeToken, status: WaitStatus },
}

/// Cross-thread handle that posts events into a worker's queue
#[derive(Clone)]
pub struct TaskSender {
    sender: mpsc::Sender<WorkerEvent>,
}

impl TaskSender {
    /// Posts an event; drops it silently when the worker is gone
    pub fn send(&self, event: WorkerEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

impl std::fmt::Debug for TaskSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskSender")
    }
}

struct WakeEntry {
    handler: Box<dyn FnOnce(WaitStatus)>,
    canceller: Option<Box<dyn FnOnce() -> bool>>,
}

struct ContextInner {
    sender: mpsc::Sender<WorkerEvent>,
    receiver: RefCell<mpsc::Receiver<WorkerEvent>>,
    microtasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    wakes: RefCell<HashMap<WakeToken, WakeEntry>>,
    deadlines: RefCell<BinaryHeap<Reverse<(Instant, WakeToken)>>>,
    next_token: Cell<WakeToken>,
    frame_handler: RefCell<Option<Rc<dyn Fn(String, Envelope)>>>,
    shutdown: Cell<bool>,
    blocking_wait_allowed: Cell<bool>,
}

/// The worker-local scheduler handle. Cheap to clone; never crosses threads.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Rc<ContextInner>,
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerContext {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            inner: Rc::new(ContextInner {
                sender,
                receiver: RefCell::new(receiver),
                microtasks: RefCell::new(VecDeque::new()),
                wakes: RefCell::new(HashMap::new()),
                deadlines: RefCell::new(BinaryHeap::new()),
                next_token: Cell::new(1),
                frame_handler: RefCell::new(None),
                shutdown: Cell::new(false),
                blocking_wait_allowed: Cell::new(true),
            }),
        }
    }

    pub fn task_sender(&self) -> TaskSender {
        TaskSender {
            sender: self.inner.sender.clone(),
        }
    }

    /// Whether blocking waits are permitted on this worker. When false the
    /// synchronous lock degrades to a busy spin.
    pub fn blocking_wait_allowed(&self) -> bool {
        self.inner.blocking_wait_allowed.get()
    }

    pub fn set_blocking_wait_allowed(&self, allowed: bool) {
        self.inner.blocking_wait_allowed.set(allowed);
    }

    /// Schedules a deferred task to run after the current event handler
    /// returns and before the next external event is taken
    pub fn schedule_microtask(&self, task: impl FnOnce() + 'static) {
        self.inner.microtasks.borrow_mut().push_back(Box::new(task));
    }

    /// Runs queued microtasks to exhaustion, including tasks queued by the
    /// tasks themselves
    pub fn flush_microtasks(&self) {
        loop {
            let task = self.inner.microtasks.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Registers an asynchronous-wait continuation, returning the token the
    /// eventual wake event will carry
    pub(crate) fn register_wake(
        &self,
        handler: impl FnOnce(WaitStatus) + 'static,
        deadline: Option<Instant>,
    ) -> WakeToken {
        let token = self.inner.next_token.get();
        self.inner.next_token.set(token + 1);
        self.inner.wakes.borrow_mut().insert(
            token,
            WakeEntry {
                handler: Box::new(handler),
                canceller: None,
            },
        );
        if let Some(deadline) = deadline {
            self.inner
                .deadlines
                .borrow_mut()
                .push(Reverse((deadline, token)));
        }
        token
    }

    /// Attaches the backend-side cancellation hook used when the wait's
    /// deadline expires before a notify arrives
    pub(crate) fn set_wake_canceller(&self, token: WakeToken, canceller: impl FnOnce() -> bool + 'static) {
        if let Some(entry) = self.inner.wakes.borrow_mut().get_mut(&token) {
            entry.canceller = Some(Box::new(canceller));
        }
    }

    /// Removes and returns a registered continuation, if still pending
    pub(crate) fn take_wake(&self, token: WakeToken) -> Option<Box<dyn FnOnce(WaitStatus)>> {
        self.inner
            .wakes
            .borrow_mut()
            .remove(&token)
            .map(|entry| entry.handler)
    }

    /// Installs the handler invoked for every inbound transport frame
    pub(crate) fn set_frame_handler(&self, handler: impl Fn(String, Envelope) + 'static) {
        *self.inner.frame_handler.borrow_mut() = Some(Rc::new(handler));
    }

    pub(crate) fn clear_frame_handler(&self) {
        *self.inner.frame_handler.borrow_mut() = None;
    }

    /// Asks the event loop to stop after the current event completes
    pub fn request_shutdown(&self) {
        self.inner.shutdown.set(true);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.get()
    }

    fn nearest_deadline(&self) -> Option<Instant> {
        let deadlines = self.inner.deadlines.borrow();
        deadlines.peek().map(|entry| entry.0 .0)
    }

    fn expire_deadlines(&self) {
        let now = Instant::now();
        loop {
            let token = {
                let mut deadlines = self.inner.deadlines.borrow_mut();
                match deadlines.peek() {
                    Some(Reverse((deadline, token))) if *deadline <= now => {
                        let token = *token;
                        deadlines.pop();
                        token
                    }
                    _ => break,
                }
            };
            let entry = self.inner.wakes.borrow_mut().remove(&token);
            let Some(entry) = entry else {
                continue; // already resolved
            };
            match entry.canceller {
                Some(cancel) => {
                    if cancel() {
                        (entry.handler)(WaitStatus::TimedOut);
                    } else {
                        // the wake raced the deadline and is in flight; keep the
                        // handler so the arriving event still finds it
                        self.inner.wakes.borrow_mut().insert(
                            token,
                            WakeEntry {
                                handler: entry.handler,
                                canceller: None,
                            },
                        );
                    }
                }
                None => (entry.handler)(WaitStatus::TimedOut),
            }
        }
    }

    fn dispatch(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Frame { peer, envelope } => {
                let handler = self.inner.frame_handler.borrow().clone();
                match handler {
                    Some(handler) => handler(peer, envelope),
                    None => log::warn!("dropping frame from '{peer}': no router installed"),
                }
            }
            WorkerEvent::WaitResolved { token, status } => {
                if let Some(handler) = self.take_wake(token) {
                    handler(status);
                }
                // stale tokens are expected after epoch bumps; ignore
            }
        }
    }

    /// Processes at most one external event, first draining microtasks.
    /// Returns true when an event was dispatched.
    pub fn turn(&self, max_wait: Option<Duration>) -> bool {
        self.flush_microtasks();
        self.expire_deadlines();
        if self.inner.shutdown.get() {
            return false;
        }
        let now = Instant::now();
        let wait_cap = match (self.nearest_deadline(), max_wait) {
            (Some(deadline), Some(cap)) => Some((deadline.saturating_duration_since(now)).min(cap)),
            (Some(deadline), None) => Some(deadline.saturating_duration_since(now)),
            (None, Some(cap)) => Some(cap),
            (None, None) => None,
        };
        let event = {
            let receiver = self.inner.receiver.borrow();
            match wait_cap {
                None => receiver.recv().ok(),
                Some(cap) => receiver.recv_timeout(cap).ok(),
            }
        };
        let dispatched = match event {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        };
        self.flush_microtasks();
        self.expire_deadlines();
        dispatched
    }

    /// Runs the event loop until shutdown is requested
    pub fn run(&self) {
        while !self.inner.shutdown.get() {
            self.turn(Some(Duration::from_millis(50)));
        }
        self.flush_microtasks();
    }

    /// Pumps the loop until the predicate holds or the timeout elapses.
    /// Returns whether the predicate was satisfied.
    pub fn run_until(&self, mut predicate: impl FnMut() -> bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.flush_microtasks();
            if predicate() {
                return true;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(Duration::from_millis(20))
                }
                None => Duration::from_millis(20),
            };
            self.turn(Some(slice));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn microtasks_run_in_fifo_order_including_nested() {
        let context = WorkerContext::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let first = order.clone();
        let nested_order = order.clone();
        let context_clone = context.clone();
        context.schedule_microtask(move || {
            first.borrow_mut().push(1);
            let inner = nested_order.clone();
            context_clone.schedule_microtask(move || inner.borrow_mut().push(3));
        });
        let second = order.clone();
        context.schedule_microtask(move || second.borrow_mut().push(2));

        context.flush_microtasks();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn wake_events_reach_registered_handlers() {
        let context = WorkerContext::new();
        let fired = Rc::new(Cell::new(None));

        let fired_clone = fired.clone();
        let token = context.register_wake(move |status| fired_clone.set(Some(status)), None);
        context.task_sender().send(WorkerEvent::WaitResolved {
            token,
            status: WaitStatus::Ok,
        });

        assert!(context.turn(Some(Duration::from_millis(100))));
        assert_eq!(fired.get(), Some(WaitStatus::Ok));
    }

    #[test]
    fn stale_wake_tokens_are_ignored() {
        let context = WorkerContext::new();
        context.task_sender().send(WorkerEvent::WaitResolved {
            token: 999,
            status: WaitStatus::Ok,
        });
        assert!(context.turn(Some(Duration::from_millis(100))));
    }

    #[test]
    fn run_until_observes_predicate_changes() {
        let context = WorkerContext::new();
        let flag = Rc::new(Cell::new(false));

        let flag_clone = flag.clone();
        context.schedule_microtask(move || flag_clone.set(true));
        assert!(context.run_until(|| flag.get(), Some(Duration::from_millis(200))));
    }

    #[test]
    fn run_until_times_out() {
        let context = WorkerContext::new();
        assert!(!context.run_until(|| false, Some(Duration::from_millis(30))));
    }
}
