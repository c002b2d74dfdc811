// src/core/async_task.rs

//! # Asynchronous Coordination
//!
//! Single-threaded primitives the conductor uses to wait for external work:
//!
//! - [`AsyncCallbacks`]: a single-resolution future with `done`/`fail`/`always`
//!   listener lists. It also implements [`Future`], so hosts running on an async
//!   runtime can simply `.await` it.
//! - [`AsyncTask`]: a fan-in join over N sub-operations. Resolves when every
//!   sub-operation is done, fails on the first failure.
//! - [`EventLoop`]: a deferred-job queue with timers, driven explicitly by the host
//!   through [`EventLoop::tick`].
//!
//! Nothing here is thread-safe; all state lives behind `Rc<RefCell<_>>`.

use crate::models::TagValues;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use thiserror::Error;

/// The failure payload carried through `fail` listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The operation failed; the message is meant for the player or the log.
    #[error("{0}")]
    Failed(String),
    /// The operation was abandoned through [`AsyncTask::abort`].
    #[error("The operation was aborted.")]
    Aborted,
}

impl Fault {
    /// Shorthand for [`Fault::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Misuse of an [`AsyncTask`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncTaskError {
    /// `run()` was called on a task that already left the `New` state.
    #[error("The task cannot be run again (current status: {0:?}).")]
    AlreadyStarted(TaskStatus),
}

// --- CALLBACKS ---

type DoneListener<T> = Box<dyn FnOnce(&T)>;
type FailListener = Box<dyn FnOnce(&Fault)>;
type AlwaysListener = Box<dyn FnOnce()>;

enum Settlement<T> {
    Pending,
    Done(T),
    Failed(Fault),
}

struct CallbacksInner<T> {
    state: Settlement<T>,
    done: Vec<DoneListener<T>>,
    fail: Vec<FailListener>,
    always: Vec<AlwaysListener>,
    wakers: Vec<Waker>,
}

/// A single-resolution future. Clones share the same state.
///
/// Listeners registered after resolution run immediately. All listeners run after
/// the internal borrow is released, so they may freely register more listeners or
/// resolve other callbacks.
pub struct AsyncCallbacks<T = ()> {
    inner: Rc<RefCell<CallbacksInner<T>>>,
}

impl<T> Clone for AsyncCallbacks<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AsyncCallbacks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.borrow().state {
            Settlement::Pending => "pending",
            Settlement::Done(_) => "done",
            Settlement::Failed(_) => "failed",
        };
        f.debug_struct("AsyncCallbacks").field("state", &state).finish()
    }
}

impl<T: Clone + 'static> Default for AsyncCallbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> AsyncCallbacks<T> {
    /// Creates pending callbacks.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(CallbacksInner {
                state: Settlement::Pending,
                done: Vec::new(),
                fail: Vec::new(),
                always: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    /// Registers a success listener.
    pub fn done(&self, listener: impl FnOnce(&T) + 'static) -> &Self {
        let value = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match &inner.state {
                Settlement::Pending => {
                    inner.done.push(Box::new(listener));
                    return self;
                }
                Settlement::Done(value) => value.clone(),
                Settlement::Failed(_) => return self,
            }
        };
        listener(&value);
        self
    }

    /// Registers a failure listener.
    pub fn fail(&self, listener: impl FnOnce(&Fault) + 'static) -> &Self {
        let fault = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match &inner.state {
                Settlement::Pending => {
                    inner.fail.push(Box::new(listener));
                    return self;
                }
                Settlement::Failed(fault) => fault.clone(),
                Settlement::Done(_) => return self,
            }
        };
        listener(&fault);
        self
    }

    /// Registers a listener that runs after either outcome.
    pub fn always(&self, listener: impl FnOnce() + 'static) -> &Self {
        {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, Settlement::Pending) {
                inner.always.push(Box::new(listener));
                return self;
            }
        }
        listener();
        self
    }

    /// Resolves successfully. Returns `false` (and changes nothing) if already settled.
    pub fn call_done(&self, value: T) -> bool {
        let (listeners, always, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, Settlement::Pending) {
                log::warn!("Ignoring a second resolution of an already settled callback.");
                return false;
            }
            inner.state = Settlement::Done(value.clone());
            inner.fail.clear();
            (
                std::mem::take(&mut inner.done),
                std::mem::take(&mut inner.always),
                std::mem::take(&mut inner.wakers),
            )
        };
        for listener in listeners {
            listener(&value);
        }
        for listener in always {
            listener();
        }
        wakers.into_iter().for_each(Waker::wake);
        true
    }

    /// Resolves with a failure. Returns `false` (and changes nothing) if already settled.
    pub fn call_fail(&self, fault: Fault) -> bool {
        let (listeners, always, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, Settlement::Pending) {
                log::warn!("Ignoring a failure reported after the callback settled: {}", fault);
                return false;
            }
            inner.state = Settlement::Failed(fault.clone());
            inner.done.clear();
            (
                std::mem::take(&mut inner.fail),
                std::mem::take(&mut inner.always),
                std::mem::take(&mut inner.wakers),
            )
        };
        for listener in listeners {
            listener(&fault);
        }
        for listener in always {
            listener();
        }
        wakers.into_iter().for_each(Waker::wake);
        true
    }

    /// `true` until the callbacks are settled.
    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, Settlement::Pending)
    }

    /// `true` once settled by `call_done`.
    pub fn is_done(&self) -> bool {
        matches!(self.inner.borrow().state, Settlement::Done(_))
    }

    /// `true` once settled by `call_fail`.
    pub fn is_failed(&self) -> bool {
        matches!(self.inner.borrow().state, Settlement::Failed(_))
    }

    /// The outcome, once settled.
    pub fn outcome(&self) -> Option<Result<T, Fault>> {
        match &self.inner.borrow().state {
            Settlement::Pending => None,
            Settlement::Done(value) => Some(Ok(value.clone())),
            Settlement::Failed(fault) => Some(Err(fault.clone())),
        }
    }
}

impl<T: Clone + 'static> Future for AsyncCallbacks<T> {
    type Output = Result<T, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.outcome() {
            return Poll::Ready(outcome);
        }
        self.inner.borrow_mut().wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

// --- EVENT LOOP ---

type Job = Box<dyn FnOnce()>;

struct Timer {
    due: Instant,
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct LoopInner {
    queue: VecDeque<Job>,
    timers: Vec<Timer>,
    next_seq: u64,
}

/// A cooperative job queue. Clones share the same queue.
#[derive(Clone, Default)]
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventLoop")
            .field("queued", &inner.queue.len())
            .field("timers", &inner.timers.len())
            .finish()
    }
}

impl EventLoop {
    /// Creates an empty loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `job` for the next [`EventLoop::tick`].
    pub fn defer(&self, job: impl FnOnce() + 'static) {
        self.inner.borrow_mut().queue.push_back(Box::new(job));
    }

    /// Schedules `job` for the first tick at or after `now + delay`.
    pub fn set_timeout(&self, now: Instant, delay: Duration, job: impl FnOnce() + 'static) {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.timers.push(Timer {
            due: now + delay,
            seq,
            job: Box::new(job),
        });
    }

    /// Returns callbacks that resolve on the first tick at or after `now + delay`.
    pub fn sleep(&self, now: Instant, delay: Duration) -> AsyncCallbacks {
        let callbacks = AsyncCallbacks::new();
        let resolver = callbacks.clone();
        self.set_timeout(now, delay, move || {
            resolver.call_done(());
        });
        callbacks
    }

    /// Runs every job queued before this call plus every timer due at `now`, in
    /// order. Jobs scheduled while ticking wait for the next tick. Returns the number
    /// of jobs run.
    pub fn tick(&self, now: Instant) -> usize {
        let batch: Vec<Job> = {
            let mut inner = self.inner.borrow_mut();
            let (mut due, waiting): (Vec<Timer>, Vec<Timer>) =
                std::mem::take(&mut inner.timers)
                    .into_iter()
                    .partition(|t| t.due <= now);
            inner.timers = waiting;
            due.sort_by_key(|t| (t.due, t.seq));
            let mut batch: Vec<Job> = inner.queue.drain(..).collect();
            batch.extend(due.into_iter().map(|t| t.job));
            batch
        };
        let count = batch.len();
        for job in batch {
            job();
        }
        count
    }

    /// `true` when neither queued jobs nor timers remain.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.borrow();
        inner.queue.is_empty() && inner.timers.is_empty()
    }

    /// `true` when deferred jobs are waiting for the next tick.
    pub fn has_queued_jobs(&self) -> bool {
        !self.inner.borrow().queue.is_empty()
    }

    /// The earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.borrow().timers.iter().map(|t| t.due).min()
    }
}

// --- FAN-IN JOIN ---

/// Lifecycle of an [`AsyncTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created; `run` has not been called.
    New,
    /// Sub-operations are in flight.
    Run,
    /// Every sub-operation finished.
    Done,
    /// A sub-operation failed.
    Fail,
    /// Abandoned through `abort`.
    Abort,
}

/// Builds one sub-operation. Receives its index and the parameters given to `run`.
pub type TaskFactory = Box<dyn FnOnce(usize, &TagValues) -> AsyncCallbacks>;

/// Runs N sub-operations and joins them into a single outcome.
pub struct AsyncTask {
    tasks: Vec<TaskFactory>,
    status: Rc<Cell<TaskStatus>>,
    callbacks: AsyncCallbacks,
    event_loop: EventLoop,
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("tasks", &self.tasks.len())
            .field("status", &self.status.get())
            .finish()
    }
}

impl AsyncTask {
    /// Creates a task without sub-operations, scheduled on `event_loop`.
    pub fn new(event_loop: &EventLoop) -> Self {
        Self {
            tasks: Vec::new(),
            status: Rc::new(Cell::new(TaskStatus::New)),
            callbacks: AsyncCallbacks::new(),
            event_loop: event_loop.clone(),
        }
    }

    /// Registers a sub-operation. It is only started by [`AsyncTask::run`].
    pub fn add(
        &mut self,
        factory: impl FnOnce(usize, &TagValues) -> AsyncCallbacks + 'static,
    ) -> &mut Self {
        self.tasks.push(Box::new(factory));
        self
    }

    /// Number of registered sub-operations.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// `true` when no sub-operation was added.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Current state.
    pub fn status(&self) -> TaskStatus {
        self.status.get()
    }

    /// The aggregate outcome.
    pub fn callbacks(&self) -> AsyncCallbacks {
        self.callbacks.clone()
    }

    /// Starts every sub-operation. May be called once; with no sub-operations the
    /// aggregate still resolves on a later event-loop tick.
    pub fn run(&mut self, params: &TagValues) -> Result<AsyncCallbacks, AsyncTaskError> {
        let status = self.status.get();
        if status != TaskStatus::New {
            return Err(AsyncTaskError::AlreadyStarted(status));
        }
        self.status.set(TaskStatus::Run);

        let tasks = std::mem::take(&mut self.tasks);
        let total = tasks.len();
        log::debug!("Running async task with {} sub-operations.", total);

        if total == 0 {
            let status = Rc::clone(&self.status);
            let callbacks = self.callbacks.clone();
            self.event_loop.defer(move || {
                if status.get() == TaskStatus::Run {
                    status.set(TaskStatus::Done);
                    callbacks.call_done(());
                }
            });
            return Ok(self.callbacks.clone());
        }

        let completed = Rc::new(Cell::new(0usize));
        for (index, factory) in tasks.into_iter().enumerate() {
            let sub = factory(index, params);

            let (status, callbacks, completed) = (
                Rc::clone(&self.status),
                self.callbacks.clone(),
                Rc::clone(&completed),
            );
            sub.done(move |_| {
                completed.set(completed.get() + 1);
                if completed.get() == total && status.get() == TaskStatus::Run {
                    status.set(TaskStatus::Done);
                    callbacks.call_done(());
                }
            });

            let (status, callbacks) = (Rc::clone(&self.status), self.callbacks.clone());
            sub.fail(move |fault| {
                if status.get() == TaskStatus::Run {
                    log::debug!("Sub-operation {} failed: {}", index, fault);
                    status.set(TaskStatus::Fail);
                    callbacks.call_fail(fault.clone());
                }
            });
        }
        Ok(self.callbacks.clone())
    }

    /// Fails the aggregate immediately. In-flight sub-operations keep running and
    /// their later outcomes are ignored.
    pub fn abort(&mut self) {
        if matches!(self.status.get(), TaskStatus::New | TaskStatus::Run) {
            self.status.set(TaskStatus::Abort);
            self.tasks.clear();
            self.callbacks.call_fail(Fault::Aborted);
        }
    }
}
