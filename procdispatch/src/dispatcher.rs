// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! §4.1 the public [`Dispatcher`] and its operations.
//!
//! A dispatcher is generic over a single result type `T`: unlike the
//! dynamically-typed source this crate generalizes, a Rust work function's
//! return type is fixed at compile time, so one dispatcher instance
//! collects results of one type. Hosts that need to dispatch several
//! differently-shaped jobs either use one dispatcher per result type or
//! unify them behind an enum — a concrete consequence of static typing,
//! recorded as such rather than left implicit.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use nix::unistd::Pid;

use crate::codec::{Codec, DefaultCodec};
use crate::error::{DispatchError, DispatchResult};
use crate::event_loop::EventLoopAdapter;
use crate::fork::{self, ForkOutcome};
use crate::frame::{Frame, FrameType};
use crate::multiplexer::{self, PendingChild};
use crate::origin::Origin;
use crate::registry::{self, ResetAfterFork};

/// §3 Data Model's `max_children: positive integer or "unbounded"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxChildren {
    Bounded(usize),
    Unbounded,
}

impl MaxChildren {
    fn is_saturated(self, running: usize) -> bool {
        match self {
            Self::Bounded(max) => running >= max,
            Self::Unbounded => false,
        }
    }
}

/// §6's two recognized configuration keys.
pub struct DispatcherConfig {
    /// Bounds `queue()`-promoted work only; direct `submit_async` calls
    /// bypass it entirely (§3 Invariant 3).
    pub max_children: MaxChildren,
    /// An event-loop adapter to register children with instead of blocking
    /// `wait_one`/`wait_all`/`wait_pid` on the multiplexer.
    pub event_loop: Option<Arc<dyn EventLoopAdapter>>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_children: MaxChildren::Bounded(5), event_loop: None }
    }
}

/// A child's identifier: the OS pid `fork()` returned for it, unique within
/// the dispatcher for the child's lifetime (§3 ChildRecord). Returned by
/// [`Dispatcher::submit_async`]/[`Dispatcher::submit_batch`], both of which
/// always fork immediately, so this is never a placeholder for not-yet-forked
/// work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionId(Pid);

/// A function invoked once with a completed child's decoded value (§3
/// ChildRecord's `callback` field; §4.3's frame-dispatch procedure).
pub type Callback<T> = Box<dyn FnOnce(T) + Send>;

/// §9's own design note: "expose this as a tagged submission variant ...
/// rather than as runtime arity dispatch."
enum Delivery<T> {
    /// A callback-less submission: its result lands in `ordered_results` at
    /// an index assigned when the child is actually forked.
    Ordered,
    Callback(Callback<T>),
}

/// What a live child's completion should do with its decoded value.
enum Slot<T> {
    Ordered(usize),
    Callback(Callback<T>),
}

struct PendingWork<T> {
    origin: Origin,
    work: Box<dyn FnOnce() -> T + Send>,
    delivery: Delivery<T>,
}

struct MultiplexedChild {
    read_end: OwnedFd,
}

/// What processing exactly one completion produced.
enum Processed {
    /// Nothing was outstanding: no running children, nothing pending.
    Nothing,
    /// `pid` completed; if it was a callback-less submission, its slot in
    /// `ordered_results` was just filled at `ordered_idx`.
    Done { pid: Pid, ordered_idx: Option<usize> },
}

struct Inner<T, C> {
    owner_pid: Pid,
    max_children: Mutex<MaxChildren>,
    event_loop: Mutex<Option<Arc<dyn EventLoopAdapter>>>,
    running_count: AtomicUsize,
    origins: Mutex<HashMap<Pid, Origin>>,
    slots: Mutex<HashMap<Pid, Slot<T>>>,
    awaiting_multiplexer: Mutex<HashMap<Pid, MultiplexedChild>>,
    completed: Mutex<VecDeque<(Pid, DispatchResult<Frame>)>>,
    completed_cv: Condvar,
    pending: Mutex<VecDeque<PendingWork<T>>>,
    ordered_count: AtomicUsize,
    ordered_results: Mutex<Vec<Option<T>>>,
    deferred_error: Mutex<Option<DispatchError>>,
    _codec: PhantomData<fn() -> C>,
}

impl<T, C> ResetAfterFork for Inner<T, C>
where
    T: Send + 'static,
    C: Send + Sync + 'static,
{
    fn reset_after_fork(&self) {
        let dropped_running = self.running_count.swap(0, Ordering::SeqCst);
        self.origins.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        self.awaiting_multiplexer.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        self.completed.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        let dropped_queued = {
            let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped_running > 0 || dropped_queued > 0 {
            tracing::warn!(
                dropped_running,
                dropped_queued,
                "forked child reset a nested dispatcher it inherited from its parent"
            );
        }
    }
}

/// A handle to a parallel work-unit dispatcher (§4.1). Cloning a `Dispatcher`
/// shares the same underlying queue, running-child set, and configuration.
pub struct Dispatcher<T, C = DefaultCodec> {
    inner: Arc<Inner<T, C>>,
}

impl<T, C> Clone for Dispatcher<T, C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, C> Dispatcher<T, C>
where
    T: Send + 'static,
    C: Codec<T> + Send + Sync + 'static,
{
    /// # Errors
    /// Returns [`DispatchError::InvalidArgument`] if `config.max_children`
    /// is `MaxChildren::Bounded(0)`.
    pub fn new(config: DispatcherConfig) -> DispatchResult<Self> {
        if config.max_children == MaxChildren::Bounded(0) {
            return Err(DispatchError::invalid_argument("max_children must be positive"));
        }
        let inner = Arc::new(Inner {
            owner_pid: nix::unistd::getpid(),
            max_children: Mutex::new(config.max_children),
            event_loop: Mutex::new(config.event_loop),
            running_count: AtomicUsize::new(0),
            origins: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            awaiting_multiplexer: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            completed_cv: Condvar::new(),
            pending: Mutex::new(VecDeque::new()),
            ordered_count: AtomicUsize::new(0),
            ordered_results: Mutex::new(Vec::new()),
            deferred_error: Mutex::new(None),
            _codec: PhantomData,
        });
        let dyn_inner: Arc<dyn ResetAfterFork> = inner.clone();
        registry::register(&dyn_inner);
        Ok(Self { inner })
    }

    /// Forks a child running `work` immediately, subject only to `fork()`/
    /// `pipe()` failure: unlike `queue`, this never waits for a free slot
    /// (§3 Invariant 3 — "directly-async children are not counted against
    /// this bound"). Its result lands in the sequence returned by
    /// [`Dispatcher::wait_all`].
    ///
    /// # Errors
    /// Returns [`DispatchError::Fork`] or [`DispatchError::Pipe`] if forking
    /// fails, or surfaces a previously [deferred error](Self).
    #[track_caller]
    pub fn submit_async(&self, work: impl FnOnce() -> T + Send + 'static) -> DispatchResult<SubmissionId> {
        self.take_deferred_error()?;
        self.fork_new(Origin::here(), Box::new(work), Delivery::Ordered)
    }

    /// As [`Dispatcher::submit_async`], but `callback` is invoked with the
    /// decoded value instead of the result being collected into
    /// [`Dispatcher::wait_all`]'s sequence.
    ///
    /// # Errors
    /// See [`Dispatcher::submit_async`].
    #[track_caller]
    pub fn submit_async_with_callback(
        &self,
        work: impl FnOnce() -> T + Send + 'static,
        callback: impl FnOnce(T) + Send + 'static,
    ) -> DispatchResult<SubmissionId> {
        self.take_deferred_error()?;
        self.fork_new(Origin::here(), Box::new(work), Delivery::Callback(Box::new(callback)))
    }

    /// Submits `count` work items built from a shared factory, each given
    /// its index in `0..count`, returning their submission ids in order.
    /// Each sub-submission is callback-less (ordered mode).
    ///
    /// # Errors
    /// See [`Dispatcher::submit_async`].
    #[track_caller]
    pub fn submit_batch<F>(&self, count: usize, work: F) -> DispatchResult<Vec<SubmissionId>>
    where
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        self.take_deferred_error()?;
        let origin = Origin::here();
        let work = Arc::new(work);
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let work = work.clone();
            ids.push(self.fork_new(origin.clone(), Box::new(move || work(i)), Delivery::Ordered)?);
        }
        Ok(ids)
    }

    /// §4.5's real `queue` operation: appends `work` (callback-less) to the
    /// pending sequence, then attempts a drain.
    ///
    /// Returns `true` if at least one pending entry (not necessarily this
    /// one) was promoted during this call, `false` if `max_children` was
    /// already saturated.
    ///
    /// # Errors
    /// Returns a previously [deferred error](Self), or whatever forking a
    /// promoted entry can return.
    #[track_caller]
    pub fn queue(&self, work: impl FnOnce() -> T + Send + 'static) -> DispatchResult<bool> {
        self.queue_inner(Origin::here(), Box::new(work), Delivery::Ordered)
    }

    /// As [`Dispatcher::queue`], with a callback instead of ordered delivery.
    ///
    /// # Errors
    /// See [`Dispatcher::queue`].
    #[track_caller]
    pub fn queue_with_callback(
        &self,
        work: impl FnOnce() -> T + Send + 'static,
        callback: impl FnOnce(T) + Send + 'static,
    ) -> DispatchResult<bool> {
        self.queue_inner(Origin::here(), Box::new(work), Delivery::Callback(Box::new(callback)))
    }

    /// Forks a child that runs `work` for its side effects only: no pipe is
    /// opened, no result is ever collected, and the child is not counted
    /// against `max_children` or toward `count()`.
    ///
    /// # Errors
    /// Returns [`DispatchError::Fork`] if `fork(2)` fails.
    #[track_caller]
    pub fn start_detached(&self, work: impl FnOnce() + Send + 'static) -> DispatchResult<()> {
        self.take_deferred_error()?;
        let sibling_read_ends = self.sibling_read_fds();
        match fork::raw_fork()? {
            ForkOutcome::Child => {
                fork::bootstrap_child(sibling_read_ends);
                work();
                std::process::exit(0);
            }
            ForkOutcome::Parent { child_pid } => {
                // No result channel exists for a detached child; reap it on
                // a background thread purely to avoid leaving a zombie.
                std::thread::spawn(move || {
                    let _ = fork::reap_blocking(child_pid);
                });
                Ok(())
            }
        }
    }

    /// Number of work items queued but not yet running (§3's `pending`).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Number of children currently forked and awaiting a result (§4.1's
    /// `count()`).
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.running_count.load(Ordering::SeqCst)
    }

    /// Current concurrency bound.
    #[must_use]
    pub fn max_children(&self) -> MaxChildren {
        *self.inner.max_children.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Raises or lowers the concurrency bound. Raising it immediately drains
    /// queued work into the newly-available slots.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidArgument`] if `max` is
    /// `MaxChildren::Bounded(0)`, otherwise whatever forking a promoted
    /// entry can return.
    pub fn set_max_children(&self, max: MaxChildren) -> DispatchResult<()> {
        if max == MaxChildren::Bounded(0) {
            return Err(DispatchError::invalid_argument("max_children must be positive"));
        }
        *self.inner.max_children.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = max;
        self.drain_queue()?;
        Ok(())
    }

    /// The currently-attached event-loop adapter, if any.
    #[must_use]
    pub fn event_loop(&self) -> Option<Arc<dyn EventLoopAdapter>> {
        self.inner.event_loop.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Attaches or detaches an event-loop adapter. Takes effect for children
    /// forked after this call; children already awaiting the multiplexer are
    /// unaffected.
    pub fn set_event_loop(&self, adapter: Option<Arc<dyn EventLoopAdapter>>) {
        *self.inner.event_loop.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = adapter;
    }

    /// Blocks for the next child to complete, if any are outstanding,
    /// returning its value if it was a callback-less submission (`None` if
    /// it had a callback, or if nothing was outstanding at all).
    ///
    /// # Errors
    /// Returns [`DispatchError::ChildFailure`] if the completing child
    /// failed, or [`DispatchError::UnserializableResult`]/
    /// [`DispatchError::TransportError`] if its result could not be decoded.
    pub fn wait_one(&self) -> DispatchResult<Option<T>> {
        loop {
            match self.process_one()? {
                Processed::Nothing => return Ok(None),
                Processed::Done { ordered_idx: Some(idx), .. } => return Ok(self.take_ordered(idx)),
                Processed::Done { ordered_idx: None, .. } => continue,
            }
        }
    }

    /// Blocks until every running and queued item has completed, returning
    /// every callback-less submission's value indexed by submission order
    /// (completion order does not affect placement). Clears the ordered
    /// sequence afterward.
    ///
    /// # Errors
    /// See [`Dispatcher::wait_one`]; the first failing child's error is
    /// returned and later results are not collected.
    pub fn wait_all(&self) -> DispatchResult<Vec<T>> {
        loop {
            if matches!(self.process_one()?, Processed::Nothing) {
                break;
            }
        }
        let results =
            std::mem::take(&mut *self.inner.ordered_results.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
        self.inner.ordered_count.store(0, Ordering::SeqCst);
        Ok(results.into_iter().flatten().collect())
    }

    /// Blocks until `id`'s child completes, processing exactly that child's
    /// frame once it arrives. If `id` is not currently tracked (never
    /// submitted, or already consumed by an earlier wait), returns `None`
    /// silently rather than failing — a race with an already-consumed
    /// completion is legal, not an error (§8).
    ///
    /// # Errors
    /// Returns [`DispatchError::ChildFailure`] if a child that completes
    /// while waiting (not necessarily `id`'s) failed, since this dispatcher
    /// is single-threaded by contract and any synchronous wait may surface
    /// any outstanding child's failure.
    pub fn wait_pid(&self, id: SubmissionId) -> DispatchResult<Option<T>> {
        self.take_deferred_error()?;
        if !self.inner.origins.lock().unwrap_or_else(std::sync::PoisonError::into_inner).contains_key(&id.0) {
            return Ok(None);
        }
        loop {
            match self.process_one()? {
                Processed::Nothing => return Ok(None),
                Processed::Done { pid, ordered_idx } if pid == id.0 => {
                    return Ok(ordered_idx.and_then(|idx| self.take_ordered(idx)));
                }
                Processed::Done { .. } => continue,
            }
        }
    }

    fn take_ordered(&self, idx: usize) -> Option<T> {
        let mut results = self.inner.ordered_results.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        results.get_mut(idx).and_then(std::mem::Option::take)
    }

    fn sibling_read_fds(&self) -> Vec<RawFd> {
        self.inner
            .awaiting_multiplexer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|c| c.read_end.as_raw_fd())
            .collect()
    }

    fn take_deferred_error(&self) -> DispatchResult<()> {
        let mut guard = self.inner.deferred_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn store_deferred(&self, err: DispatchError) {
        tracing::error!(error = %err, "deferred dispatcher error raised while promoting queued work");
        *self.inner.deferred_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(err);
    }

    fn queue_inner(
        &self,
        origin: Origin,
        work: Box<dyn FnOnce() -> T + Send>,
        delivery: Delivery<T>,
    ) -> DispatchResult<bool> {
        self.take_deferred_error()?;
        self.inner.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push_back(PendingWork {
            origin,
            work,
            delivery,
        });
        Ok(self.drain_queue()? > 0)
    }

    /// Promotes pending entries while `max_children` allows it (§4.5).
    /// §3 Invariant 5: a failure already latched in `deferred_error` stops
    /// further promotion until the next synchronous entry consumes it.
    fn drain_queue(&self) -> DispatchResult<usize> {
        let mut promoted = 0;
        loop {
            if self.inner.deferred_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner).is_some() {
                return Ok(promoted);
            }
            let max = self.max_children();
            if max.is_saturated(self.count()) {
                return Ok(promoted);
            }
            let next = self.inner.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).pop_front();
            let Some(PendingWork { origin, work, delivery }) = next else { return Ok(promoted) };
            self.fork_new(origin, work, delivery)?;
            promoted += 1;
        }
    }

    fn fork_new(
        &self,
        origin: Origin,
        work: Box<dyn FnOnce() -> T + Send>,
        delivery: Delivery<T>,
    ) -> DispatchResult<SubmissionId> {
        let slot = match delivery {
            Delivery::Ordered => Slot::Ordered(self.inner.ordered_count.fetch_add(1, Ordering::SeqCst)),
            Delivery::Callback(callback) => Slot::Callback(callback),
        };

        let ends = fork::open_pipe()?;
        let sibling_read_ends = self.sibling_read_fds();

        match fork::raw_fork()? {
            ForkOutcome::Child => {
                drop(ends.read);
                fork::bootstrap_child(sibling_read_ends);
                crate::child::run_and_exit::<T, C, _>(ends.write, work);
            }
            ForkOutcome::Parent { child_pid } => {
                drop(ends.write);
                self.inner.origins.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(child_pid, origin);
                self.inner.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(child_pid, slot);
                self.inner.running_count.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(pid = child_pid.as_raw(), "forked child");

                if let Some(adapter) = self.event_loop() {
                    let inner = self.inner.clone();
                    adapter.register_child(
                        child_pid,
                        ends.read,
                        Box::new(move |pid, outcome| {
                            inner
                                .completed
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .push_back((pid, outcome));
                            inner.completed_cv.notify_all();
                        }),
                    )?;
                } else {
                    self.inner
                        .awaiting_multiplexer
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .insert(child_pid, MultiplexedChild { read_end: ends.read });
                }
                Ok(SubmissionId(child_pid))
            }
        }
    }

    /// Waits for and fully processes exactly one child's completion, from
    /// whichever source produces one first: the event loop's
    /// already-delivered completions, or a fresh blocking multiplexer wait.
    /// Dispatches the frame per §4.3: a callback-less slot's value is
    /// written into `ordered_results`, a callback slot's callback is invoked
    /// with it.
    fn process_one(&self) -> DispatchResult<Processed> {
        self.take_deferred_error()?;

        let delivered = self.inner.completed.lock().unwrap_or_else(std::sync::PoisonError::into_inner).pop_front();
        let (pid, frame_result) = match delivered {
            Some((pid, outcome)) => (pid, outcome),
            None => {
                let awaiting_count = self
                    .inner
                    .awaiting_multiplexer
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .len();

                if awaiting_count == 0 {
                    if self.count() == 0 && self.pending_count() == 0 {
                        return Ok(Processed::Nothing);
                    }
                    // Every outstanding child is event-loop-tracked: block
                    // until one of its completions is pushed and signaled.
                    let guard = self.inner.completed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    let mut guard = self
                        .inner
                        .completed_cv
                        .wait_while(guard, |q| q.is_empty())
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    let (pid, outcome) = guard.pop_front().expect("condvar woke with an empty queue");
                    (pid, outcome)
                } else {
                    let children: Vec<PendingChild> = self
                        .inner
                        .awaiting_multiplexer
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .iter()
                        .map(|(pid, c)| PendingChild {
                            pid: *pid,
                            read_end: c.read_end.try_clone().expect("duplicate read end for multiplexer wait"),
                        })
                        .collect();
                    let (pid, frame) = multiplexer::wait_for_one(&children)?;
                    self.inner
                        .awaiting_multiplexer
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .remove(&pid);
                    (pid, Ok(frame))
                }
            }
        };

        self.inner.running_count.fetch_sub(1, Ordering::SeqCst);
        let origin = self
            .inner
            .origins
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&pid)
            .unwrap_or_else(Origin::here);
        let slot = self.inner.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&pid);

        if let Err(e) = self.drain_queue() {
            self.store_deferred(e);
        }

        match frame_result {
            Ok(frame) => match frame.kind {
                FrameType::Result => {
                    let value: T = C::decode(&frame.payload)?;
                    let ordered_idx = match slot {
                        Some(Slot::Ordered(idx)) => {
                            let mut results =
                                self.inner.ordered_results.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                            if results.len() <= idx {
                                results.resize_with(idx + 1, || None);
                            }
                            results[idx] = Some(value);
                            Some(idx)
                        }
                        Some(Slot::Callback(callback)) => {
                            callback(value);
                            None
                        }
                        None => None,
                    };
                    Ok(Processed::Done { pid, ordered_idx })
                }
                FrameType::Error => Err(DispatchError::ChildFailure {
                    origin,
                    detail: String::from_utf8_lossy(&frame.payload).into_owned(),
                }),
            },
            Err(e) => Err(e),
        }
    }
}

impl<T, C> Drop for Dispatcher<T, C> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) > 1 {
            return;
        }
        if nix::unistd::getpid() != self.inner.owner_pid {
            return;
        }
        let running = self.inner.running_count.load(Ordering::SeqCst);
        let queued = self.inner.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len();
        if running > 0 || queued > 0 {
            tracing::warn!(
                running,
                queued,
                "dispatcher dropped with outstanding children; their results are lost and the children become unreachable"
            );
        }
    }
}
