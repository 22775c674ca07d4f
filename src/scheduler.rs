// Deferred-task scheduling. Grounded on `ewe_channels::executor`'s split between
// a `Task`/`Executor` (the enqueue side) and an `ExecutionService` (the drain
// side) -- here the two sides are the same `QueueScheduler` object since every
// task in this crate is a plain `FnOnce()`, not a `Future` needing a waker.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, RawWaker, RawWakerVTable, Waker};

/// A pluggable microtask-style executor. `spec.md` §4.A: "Exposes `schedule(task)`
/// to enqueue a nullary task for deferred execution... No exception propagation
/// from tasks back to schedulers."
pub trait Scheduler {
    fn schedule(&self, task: Box<dyn FnOnce()>);
}

/// FIFO queue of deferred tasks. Serves as both the default "microtask"
/// scheduler and the "blocking-test" macrotask scheduler `spec.md` §4.A
/// describes -- there is no host event loop in a bare Rust crate to provide an
/// implicit microtask drain, so both modes reduce to "a queue someone actively
/// drains"; see `DESIGN.md` for this collapse.
#[derive(Default)]
pub struct QueueScheduler {
    queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl QueueScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every task currently queued, in FIFO order, including any new
    /// tasks those tasks schedule, until the queue is empty. Returns the
    /// number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.queue.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Runs exactly the batch of tasks queued *right now*, without draining
    /// tasks those tasks in turn schedule. Mirrors a single macrotask "tick".
    pub fn tick_once(&self) -> usize {
        let batch: Vec<_> = {
            let mut q = self.queue.borrow_mut();
            q.drain(..).collect()
        };
        let ran = batch.len();
        for task in batch {
            task();
        }
        ran
    }

    pub fn is_idle(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, task: Box<dyn FnOnce()>) {
        self.queue.borrow_mut().push_back(task);
    }
}

thread_local! {
    static GLOBAL_SCHEDULER: RefCell<Rc<dyn Scheduler>> =
        RefCell::new(Rc::new(QueueScheduler::new()));
}

/// Replaces the process-wide (thread-wide, here) scheduler. `spec.md` §4.A /
/// §9: "treat the scheduler as a process-wide injected singleton with
/// get/set".
pub fn set(scheduler: Rc<dyn Scheduler>) {
    GLOBAL_SCHEDULER.with(|cell| *cell.borrow_mut() = scheduler);
}

#[must_use]
pub fn get() -> Rc<dyn Scheduler> {
    GLOBAL_SCHEDULER.with(|cell| cell.borrow().clone())
}

/// Enqueues `task` on the current global scheduler.
pub fn schedule(task: impl FnOnce() + 'static) {
    get().schedule(Box::new(task));
}

type BoxedFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Drives a fire-and-forget future to completion by repolling it on the
/// global scheduler whenever it wakes itself. Used by `transform::Source`'s
/// future/factory variants to resolve a source without a real async
/// runtime -- `spec.md` §4.H: "A future/factory source is resolved on the
/// next tick". Grounded on `ewe_channels::executor`'s waker-driven `Task`,
/// collapsed from `Arc`/cross-thread re-queueing to a single-threaded `Rc`
/// since this crate has no thread pool to hand wakeups to.
pub fn spawn(fut: impl Future<Output = ()> + 'static) {
    let cell = Rc::new(RefCell::new(Box::pin(fut) as BoxedFuture));
    poll_spawned(cell);
}

fn poll_spawned(fut: Rc<RefCell<BoxedFuture>>) {
    let waker = rc_waker(fut.clone());
    let mut cx = Context::from_waker(&waker);
    let pending = fut.borrow_mut().as_mut().poll(&mut cx).is_pending();
    if !pending {
        // future resolved; drop our handle, nothing left to repoll.
        drop(fut);
    }
}

fn rc_waker(fut: Rc<RefCell<BoxedFuture>>) -> Waker {
    // `Waker` erases its data behind a thin `*const ()`; an `Rc<dyn Trait>`
    // is a fat pointer, so the wake callback is boxed first (`Box<dyn Fn()>`
    // is a sized, thin-pointer-friendly value) and that box is what gets
    // refcounted.
    let wake_fn: Rc<Box<dyn Fn()>> = Rc::new(Box::new(move || {
        let fut = fut.clone();
        schedule(move || poll_spawned(fut));
    }));
    unsafe { Waker::from_raw(clone_raw(Rc::into_raw(wake_fn).cast())) }
}

unsafe fn clone_raw(data: *const ()) -> RawWaker {
    Rc::increment_strong_count(data.cast::<Box<dyn Fn()>>());
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_raw(data: *const ()) {
    let rc = Rc::from_raw(data.cast::<Box<dyn Fn()>>());
    (rc)();
}

unsafe fn wake_by_ref_raw(data: *const ()) {
    let rc = Rc::from_raw(data.cast::<Box<dyn Fn()>>());
    (rc)();
    std::mem::forget(rc);
}

unsafe fn drop_raw(data: *const ()) {
    drop(Rc::from_raw(data.cast::<Box<dyn Fn()>>()));
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);
