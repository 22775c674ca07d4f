// Demand-driven internal queue shared by every "producing" iterator in this
// crate (transform, multi-transform, union). `spec.md` §4.G.
//
// Rust has no inheritance, so the JS source's "buffered iterator base class"
// becomes `BufferedCore<T>` (the embedded state: queue, read lock, pushed
// counter) plus the `BufferedSubclass<T>` trait (the three overridable hooks:
// `begin`, `fill`, `flush`). The free functions below are the "base class
// methods" -- they take `&Rc<S>` explicitly wherever they need to schedule a
// continuation that outlives the call, mirroring `crate::core`'s
// `init_dual_mode`/`arm_drain`/`drain_loop` free-function style.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::{end_iterator, AsyncIterator, Core, Iter};
use crate::error::Result;
use crate::list::List;
use crate::scheduler;
use crate::state::IterState;

/// Above this many items requested in one refill pass, the request is
/// capped and finished across multiple `_fillBuffer` passes. `spec.md` §4.G:
/// "needed = min(maxBufferSize − buffer.length, 128)".
const MAX_FILL_PER_PASS: usize = 128;

pub struct BufferedCore<T: Clone + 'static> {
    core: Core<T>,
    buffer: RefCell<List<T>>,
    max_buffer_size: usize,
    reading: Cell<bool>,
    pushed_count: Cell<usize>,
    source_started: Cell<bool>,
}

impl<T: Clone + 'static> BufferedCore<T> {
    /// `spec.md` §3: "positive integer or +∞; non-finite non-∞ coerces to 4;
    /// values <1 coerce to 1." `None` is this crate's `+∞`.
    #[must_use]
    pub fn new(max_buffer_size: Option<usize>) -> Self {
        let max = match max_buffer_size {
            None => usize::MAX,
            Some(0) => 1,
            Some(n) => n,
        };
        Self {
            core: Core::new(),
            buffer: RefCell::new(List::new()),
            max_buffer_size: max,
            // held from construction until `_init`'s `begin` hook completes --
            // `spec.md` §4.G: "Constructor state: INIT; reading=true."
            reading: Cell::new(true),
            pushed_count: Cell::new(0),
            source_started: Cell::new(false),
        }
    }

    #[must_use]
    pub fn core(&self) -> &Core<T> {
        &self.core
    }

    #[must_use]
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer.borrow().length()
    }

    #[must_use]
    pub fn source_started(&self) -> bool {
        self.source_started.get()
    }

    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.reading.get()
    }

    #[must_use]
    pub fn pushed_count(&self) -> usize {
        self.pushed_count.get()
    }

    /// Drops every buffered item. `spec.md` §5: "`destroy` ... buffer is
    /// cleared." Concrete subclasses call this from their `destroy_hook`
    /// override -- see the trait doc on [`BufferedSubclass`].
    pub fn clear(&self) {
        self.buffer.borrow_mut().clear();
    }

    /// `spec.md` §4.G `_push`: "no-op if done; else increments pushedCount,
    /// appends to buffer, and sets readable=true."
    pub fn push(&self, item: T) {
        if self.core.done() {
            return;
        }
        self.pushed_count.set(self.pushed_count.get() + 1);
        self.buffer.borrow_mut().push(item);
        self.core.set_readable(true);
    }
}

/// The three overridable hooks of a buffered iterator, plus the `Rc`-scoped
/// free functions every concrete producer (`TransformIterator`,
/// `MultiTransformIterator`, `UnionIterator`) drives its lifecycle through.
///
/// Rust has no virtual dispatch for `close()`/`destroy()`, so every concrete
/// type implementing this trait must also override those two methods on its
/// own `AsyncIterator` impl: `close` to call `buffered::close(&rc)` (instead
/// of inheriting `AsyncIterator`'s plain-base-iterator default), and
/// `destroy_hook` to call `rc.buffered().clear()` before `done(None)` so the
/// buffer is actually dropped per `spec.md` §5.
pub trait BufferedSubclass<T: Clone + 'static>: AsyncIterator<T> + 'static {
    fn buffered(&self) -> &BufferedCore<T>;

    /// `spec.md` §4.G `_init`: "invokes subclass `_begin(done)`. `done` must
    /// be called exactly once." Default: nothing to wait on.
    fn begin(rc: &Rc<Self>, done: Box<dyn FnOnce()>)
    where
        Self: Sized,
    {
        let _ = rc;
        done();
    }

    /// `spec.md` §4.G `_fillBuffer`: invoke with `needed` = how many more
    /// items the buffer can currently hold; the subclass calls
    /// `rc.buffered().push(item)` some number of times (possibly zero, e.g.
    /// if the source itself has nothing readable right now) and then must
    /// call `done` exactly once.
    fn fill(rc: &Rc<Self>, needed: usize, done: Box<dyn FnOnce()>)
    where
        Self: Sized;

    /// `spec.md` §4.G `_flush`: runs once, during `_completeClose`, before
    /// the iterator is permitted to reach `ENDED`. Default: nothing to wait
    /// on.
    fn flush(rc: &Rc<Self>, done: Box<dyn FnOnce()>)
    where
        Self: Sized,
    {
        let _ = rc;
        done();
    }

    /// `spec.md` §4.H `_closeWhenDone`: what happens when the bound source
    /// reports `end`. Default (per the base transform iterator): `close()`.
    /// Multi-transform overrides this to wait for its sub-iterator queue to
    /// drain first.
    fn close_when_done(rc: &Rc<Self>)
    where
        Self: Sized,
    {
        close(rc);
    }
}

/// Schedules `_init(autoStart)` for the next tick, per `spec.md` §4.G.
pub fn schedule_init<T, S>(rc: &Rc<S>, auto_start: bool)
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    let rc = rc.clone();
    scheduler::schedule(move || init(&rc, auto_start));
}

fn init<T, S>(rc: &Rc<S>, auto_start: bool)
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    let rc_for_done = rc.clone();
    S::begin(
        rc,
        Box::new(move || {
            let b = rc_for_done.buffered();
            b.reading.set(false);
            b.core.change_state(IterState::Open);
            if auto_start {
                let rc2 = rc_for_done.clone();
                scheduler::schedule(move || fill_buffer(&rc2));
            } else {
                b.core.set_readable(true);
            }
        }),
    );
}

/// `spec.md` §4.G `read()`.
pub fn read<T, S>(rc: &Rc<S>) -> Option<T>
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    let b = rc.buffered();
    if b.core.done() {
        return None;
    }
    b.source_started.set(true);

    let item = b.buffer.borrow_mut().shift();
    let Some(item) = item else {
        b.core.set_readable(false);
        return None;
    };

    if !b.reading.get() && b.buffer_len() < b.max_buffer_size {
        if !b.core.closed() {
            let rc2 = rc.clone();
            scheduler::schedule(move || fill_buffer(&rc2));
        } else if b.buffer.borrow().empty() {
            schedule_end(rc);
        }
    }

    Some(item)
}

/// `spec.md` §4.G `_fillBuffer`.
pub fn fill_buffer<T, S>(rc: &Rc<S>)
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    let b = rc.buffered();
    if b.reading.get() {
        return;
    }
    if b.core.closed() {
        complete_close(rc);
        return;
    }

    let needed = b.max_buffer_size.saturating_sub(b.buffer_len()).min(MAX_FILL_PER_PASS);
    if needed == 0 {
        return;
    }

    tracing::trace!(needed, buffer_len = b.buffer_len(), "starting a buffer refill pass");
    b.reading.set(true);
    b.pushed_count.set(0);
    let rc2 = rc.clone();
    S::fill(rc, needed, Box::new(move || fill_done(&rc2)));
}

/// Acquires the read lock, defers a tick, releases, then fills -- `spec.md`
/// §4.G `_fillBufferAsync`, used by subclasses whose own `fill` hook needs to
/// yield once before it can know how much it can push (e.g. resolving a
/// still-pending future source).
pub fn fill_buffer_async<T, S>(rc: &Rc<S>)
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    let b = rc.buffered();
    if b.reading.get() {
        return;
    }
    b.reading.set(true);
    let rc2 = rc.clone();
    scheduler::schedule(move || {
        rc2.buffered().reading.set(false);
        fill_buffer(&rc2);
    });
}

fn fill_done<T, S>(rc: &Rc<S>)
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    let b = rc.buffered();
    b.reading.set(false);
    if b.core.closed() {
        complete_close(rc);
    } else if b.pushed_count.get() > 0 {
        b.core.set_readable(true);
        if b.buffer_len() * 2 < b.max_buffer_size {
            let rc2 = rc.clone();
            scheduler::schedule(move || fill_buffer(&rc2));
        }
    }
}

/// `spec.md` §4.G `close()`.
pub fn close<T, S>(rc: &Rc<S>)
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    let b = rc.buffered();
    if b.core.state() >= IterState::Closing {
        return;
    }
    if b.reading.get() {
        b.core.change_state(IterState::Closing);
    } else {
        complete_close(rc);
    }
}

/// `spec.md` §4.G `_completeClose`.
fn complete_close<T, S>(rc: &Rc<S>)
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    let b = rc.buffered();
    if !b.core.change_state(IterState::Closed) {
        return;
    }
    b.reading.set(true);
    let rc2 = rc.clone();
    S::flush(
        rc,
        Box::new(move || {
            let b = rc2.buffered();
            b.reading.set(false);
            if b.buffer.borrow().empty() {
                schedule_end(&rc2);
            }
        }),
    );
}

/// Binds `iter` as `rc`'s single source: claims it via the single-owner
/// destination marker, closes `rc` immediately if `iter` is already `done`,
/// and otherwise wires the three listeners `spec.md` §4.H's `set source`
/// describes (`end`, `readable`, `error`). Shared by `transform` and
/// `multi_transform`, whose sources are both a single `Iter<T>` of the same
/// element type the producer itself yields.
pub fn bind_source<T, S>(rc: &Rc<S>, iter: Iter<T>) -> Result<Iter<T>>
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    iter.0.core().bind_destination()?;

    if iter.done() {
        close(rc);
        return Ok(iter);
    }

    let weak_end: Weak<S> = Rc::downgrade(rc);
    iter.0.core().events.on_end(move || {
        if let Some(strong) = weak_end.upgrade() {
            S::close_when_done(&strong);
        }
    });

    let weak_readable: Weak<S> = Rc::downgrade(rc);
    iter.0.core().events.on_readable(move || {
        if let Some(strong) = weak_readable.upgrade() {
            if strong.buffered().source_started() {
                fill_buffer(&strong);
            }
        }
    });

    let weak_error: Weak<S> = Rc::downgrade(rc);
    iter.0.core().events.on_error(move |cause| {
        if let Some(strong) = weak_error.upgrade() {
            strong.core().events.emit_error(cause);
        }
    });

    Ok(iter)
}

fn schedule_end<T, S>(rc: &Rc<S>)
where
    T: Clone + 'static,
    S: BufferedSubclass<T>,
{
    let weak = Rc::downgrade(rc);
    scheduler::schedule(move || {
        if let Some(strong) = weak.upgrade() {
            end_iterator(strong.as_ref() as &dyn AsyncIterator<T>, false, false);
        }
    });
}
