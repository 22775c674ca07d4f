// Offset/limit/filter/map/transform/prepend/append composition. `spec.md`
// §4.I. Built directly on `BufferedCore`/`buffered::bind_source` (the same
// base `transform.rs` uses) rather than wrapping `TransformIterator`, since
// this component needs two extra hooks transform's `begin`/`flush` don't
// expose by default: draining a `prepend` source before the first fill, and
// a `append` source during close.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::buffered::{self, BufferedCore, BufferedSubclass};
use crate::core::{init_dual_mode, AsyncIterator, Core, Iter};
use crate::emitter::Cause;
use crate::primitive::ArrayIter;
use crate::transform::{SourceInput, Transformer};

/// `offset == INFINITE_OFFSET` models the spec's `offset = +∞`: every item
/// is skipped forever, so construction pins `limit` to zero immediately
/// instead of actually counting down from `usize::MAX`.
pub const INFINITE_OFFSET: usize = usize::MAX;

pub enum PrependAppendSource<T: Clone + 'static> {
    Array(Vec<T>),
    Iter(Iter<T>),
}

impl<T: Clone + 'static> PrependAppendSource<T> {
    fn into_iter(self) -> Iter<T> {
        match self {
            PrependAppendSource::Array(items) => Iter::new(ArrayIter::new(items, true, true) as Rc<dyn AsyncIterator<T>>),
            PrependAppendSource::Iter(it) => it,
        }
    }
}

/// Per-item composition options, applied in the fixed order `spec.md` §4.I
/// lists: filter, offset, map, transform, limit. `prepend`/`append` bookend
/// the whole pipeline via `_begin`/`_flush`.
pub struct SimpleTransformOptions<T: Clone + 'static> {
    pub filter: Option<Box<dyn FnMut(&T) -> bool>>,
    pub offset: usize,
    pub map: Option<Box<dyn FnMut(T) -> Option<T>>>,
    pub optional: bool,
    pub transform: Option<Box<dyn Transformer<T>>>,
    pub limit: Option<usize>,
    pub prepend: Option<PrependAppendSource<T>>,
    pub append: Option<PrependAppendSource<T>>,
    pub destroy_source: bool,
    pub auto_start: bool,
    pub max_buffer_size: Option<usize>,
}

impl<T: Clone + 'static> Default for SimpleTransformOptions<T> {
    fn default() -> Self {
        Self {
            filter: None,
            offset: 0,
            map: None,
            optional: false,
            transform: None,
            limit: None,
            prepend: None,
            append: None,
            destroy_source: true,
            auto_start: true,
            max_buffer_size: None,
        }
    }
}

pub struct SimpleTransformIterator<T: Clone + 'static> {
    core: BufferedCore<T>,
    source: RefCell<Option<Iter<T>>>,
    pending_source: RefCell<Option<SourceInput<T>>>,
    filter: RefCell<Option<Box<dyn FnMut(&T) -> bool>>>,
    offset_remaining: Cell<usize>,
    map: RefCell<Option<Box<dyn FnMut(T) -> Option<T>>>>,
    optional: bool,
    user_transform: Option<Box<dyn Transformer<T>>>,
    limit_remaining: Cell<Option<usize>>,
    prepend: RefCell<Option<Iter<T>>>,
    append: RefCell<Option<Iter<T>>>,
    destroy_source: bool,
    self_weak: RefCell<Weak<Self>>,
}

/// Builds a `SimpleTransformIterator` reading from `source` with `opts`
/// applied, returned as the crate's usual type-erased handle.
#[must_use]
pub fn build<T: Clone + 'static>(source: Iter<T>, opts: SimpleTransformOptions<T>) -> Iter<T> {
    let limit = if opts.offset == INFINITE_OFFSET { Some(0) } else { opts.limit };
    let rc = Rc::new(SimpleTransformIterator {
        core: BufferedCore::new(opts.max_buffer_size),
        source: RefCell::new(None),
        pending_source: RefCell::new(Some(SourceInput::Ready(source))),
        filter: RefCell::new(opts.filter),
        offset_remaining: Cell::new(if opts.offset == INFINITE_OFFSET { 0 } else { opts.offset }),
        map: RefCell::new(opts.map),
        optional: opts.optional,
        user_transform: opts.transform,
        limit_remaining: Cell::new(limit),
        prepend: RefCell::new(opts.prepend.map(PrependAppendSource::into_iter)),
        append: RefCell::new(opts.append.map(PrependAppendSource::into_iter)),
        destroy_source: opts.destroy_source,
        self_weak: RefCell::new(Weak::new()),
    });
    *rc.self_weak.borrow_mut() = Rc::downgrade(&rc);
    init_dual_mode::<T, _>(&rc);
    buffered::schedule_init(&rc, opts.auto_start);
    Iter::new(rc as Rc<dyn AsyncIterator<T>>)
}

fn weak<T: Clone + 'static>(rc: &SimpleTransformIterator<T>) -> Weak<SimpleTransformIterator<T>> {
    rc.self_weak.borrow().clone()
}

fn strong<T: Clone + 'static>(rc: &SimpleTransformIterator<T>) -> Rc<SimpleTransformIterator<T>> {
    weak(rc).upgrade().expect("simple transform iterator alive during its own operation")
}

impl<T: Clone + 'static> AsyncIterator<T> for SimpleTransformIterator<T> {
    fn core(&self) -> &Core<T> {
        self.core.core()
    }

    fn read(&self) -> Option<T> {
        buffered::read(&strong(self))
    }

    fn weak_dyn(&self) -> Weak<dyn AsyncIterator<T>> {
        weak(self)
    }

    fn close(&self) {
        buffered::close(&strong(self));
    }

    fn destroy_hook(&self, _cause: Option<Cause>, done: &mut dyn FnMut(Option<Cause>)) {
        self.core.clear();
        done(None);
    }

    fn on_end_hook(&self) {
        if let Some(source) = self.source.borrow_mut().take() {
            source.0.core().events.clear_all();
            if self.destroy_source {
                source.destroy(None);
            }
        }
    }
}

/// Subscribes `target`'s `data` (via `for_each`, which arms flow mode) to
/// push straight into `rc`'s buffer, and its `end` to signal `done`.
/// `spec.md` §4.I: "an inserter that attaches `data→push` and `end→done`."
fn drain_into_buffer<T: Clone + 'static>(rc: &Rc<SimpleTransformIterator<T>>, source: Iter<T>, done: Box<dyn FnOnce()>) {
    if source.done() {
        done();
        return;
    }
    let done_slot: Rc<RefCell<Option<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(Some(done)));
    let done_slot2 = done_slot.clone();
    source.0.core().events.on_end(move || {
        if let Some(d) = done_slot2.borrow_mut().take() {
            d();
        }
    });
    let rc2 = rc.clone();
    source.for_each(move |item| rc2.core.push(item));
}

impl<T: Clone + 'static> BufferedSubclass<T> for SimpleTransformIterator<T> {
    fn buffered(&self) -> &BufferedCore<T> {
        &self.core
    }

    fn begin(rc: &Rc<Self>, done: Box<dyn FnOnce()>) {
        let rc_after_source = rc.clone();
        let after_source: Box<dyn FnOnce()> = Box::new(move || match rc_after_source.prepend.borrow_mut().take() {
            Some(prepend_source) => drain_into_buffer(&rc_after_source, prepend_source, done),
            None => done(),
        });

        match rc.pending_source.borrow_mut().take() {
            Some(SourceInput::Ready(iter)) => {
                bind(rc, iter);
                after_source();
            }
            Some(SourceInput::Factory(make)) => {
                bind(rc, make());
                after_source();
            }
            Some(SourceInput::Future(fut)) => {
                let rc2 = rc.clone();
                crate::scheduler::spawn(async move {
                    let iter = fut.await;
                    bind(&rc2, iter);
                    after_source();
                });
            }
            None => after_source(),
        }
    }

    /// `spec.md` §4.I: filter -> offset -> map -> transform -> limit, driven
    /// in the same "schedule the next attempt" style as `transform.rs`'s
    /// `_readAndTransform`.
    fn fill(rc: &Rc<Self>, needed: usize, done: Box<dyn FnOnce()>) {
        if rc.limit_remaining.get() == Some(0) {
            buffered::close(rc);
            done();
            return;
        }
        step(rc.clone(), needed, Rc::new(RefCell::new(Some(done))));
    }

    fn flush(rc: &Rc<Self>, done: Box<dyn FnOnce()>) {
        match rc.append.borrow_mut().take() {
            Some(append_source) => drain_into_buffer(rc, append_source, done),
            None => done(),
        }
    }
}

fn bind<T: Clone + 'static>(rc: &Rc<SimpleTransformIterator<T>>, iter: Iter<T>) {
    if rc.core.core().done() {
        if rc.destroy_source {
            iter.destroy(None);
        }
        return;
    }
    match buffered::bind_source(rc, iter) {
        Ok(iter) => *rc.source.borrow_mut() = Some(iter),
        Err(err) => {
            let cause: Cause = Rc::new(anyhow::Error::new(err));
            rc.core.core().events.emit_error(&cause);
            buffered::close(rc);
        }
    }
}

type DoneSlot = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

/// See `transform::finish` -- same shared-`done`-slot shape, same contract:
/// exactly one of `step`'s early-return branches is supposed to fire this.
fn finish(done: &DoneSlot) {
    match done.borrow_mut().take() {
        Some(d) => d(),
        None => {
            tracing::error!("transform `_read`'s `done` callback was invoked more than once");
            panic!("{}", crate::error::IteratorError::DoneCalledTwice("_read"));
        }
    }
}

fn limited_push<T: Clone + 'static>(rc: &Rc<SimpleTransformIterator<T>>, item: T) {
    match rc.limit_remaining.get() {
        Some(0) => {}
        Some(remaining) => {
            let next = remaining - 1;
            rc.limit_remaining.set(Some(next));
            rc.core.push(item);
            if next == 0 {
                buffered::close(rc);
            }
        }
        None => rc.core.push(item),
    }
}

fn step<T: Clone + 'static>(rc: Rc<SimpleTransformIterator<T>>, needed: usize, done: DoneSlot) {
    loop {
        if rc.core.core().closed() || rc.core.pushed_count() >= needed || rc.limit_remaining.get() == Some(0) {
            finish(&done);
            return;
        }

        let Some(source) = rc.source.borrow().clone() else {
            finish(&done);
            return;
        };

        let Some(raw_item) = source.read() else {
            finish(&done);
            return;
        };

        if let Some(filter) = rc.filter.borrow_mut().as_mut() {
            if !filter(&raw_item) {
                continue;
            }
        }

        if rc.offset_remaining.get() > 0 {
            rc.offset_remaining.set(rc.offset_remaining.get() - 1);
            continue;
        }

        let mapped = match rc.map.borrow_mut().as_mut() {
            Some(map) => match map(raw_item.clone()) {
                Some(value) => value,
                None => {
                    if rc.optional {
                        limited_push(&rc, raw_item);
                    }
                    continue;
                }
            },
            None => raw_item,
        };

        match &rc.user_transform {
            Some(transformer) => {
                let count_before = rc.core.pushed_count();
                let optional = rc.optional;
                let fallback = mapped.clone();
                let rc_next = rc.clone();
                let done_next = done.clone();
                let next: Box<dyn FnOnce()> = Box::new(move || {
                    if optional && rc_next.core.pushed_count() == count_before {
                        limited_push(&rc_next, fallback);
                    }
                    step(rc_next, needed, done_next);
                });
                let rc_push = rc.clone();
                let push = move |v: T| limited_push(&rc_push, v);
                transformer.transform(mapped, &push, next);
                return;
            }
            None => {
                limited_push(&rc, mapped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Iter;
    use crate::primitive::ArrayIter;
    use crate::scheduler::{self as sched_mod, QueueScheduler};
    use crate::testing::block_on;

    fn new_scheduler() -> Rc<QueueScheduler> {
        let sched = Rc::new(QueueScheduler::new());
        sched_mod::set(sched.clone());
        sched
    }

    fn array_source(items: Vec<i32>) -> Iter<i32> {
        Iter::new(ArrayIter::new(items, true, true) as Rc<dyn AsyncIterator<i32>>)
    }

    /// `spec.md` §8 scenario 2.
    #[test]
    fn offset_and_limit_compose() {
        let sched = new_scheduler();
        let source = array_source(vec![10, 20, 30, 40, 50]);
        let out = build(
            source,
            SimpleTransformOptions {
                offset: 1,
                limit: Some(2),
                ..Default::default()
            },
        );
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![20, 30]);
    }

    #[test]
    fn filter_runs_before_offset() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3, 4, 5, 6]);
        let out = build(
            source,
            SimpleTransformOptions {
                filter: Some(Box::new(|x: &i32| x % 2 == 0)),
                offset: 1,
                ..Default::default()
            },
        );
        // evens are [2, 4, 6]; offset 1 of the filtered stream drops the 2.
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![4, 6]);
    }

    #[test]
    fn infinite_offset_pins_limit_to_zero() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3]);
        let out = build(
            source,
            SimpleTransformOptions {
                offset: INFINITE_OFFSET,
                ..Default::default()
            },
        );
        let result = block_on(&sched, out.to_array(None));
        assert!(result.is_empty());
    }

    #[test]
    fn prepend_runs_before_the_source_and_append_after() {
        let sched = new_scheduler();
        let source = array_source(vec![2, 3]);
        let out = build(
            source,
            SimpleTransformOptions {
                prepend: Some(PrependAppendSource::Array(vec![1])),
                append: Some(PrependAppendSource::Array(vec![4])),
                ..Default::default()
            },
        );
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![1, 2, 3, 4]);
    }

    #[test]
    fn map_to_none_without_optional_drops_the_item() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3, 4]);
        let out = build(
            source,
            SimpleTransformOptions {
                map: Some(Box::new(|x: i32| if x % 2 == 0 { Some(x) } else { None })),
                ..Default::default()
            },
        );
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![2, 4]);
    }

    #[test]
    fn map_to_none_with_optional_pushes_the_original() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3]);
        let out = build(
            source,
            SimpleTransformOptions {
                map: Some(Box::new(|x: i32| if x % 2 == 0 { Some(x * 10) } else { None })),
                optional: true,
                ..Default::default()
            },
        );
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![1, 20, 3]);
    }

    /// `spec.md` §7: "`done` callback invoked twice inside ... `_read`" is a
    /// contract violation, not a silent no-op.
    #[test]
    #[should_panic(expected = "done")]
    fn finishing_a_done_slot_twice_panics() {
        let done: DoneSlot = Rc::new(RefCell::new(Some(Box::new(|| {}))));
        finish(&done);
        finish(&done);
    }
}
