// Per-item sub-iterator expansion with FIFO drain. `spec.md` §4.J. Each
// source item becomes its own sub-iterator (by default a one-shot
// `Single`); the FIFO lets several sub-iterators be in flight while only
// the head is actively drained into the buffer, matching the spec's
// "from the head transformer, pull up to `count` items" wording.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::buffered::{self, BufferedCore, BufferedSubclass};
use crate::core::{init_dual_mode, AsyncIterator, Core, Iter};
use crate::emitter::Cause;
use crate::primitive::Single;
use crate::transform::SourceInput;

/// `spec.md` §4.J: "`_createTransformer(item)` (default: singleton of the
/// item cast)". A user-supplied factory can expand one source item into any
/// number of output items by handing back a richer sub-iterator.
pub trait SubIteratorFactory<T: Clone + 'static> {
    fn create(&self, item: T) -> Iter<T>;
}

pub struct DefaultSingletonFactory;

impl<T: Clone + 'static> SubIteratorFactory<T> for DefaultSingletonFactory {
    fn create(&self, item: T) -> Iter<T> {
        Iter::new(Single::new(Some(item)) as Rc<dyn AsyncIterator<T>>)
    }
}

struct QueueEntry<T: Clone + 'static> {
    item: RefCell<Option<T>>,
    sub: Iter<T>,
}

pub struct MultiTransformIterator<T: Clone + 'static> {
    core: BufferedCore<T>,
    source: RefCell<Option<Iter<T>>>,
    pending_source: RefCell<Option<SourceInput<T>>>,
    factory: Box<dyn SubIteratorFactory<T>>,
    optional: bool,
    destroy_source: bool,
    queue: RefCell<VecDeque<Rc<QueueEntry<T>>>>,
    self_weak: RefCell<Weak<Self>>,
}

#[must_use]
pub fn build<T: Clone + 'static>(
    source: Iter<T>,
    factory: Box<dyn SubIteratorFactory<T>>,
    optional: bool,
    destroy_source: bool,
    auto_start: bool,
    max_buffer_size: Option<usize>,
) -> Iter<T> {
    let rc = Rc::new(MultiTransformIterator {
        core: BufferedCore::new(max_buffer_size),
        source: RefCell::new(None),
        pending_source: RefCell::new(Some(SourceInput::Ready(source))),
        factory,
        optional,
        destroy_source,
        queue: RefCell::new(VecDeque::new()),
        self_weak: RefCell::new(Weak::new()),
    });
    *rc.self_weak.borrow_mut() = Rc::downgrade(&rc);
    init_dual_mode::<T, _>(&rc);
    buffered::schedule_init(&rc, auto_start);
    Iter::new(rc as Rc<dyn AsyncIterator<T>>)
}

fn weak<T: Clone + 'static>(rc: &MultiTransformIterator<T>) -> Weak<MultiTransformIterator<T>> {
    rc.self_weak.borrow().clone()
}

fn strong<T: Clone + 'static>(rc: &MultiTransformIterator<T>) -> Rc<MultiTransformIterator<T>> {
    weak(rc).upgrade().expect("multi-transform iterator alive during its own operation")
}

impl<T: Clone + 'static> AsyncIterator<T> for MultiTransformIterator<T> {
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
        for entry in self.queue.borrow_mut().drain(..) {
            entry.sub.destroy(None);
        }
        done(None);
    }

    fn on_end_hook(&self) {
        if let Some(source) = self.source.borrow_mut().take() {
            source.0.core().events.clear_all();
            if self.destroy_source {
                source.destroy(None);
            }
        }
        for entry in self.queue.borrow_mut().drain(..) {
            entry.sub.destroy(None);
        }
    }
}

fn attach_sub_listeners<T: Clone + 'static>(rc: &Rc<MultiTransformIterator<T>>, sub: &Iter<T>) {
    let weak_readable = Rc::downgrade(rc);
    sub.0.core().events.on_readable(move || {
        if let Some(strong) = weak_readable.upgrade() {
            if strong.buffered().source_started() {
                buffered::fill_buffer(&strong);
            }
        }
    });
    let weak_end = Rc::downgrade(rc);
    sub.0.core().events.on_end(move || {
        if let Some(strong) = weak_end.upgrade() {
            if strong.buffered().source_started() {
                buffered::fill_buffer(&strong);
            }
        }
    });
}

impl<T: Clone + 'static> BufferedSubclass<T> for MultiTransformIterator<T> {
    fn buffered(&self) -> &BufferedCore<T> {
        &self.core
    }

    fn begin(rc: &Rc<Self>, done: Box<dyn FnOnce()>) {
        match rc.pending_source.borrow_mut().take() {
            Some(SourceInput::Ready(iter)) => {
                bind(rc, iter);
                done();
            }
            Some(SourceInput::Factory(make)) => {
                bind(rc, make());
                done();
            }
            Some(SourceInput::Future(fut)) => {
                let rc2 = rc.clone();
                crate::scheduler::spawn(async move {
                    let iter = fut.await;
                    bind(&rc2, iter);
                    done();
                });
            }
            None => done(),
        }
    }

    /// `spec.md` §4.J `_read(count, done)`: drain finished heads, load new
    /// sub-iterators up to `maxBufferSize`, then pull from the (new) head.
    fn fill(rc: &Rc<Self>, needed: usize, done: Box<dyn FnOnce()>) {
        drain_finished_heads(rc);
        load_sub_iterators(rc);
        pull_from_head(rc, needed);

        if rc.queue.borrow().is_empty() {
            if let Some(source) = rc.source.borrow().as_ref() {
                if source.done() {
                    buffered::close(rc);
                }
            }
        }
        done();
    }

    fn close_when_done(rc: &Rc<Self>) {
        if rc.queue.borrow().is_empty() {
            buffered::close(rc);
        }
        // Otherwise the remaining sub-iterators' own `end` events keep
        // re-triggering `fill`, whose own queue-empty check closes us once
        // they finish draining.
    }
}

fn bind<T: Clone + 'static>(rc: &Rc<MultiTransformIterator<T>>, iter: Iter<T>) {
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

fn drain_finished_heads<T: Clone + 'static>(rc: &Rc<MultiTransformIterator<T>>) {
    loop {
        let head_done = matches!(rc.queue.borrow().front(), Some(entry) if entry.sub.done());
        if !head_done {
            break;
        }
        let Some(entry) = rc.queue.borrow_mut().pop_front() else { break };
        if rc.optional {
            if let Some(item) = entry.item.borrow_mut().take() {
                rc.core.push(item);
            }
        }
    }
}

fn load_sub_iterators<T: Clone + 'static>(rc: &Rc<MultiTransformIterator<T>>) {
    loop {
        if rc.queue.borrow().len() >= rc.core.max_buffer_size() {
            break;
        }
        let Some(source) = rc.source.borrow().clone() else { break };
        let Some(item) = source.read() else { break };

        let sub = rc.factory.create(item.clone());
        attach_sub_listeners(rc, &sub);
        rc.queue.borrow_mut().push_back(Rc::new(QueueEntry {
            item: RefCell::new(Some(item)),
            sub,
        }));
    }
}

fn pull_from_head<T: Clone + 'static>(rc: &Rc<MultiTransformIterator<T>>, needed: usize) {
    let start = rc.core.pushed_count();
    loop {
        if rc.core.pushed_count().saturating_sub(start) >= needed {
            break;
        }
        let Some(entry) = rc.queue.borrow().front().cloned() else { break };
        let Some(item) = entry.sub.read() else { break };
        rc.core.push(item);
        entry.item.borrow_mut().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn default_factory_passes_every_item_through_unchanged() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3]);
        let out = build(source, Box::new(DefaultSingletonFactory), false, true, true, None);
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![1, 2, 3]);
    }

    struct RepeatTwice;
    impl SubIteratorFactory<i32> for RepeatTwice {
        fn create(&self, item: i32) -> Iter<i32> {
            Iter::new(ArrayIter::new(vec![item, item], true, true) as Rc<dyn AsyncIterator<i32>>)
        }
    }

    #[test]
    fn custom_factory_expands_each_item_into_several() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2]);
        let out = build(source, Box::new(RepeatTwice), false, true, true, None);
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![1, 1, 2, 2]);
    }

    struct EmptyOnOdd;
    impl SubIteratorFactory<i32> for EmptyOnOdd {
        fn create(&self, item: i32) -> Iter<i32> {
            if item % 2 == 0 {
                Iter::new(ArrayIter::new(vec![item], true, true) as Rc<dyn AsyncIterator<i32>>)
            } else {
                Iter::new(ArrayIter::new(vec![], true, true) as Rc<dyn AsyncIterator<i32>>)
            }
        }
    }

    #[test]
    fn optional_pushes_the_original_item_when_its_transformer_never_pushed() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3]);
        let out = build(source, Box::new(EmptyOnOdd), true, true, true, None);
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[test]
    fn non_optional_drops_items_whose_transformer_never_pushed() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3]);
        let out = build(source, Box::new(EmptyOnOdd), false, true, true, None);
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![2]);
    }
}
