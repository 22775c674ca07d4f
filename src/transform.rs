// Source-backed buffered iterator with an async `_transform` hook.
// `spec.md` §4.H.
//
// The source text allows `transform`'s output type to differ from its input
// type, but the only place the spec actually exploits that is `mapping.rs`
// (component F), which has no `optional` fallback. Every transform this crate
// builds here (simple transform, multi-transform) pushes its *own* element
// type back onto itself when `optional` falls through, so `TransformIterator`
// is kept single-type-parameter (`T -> T`) -- see `DESIGN.md`.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};

use crate::buffered::{self, BufferedCore, BufferedSubclass};
use crate::core::{init_dual_mode, AsyncIterator, Core, Iter};
use crate::emitter::Cause;
use crate::scheduler;

/// How a transform iterator's source is supplied. `spec.md` §4.H: "Sources
/// may be provided as: an iterator/emitter, a future, a zero-arg factory
/// returning either."
pub enum SourceInput<T: Clone + 'static> {
    Ready(Iter<T>),
    Factory(Box<dyn FnOnce() -> Iter<T>>),
    Future(Pin<Box<dyn Future<Output = Iter<T>>>>),
}

impl<T: Clone + 'static> From<Iter<T>> for SourceInput<T> {
    fn from(iter: Iter<T>) -> Self {
        SourceInput::Ready(iter)
    }
}

/// The per-item transform hook. `push` may be called any number of times
/// before `done`, which must be called exactly once -- `spec.md` §9's
/// "coroutine-style API" note.
pub trait Transformer<T: Clone + 'static> {
    fn transform(&self, item: T, push: &dyn Fn(T), done: Box<dyn FnOnce()>);
}

/// `_transform`'s default: push the item through unchanged. `spec.md` §4.H:
/// "Default `_transform` is identity."
pub struct Identity;

impl<T: Clone + 'static> Transformer<T> for Identity {
    fn transform(&self, item: T, push: &dyn Fn(T), done: Box<dyn FnOnce()>) {
        push(item);
        done();
    }
}

pub struct TransformIterator<T: Clone + 'static> {
    core: BufferedCore<T>,
    source: RefCell<Option<Iter<T>>>,
    pending: RefCell<Option<SourceInput<T>>>,
    transformer: Box<dyn Transformer<T>>,
    optional: bool,
    destroy_source: bool,
    self_weak: RefCell<Weak<TransformIterator<T>>>,
}

impl<T: Clone + 'static> TransformIterator<T> {
    #[must_use]
    pub fn new(
        source: SourceInput<T>,
        transformer: Box<dyn Transformer<T>>,
        optional: bool,
        destroy_source: bool,
        auto_start: bool,
        max_buffer_size: Option<usize>,
    ) -> Rc<Self> {
        let rc = Rc::new(TransformIterator {
            core: BufferedCore::new(max_buffer_size),
            source: RefCell::new(None),
            pending: RefCell::new(Some(source)),
            transformer,
            optional,
            destroy_source,
            self_weak: RefCell::new(Weak::new()),
        });
        *rc.self_weak.borrow_mut() = Rc::downgrade(&rc);
        init_dual_mode::<T, _>(&rc);
        buffered::schedule_init(&rc, auto_start);
        rc
    }

    fn weak(&self) -> Weak<Self> {
        self.self_weak.borrow().clone()
    }

    fn this(&self) -> Rc<Self> {
        self.weak().upgrade().expect("transform iterator alive during its own operation")
    }

    fn resolve(rc: &Rc<Self>, input: SourceInput<T>, done: Box<dyn FnOnce()>) {
        match input {
            SourceInput::Ready(iter) => {
                bind(rc, iter);
                done();
            }
            SourceInput::Factory(make) => {
                let iter = make();
                bind(rc, iter);
                done();
            }
            SourceInput::Future(fut) => {
                let rc2 = rc.clone();
                scheduler::spawn(async move {
                    let iter = fut.await;
                    bind(&rc2, iter);
                    done();
                });
            }
        }
    }
}

fn bind<T: Clone + 'static>(rc: &Rc<TransformIterator<T>>, iter: Iter<T>) {
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

impl<T: Clone + 'static> AsyncIterator<T> for TransformIterator<T> {
    fn core(&self) -> &Core<T> {
        self.core.core()
    }

    fn read(&self) -> Option<T> {
        buffered::read(&self.this())
    }

    fn weak_dyn(&self) -> Weak<dyn AsyncIterator<T>> {
        self.weak()
    }

    fn close(&self) {
        buffered::close(&self.this());
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

impl<T: Clone + 'static> BufferedSubclass<T> for TransformIterator<T> {
    fn buffered(&self) -> &BufferedCore<T> {
        &self.core
    }

    fn begin(rc: &Rc<Self>, done: Box<dyn FnOnce()>) {
        match rc.pending.borrow_mut().take() {
            Some(input) => TransformIterator::resolve(rc, input, done),
            None => done(),
        }
    }

    /// `spec.md` §4.H `_read(count, done)`.
    fn fill(rc: &Rc<Self>, needed: usize, done: Box<dyn FnOnce()>) {
        read_and_transform(rc.clone(), needed, Rc::new(RefCell::new(Some(done))));
    }
}

type DoneSlot = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

/// Calls the shared `_read` completion callback. `spec.md` §4.H/§7: "`done`
/// callback invoked twice inside `_read`" is a contract violation, "thrown
/// immediately from the offending call" -- `read_and_transform`'s several
/// early-return branches all reach here, and exactly one of them is
/// supposed to actually fire it.
fn finish(done: &DoneSlot) {
    match done.borrow_mut().take() {
        Some(d) => d(),
        None => {
            tracing::error!("transform `_read`'s `done` callback was invoked more than once");
            panic!("{}", crate::error::IteratorError::DoneCalledTwice("_read"));
        }
    }
}

/// `spec.md` §4.H `_readAndTransform`, driven in a loop by its own
/// completion callback (`next`) rather than real recursion from the
/// caller's perspective -- bounded by `needed` (<=128 per `_fillBuffer`
/// pass), so the call stack this builds up is bounded too.
fn read_and_transform<T: Clone + 'static>(rc: Rc<TransformIterator<T>>, needed: usize, done: DoneSlot) {
    if rc.core.core().closed() || rc.core.pushed_count() >= needed {
        finish(&done);
        return;
    }

    let Some(source) = rc.source.borrow().clone() else {
        finish(&done);
        return;
    };

    let Some(item) = source.read() else {
        finish(&done);
        return;
    };

    let count_before = rc.core.pushed_count();
    let optional = rc.optional;
    let fallback = item.clone();
    let rc_next = rc.clone();
    let done_next = done.clone();

    let next: Box<dyn FnOnce()> = Box::new(move || {
        if optional && rc_next.core.pushed_count() == count_before {
            rc_next.core.push(fallback);
        }
        read_and_transform(rc_next, needed, done_next);
    });

    let rc_push = rc.clone();
    let push = move |v: T| rc_push.core.push(v);
    rc.transformer.transform(item, &push, next);
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
    fn identity_transform_passes_every_item_through() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3]);
        let t = TransformIterator::new(source.into(), Box::new(Identity), false, true, true, None);
        let iter = Iter::new(t as Rc<dyn AsyncIterator<i32>>);

        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![1, 2, 3]);
    }

    struct Double;
    impl Transformer<i32> for Double {
        fn transform(&self, item: i32, push: &dyn Fn(i32), done: Box<dyn FnOnce()>) {
            push(item * 2);
            done();
        }
    }

    #[test]
    fn custom_transform_reshapes_each_item() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3]);
        let t = TransformIterator::new(source.into(), Box::new(Double), false, true, true, None);
        let iter = Iter::new(t as Rc<dyn AsyncIterator<i32>>);

        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![2, 4, 6]);
    }

    /// `spec.md` §8 scenario 6: optional transform that pushes nothing of
    /// its own falls back to the original item.
    struct Silent;
    impl Transformer<i32> for Silent {
        fn transform(&self, _item: i32, _push: &dyn Fn(i32), done: Box<dyn FnOnce()>) {
            done();
        }
    }

    #[test]
    fn optional_transform_falls_back_to_the_original_item() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3]);
        let t = TransformIterator::new(source.into(), Box::new(Silent), true, true, true, None);
        let iter = Iter::new(t as Rc<dyn AsyncIterator<i32>>);

        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[test]
    fn non_optional_transform_drops_items_with_no_push() {
        let sched = new_scheduler();
        let source = array_source(vec![1, 2, 3]);
        let t = TransformIterator::new(source.into(), Box::new(Silent), false, true, true, None);
        let iter = Iter::new(t as Rc<dyn AsyncIterator<i32>>);

        let result = block_on(&sched, iter.to_array(None));
        assert!(result.is_empty());
    }

    #[test]
    fn closes_immediately_when_source_is_already_done() {
        let sched = new_scheduler();
        let source = array_source(vec![]);
        sched.run_until_idle();
        assert!(source.done());

        let t = TransformIterator::new(source.into(), Box::new(Identity), false, true, true, None);
        sched.run_until_idle();
        assert!(t.core.core().done());
    }

    #[test]
    fn factory_source_is_resolved_during_begin() {
        let sched = new_scheduler();
        let t = TransformIterator::new(
            SourceInput::Factory(Box::new(|| array_source(vec![7, 8]))),
            Box::new(Identity),
            false,
            true,
            true,
            None,
        );
        let iter = Iter::new(t as Rc<dyn AsyncIterator<i32>>);
        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![7, 8]);
    }

    #[test]
    fn future_source_is_resolved_once_it_completes() {
        let sched = new_scheduler();
        let t = TransformIterator::new(
            SourceInput::Future(Box::pin(async { array_source(vec![9]) })),
            Box::new(Identity),
            false,
            true,
            true,
            None,
        );
        let iter = Iter::new(t as Rc<dyn AsyncIterator<i32>>);
        let result = block_on(&sched, iter.to_array(None));
        assert_eq!(result, vec![9]);
    }

    #[test]
    fn double_binding_a_source_closes_the_rejected_transform() {
        let sched = new_scheduler();
        let shared = array_source(vec![1]);

        let t1 = TransformIterator::new(shared.clone().into(), Box::new(Identity), false, false, true, None);
        let t2 = TransformIterator::new(shared.into(), Box::new(Identity), false, false, true, None);

        // The loser of the race never got a source bound, so its buffer stays
        // empty and it reaches ENDED on its own.
        sched.run_until_idle();
        assert!(t2.core.core().done());

        // The winner still has to be drained before it can reach ENDED.
        let iter1 = Iter::new(t1 as Rc<dyn AsyncIterator<i32>>);
        let result = block_on(&sched, iter1.to_array(None));
        assert_eq!(result, vec![1]);
        assert!(iter1.done());
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
