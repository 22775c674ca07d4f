// Round-robin merge of a static or dynamic source set. `spec.md` §4.K.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::buffered::{self, BufferedCore, BufferedSubclass};
use crate::core::{init_dual_mode, AsyncIterator, Core, Iter};
use crate::emitter::Cause;

pub enum UnionSources<T: Clone + 'static> {
    Static(Vec<Iter<T>>),
    /// An iterator whose own elements are iterators -- sources arrive over
    /// time rather than all being known up front.
    Dynamic(Iter<Iter<T>>),
}

struct PendingSources<T: Clone + 'static> {
    of_sources: Iter<Iter<T>>,
}

pub struct UnionIterator<T: Clone + 'static> {
    core: BufferedCore<T>,
    sources: RefCell<Vec<Iter<T>>>,
    current_source: Cell<usize>,
    pending: RefCell<Option<PendingSources<T>>>,
    destroy_sources: bool,
    self_weak: RefCell<Weak<Self>>,
}

#[must_use]
pub fn build<T: Clone + 'static>(
    sources: UnionSources<T>,
    destroy_sources: bool,
    auto_start: bool,
    max_buffer_size: Option<usize>,
) -> Iter<T> {
    let (initial, pending) = match sources {
        UnionSources::Static(v) => (v, None),
        UnionSources::Dynamic(it) => (Vec::new(), Some(PendingSources { of_sources: it })),
    };
    let close_immediately = initial.is_empty() && pending.is_none() && auto_start;

    let rc = Rc::new(UnionIterator {
        core: BufferedCore::new(max_buffer_size),
        sources: RefCell::new(Vec::new()),
        current_source: Cell::new(0),
        pending: RefCell::new(pending),
        destroy_sources,
        self_weak: RefCell::new(Weak::new()),
    });
    *rc.self_weak.borrow_mut() = Rc::downgrade(&rc);
    init_dual_mode::<T, _>(&rc);

    for source in initial {
        let _ = add_source(&rc, source);
    }
    attach_pending_listeners(&rc);

    buffered::schedule_init(&rc, auto_start);
    if close_immediately {
        buffered::close(&rc);
    }
    Iter::new(rc as Rc<dyn AsyncIterator<T>>)
}

fn weak<T: Clone + 'static>(rc: &UnionIterator<T>) -> Weak<UnionIterator<T>> {
    rc.self_weak.borrow().clone()
}

fn strong<T: Clone + 'static>(rc: &UnionIterator<T>) -> Rc<UnionIterator<T>> {
    weak(rc).upgrade().expect("union iterator alive during its own operation")
}

impl<T: Clone + 'static> AsyncIterator<T> for UnionIterator<T> {
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
        if self.destroy_sources {
            for source in self.sources.borrow_mut().drain(..) {
                source.destroy(None);
            }
            if let Some(pending) = self.pending.borrow_mut().take() {
                pending.of_sources.destroy(None);
            }
        }
        done(None);
    }
}

fn add_source<T: Clone + 'static>(rc: &Rc<UnionIterator<T>>, iter: Iter<T>) -> crate::error::Result<()> {
    iter.0.core().bind_destination()?;
    if iter.done() {
        return Ok(());
    }

    let weak_end: Weak<UnionIterator<T>> = Rc::downgrade(rc);
    let iter_for_end = iter.clone();
    iter.0.core().events.on_end(move || {
        if let Some(strong) = weak_end.upgrade() {
            remove_source(&strong, &iter_for_end);
        }
    });

    let weak_readable: Weak<UnionIterator<T>> = Rc::downgrade(rc);
    iter.0.core().events.on_readable(move || {
        if let Some(strong) = weak_readable.upgrade() {
            if strong.buffered().source_started() {
                buffered::fill_buffer(&strong);
            }
        }
    });

    let weak_error: Weak<UnionIterator<T>> = Rc::downgrade(rc);
    iter.0.core().events.on_error(move |cause: &Cause| {
        if let Some(strong) = weak_error.upgrade() {
            strong.core().events.emit_error(cause);
        }
    });

    rc.sources.borrow_mut().push(iter);
    Ok(())
}

/// Prunes a finished source and adjusts `current_source` so the rotation
/// invariant holds: "decrement when removing at or before it" (`spec.md`
/// §4.K).
fn remove_source<T: Clone + 'static>(rc: &Rc<UnionIterator<T>>, target: &Iter<T>) {
    let mut sources = rc.sources.borrow_mut();
    if let Some(idx) = sources.iter().position(|s| Rc::ptr_eq(&s.0, &target.0)) {
        sources.remove(idx);
        let cur = rc.current_source.get();
        if idx <= cur && cur > 0 {
            rc.current_source.set(cur - 1);
        }
    }
    drop(sources);
    maybe_close(rc);
}

fn maybe_close<T: Clone + 'static>(rc: &Rc<UnionIterator<T>>) {
    if rc.pending.borrow().is_none() && rc.sources.borrow().is_empty() {
        buffered::close(rc);
    }
}

fn attach_pending_listeners<T: Clone + 'static>(rc: &Rc<UnionIterator<T>>) {
    let of_sources = {
        let p = rc.pending.borrow();
        p.as_ref().map(|p| p.of_sources.clone())
    };
    let Some(of_sources) = of_sources else { return };

    let weak_readable: Weak<UnionIterator<T>> = Rc::downgrade(rc);
    of_sources.0.core().events.on_readable(move || {
        if let Some(strong) = weak_readable.upgrade() {
            drain_pending_sources(&strong);
            if strong.buffered().source_started() {
                buffered::fill_buffer(&strong);
            }
        }
    });

    let weak_end: Weak<UnionIterator<T>> = Rc::downgrade(rc);
    of_sources.0.core().events.on_end(move || {
        if let Some(strong) = weak_end.upgrade() {
            strong.pending.borrow_mut().take();
            maybe_close(&strong);
        }
    });
}

/// Synchronously pulls every source-of-sources item currently available.
/// `spec.md` §4.K: "Dynamic mode defers loading until first `_read` if not
/// `autoStart`" -- calling this unconditionally from every `fill` pass (see
/// below) makes that fall out naturally instead of needing a separate flag.
fn drain_pending_sources<T: Clone + 'static>(rc: &Rc<UnionIterator<T>>) {
    let of_sources = {
        let p = rc.pending.borrow();
        p.as_ref().map(|p| p.of_sources.clone())
    };
    let Some(of_sources) = of_sources else { return };

    while let Some(sub) = of_sources.read() {
        let _ = add_source(rc, sub);
    }
    if of_sources.done() {
        rc.pending.borrow_mut().take();
        maybe_close(rc);
    }
}

/// `spec.md` §4.K `_read(count, done)`: round-robin starting just past
/// `current_source`, continuing passes until a full pass pushes nothing
/// (every source empty right now) or `count` reaches zero.
fn round_robin_fill<T: Clone + 'static>(rc: &Rc<UnionIterator<T>>, needed: usize) {
    let mut remaining = needed;
    loop {
        if remaining == 0 {
            break;
        }
        let n = rc.sources.borrow().len();
        if n == 0 {
            break;
        }
        let start = (rc.current_source.get() + 1) % n;
        let mut progressed = false;
        for offset in 0..n {
            if remaining == 0 {
                break;
            }
            let idx = (start + offset) % n;
            let Some(source) = rc.sources.borrow().get(idx).cloned() else { continue };
            if let Some(item) = source.read() {
                rc.core.push(item);
                remaining -= 1;
                rc.current_source.set(idx);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

impl<T: Clone + 'static> BufferedSubclass<T> for UnionIterator<T> {
    fn buffered(&self) -> &BufferedCore<T> {
        &self.core
    }

    fn fill(rc: &Rc<Self>, needed: usize, done: Box<dyn FnOnce()>) {
        drain_pending_sources(rc);
        round_robin_fill(rc, needed);
        maybe_close(rc);
        done();
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

    fn array_source<T: Clone + 'static>(items: Vec<T>) -> Iter<T> {
        Iter::new(ArrayIter::new(items, true, true) as Rc<dyn AsyncIterator<T>>)
    }

    /// `spec.md` §8 boundary: `union([a, b]).read()` interleaves one at a
    /// time; `a=[1,2,3]`, `b=[10,20]` drains as `[1,10,2,20,3]`.
    #[test]
    fn round_robin_interleaves_sources_fairly() {
        let sched = new_scheduler();
        let a = array_source(vec![1, 2, 3]);
        let b = array_source(vec![10, 20]);
        let out = build(UnionSources::Static(vec![a, b]), true, true, None);
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec![1, 10, 2, 20, 3]);
    }

    /// `spec.md` §8 end-to-end scenario 3: `union([[1,2,3],['a','b']])` ->
    /// `[1,'a',2,'b',3]`.
    #[test]
    fn three_way_union_preserves_fairness_as_sources_drain() {
        let sched = new_scheduler();
        let a = array_source(vec!["1", "2", "3"]);
        let b = array_source(vec!["a", "b"]);
        let out = build(UnionSources::Static(vec![a, b]), true, true, None);
        let result = block_on(&sched, out.to_array(None));
        assert_eq!(result, vec!["1", "a", "2", "b", "3"]);
    }

    #[test]
    fn empty_static_sources_with_auto_start_closes_immediately() {
        let _sched = new_scheduler();
        let out = build(UnionSources::<i32>::Static(vec![]), true, true, None);
        assert!(out.done());
    }

    #[test]
    fn dynamic_sources_are_added_as_they_arrive() {
        let sched = new_scheduler();
        let sources_of_sources = array_source(vec![array_source(vec![1, 2]), array_source(vec![10])]);
        let out = build(UnionSources::Dynamic(sources_of_sources), true, true, None);
        let result = block_on(&sched, out.to_array(None));
        let mut sorted = result.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 10]);
    }
}
