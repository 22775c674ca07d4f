// Shared lifecycle state machine, dual-mode (pull/push) read protocol, and
// property store every iterator in this crate is built from. `spec.md` §4.D.
//
// Rust has no class inheritance, so the "base iterator" is a `Core<T>` field
// every concrete iterator embeds, plus the `AsyncIterator<T>` trait providing
// default methods that delegate to it. Concrete types additionally keep a
// `Weak<dyn AsyncIterator<T>>` to themselves (set once via `Rc::new_cyclic` at
// construction) so default methods can schedule continuations that outlive
// the current call without needing `&'static self`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::emitter::{Cause, Events};
use crate::error::{IteratorError, Result};
use crate::property::PropertyStore;
use crate::scheduler;
use crate::state::IterState;

/// The data shared by every iterator: lifecycle state, the `readable` hint,
/// the event channels, and the property store. Embedded (not inherited) by
/// every concrete iterator type.
pub struct Core<T: 'static> {
    state: Cell<IterState>,
    readable: Cell<bool>,
    pub(crate) events: Rc<Events<T>>,
    properties: RefCell<PropertyStore>,
    destination_bound: Cell<bool>,
    /// The `readable -> drain_loop` subscription id installed by `arm_drain`
    /// while flow mode is active, `0` when none is installed. Lets
    /// `drain_loop` unsubscribe itself when the last `data` listener departs,
    /// instead of leaving a stale `on_readable` hook around to accumulate
    /// across repeated flow-mode/pull-mode switches.
    drain_hook_id: Cell<u64>,
}

impl<T: 'static> Default for Core<T> {
    fn default() -> Self {
        Self {
            state: Cell::new(IterState::Init),
            readable: Cell::new(false),
            events: Rc::new(Events::new()),
            properties: RefCell::new(PropertyStore::new()),
            destination_bound: Cell::new(false),
            drain_hook_id: Cell::new(0),
        }
    }
}

impl<T: 'static> Core<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> IterState {
        self.state.get()
    }

    /// Raw, unconditional state transition: accepts iff `new_state > current`
    /// and `current < ENDED`, per `spec.md` §4.D. Does not emit any event --
    /// callers decide how/when `end` is delivered (see `transition_to_ended`).
    pub fn change_state(&self, new_state: IterState) -> bool {
        let current = self.state.get();
        if !(new_state > current && current < IterState::Ended) {
            tracing::trace!(?current, ?new_state, "rejected out-of-order state transition");
            return false;
        }
        self.state.set(new_state);
        tracing::debug!(?current, ?new_state, "iterator state transition");
        if new_state.is_done() {
            self.readable.set(false);
        }
        true
    }

    /// Attempts the terminal `* -> ENDED` transition, emitting `end` exactly
    /// once (synchronously or deferred per `event_async`) and then releasing
    /// every listener -- `spec.md` invariant 3 ("`end` is emitted exactly
    /// once") and invariant 5 ("after `done`, no further events").
    pub fn transition_to_ended(&self, event_async: bool) -> bool {
        if !self.change_state(IterState::Ended) {
            return false;
        }
        let events = self.events.clone();
        if event_async {
            scheduler::schedule(move || {
                events.emit_end();
                events.clear_all();
            });
        } else {
            events.emit_end();
            events.clear_all();
        }
        true
    }

    /// Attempts the terminal `* -> DESTROYED` transition. No `end` is ever
    /// emitted on this path (`spec.md` §5: "`destroy` ... `end` is not
    /// emitted").
    pub fn transition_to_destroyed(&self) -> bool {
        if !self.change_state(IterState::Destroyed) {
            return false;
        }
        self.events.clear_all();
        true
    }

    #[must_use]
    pub fn closed(&self) -> bool {
        self.state.get().is_closed()
    }

    #[must_use]
    pub fn ended(&self) -> bool {
        self.state.get().is_ended()
    }

    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.state.get().is_destroyed()
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.state.get().is_done()
    }

    #[must_use]
    pub fn readable(&self) -> bool {
        self.readable.get()
    }

    /// `spec.md` §3: "Setting true-from-false schedules an asynchronous
    /// `readable` event emission; setting true when done coerces to false;
    /// setting false is silent."
    pub fn set_readable(&self, value: bool) {
        let value = if self.state.get().is_done() { false } else { value };
        let previous = self.readable.get();
        self.readable.set(value);
        if !previous && value {
            let events = self.events.clone();
            scheduler::schedule(move || events.emit_readable());
        }
    }

    pub fn get_property(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.properties.borrow().get(name)
    }

    pub fn get_property_async(&self, name: &str, cb: impl FnOnce(&Rc<dyn Any>) + 'static) {
        self.properties.borrow_mut().get_or_wait(name, cb);
    }

    pub fn set_property(&self, name: &str, value: Rc<dyn Any>) {
        if self.destroyed() {
            tracing::warn!(name, "setProperty called on a destroyed iterator");
        }
        self.properties.borrow_mut().set(name, value);
    }

    pub fn get_properties(&self) -> HashMap<String, Rc<dyn Any>> {
        self.properties.borrow().snapshot()
    }

    pub fn set_properties(&self, values: impl IntoIterator<Item = (String, Rc<dyn Any>)>) {
        self.properties.borrow_mut().set_many(values);
    }

    pub fn copy_properties(&self, source: &Core<impl Sized>, names: &[&str]) {
        self.properties.borrow_mut().copy_from(&source.properties.borrow(), names);
    }

    fn release_properties(&self) {
        self.properties.borrow_mut().release();
    }

    /// Claims this source for exactly one destination. `spec.md` §3: "Each
    /// source may have at most one destination binding. Attempting to set a
    /// source whose destination is already claimed fails with an error; the
    /// cloned-iterator path is the sole exception." The clone path claims it
    /// once, via its shared `HistoryReader`, and every subsequent clone reads
    /// through that reader instead of re-binding the underlying source.
    pub fn bind_destination(&self) -> Result<()> {
        if self.destination_bound.get() {
            tracing::error!("rejected a second destination binding on one source");
            return Err(IteratorError::DestinationAlreadyBound);
        }
        self.destination_bound.set(true);
        Ok(())
    }

    #[must_use]
    pub fn has_destination(&self) -> bool {
        self.destination_bound.get()
    }
}

/// Consumer-facing and subclass-facing surface shared by every iterator,
/// `spec.md` §4.D / §6. Object-safe so heterogeneous iterators can be stored
/// as `Rc<dyn AsyncIterator<T>>` (needed by union, clone, and `Iter<T>`).
///
/// `T: Clone` is a deliberate departure from the source text's reference
/// semantics: Rust values are moved/owned, but the `data` event broadcasts
/// one item to any number of listeners, and both `clone()`'s history log and
/// `to_array()` need to retain items the read-side has already consumed. A
/// host language runtime gets this for free via GC references; here it's
/// made explicit via `Clone`. See `DESIGN.md`.
pub trait AsyncIterator<T: Clone + 'static> {
    fn core(&self) -> &Core<T>;

    /// Pulls the next item, or `None` if one isn't available right now.
    /// `spec.md` §4.D: "Must never throw for normal drain; surfaces errors
    /// via the `error` event."
    fn read(&self) -> Option<T>;

    /// A `Weak` handle to `self` as a trait object, established once at
    /// construction via `Rc::new_cyclic`. Lets default methods schedule
    /// continuations (`close`'s deferred `_end`, the dual-mode drain loop)
    /// without needing `'static` access to a borrowed `&self`.
    fn weak_dyn(&self) -> Weak<dyn AsyncIterator<T>>;

    /// Subclass hook invoked once, synchronously, as part of `_end` --
    /// detach source listeners, propagate `destroy()` to an owned source,
    /// etc. Default: nothing to detach.
    fn on_end_hook(&self) {}

    /// Subclass hook for `destroy(cause)`. `spec.md` §4.D: "calls subclass
    /// `_destroy(cause, k)`; on `k(err)`, emits `error` if `cause||err` is
    /// set". `done` must be invoked exactly once, synchronously, before this
    /// call returns -- none of this crate's iterators need asynchronous
    /// teardown, so unlike `_transform` this hook does not need a deferred
    /// variant (see `DESIGN.md`).
    fn destroy_hook(&self, _cause: Option<Cause>, done: &mut dyn FnMut(Option<Cause>)) {
        done(None);
    }

    fn readable(&self) -> bool {
        self.core().readable()
    }

    fn set_readable(&self, value: bool) {
        self.core().set_readable(value);
    }

    fn closed(&self) -> bool {
        self.core().closed()
    }

    fn ended(&self) -> bool {
        self.core().ended()
    }

    fn destroyed(&self) -> bool {
        self.core().destroyed()
    }

    fn done(&self) -> bool {
        self.core().done()
    }

    /// Base `close()`: `spec.md` §4.D -- "transitions OPEN→CLOSED ... and
    /// schedules `_end()` asynchronously. Idempotent." Buffered-style
    /// iterators (transform, multi-transform, union) override this with the
    /// more elaborate CLOSING semantics of `spec.md` §4.G.
    fn close(&self) {
        if self.core().state() >= IterState::Closed {
            return;
        }
        if self.core().change_state(IterState::Closed) {
            let weak = self.weak_dyn();
            scheduler::schedule(move || {
                if let Some(strong) = weak.upgrade() {
                    end_iterator(strong.as_ref(), false, true);
                }
            });
        }
    }

    /// `spec.md` §4.D: immediate cancellation. Idempotent once `done`.
    fn destroy(&self, cause: Option<anyhow::Error>) {
        if self.core().done() {
            return;
        }
        let cause_rc: Option<Cause> = cause.map(Rc::new);
        let mut hook_result: Option<Cause> = None;
        self.destroy_hook(cause_rc.clone(), &mut |err| hook_result = err);
        let final_cause = hook_result.or(cause_rc);
        if let Some(ref c) = final_cause {
            tracing::warn!(cause = %c, "iterator destroyed with a cause");
            self.core().events.emit_error(c);
        }
        end_iterator(self, true, false);
    }

    fn get_property(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.core().get_property(name)
    }

    fn get_property_async(&self, name: &str, cb: impl FnOnce(&Rc<dyn Any>) + 'static)
    where
        Self: Sized,
    {
        self.core().get_property_async(name, cb);
    }

    fn set_property(&self, name: &str, value: Rc<dyn Any>) {
        self.core().set_property(name, value);
    }

    fn get_properties(&self) -> HashMap<String, Rc<dyn Any>> {
        self.core().get_properties()
    }

    fn set_properties(&self, values: impl IntoIterator<Item = (String, Rc<dyn Any>)>)
    where
        Self: Sized,
    {
        self.core().set_properties(values);
    }
}

/// Runs the shared `_end` sequence for any `AsyncIterator`: the subclass
/// teardown hook, then the terminal transition (`DESTROYED` or `ENDED`).
/// A free function rather than a trait default method because it needs to
/// be callable via a `Rc<dyn AsyncIterator<T>>` obtained from a `Weak`
/// upgrade (see `close`'s scheduled continuation above).
pub fn end_iterator<T: Clone + 'static>(it: &dyn AsyncIterator<T>, is_destroy: bool, event_async: bool) {
    it.on_end_hook();
    if is_destroy {
        it.core().transition_to_destroyed();
    } else {
        it.core().transition_to_ended(event_async);
    }
    it.core().release_properties();
}

/// Installs the dual-mode emission machinery described in `spec.md` §4.D:
/// flow mode is active iff at least one `data` listener is present. Called
/// once by every concrete iterator's constructor, right after it is wrapped
/// in its owning `Rc`.
pub fn init_dual_mode<T, I>(it: &Rc<I>)
where
    T: Clone + 'static,
    I: AsyncIterator<T> + 'static,
{
    arm_new_listener_hook(it);
}

fn arm_new_listener_hook<T, I>(it: &Rc<I>)
where
    T: Clone + 'static,
    I: AsyncIterator<T> + 'static,
{
    let weak: Weak<I> = Rc::downgrade(it);
    let core = it.core();
    let hook_id = Rc::new(Cell::new(0_u64));
    let hook_id_for_closure = hook_id.clone();
    let id = core.events.on_new_listener(move |name| {
        if name != "data" {
            return;
        }
        let Some(strong) = weak.upgrade() else {
            return;
        };
        strong.core().events.off_new_listener(hook_id_for_closure.get());
        arm_drain(&strong);
    });
    hook_id.set(id);
}

fn arm_drain<T, I>(it: &Rc<I>)
where
    T: Clone + 'static,
    I: AsyncIterator<T> + 'static,
{
    let weak: Weak<I> = Rc::downgrade(it);
    let core = it.core();
    let id = core.events.on_readable(move || {
        if let Some(strong) = weak.upgrade() {
            drain_loop(&strong);
        }
    });
    core.drain_hook_id.set(id);
    if core.readable() {
        let weak2: Weak<I> = Rc::downgrade(it);
        scheduler::schedule(move || {
            if let Some(strong) = weak2.upgrade() {
                drain_loop(&strong);
            }
        });
    }
}

fn drain_loop<T, I>(it: &Rc<I>)
where
    T: Clone + 'static,
    I: AsyncIterator<T> + 'static,
{
    loop {
        if it.core().events.data_listener_count() == 0 {
            break;
        }
        match it.read() {
            Some(item) => it.core().events.emit_data(&item),
            None => break,
        }
    }
    if it.core().events.data_listener_count() == 0 && !it.core().done() {
        let hook_id = it.core().drain_hook_id.replace(0);
        if hook_id != 0 {
            it.core().events.off_readable(hook_id);
        }
        arm_new_listener_hook(it);
    }
}

/// A cloneable handle to any iterator, exposing the full consumer-facing
/// surface from `spec.md` §6 as inherent methods (trait objects cannot carry
/// generic combinator methods like `map`/`filter`, which return differently
/// typed iterators -- see `crate::combinators`).
pub struct Iter<T: Clone + 'static>(pub Rc<dyn AsyncIterator<T>>);

impl<T: Clone + 'static> Clone for Iter<T> {
    fn clone(&self) -> Self {
        Iter(self.0.clone())
    }
}

impl<T: Clone + 'static> Iter<T> {
    #[must_use]
    pub fn new(inner: Rc<dyn AsyncIterator<T>>) -> Self {
        Self(inner)
    }

    pub fn read(&self) -> Option<T> {
        self.0.read()
    }

    pub fn close(&self) {
        self.0.close();
    }

    pub fn destroy(&self, cause: Option<anyhow::Error>) {
        self.0.destroy(cause);
    }

    #[must_use]
    pub fn readable(&self) -> bool {
        self.0.readable()
    }

    pub fn set_readable(&self, value: bool) {
        self.0.set_readable(value);
    }

    #[must_use]
    pub fn closed(&self) -> bool {
        self.0.closed()
    }

    #[must_use]
    pub fn ended(&self) -> bool {
        self.0.ended()
    }

    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.0.destroyed()
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.0.done()
    }

    pub fn get_property(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.0.get_property(name)
    }

    pub fn set_property(&self, name: &str, value: Rc<dyn Any>) {
        self.0.set_property(name, value);
    }

    pub fn get_properties(&self) -> HashMap<String, Rc<dyn Any>> {
        self.0.get_properties()
    }

    pub fn copy_properties(&self, source: &Iter<T>, names: &[&str]) {
        self.0.core().copy_properties(source.0.core(), names);
    }

    /// `spec.md` §4.D: subscribes `cb` to `data`, which (per the dual-mode
    /// invariant) switches the iterator into flow mode.
    pub fn for_each(&self, mut cb: impl FnMut(T) + 'static) {
        self.0.core().events.on_data(move |item: &T| cb(item.clone()));
    }

    /// Returns a future resolving to every remaining item (or the first
    /// `limit` of them), in order. `spec.md` §4.D.
    #[must_use]
    pub fn to_array(&self, limit: Option<usize>) -> ToArray<T> {
        ToArray::new(self.0.clone(), limit)
    }
}

struct ToArrayState<T: Clone + 'static> {
    iter: Option<Rc<dyn AsyncIterator<T>>>,
    items: Vec<T>,
    limit: Option<usize>,
    done: bool,
    waker: Option<Waker>,
    subscribed: bool,
    data_id: Option<u64>,
    end_id: Option<u64>,
    error_id: Option<u64>,
}

pub struct ToArray<T: Clone + 'static> {
    state: Rc<RefCell<ToArrayState<T>>>,
}

impl<T: Clone + 'static> ToArray<T> {
    fn new(iter: Rc<dyn AsyncIterator<T>>, limit: Option<usize>) -> Self {
        Self {
            state: Rc::new(RefCell::new(ToArrayState {
                iter: Some(iter),
                items: Vec::new(),
                limit,
                done: false,
                waker: None,
                subscribed: false,
                data_id: None,
                end_id: None,
                error_id: None,
            })),
        }
    }
}

impl<T: Clone + 'static> Future for ToArray<T> {
    type Output = Vec<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Vec<T>> {
        let state = self.state.clone();
        let mut st = state.borrow_mut();

        if !st.subscribed {
            st.subscribed = true;
            let iter = st.iter.clone().expect("iter present before first poll");
            let limit = st.limit;

            let state_for_data = state.clone();
            let data_id = iter.core().events.on_data(move |item: &T| {
                let mut s = state_for_data.borrow_mut();
                if s.done {
                    return;
                }
                s.items.push(item.clone());
                if let Some(limit) = limit {
                    if s.items.len() >= limit {
                        s.done = true;
                        if let Some(w) = s.waker.take() {
                            w.wake();
                        }
                    }
                }
            });

            let state_for_end = state.clone();
            let end_id = iter.core().events.on_end(move || {
                let mut s = state_for_end.borrow_mut();
                s.done = true;
                if let Some(w) = s.waker.take() {
                    w.wake();
                }
            });

            let state_for_error = state.clone();
            let error_id = iter.core().events.on_error(move |_cause| {
                let mut s = state_for_error.borrow_mut();
                s.done = true;
                if let Some(w) = s.waker.take() {
                    w.wake();
                }
            });

            st.data_id = Some(data_id);
            st.end_id = Some(end_id);
            st.error_id = Some(error_id);
        }

        if st.done {
            if let Some(iter) = st.iter.take() {
                if let Some(id) = st.data_id.take() {
                    iter.core().events.off_data(id);
                }
                if let Some(id) = st.end_id.take() {
                    iter.core().events.off_end(id);
                }
                if let Some(id) = st.error_id.take() {
                    iter.core().events.off_error(id);
                }
            }
            Poll::Ready(std::mem::take(&mut st.items))
        } else {
            st.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}
