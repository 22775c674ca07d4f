// Test-only helpers. `spec.md` §4.A names a "blocking-test" scheduler mode
// for driving a future to completion in tests without a real async runtime;
// `QueueScheduler` already provides the queue, this module just adds the
// poll/drain loop a `Future`-returning API like `to_array()` needs.
//
// No `tokio`/`futures` dependency: `Waker::noop()` (stable since 1.85) is
// enough since every future in this crate is woken by scheduling a task on
// the same `QueueScheduler` the test already drains.

use std::future::Future;
use std::pin::pin;
use std::task::{Context, Poll, Waker};

use crate::scheduler::QueueScheduler;

/// Drives `future` to completion by alternating polls with draining
/// `scheduler`. Panics if the future never completes after the scheduler
/// goes idle with no progress made, which would otherwise hang forever.
pub fn block_on<F: Future>(scheduler: &QueueScheduler, future: F) -> F::Output {
    let mut future = pin!(future);
    let waker = Waker::noop();
    let mut cx = Context::from_waker(waker);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => {
                let ran = scheduler.run_until_idle();
                if ran == 0 {
                    match future.as_mut().poll(&mut cx) {
                        Poll::Ready(value) => return value,
                        Poll::Pending => {
                            panic!("block_on: future is pending and the scheduler is idle");
                        }
                    }
                }
            }
        }
    }
}
