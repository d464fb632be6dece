#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{boxed::Box, sync::Arc, task::Wake};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

/// `take_waker()` returns the waker of the current task. A task that is
/// about to suspend stores it somewhere another task can find it; calling
/// the waker later puts the suspended task back on its hart's run queue.
#[inline(always)]
pub async fn take_waker() -> Waker {
    TakeWakerFuture.await
}

struct TakeWakerFuture;

impl Future for TakeWakerFuture {
    type Output = Waker;
    #[inline(always)]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(cx.waker().clone())
    }
}

struct SuspendFuture {
    has_suspended: bool,
}

impl Future for SuspendFuture {
    type Output = ();

    /// The first poll returns `Pending`; any later poll returns `Ready`.
    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context) -> Poll<Self::Output> {
        match self.has_suspended {
            true => Poll::Ready(()),
            false => {
                self.has_suspended = true;
                Poll::Pending
            }
        }
    }
}

/// Suspends the current task without re-queueing it. The task runs again
/// only after someone calls the waker it has published beforehand (see
/// [`take_waker`]).
pub async fn suspend_now() {
    log::trace!("suspend");
    SuspendFuture {
        has_suspended: false,
    }
    .await
}

struct YieldFuture {
    has_yielded: bool,
}

impl Future for YieldFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.has_yielded {
            true => Poll::Ready(()),
            false => {
                self.has_yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// Gives the hart to other runnable tasks. Unlike [`suspend_now`] the waker
/// is invoked up front, so the task rejoins the end of the queue by itself.
pub async fn yield_now() {
    YieldFuture { has_yielded: false }.await;
}

/// Waker used by [`block_on`]. Waking is a no-op: the blocked hart polls in
/// a loop anyway and needs no external nudge.
struct BlockWaker;

impl Wake for BlockWaker {
    fn wake(self: Arc<Self>) {
        log::trace!("block waker wakes");
    }
}

/// Run a future to completion on the current hart. There is no task switch
/// on `Pending`; the future is simply polled again.
pub fn block_on<T>(fut: impl Future<Output = T>) -> T {
    let mut fut = Box::pin(fut);
    let waker = Waker::from(Arc::new(BlockWaker));
    let mut cx = Context::from_waker(&waker);

    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(res) => return res,
            Poll::Pending => core::hint::spin_loop(),
        }
    }
}
