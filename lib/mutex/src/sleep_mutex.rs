use alloc::{collections::VecDeque, sync::Arc};
use core::{
    cell::UnsafeCell,
    future::Future,
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll, Waker},
};

use crate::{MutexSupport, SpinMutex};

const MAX_SPIN_COUNT: usize = 1000;

/// Sleep-capable exclusive lock. Acquisition is a future; a contended
/// caller leaves the hart instead of burning it. The guard may be held
/// across suspension points and across device I/O, which the spin tier
/// forbids.
///
/// Bookkeeping (the `locked` flag and the waiter queue) lives behind an
/// inner [`SpinMutex`], held only for a few instructions per transition.
pub struct SleepMutex<T: ?Sized, S: MutexSupport> {
    state: SpinMutex<SleepState, S>,
    data: UnsafeCell<T>,
}

struct SleepState {
    locked: bool,
    waiters: VecDeque<Arc<WaitEntry>>,
}

/// One queued waiter. `granted` is written under the state lock; once it is
/// set the lock has been handed to this waiter and `locked` stays true.
struct WaitEntry {
    granted: AtomicBool,
    waker: Waker,
}

unsafe impl<T: ?Sized + Send, S: MutexSupport> Send for SleepMutex<T, S> {}
unsafe impl<T: ?Sized + Send, S: MutexSupport> Sync for SleepMutex<T, S> {}

impl<T, S: MutexSupport> SleepMutex<T, S> {
    pub const fn new(user_data: T) -> Self {
        SleepMutex {
            state: SpinMutex::new(SleepState {
                locked: false,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(user_data),
        }
    }
}

impl<T: ?Sized, S: MutexSupport> SleepMutex<T, S> {
    pub fn try_lock(&self) -> Option<SleepMutexGuard<'_, T, S>> {
        let mut state = self.state.lock();
        if state.locked {
            None
        } else {
            state.locked = true;
            Some(SleepMutexGuard { mutex: self })
        }
    }

    pub async fn lock(&self) -> SleepMutexGuard<'_, T, S> {
        // Most holds are short: spin a bounded while before queueing.
        let mut spin_count = 0;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            if spin_count >= MAX_SPIN_COUNT {
                break;
            }
            spin_count += 1;
            core::hint::spin_loop();
        }
        // Give the holder one chance to finish on this hart, then sleep.
        osfuture::yield_now().await;
        SleepMutexFuture {
            mutex: self,
            entry: None,
        }
        .await
    }
}

struct SleepMutexFuture<'a, T: ?Sized, S: MutexSupport> {
    mutex: &'a SleepMutex<T, S>,
    entry: Option<Arc<WaitEntry>>,
}

impl<'a, T: ?Sized, S: MutexSupport> Future for SleepMutexFuture<'a, T, S> {
    type Output = SleepMutexGuard<'a, T, S>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.entry.take() {
            None => {
                let mut state = this.mutex.state.lock();
                if !state.locked {
                    state.locked = true;
                    drop(state);
                    Poll::Ready(SleepMutexGuard { mutex: this.mutex })
                } else {
                    let entry = Arc::new(WaitEntry {
                        granted: AtomicBool::new(false),
                        waker: cx.waker().clone(),
                    });
                    state.waiters.push_back(entry.clone());
                    drop(state);
                    this.entry = Some(entry);
                    Poll::Pending
                }
            }
            Some(entry) => {
                if entry.granted.load(Ordering::Acquire) {
                    Poll::Ready(SleepMutexGuard { mutex: this.mutex })
                } else {
                    this.entry = Some(entry);
                    Poll::Pending
                }
            }
        }
    }
}

impl<T: ?Sized, S: MutexSupport> Drop for SleepMutexFuture<'_, T, S> {
    /// A future dropped mid-wait must not strand its queue entry: either it
    /// is still queued (remove it) or the lock was already handed to it
    /// (pass the grant on).
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        let mut state = self.mutex.state.lock();
        if entry.granted.load(Ordering::Acquire) {
            let next = grant_next(&mut state);
            drop(state);
            if let Some(next) = next {
                next.waker.wake_by_ref();
            }
        } else {
            state.waiters.retain(|e| !Arc::ptr_eq(e, &entry));
        }
    }
}

/// Hand the lock to the next queued waiter, or mark it free. Must be called
/// with the state lock held and the lock logically owned by the caller.
fn grant_next(state: &mut SleepState) -> Option<Arc<WaitEntry>> {
    match state.waiters.pop_front() {
        Some(next) => {
            // `locked` stays true: ownership moves directly to `next`.
            next.granted.store(true, Ordering::Release);
            Some(next)
        }
        None => {
            state.locked = false;
            None
        }
    }
}

pub struct SleepMutexGuard<'a, T: ?Sized, S: MutexSupport> {
    mutex: &'a SleepMutex<T, S>,
}

unsafe impl<T: ?Sized + Send, S: MutexSupport> Send for SleepMutexGuard<'_, T, S> {}
unsafe impl<T: ?Sized + Send + Sync, S: MutexSupport> Sync for SleepMutexGuard<'_, T, S> {}

impl<T: ?Sized, S: MutexSupport> Deref for SleepMutexGuard<'_, T, S> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized, S: MutexSupport> DerefMut for SleepMutexGuard<'_, T, S> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized, S: MutexSupport> Drop for SleepMutexGuard<'_, T, S> {
    fn drop(&mut self) {
        let mut state = self.mutex.state.lock();
        let next = grant_next(&mut state);
        drop(state);
        if let Some(next) = next {
            next.waker.wake_by_ref();
        }
    }
}
