#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod sleep_mutex;
mod spin_mutex;

pub use sleep_mutex::{SleepMutex, SleepMutexGuard};
pub use spin_mutex::{SpinMutex, SpinMutexGuard};

pub type SpinLock<T> = SpinMutex<T, Spin>;
pub type SpinNoIrqLock<T> = SpinMutex<T, SpinNoIrq>;
pub type SleepLock<T> = SleepMutex<T, SpinNoIrq>;
pub type SleepLockGuard<'a, T> = SleepMutexGuard<'a, T, SpinNoIrq>;

/// Low-level support for mutex(spinlock, sleeplock, etc)
pub trait MutexSupport {
    /// Guard data
    type GuardData;
    /// Called before lock() & try_lock()
    fn before_lock() -> Self::GuardData;
    /// Called when MutexGuard dropping
    fn after_unlock(_: &mut Self::GuardData);
}

/// Spin MutexSupport
#[derive(Debug)]
pub struct Spin;

impl MutexSupport for Spin {
    type GuardData = ();
    #[inline(always)]
    fn before_lock() -> Self::GuardData {}
    #[inline(always)]
    fn after_unlock(_: &mut Self::GuardData) {}
}

/// Saves the interrupt-enable state on entry to a critical section and
/// restores it on exit. On targets without a supervisor interrupt flag this
/// degrades to plain spinning.
pub struct SieGuard(bool);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        impl SieGuard {
            fn new() -> Self {
                let sie = riscv::register::sstatus::read().sie();
                unsafe {
                    riscv::register::sstatus::clear_sie();
                }
                Self(sie)
            }
        }

        impl Drop for SieGuard {
            fn drop(&mut self) {
                if self.0 {
                    unsafe {
                        riscv::register::sstatus::set_sie();
                    }
                }
            }
        }
    } else {
        impl SieGuard {
            fn new() -> Self {
                Self(false)
            }
        }

        impl Drop for SieGuard {
            fn drop(&mut self) {
                let _ = self.0;
            }
        }
    }
}

/// SpinNoIrq MutexSupport
#[derive(Debug)]
pub struct SpinNoIrq;

impl MutexSupport for SpinNoIrq {
    type GuardData = SieGuard;
    #[inline(always)]
    fn before_lock() -> Self::GuardData {
        SieGuard::new()
    }
    #[inline(always)]
    fn after_unlock(_: &mut Self::GuardData) {}
}
