// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libitc contributors
//
// Clock-bound wait primitive: a pthread mutex paired with a pthread
// condition variable whose deadline clock is chosen at construction.
// std's Condvar cannot bind CLOCK_MONOTONIC, so this goes through libc.

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::ptr;

/// Which clock a `Waiter`'s timed waits measure against.
///
/// Monotonic is strongly recommended; a realtime clock makes deadlines
/// jump with wall-clock adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    Realtime,
    Monotonic,
}

impl ClockId {
    fn as_raw(self) -> libc::clockid_t {
        match self {
            ClockId::Realtime => libc::CLOCK_REALTIME,
            ClockId::Monotonic => libc::CLOCK_MONOTONIC,
        }
    }
}

/// Blocking policy for pool allocation and queue dequeue.
///
/// `Grow` applies to pool allocation only; dequeue paths treat it as an
/// immediate miss. `Millis(0)` is the same as `NoWait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Grow the pool by its growth increment if the free list is empty.
    Grow,
    /// Block until a slot/message is available.
    Forever,
    /// Never block; return empty immediately.
    NoWait,
    /// Block for at most this many milliseconds.
    Millis(u32),
}

impl Wait {
    /// One second, for callers that think in the classic integer constants.
    pub const ONE_SEC: Wait = Wait::Millis(1000);
}

/// Mapping from the classic integer encoding: −2 grow, any other negative
/// forever, 0 no wait, positive milliseconds.
impl From<i32> for Wait {
    fn from(v: i32) -> Wait {
        match v {
            -2 => Wait::Grow,
            v if v < 0 => Wait::Forever,
            0 => Wait::NoWait,
            v => Wait::Millis(v as u32),
        }
    }
}

/// A mutex and condition variable bound to a named clock.
///
/// The pthread objects are boxed so the `Waiter` value itself may move;
/// pthread state must never change address once initialized.
pub(crate) struct Waiter {
    mutex: Box<UnsafeCell<libc::pthread_mutex_t>>,
    cond: Box<UnsafeCell<libc::pthread_cond_t>>,
    clock: ClockId,
}

unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

impl Waiter {
    pub(crate) fn new(clock: ClockId) -> io::Result<Waiter> {
        let mutex: Box<UnsafeCell<libc::pthread_mutex_t>> =
            Box::new(UnsafeCell::new(unsafe { mem::zeroed() }));
        let cond: Box<UnsafeCell<libc::pthread_cond_t>> =
            Box::new(UnsafeCell::new(unsafe { mem::zeroed() }));

        unsafe {
            let eno = libc::pthread_mutex_init(mutex.get(), ptr::null());
            if eno != 0 {
                return Err(io::Error::from_raw_os_error(eno));
            }

            let mut attr: libc::pthread_condattr_t = mem::zeroed();
            let mut eno = libc::pthread_condattr_init(&mut attr);
            if eno != 0 {
                libc::pthread_mutex_destroy(mutex.get());
                return Err(io::Error::from_raw_os_error(eno));
            }

            // macOS has no pthread_condattr_setclock; timed waits there
            // measure against the realtime default regardless of `clock`.
            #[cfg(not(target_os = "macos"))]
            {
                eno = libc::pthread_condattr_setclock(&mut attr, clock.as_raw());
                if eno != 0 {
                    libc::pthread_condattr_destroy(&mut attr);
                    libc::pthread_mutex_destroy(mutex.get());
                    return Err(io::Error::from_raw_os_error(eno));
                }
            }

            eno = libc::pthread_cond_init(cond.get(), &attr);
            libc::pthread_condattr_destroy(&mut attr);
            if eno != 0 {
                libc::pthread_mutex_destroy(mutex.get());
                return Err(io::Error::from_raw_os_error(eno));
            }
        }

        Ok(Waiter { mutex, cond, clock })
    }

    pub(crate) fn lock(&self) -> Locked<'_> {
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_lock");
        Locked { w: self }
    }

    /// Wake one thread blocked on the condition. Callable with or without
    /// the mutex held.
    pub(crate) fn notify_one(&self) {
        let rc = unsafe { libc::pthread_cond_signal(self.cond.get()) };
        debug_assert_eq!(rc, 0, "pthread_cond_signal");
    }

    #[cfg(not(target_os = "macos"))]
    fn cond_clock(&self) -> libc::clockid_t {
        self.clock.as_raw()
    }

    #[cfg(target_os = "macos")]
    fn cond_clock(&self) -> libc::clockid_t {
        let _ = self.clock;
        libc::CLOCK_REALTIME
    }

    /// Absolute deadline `ms` milliseconds from now on the bound clock,
    /// computed once per timed call.
    pub(crate) fn deadline_in(&self, ms: u32) -> libc::timespec {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(self.cond_clock(), &mut ts);
        }
        ts.tv_sec += (ms / 1000) as libc::time_t;
        ts.tv_nsec += ((ms % 1000) as libc::c_long) * 1_000_000;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_nsec -= 1_000_000_000;
            ts.tv_sec += 1;
        }
        ts
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_cond_destroy(self.cond.get());
            libc::pthread_mutex_destroy(self.mutex.get());
        }
    }
}

/// Proof that the waiter's mutex is held; unlocks on drop. Waiting is only
/// reachable through this guard, and spurious wakes are expected: callers
/// loop on their predicate.
pub(crate) struct Locked<'a> {
    w: &'a Waiter,
}

impl Locked<'_> {
    pub(crate) fn wait(&self) {
        let rc = unsafe { libc::pthread_cond_wait(self.w.cond.get(), self.w.mutex.get()) };
        debug_assert_eq!(rc, 0, "pthread_cond_wait");
    }

    /// Returns false once the deadline has passed without a wakeup.
    pub(crate) fn wait_until(&self, deadline: &libc::timespec) -> bool {
        let rc =
            unsafe { libc::pthread_cond_timedwait(self.w.cond.get(), self.w.mutex.get(), deadline) };
        rc == 0
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.w.mutex.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock");
    }
}
