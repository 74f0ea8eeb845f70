/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! One-shot completion notification safe to signal from signal context.
//!
//! A mutex + condvar pair cannot be used here: the signaling side runs in a
//! signal handler and locking is not async-signal-safe. POSIX semaphores
//! are async-signal-safe but their timed wait uses the wall clock, which is
//! the wrong clock for strict deadlines. So the flag is a bare atomic word
//! with futex wait/wake on Linux and a yield loop elsewhere.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

pub(crate) struct CompletionFlag {
    complete: AtomicI32,
}

impl CompletionFlag {
    pub const fn new() -> Self {
        Self {
            complete: AtomicI32::new(0),
        }
    }

    /// Mark the flag as complete, waking all waiters.
    ///
    /// Async-signal-safe: one atomic store plus the wake syscall.
    pub fn signal(&self) {
        self.complete.store(1, Ordering::Release);
        #[cfg(target_os = "linux")]
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.complete.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                libc::c_int::MAX, // wake all
                0usize,
                0usize,
                0usize,
            );
        }
    }

    /// Wait for the flag to be marked complete, up until `deadline`.
    /// Returns `true` if the flag was marked complete before the deadline.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        if self.is_complete() {
            return true;
        }
        let mut now = Instant::now();
        while now < deadline {
            self.wait_on_word(Some(deadline - now));
            if self.is_complete() {
                return true;
            }
            now = Instant::now();
        }
        self.is_complete()
    }

    /// Wait for the flag with no deadline. Only used once a signaler is
    /// known to be committed to calling `signal()`.
    pub fn wait(&self) {
        while !self.is_complete() {
            self.wait_on_word(None);
        }
    }

    /// Reset to incomplete. The caller guarantees no concurrent waiter or
    /// signaler.
    #[allow(dead_code)]
    pub fn reset(&self) {
        self.complete.store(0, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire) != 0
    }

    /// Sleep until the word leaves 0, `timeout` elapses, or a spurious
    /// wakeup. The caller rechecks the flag and the clock.
    #[cfg(target_os = "linux")]
    fn wait_on_word(&self, timeout: Option<Duration>) {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = match &ts {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.complete.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0, // wait only if the word is still 0
                ts_ptr,
                0usize,
                0usize,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_on_word(&self, _timeout: Option<Duration>) {
        std::thread::yield_now();
    }
}
