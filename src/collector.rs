/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-request handle for collecting one remote thread's stack.

use std::time::Duration;
use std::time::Instant;

use crate::Tid;
use crate::error::Error;
use crate::error::Result;
use crate::stack_trace::StackTrace;

/// Collects a stack trace from another thread of this process.
///
/// One-shot: a collector services a single [`trigger_async`] /
/// [`await_collection`] pair. Movable, not copyable. Dropping a collector
/// with a request still in flight revokes the request.
///
/// [`trigger_async`]: StackTraceCollector::trigger_async
/// [`await_collection`]: StackTraceCollector::await_collection
pub struct StackTraceCollector {
    tid: Tid,
    #[cfg(target_os = "linux")]
    sig_data: *mut crate::signal_handler::SignalData,
}

// safety: `sig_data` is exclusively owned by this collector. The target
// thread dereferences the pointer from signal context but never frees it,
// and the handshake protocol serializes its accesses against ours.
unsafe impl Send for StackTraceCollector {}

impl Default for StackTraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl StackTraceCollector {
    pub fn new() -> Self {
        Self {
            tid: 0,
            sig_data: std::ptr::null_mut(),
        }
    }

    /// Queue a stack collection request to thread `tid` and return without
    /// waiting for it.
    pub fn trigger_async(&mut self, tid: Tid) -> Result<()> {
        assert!(
            self.sig_data.is_null() && self.tid == 0,
            "trigger_async() must not be called more than once per instance"
        );

        let signum = crate::signal_handler::ensure_signal_handler_installed()?;

        // The unwinder must be primed before any signal goes out; see
        // prime_unwinder().
        crate::stack_trace::prime_unwinder();

        // The target tid in the block lets a delayed delivery that lands
        // after we gave up (or, with a recycled tid, on some other thread)
        // know to ignore the request.
        let data = Box::into_raw(Box::new(crate::signal_handler::SignalData::new(tid)));

        // Pair with the handler's acquire CAS: everything before the send
        // is visible to the target thread.
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);

        if crate::osutil::queue_signal_to_thread(tid, signum, data as *mut libc::c_void).is_err() {
            // Never delivered, so no handler can hold the pointer.
            drop(unsafe { Box::from_raw(data) });
            return Err(Error::NotFound(
                "unable to deliver signal: thread may have exited",
            ));
        }

        // The signal is now pending on the target thread. The raw pointer
        // (not a Box) is kept because destruction must go through
        // revoke_sig_data(): the block may have to outlive us.
        self.sig_data = data;
        self.tid = tid;
        Ok(())
    }

    /// Wait until `deadline` for the stack queued by
    /// [`StackTraceCollector::trigger_async`]. On success the collected
    /// trace is stored into `stack`; on failure `stack` is left untouched.
    pub fn await_collection(&mut self, deadline: Instant, stack: &mut StackTrace) -> Result<()> {
        assert!(
            !self.sig_data.is_null(),
            "must successfully call trigger_async() first"
        );

        // The wait result is deliberately ignored: the flag may be signaled
        // between a timeout here and the revocation below, and revocation
        // alone decides whether the collection completed.
        let _ = unsafe { &*self.sig_data }.result_ready().wait_until(deadline);

        match self.revoke_sig_data() {
            Some(trace) => {
                *stack = trace;
                Ok(())
            }
            None => Err(Error::TimedOut(
                "thread did not respond: maybe it is blocking signals",
            )),
        }
    }

    /// Withdraw the in-flight request. Returns the collected stack if the
    /// target completed (or was already committed and is waited for), or
    /// `None` if the signal was never picked up.
    fn revoke_sig_data(&mut self) -> Option<StackTrace> {
        let data = self.sig_data;
        let old_val = unsafe { &*data }.revoke();

        // 1) The handler never saw the request: the signal may still be
        //    pending, and a later delivery will dereference the block (its
        //    CAS then fails against NOT_IN_USE and it backs off without
        //    writing). There is no upper bound on signal latency, so the
        //    block can never be freed. Leak it.
        if old_val == self.tid {
            tracing::warn!(
                tid = self.tid,
                sig_data = data as usize,
                "leaking stack collection request block after lost signal"
            );
            self.sig_data = std::ptr::null_mut();
            return None;
        }

        // 2) The handler claimed the request. Either it is still writing
        //    into the block (wait for it) or it already finished (the wait
        //    is a no-op). Either way the block is ours to free afterwards.
        assert!(
            old_val == crate::signal_handler::DUMP_STARTED,
            "unexpected queued_to_tid value {old_val} on revocation"
        );
        let block = unsafe { &*data };
        block.result_ready().wait();
        // safety: result_ready is set, the handler is done with the block.
        let trace = unsafe { block.cloned_stack() };
        drop(unsafe { Box::from_raw(data) });
        self.sig_data = std::ptr::null_mut();
        Some(trace)
    }
}

#[cfg(not(target_os = "linux"))]
impl StackTraceCollector {
    pub fn new() -> Self {
        Self { tid: 0 }
    }

    pub fn trigger_async(&mut self, _tid: Tid) -> Result<()> {
        Err(Error::NotSupported("unsupported platform"))
    }

    pub fn await_collection(&mut self, _deadline: Instant, _stack: &mut StackTrace) -> Result<()> {
        Err(Error::NotSupported("unsupported platform"))
    }
}

#[cfg(target_os = "linux")]
impl Drop for StackTraceCollector {
    fn drop(&mut self) {
        if !self.sig_data.is_null() {
            self.revoke_sig_data();
        }
    }
}

/// Collect the stack of thread `tid` into `stack`, waiting up to one
/// second.
///
/// The timeout is very conservative: responsive threads answer within a few
/// milliseconds. The usual reason for missing it is a target that blocks
/// the stack trace signal (glibc's timer thread, for example, never
/// responds).
pub fn get_thread_stack(tid: Tid, stack: &mut StackTrace) -> Result<()> {
    let mut collector = StackTraceCollector::new();
    collector.trigger_async(tid)?;
    collector.await_collection(Instant::now() + Duration::from_secs(1), stack)
}

/// Human-readable symbolized stack of thread `tid`; failures render as
/// `<the error>`.
pub fn dump_thread_stack(tid: Tid) -> String {
    let mut stack = StackTrace::new();
    match get_thread_stack(tid, &mut stack) {
        Ok(()) => stack.symbolize(),
        Err(e) => format!("<{e}>"),
    }
}
