/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The tracer/target handshake behind remote stack collection.
//!
//! A collector allocates a [`SignalData`] block, queues the process-wide
//! stack trace signal to the target thread with a pointer to the block as
//! the signal's user value, and waits on the block's completion flag. The
//! handler below runs on the target thread, claims the block, fills in the
//! stack and signals the flag.
//!
//! Everything the handler touches must be async-signal-safe: atomics, the
//! (primed) unwinder, the futex wake, and writes into the block. No
//! allocation, no locks, no logging.

use std::cell::UnsafeCell;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use crate::Tid;
use crate::completion_flag::CompletionFlag;
use crate::error::Error;
use crate::error::Result;
use crate::osutil;
use crate::stack_trace::StackTrace;

pub(crate) const NOT_IN_USE: i64 = 0;
pub(crate) const DUMP_STARTED: i64 = -1;

/// Shared between one collector and (at most) one target thread; the target
/// receives a raw pointer to it through the signal's user value.
///
/// The state is the pair of `queued_to_tid` and `result_ready`:
///
/// ```text
///   [ NOT_IN_USE, 0 ]
///          |
///          | (A) collector stores the target tid, queues the signal
///          v                 (D)
///   [ <target tid>, 0 ]    ---->  [ NOT_IN_USE, 0 ]  (revoked; block leaked)
///          |
///          | (B) handler CASes the tid to DUMP_STARTED
///          v                 (E)
///   [ DUMP_STARTED, 0 ]    ---->  [ NOT_IN_USE, 0 ]  (collector waits for flag)
///          |
///          | (C) handler fills `stack`, signals `result_ready`
///          v                 (F)
///   [ DUMP_STARTED, 1 ]    ---->  [ NOT_IN_USE, 1 ]  (already complete)
/// ```
///
/// (D), (E), (F) are the collector exchanging `NOT_IN_USE` back in during
/// revocation. The CAS in (B) and that exchange are the one synchronization
/// point deciding ownership of `stack`: whichever side wins, the other
/// backs off.
pub(crate) struct SignalData {
    /// Filled by the target thread's signal handler; read by the collector
    /// only after the handshake reports completion.
    stack: UnsafeCell<StackTrace>,
    /// `NOT_IN_USE`, `DUMP_STARTED`, or the tid the collector is waiting on.
    queued_to_tid: AtomicI64,
    /// Set once the target thread has collected its stack.
    result_ready: CompletionFlag,
}

impl SignalData {
    pub(crate) fn new(tid: Tid) -> Self {
        Self {
            stack: UnsafeCell::new(StackTrace::new()),
            queued_to_tid: AtomicI64::new(tid),
            result_ready: CompletionFlag::new(),
        }
    }

    /// Withdraw this block from the handler, returning the previous
    /// `queued_to_tid` value. After this returns, a handler CAS can no
    /// longer succeed.
    pub(crate) fn revoke(&self) -> i64 {
        self.queued_to_tid.swap(NOT_IN_USE, Ordering::AcqRel)
    }

    pub(crate) fn result_ready(&self) -> &CompletionFlag {
        &self.result_ready
    }

    /// Copy out the collected stack.
    ///
    /// Safety: only valid once `result_ready` is set; before that the
    /// target thread may still be writing.
    pub(crate) unsafe fn cloned_stack(&self) -> StackTrace {
        (*self.stack.get()).clone()
    }
}

/// Handler for the stack trace signal. Expected to be raised only by a
/// collector; a missing user value means someone else sent the signal.
pub(crate) extern "C" fn handle_stack_trace_signal(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    // Signal handlers may interrupt arbitrary code; preserve errno.
    let saved_errno = unsafe { *libc::__errno_location() };

    let sig_data = unsafe { (*info).si_value().sival_ptr } as *mut SignalData;
    if !sig_data.is_null() {
        let data = unsafe { &*sig_data };
        let my_tid = osutil::get_thread_id();
        // If delivery was slow, the collector may have given up and revoked
        // the request; its exchange took our tid out and this CAS fails.
        if data
            .queued_to_tid
            .compare_exchange(my_tid, DUMP_STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // DUMP_STARTED commits the collector to waiting on the flag:
            // we are writing into the block it owns.
            unsafe { (*data.stack.get()).collect(1) };
            data.result_ready.signal();
        }
    }

    unsafe { *libc::__errno_location() = saved_errno };
}

#[derive(Clone, Copy, PartialEq)]
enum InitState {
    Uninitialized,
    InitError,
    Initialized,
}

struct HandlerState {
    signum: libc::c_int,
    state: InitState,
}

/// The signal used to communicate with other threads, and whether our
/// handler is installed on it. The signal cannot be in use by anything
/// else in the process.
static HANDLER: Mutex<HandlerState> = Mutex::new(HandlerState {
    signum: libc::SIGUSR2,
    state: InitState::Uninitialized,
});

fn handler_fn_addr() -> libc::sighandler_t {
    handle_stack_trace_signal as usize
}

fn init_signal_handler_locked(handler: &mut HandlerState, signum: libc::c_int) -> bool {
    // Asked to change signal after a successful install: unregister the old
    // handler first, but only if it is still ours.
    if signum != handler.signum && handler.state == InitState::Initialized {
        unsafe {
            let mut old_act: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(handler.signum, std::ptr::null(), &mut old_act) == 0
                && old_act.sa_sigaction == handler_fn_addr()
            {
                libc::signal(handler.signum, libc::SIG_DFL);
            }
        }
    }

    // A changed signal number gets a fresh attempt even after an earlier
    // refusal.
    if signum != handler.signum {
        handler.signum = signum;
        handler.state = InitState::Uninitialized;
    }

    if handler.state == InitState::Uninitialized {
        unsafe {
            let mut old_act: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(handler.signum, std::ptr::null(), &mut old_act) != 0 {
                handler.state = InitState::InitError;
            } else if old_act.sa_sigaction != libc::SIG_DFL
                && old_act.sa_sigaction != libc::SIG_IGN
                && old_act.sa_sigaction != handler_fn_addr()
            {
                handler.state = InitState::InitError;
                tracing::warn!(
                    signum = handler.signum,
                    "signal handler for stack trace signal is already in use: \
                     thread stack traces will not be produced"
                );
            } else {
                let mut act: libc::sigaction = std::mem::zeroed();
                act.sa_sigaction = handler_fn_addr();
                act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
                libc::sigemptyset(&mut act.sa_mask);
                let mut prev_act: libc::sigaction = std::mem::zeroed();
                if libc::sigaction(handler.signum, &act, &mut prev_act) != 0 {
                    handler.state = InitState::InitError;
                } else {
                    // Nobody appeared to be using the signal above, but the
                    // read and the install are not one atomic step.
                    let prev = prev_act.sa_sigaction;
                    assert!(
                        prev == libc::SIG_DFL
                            || prev == libc::SIG_IGN
                            || prev == handler_fn_addr(),
                        "raced against another thread installing a signal handler"
                    );
                    handler.state = InitState::Initialized;
                }
            }
        }
    }
    handler.state == InitState::Initialized
}

/// Use `signum` as the process-wide stack trace signal, (re)installing the
/// handler. Fails if the signal already has a foreign handler.
pub fn set_stack_trace_signal(signum: libc::c_int) -> Result<()> {
    let mut handler = HANDLER.lock().unwrap_or_else(PoisonError::into_inner);
    if !init_signal_handler_locked(&mut handler, signum) {
        return Err(Error::InvalidArgument("unable to install signal handler"));
    }
    Ok(())
}

/// Make sure the handler is installed on the current signal, returning the
/// signal number to send. Idempotent.
pub(crate) fn ensure_signal_handler_installed() -> Result<libc::c_int> {
    let mut handler = HANDLER.lock().unwrap_or_else(PoisonError::into_inner);
    let signum = handler.signum;
    if !init_signal_handler_locked(&mut handler, signum) {
        return Err(Error::NotSupported(
            "unable to take thread stack: signal handler unavailable",
        ));
    }
    Ok(signum)
}
