/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process-global predicate deciding whether it is safe to walk the
//! current thread's stack right now.
//!
//! Unwinding inside the dynamic linker (ex. a signal arriving while the
//! thread is mid-`dlopen`) can deadlock on the linker's own locks. A host
//! application that tracks such regions registers a check here; with no
//! check registered, unwinding is assumed safe.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// The check used by this process. Zero means "no check registered".
static UNWIND_SAFETY_CHECK: AtomicUsize = AtomicUsize::new(0);

/// Register the unwind-safety check used by this process.
///
/// The check may run in signal context and must be async-signal-safe.
pub fn set_unwind_safety_check(check: fn() -> bool) {
    UNWIND_SAFETY_CHECK.store(check as usize, Ordering::Release);
}

/// `true` if walking the current thread's stack is presently safe.
/// Async-signal-safe: one atomic load plus an indirect call.
pub(crate) fn safe_to_unwind() -> bool {
    let raw = UNWIND_SAFETY_CHECK.load(Ordering::Acquire);
    if raw == 0 {
        return true;
    }
    // safety: only ever stored from a `fn() -> bool` in
    // set_unwind_safety_check above.
    let check: fn() -> bool = unsafe { std::mem::transmute(raw) };
    check()
}
