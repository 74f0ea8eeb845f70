/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Stack traces from other threads of the current process.
//!
//! - Ask one thread for its current call stack by OS thread id
//!   ([`get_thread_stack`], [`dump_thread_stack`]), or capture every live
//!   thread at once and group identical stacks ([`StackTraceSnapshot`]).
//! - Collection is signal-based: a realtime-queued signal carries a pointer
//!   to a per-request block to the target thread, whose handler walks its
//!   own stack into the block and flags completion. The handshake stays
//!   correct under delivery delays, deadlines, lost signals, exiting
//!   threads and concurrent requests.
//!
//! Remote collection is implemented for Linux (it needs queued signals with
//! a user value and tid-scoped delivery). Other platforms keep
//! current-thread collection only and report `NotSupported` elsewhere.

mod collector;
mod completion_flag;
mod error;
mod osutil;
#[cfg(target_os = "linux")]
mod signal_handler;
mod snapshot;
mod stack_trace;
#[cfg(test)]
mod tests;
mod unwind_safety;

pub use collector::StackTraceCollector;
pub use collector::dump_thread_stack;
pub use collector::get_thread_stack;
pub use error::Error;
pub use error::Result;
pub use osutil::list_threads;
#[cfg(target_os = "linux")]
pub use signal_handler::set_stack_trace_signal;
pub use snapshot::StackTraceSnapshot;
pub use snapshot::ThreadInfo;
pub use stack_trace::MAX_FRAMES;
pub use stack_trace::StackTrace;
pub use unwind_safety::set_unwind_safety_check;

/// OS-level thread id, as seen in `/proc/<pid>/task`.
pub type Tid = i64;

#[cfg(not(target_os = "linux"))]
pub fn set_stack_trace_signal(_signum: i32) -> Result<()> {
    Err(Error::NotSupported("unsupported platform"))
}

/// The current thread's stack, symbolized.
pub fn get_stack_trace() -> String {
    let mut trace = StackTrace::new();
    trace.collect(1);
    trace.symbolize()
}

/// The current thread's stack as space-separated hex addresses.
pub fn get_stack_trace_hex() -> String {
    let mut buf = [0u8; 1024];
    hex_stack_trace_to_string(&mut buf);
    let end = buf.iter().position(|&b| b == 0).unwrap_or(0);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Like [`get_stack_trace_hex`], but written into a caller-provided buffer
/// with no allocation: usable from crash handlers.
pub fn hex_stack_trace_to_string(buf: &mut [u8]) {
    let mut trace = StackTrace::new();
    trace.collect(1);
    trace.stringify_to_hex(buf, 0);
}

/// The current thread's stack as one fixed-width hex address per line.
pub fn get_log_format_stack_trace_hex() -> String {
    let mut trace = StackTrace::new();
    trace.collect(1);
    trace.to_log_format_hex_string()
}
