/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fixed-capacity stack trace buffer.
//!
//! Captured in two steps, like all backtraces in this crate: an
//! async-signal-safe capture of raw instruction pointers
//! ([`StackTrace::collect`], callable from a signal handler once the
//! unwinder has been primed), and a separate resolve step
//! ([`StackTrace::symbolize`]) that may allocate and take locks.

use std::ffi::c_void;
use std::fmt::Write as _;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Once;

use crate::unwind_safety;

/// Maximum number of frames held by a [`StackTrace`]. Deeper stacks are
/// silently truncated.
pub const MAX_FRAMES: usize = 16;

/// Characters per address in hex renderings.
const HEX_ENTRY_LENGTH: usize = 16;

/// Field width for the pointer column: "0x" plus two characters per byte.
const POINTER_FIELD_WIDTH: usize = 2 + 2 * std::mem::size_of::<usize>();

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

static PRIME_UNWINDER_ONCE: Once = Once::new();

/// Walk the current stack once, from ordinary (non-signal) context.
///
/// The unwinder initializes lazily under a non-reentrant lock on first use.
/// If that first use happened inside a signal handler that interrupted a
/// thread which was itself mid-initialization, the handler would self-
/// deadlock. Running the first walk here guarantees the signal-context path
/// only ever sees the completed fast path of the `Once`.
pub(crate) fn prime_unwinder() {
    PRIME_UNWINDER_ONCE.call_once(|| {
        let mut depth = 0;
        unsafe {
            backtrace::trace_unsynchronized(|_| {
                depth += 1;
                depth < MAX_FRAMES
            });
        }
    });
}

/// Deliberately empty. [`StackTrace::collect`] records this function's
/// address when unwinding is declared unsafe, so that symbolized output
/// shows a readable marker instead of an empty stack.
#[inline(never)]
fn could_not_collect_stack_trace_because_inside_lib_dl() {}

/// A fixed-capacity sequence of call-site addresses, innermost first.
///
/// Only the prefix `frames[0..num_frames]` is meaningful. Equality, order
/// and hashing are all over that prefix.
#[derive(Clone, Debug, Default)]
pub struct StackTrace {
    frames: [usize; MAX_FRAMES],
    num_frames: usize,
}

impl StackTrace {
    /// Do not subtract one from collected addresses when rendering.
    pub const NO_FIX_CALLER_ADDRESSES: u32 = 1;
    /// Prepend `0x` to each address in hex renderings.
    pub const HEX_0X_PREFIX: u32 = 2;

    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current thread's stack, excluding `skip_frames` frames
    /// on top of the `collect` frame itself.
    ///
    /// Async-signal-safe once [`prime_unwinder`] has run: the walk uses
    /// only the unsynchronized unwinder and writes into `self`.
    pub fn collect(&mut self, skip_frames: usize) {
        self.num_frames = 0;

        if !unwind_safety::safe_to_unwind() {
            // Build a one-frame fake stack so the user sees an appropriate
            // message upon symbolizing rather than an empty stack. Add one
            // byte: a return address would not point at the beginning of
            // the function, and rendering subtracts one again.
            let marker = could_not_collect_stack_trace_because_inside_lib_dl as usize;
            self.frames[0] = marker + 1;
            self.num_frames = 1;
            return;
        }

        // Completed fast path when reached from the signal handler.
        prime_unwinder();

        let mut skip = skip_frames + 1; // do not include the collect frame
        let mut num = 0;
        let frames = &mut self.frames;
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                if ip == 0 {
                    return false;
                }
                if skip > 0 {
                    skip -= 1;
                    return true;
                }
                frames[num] = ip;
                num += 1;
                num < MAX_FRAMES
            });
        }
        self.num_frames = num;
    }

    /// Forget any collected frames.
    pub fn reset(&mut self) {
        self.num_frames = 0;
    }

    /// `true` once frames have been collected into this trace.
    pub fn has_collected(&self) -> bool {
        self.num_frames > 0
    }

    /// The defined prefix of collected frames.
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.num_frames]
    }

    /// Write the trace as space-separated 16-digit hex addresses into
    /// `buf`, always NUL-terminated, never touching more than `buf.len()`
    /// bytes. Entries that do not fit are dropped. No heap allocation.
    ///
    /// Unless `NO_FIX_CALLER_ADDRESSES` is set, each non-zero address is
    /// decremented by one before printing: collected return addresses point
    /// at the instruction after the call, and the caller is what a reader
    /// (or addr2line) wants.
    pub fn stringify_to_hex(&self, buf: &mut [u8], flags: u32) {
        if buf.is_empty() {
            return;
        }
        let prefix = if flags & Self::HEX_0X_PREFIX != 0 { 2 } else { 0 };
        let mut pos = 0;
        for i in 0..self.num_frames {
            let sep = usize::from(i != 0);
            // The whole entry plus the trailing NUL must fit.
            if pos + sep + prefix + HEX_ENTRY_LENGTH + 1 > buf.len() {
                break;
            }
            if i != 0 {
                buf[pos] = b' ';
                pos += 1;
            }
            if prefix != 0 {
                buf[pos] = b'0';
                buf[pos + 1] = b'x';
                pos += 2;
            }
            let mut addr = self.frames[i] as u64;
            if addr > 0 && flags & Self::NO_FIX_CALLER_ADDRESSES == 0 {
                addr -= 1;
            }
            for shift in (0..HEX_ENTRY_LENGTH).rev() {
                buf[pos] = HEX_DIGITS[(addr >> (shift * 4)) as usize & 0xf];
                pos += 1;
            }
        }
        buf[pos] = 0;
    }

    /// Heap-allocating wrapper around [`StackTrace::stringify_to_hex`].
    pub fn to_hex_string(&self, flags: u32) -> String {
        let mut len_per_frame = HEX_ENTRY_LENGTH + 1; // plus separating space
        if flags & Self::HEX_0X_PREFIX != 0 {
            len_per_frame += 2;
        }
        let mut buf = vec![0u8; MAX_FRAMES * len_per_frame + 1];
        self.stringify_to_hex(&mut buf, flags);
        let end = buf.iter().position(|&b| b == 0).unwrap_or(0);
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    /// Render one `    @ <pointer>  <symbol>` line per frame.
    ///
    /// Symbolization resolves `address - 1`: the collected return address
    /// points at the instruction after the call, which for a call in tail
    /// position (ex. to a function that does not return) may already belong
    /// to the next function in the binary. The printed pointer column keeps
    /// the raw collected value.
    pub fn symbolize(&self) -> String {
        let mut out = String::new();
        for &pc in self.frames() {
            let resolved = match pc {
                0 => None,
                pc => resolve_symbol(pc - 1),
            };
            let symbol = resolved.as_deref().unwrap_or("(unknown)");
            let ptr = format!("{pc:#x}");
            let _ = writeln!(out, "    @ {ptr:>POINTER_FIELD_WIDTH$}  {symbol}");
        }
        out
    }

    /// Like [`StackTrace::symbolize`] but with no symbol column.
    pub fn to_log_format_hex_string(&self) -> String {
        let mut out = String::new();
        for &pc in self.frames() {
            let ptr = format!("{pc:#x}");
            let _ = writeln!(out, "    @ {ptr:>POINTER_FIELD_WIDTH$}");
        }
        out
    }

    /// 64-bit content hash of the defined prefix.
    pub fn hash_code(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    #[cfg(test)]
    pub(crate) fn from_frames(frames: &[usize]) -> Self {
        let mut trace = Self::new();
        trace.frames[..frames.len()].copy_from_slice(frames);
        trace.num_frames = frames.len();
        trace
    }
}

impl PartialEq for StackTrace {
    fn eq(&self, other: &Self) -> bool {
        self.frames() == other.frames()
    }
}

impl Eq for StackTrace {}

impl PartialOrd for StackTrace {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StackTrace {
    /// Lexicographic over the defined prefix; a proper prefix of a longer
    /// trace orders first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.frames().cmp(other.frames())
    }
}

impl Hash for StackTrace {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.frames().hash(state);
    }
}

/// Map a program counter to a function name, or `None`.
fn resolve_symbol(pc: usize) -> Option<String> {
    let mut resolved = None;
    // NOTE: the resolver may call back multiple times (ex. inlined
    // functions); keep the last symbol.
    backtrace::resolve(pc as *mut c_void, |symbol| {
        if let Some(name) = symbol.name() {
            resolved = Some(name.to_string());
        }
    });
    resolved
}
