/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Operating system features used for cross-thread stack collection.

use std::fs;
use std::io;

use crate::Tid;
use crate::error::Error;
use crate::error::Result;

/// Get the current thread id. Must be async-signal-safe.
#[cfg(target_os = "linux")]
pub(crate) fn get_thread_id() -> Tid {
    unsafe { libc::syscall(libc::SYS_gettid) as Tid }
}

/// The layout of the kernel's `siginfo_t` for `SI_QUEUE` senders, up to and
/// including the user value. Written over a zeroed `libc::siginfo_t` (whose
/// union fields are private) before handing it to the kernel.
#[cfg(target_os = "linux")]
#[repr(C)]
#[allow(dead_code)] // written through a pointer cast, never read back
struct RawSigInfo {
    si_signo: libc::c_int,
    si_errno: libc::c_int,
    si_code: libc::c_int,
    // The union of per-sender fields is pointer-aligned.
    #[cfg(target_pointer_width = "64")]
    _pad: libc::c_int,
    si_pid: libc::pid_t,
    si_uid: libc::uid_t,
    si_value: *mut libc::c_void,
}

/// Queue `signum` to thread `tid`, carrying `payload` as the signal's user
/// value.
///
/// Uses the raw `rt_tgsigqueueinfo` syscall instead of `kill()`/`sigqueue()`
/// so that delivery is restricted to a thread of the current process: if the
/// target thread exited and its tid was recycled by another process, the
/// signal is not sent there.
#[cfg(target_os = "linux")]
pub(crate) fn queue_signal_to_thread(
    tid: Tid,
    signum: libc::c_int,
    payload: *mut libc::c_void,
) -> io::Result<()> {
    unsafe {
        let mut info: libc::siginfo_t = std::mem::zeroed();
        let raw = &mut info as *mut libc::siginfo_t as *mut RawSigInfo;
        (*raw).si_signo = signum;
        (*raw).si_code = libc::SI_QUEUE;
        (*raw).si_pid = libc::getpid();
        (*raw).si_uid = libc::getuid();
        (*raw).si_value = payload;
        if libc::syscall(
            libc::SYS_rt_tgsigqueueinfo,
            libc::getpid(),
            tid as libc::pid_t,
            signum,
            &mut info,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Enumerate the tids of all live threads of the current process.
#[cfg(target_os = "linux")]
pub fn list_threads() -> Result<Vec<Tid>> {
    let dir =
        fs::read_dir("/proc/self/task").map_err(|e| Error::Io("failed to open task dir", e))?;
    let mut tids = Vec::new();
    for entry in dir {
        let entry = entry.map_err(|e| Error::Io("failed to read task dir", e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match name.parse::<u32>() {
            Ok(tid) => tids.push(tid as Tid),
            Err(_) => tracing::warn!(entry = name, "bad tid found in procfs"),
        }
    }
    Ok(tids)
}

#[cfg(not(target_os = "linux"))]
pub fn list_threads() -> Result<Vec<Tid>> {
    Err(Error::NotSupported("unable to list threads on this platform"))
}

/// Read the human-readable name of a thread of this process, best-effort.
#[cfg(target_os = "linux")]
pub(crate) fn read_thread_name(tid: Tid) -> Option<String> {
    let comm = fs::read_to_string(format!("/proc/self/task/{tid}/comm")).ok()?;
    Some(comm.trim_end_matches('\n').to_string())
}

/// `true` if a debugger or tracer (gdb, strace, ...) is attached to this
/// process. Best-effort: errors read as "not attached".
#[cfg(target_os = "linux")]
pub(crate) fn is_being_debugged() -> bool {
    let Ok(status) = fs::read_to_string("/proc/self/status") else {
        return false;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("TracerPid:") {
            return rest.trim().parse::<i64>().map_or(false, |pid| pid != 0);
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn is_being_debugged() -> bool {
    false
}

/// Block or unblock `sig` for the current thread.
#[cfg(test)]
pub(crate) fn sigmask(sig: libc::c_int, block: bool) {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
        let how = match block {
            true => libc::SIG_BLOCK,
            _ => libc::SIG_UNBLOCK,
        };
        libc::pthread_sigmask(how, &set, std::ptr::null_mut());
    }
}
