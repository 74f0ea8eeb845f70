/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crate::Error;
use crate::StackTrace;
use crate::StackTraceCollector;
use crate::StackTraceSnapshot;
use crate::Tid;
use crate::dump_thread_stack;
use crate::get_thread_stack;
use crate::osutil;
use crate::set_stack_trace_signal;
use crate::set_unwind_safety_check;

/// Serializes tests that exercise the process-wide signal handler state or
/// the unwind-safety check. Cargo runs tests on parallel threads.
static SIGNAL_TEST_LOCK: Mutex<()> = Mutex::new(());

fn signal_lock() -> MutexGuard<'static, ()> {
    SIGNAL_TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A thread parked in a loop until dropped, with its tid already known.
struct TargetThread {
    tid: Tid,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TargetThread {
    fn spawn(name: &str) -> Self {
        Self::spawn_inner(name, false)
    }

    /// Like `spawn`, but the thread blocks the stack trace signal while it
    /// runs (and unblocks it again on its way out).
    fn spawn_blocking_signal(name: &str) -> Self {
        Self::spawn_inner(name, true)
    }

    fn spawn_inner(name: &str, block_signal: bool) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn({
                let stop = stop.clone();
                move || {
                    if block_signal {
                        osutil::sigmask(libc::SIGUSR2, true);
                    }
                    tx.send(osutil::get_thread_id()).unwrap();
                    park_until_stopped(&stop);
                    if block_signal {
                        // A signal queued while we were blocked is delivered
                        // here; the handler must recognize the revoked
                        // request and back off cleanly.
                        osutil::sigmask(libc::SIGUSR2, false);
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            })
            .unwrap();
        let tid = rx.recv().unwrap();
        Self {
            tid,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for TargetThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

#[inline(never)]
fn park_until_stopped(stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        thread::park_timeout(Duration::from_millis(5));
    }
}

#[test]
fn test_get_thread_stack_of_live_thread() {
    let _guard = signal_lock();
    let target = TargetThread::spawn("live-target");

    let mut stack = StackTrace::new();
    get_thread_stack(target.tid, &mut stack).unwrap();
    assert!(stack.has_collected());
    assert!(stack.frames().iter().all(|&f| f != 0));
}

#[test]
fn test_nonexistent_tid() {
    let _guard = signal_lock();
    let mut stack = StackTrace::new();
    let err = get_thread_stack(0x7fff_ffff, &mut stack).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err}");
    assert!(!stack.has_collected());
}

#[test]
fn test_signal_blocking_target_times_out() {
    let _guard = signal_lock();
    let target = TargetThread::spawn_blocking_signal("blocked-target");

    let mut stack = StackTrace::new();
    let start = Instant::now();
    let err = get_thread_stack(target.tid, &mut stack).unwrap_err();
    assert!(matches!(err, Error::TimedOut(_)), "{err}");
    assert!(start.elapsed() >= Duration::from_secs(1));
    // A timed-out collection must leave the destination untouched.
    assert!(!stack.has_collected());

    // Dropping the target unblocks the signal; the late delivery must not
    // crash on the (intentionally leaked) request block.
    drop(target);

    let alive = TargetThread::spawn("alive-after-late-delivery");
    get_thread_stack(alive.tid, &mut stack).unwrap();
    assert!(stack.has_collected());
}

#[test]
fn test_conflicting_handler_disables_collection() {
    extern "C" fn foreign_handler(_signum: libc::c_int) {}

    let _guard = signal_lock();
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = foreign_handler as usize;
        libc::sigemptyset(&mut act.sa_mask);
        libc::sigaction(libc::SIGPROF, &act, std::ptr::null_mut());
    }

    let err = set_stack_trace_signal(libc::SIGPROF).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err}");

    // While disabled, triggering refuses up front.
    let mut collector = StackTraceCollector::new();
    let err = collector.trigger_async(osutil::get_thread_id()).unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)), "{err}");

    // Clear the foreign handler; moving back to a free signal recovers.
    unsafe {
        libc::signal(libc::SIGPROF, libc::SIG_DFL);
    }
    set_stack_trace_signal(libc::SIGUSR2).unwrap();

    let target = TargetThread::spawn("post-conflict");
    let mut stack = StackTrace::new();
    get_thread_stack(target.tid, &mut stack).unwrap();
}

#[test]
fn test_signal_number_change() {
    let _guard = signal_lock();

    set_stack_trace_signal(libc::SIGUSR1).unwrap();
    let target = TargetThread::spawn("on-sigusr1");
    let mut stack = StackTrace::new();
    get_thread_stack(target.tid, &mut stack).unwrap();
    assert!(stack.has_collected());
    drop(target);

    set_stack_trace_signal(libc::SIGUSR2).unwrap();
    let target = TargetThread::spawn("back-on-sigusr2");
    get_thread_stack(target.tid, &mut stack).unwrap();
}

#[test]
#[should_panic(expected = "more than once")]
fn test_trigger_async_twice_panics() {
    let _guard = signal_lock();
    let target = TargetThread::spawn("double-trigger");
    let mut collector = StackTraceCollector::new();
    collector.trigger_async(target.tid).unwrap();
    let _ = collector.trigger_async(target.tid);
}

/// Threads whose tid is stored here report unwinding as unsafe.
static UNWIND_UNSAFE_TID: AtomicI64 = AtomicI64::new(0);

fn unwind_unsafe_for_marked_thread() -> bool {
    UNWIND_UNSAFE_TID.load(Ordering::Acquire) != osutil::get_thread_id()
}

#[test]
fn test_unwind_unsafe_context_yields_marker_frame() {
    let _guard = signal_lock();
    set_unwind_safety_check(unwind_unsafe_for_marked_thread);
    UNWIND_UNSAFE_TID.store(osutil::get_thread_id(), Ordering::Release);

    let mut trace = StackTrace::new();
    trace.collect(0);
    UNWIND_UNSAFE_TID.store(0, Ordering::Release);

    assert_eq!(trace.frames().len(), 1);
    assert!(
        trace
            .symbolize()
            .contains("could_not_collect_stack_trace_because_inside_lib_dl"),
        "{}",
        trace.symbolize()
    );
}

#[test]
fn test_unwind_unsafe_target_thread_reports_marker() {
    let _guard = signal_lock();
    set_unwind_safety_check(unwind_unsafe_for_marked_thread);
    let target = TargetThread::spawn("unsafe-unwind");
    UNWIND_UNSAFE_TID.store(target.tid, Ordering::Release);

    let mut stack = StackTrace::new();
    get_thread_stack(target.tid, &mut stack).unwrap();
    UNWIND_UNSAFE_TID.store(0, Ordering::Release);

    assert_eq!(stack.frames().len(), 1);
    assert!(
        stack
            .symbolize()
            .contains("could_not_collect_stack_trace_because_inside_lib_dl")
    );
}

#[test]
fn test_dump_thread_stack_renders() {
    let _guard = signal_lock();
    let target = TargetThread::spawn("dump-target");

    let dump = dump_thread_stack(target.tid);
    assert!(dump.contains("    @ "), "{dump}");

    let dump = dump_thread_stack(0x7fff_ffff);
    assert!(dump.starts_with('<') && dump.ends_with('>'), "{dump}");
    assert!(dump.contains("not found"), "{dump}");
}

#[test]
fn test_snapshot_all_stacks() {
    let _guard = signal_lock();
    let _a = TargetThread::spawn("snap-a");
    let _b = TargetThread::spawn("snap-b");
    let _c = TargetThread::spawn("snap-c");

    let mut snapshot = StackTraceSnapshot::new();
    snapshot.snapshot_all_stacks().unwrap();

    // Main thread, the three targets, and whatever else the test harness
    // is running.
    assert!(snapshot.infos().len() >= 4);

    for pair in snapshot.infos().windows(2) {
        assert!(pair[0].stack <= pair[1].stack);
    }

    // Groups partition the entries: equal within, distinct between.
    let mut visited = 0;
    let mut group_heads: Vec<StackTrace> = Vec::new();
    snapshot.visit_groups(|group| {
        assert!(!group.is_empty());
        visited += group.len();
        for info in group {
            assert_eq!(info.stack, group[0].stack);
        }
        group_heads.push(group[0].stack.clone());
    });
    assert_eq!(visited, snapshot.infos().len());
    for pair in group_heads.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }

    // Our targets responded, with their names captured.
    for name in ["snap-a", "snap-b", "snap-c"] {
        let info = snapshot
            .infos()
            .iter()
            .find(|info| info.thread_name == name)
            .unwrap_or_else(|| panic!("no snapshot entry named {name}"));
        assert!(info.status.is_ok());
        assert!(info.stack.has_collected());
    }
}

#[test]
fn test_snapshot_with_blocked_thread() {
    let _guard = signal_lock();
    let _responsive = TargetThread::spawn("snap-fine");
    let blocked = TargetThread::spawn_blocking_signal("snap-blocked");

    let mut snapshot = StackTraceSnapshot::new();
    snapshot.snapshot_all_stacks().unwrap();

    assert!(snapshot.num_failed() >= 1);
    let info = snapshot
        .infos()
        .iter()
        .find(|info| info.tid == blocked.tid)
        .unwrap();
    assert!(info.status.is_err());
    assert!(!info.stack.has_collected());
}

#[test]
fn test_stress_concurrent_collections() {
    // Repeat to surface intermittent hangs, use-after-free or cross-talk
    // between concurrent requests.
    let _guard = signal_lock();
    let (jobs, iterations) = if cfg!(debug_assertions) {
        (3, 10)
    } else {
        (6, 25)
    };

    let targets: Vec<TargetThread> = (0..4)
        .map(|i| TargetThread::spawn(&format!("stress-{i}")))
        .collect();
    let tids: Vec<Tid> = targets.iter().map(|t| t.tid).collect();

    let handles: Vec<_> = (0..jobs)
        .map(|job| {
            let tids = tids.clone();
            thread::spawn(move || {
                for iteration in 0..iterations {
                    for &tid in &tids {
                        let mut stack = StackTrace::new();
                        match get_thread_stack(tid, &mut stack) {
                            Ok(()) => {
                                assert!(stack.has_collected());
                                assert!(stack.frames().iter().all(|&f| f != 0));
                            }
                            // Standard signals coalesce, so concurrent
                            // requests against one thread can starve.
                            Err(Error::TimedOut(_)) => {}
                            Err(e) => panic!("job {job} iteration {iteration}: {e}"),
                        }
                    }
                    // Also exercise revoke-on-drop with the request still
                    // in flight.
                    let mut collector = StackTraceCollector::new();
                    if collector.trigger_async(tids[iteration % tids.len()]).is_ok() {
                        drop(collector);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_current_thread_conveniences() {
    let symbolized = crate::get_stack_trace();
    assert!(!symbolized.is_empty());
    assert!(symbolized.lines().all(|l| l.starts_with("    @ ")));

    let hex = crate::get_stack_trace_hex();
    assert!(!hex.is_empty());
    for field in hex.split(' ') {
        assert_eq!(field.len(), 16, "{field}");
        assert!(u64::from_str_radix(field, 16).is_ok());
    }

    let log_hex = crate::get_log_format_stack_trace_hex();
    assert!(log_hex.lines().all(|l| l.starts_with("    @ ")));

    let mut buf = [0u8; 64];
    crate::hex_stack_trace_to_string(&mut buf);
    assert!(buf.contains(&0));
}

#[test]
fn test_list_threads_sees_spawned_thread() {
    let target = TargetThread::spawn("listed-thread");
    let tids = crate::list_threads().unwrap();
    assert!(tids.contains(&target.tid));
}
