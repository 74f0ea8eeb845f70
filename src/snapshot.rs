/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Whole-process stack snapshot: capture every live thread's stack
//! concurrently and group threads with identical stacks.

use std::time::Duration;
use std::time::Instant;

use crate::Tid;
use crate::collector::StackTraceCollector;
use crate::error::Error;
use crate::error::Result;
use crate::osutil;
use crate::stack_trace::StackTrace;

/// One thread's entry in a snapshot.
pub struct ThreadInfo {
    pub tid: Tid,
    pub stack: StackTrace,
    /// Per-thread collection outcome. A failed entry leaves `stack` empty.
    pub status: Result<()>,
    pub thread_name: String,
}

/// Captures the stacks of all live threads of this process.
pub struct StackTraceSnapshot {
    infos: Vec<ThreadInfo>,
    num_failed: usize,
    capture_thread_names: bool,
}

impl Default for StackTraceSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StackTraceSnapshot {
    pub fn new() -> Self {
        Self {
            infos: Vec::new(),
            num_failed: 0,
            capture_thread_names: true,
        }
    }

    /// Whether to also read thread names from the OS (on by default).
    pub fn set_capture_thread_names(&mut self, capture: bool) {
        self.capture_thread_names = capture;
    }

    /// Trigger collection against every live thread, wait for the results,
    /// and sort the entries by stack.
    ///
    /// Per-thread failures are recorded in the entries (and counted in
    /// [`StackTraceSnapshot::num_failed`]); the snapshot itself still
    /// succeeds.
    pub fn snapshot_all_stacks(&mut self) -> Result<()> {
        // Unwinding a thread that a debugger has stopped inside the runtime
        // linker can deadlock; refuse to touch anything.
        if osutil::is_being_debugged() {
            return Err(Error::Incomplete(
                "not collecting stack trace since debugger or strace is attached",
            ));
        }

        let tids = osutil::list_threads()?;

        let mut collectors: Vec<StackTraceCollector> = Vec::new();
        collectors.resize_with(tids.len(), StackTraceCollector::new);
        self.infos = tids
            .into_iter()
            .map(|tid| ThreadInfo {
                tid,
                stack: StackTrace::new(),
                status: Ok(()),
                thread_name: String::new(),
            })
            .collect();

        for (collector, info) in collectors.iter_mut().zip(self.infos.iter_mut()) {
            info.status = collector.trigger_async(info.tid);
        }

        // Collect the thread names while the signal handlers run.
        if self.capture_thread_names {
            for info in &mut self.infos {
                if info.status.is_err() {
                    continue;
                }
                info.thread_name = read_thread_name(info.tid);
            }
        }

        self.num_failed = 0;
        let deadline = Instant::now() + Duration::from_secs(1);
        for (collector, info) in collectors.iter_mut().zip(self.infos.iter_mut()) {
            if info.status.is_ok() {
                let status = collector.await_collection(deadline, &mut info.stack);
                info.status = status;
            }
            if info.status.is_err() {
                self.num_failed += 1;
                // A failed collection must leave the destination untouched.
                assert!(!info.stack.has_collected());
            }
        }
        drop(collectors);

        self.infos.sort_by(|a, b| a.stack.cmp(&b.stack));
        Ok(())
    }

    /// Visit the sorted entries as contiguous runs of equal stacks, one
    /// call per run.
    pub fn visit_groups(&self, mut visitor: impl FnMut(&[ThreadInfo])) {
        let mut group_start = 0;
        while group_start < self.infos.len() {
            let mut group_end = group_start + 1;
            while group_end < self.infos.len()
                && self.infos[group_end].stack == self.infos[group_start].stack
            {
                group_end += 1;
            }
            visitor(&self.infos[group_start..group_end]);
            group_start = group_end;
        }
    }

    /// The snapshot entries, sorted by stack after a successful
    /// [`StackTraceSnapshot::snapshot_all_stacks`].
    pub fn infos(&self) -> &[ThreadInfo] {
        &self.infos
    }

    /// How many entries failed to collect in the last snapshot.
    pub fn num_failed(&self) -> usize {
        self.num_failed
    }
}

#[cfg(target_os = "linux")]
fn read_thread_name(tid: Tid) -> String {
    osutil::read_thread_name(tid).unwrap_or_else(|| "<unknown name>".to_string())
}

#[cfg(not(target_os = "linux"))]
fn read_thread_name(_tid: Tid) -> String {
    "<unknown name>".to_string()
}
