//! Per-process and per-descriptor bookkeeping for the breakpoint tracer.
//!
//! Both tables are owned exclusively by the tracer loop; nothing else
//! mutates them, so no locking is needed. Unknown-pid operations are
//! no-ops rather than errors: a process may exit between the kernel
//! queueing a notification and the tracer acting on it.

use std::collections::HashMap;

use nix::unistd::Pid;

use crate::event::Verdict;

/// Which half of the entry/exit stop pair comes next for a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Entry,
    Exit,
}

/// Syscall observed at an entry stop, held until the matching exit stop.
#[derive(Debug, Clone)]
pub struct PendingSyscall {
    pub nr: u64,
    pub name: &'static str,
    pub fd: i32,
    pub target: String,
    pub verdict: Verdict,
}

#[derive(Debug)]
pub struct ProcessRecord {
    pub depth: u32,
    /// Expected phase of the next syscall stop. Meaningful only once
    /// `seen_syscall` is set; the tracer classifies the first stop from the
    /// registers, since a forked child surfaces at its clone exit.
    pub phase: Phase,
    pub seen_syscall: bool,
    pub last_ret: i64,
    pub pending: Option<PendingSyscall>,
}

impl ProcessRecord {
    fn new(depth: u32) -> Self {
        Self {
            depth,
            phase: Phase::Entry,
            seen_syscall: false,
            last_ret: 0,
            pending: None,
        }
    }
}

/// Records for every live traced process, keyed by pid.
#[derive(Debug, Default)]
pub struct ProcessTable {
    map: HashMap<Pid, ProcessRecord>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `pid`, created at depth 0 on first sight.
    pub fn observe(&mut self, pid: Pid) -> &mut ProcessRecord {
        self.map.entry(pid).or_insert_with(|| ProcessRecord::new(0))
    }

    /// Place the child at the parent's depth + 1; a missing parent is
    /// treated as root. The child's stops can be delivered before the
    /// parent's fork event, so an existing record is kept as-is apart from
    /// the depth: resetting it would discard classification already done.
    pub fn observe_child(&mut self, parent: Pid, child: Pid) -> u32 {
        let depth = self.depth_of(parent).map_or(1, |d| d + 1);
        let record = self
            .map
            .entry(child)
            .or_insert_with(|| ProcessRecord::new(depth));
        record.depth = depth;
        depth
    }

    pub fn depth_of(&self, pid: Pid) -> Option<u32> {
        self.map.get(&pid).map(|r| r.depth)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ProcessRecord> {
        self.map.get_mut(&pid)
    }

    /// Flip the entry/exit phase, returning the phase that was current
    /// before the flip. Unknown pid yields `None`.
    pub fn advance_phase(&mut self, pid: Pid) -> Option<Phase> {
        self.map.get_mut(&pid).map(|r| {
            let before = r.phase;
            r.phase = match before {
                Phase::Entry => Phase::Exit,
                Phase::Exit => Phase::Entry,
            };
            before
        })
    }

    pub fn remove(&mut self, pid: Pid) {
        self.map.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.map.keys().copied()
    }
}

/// Bound on live (pid, fd) entries. Past this, new opens are silently not
/// recorded: attribution degrades, the engine keeps running.
pub const FD_TABLE_CAPACITY: usize = 4096;

/// Descriptor-to-path attribution, keyed by (pid, fd).
///
/// Descriptor numbers are only unique within one process and are reused
/// after close, so entries are removed eagerly on close and on process
/// exit. Duplication copies the path; the two entries are independent.
#[derive(Debug, Default)]
pub struct FdTable {
    map: HashMap<(Pid, i32), String>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_open(&mut self, pid: Pid, fd: i32, path: String) {
        if self.map.len() >= FD_TABLE_CAPACITY && !self.map.contains_key(&(pid, fd)) {
            log::debug!("descriptor table full, not recording fd {fd} for pid {pid}");
            return;
        }
        self.map.insert((pid, fd), path);
    }

    /// Copy `old_fd`'s path to `new_fd`. No-op when `old_fd` is unmapped
    /// (e.g. a raw socket descriptor), which is valid and simply yields no
    /// resolvable path later.
    pub fn duplicate(&mut self, pid: Pid, old_fd: i32, new_fd: i32) {
        if let Some(path) = self.map.get(&(pid, old_fd)).cloned() {
            self.record_open(pid, new_fd, path);
        }
    }

    pub fn resolve(&self, pid: Pid, fd: i32) -> Option<&str> {
        self.map.get(&(pid, fd)).map(String::as_str)
    }

    pub fn forget(&mut self, pid: Pid, fd: i32) {
        self.map.remove(&(pid, fd));
    }

    /// Drop every entry belonging to an exited process.
    pub fn remove_process(&mut self, pid: Pid) {
        self.map.retain(|(p, _), _| *p != pid);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
