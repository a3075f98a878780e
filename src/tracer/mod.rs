//! Breakpoint tracer backend.
//!
//! The subject is forked with TRACEME and stopped before exec; the engine
//! then steps every process in the tree from syscall boundary to syscall
//! boundary with `ptrace::syscall`. Watchlisted calls are queried against
//! the oracle at the entry stop, and a block verdict is enforced by
//! rewriting the syscall number so the kernel fails the call with ENOSYS.
//! All descendants are picked up automatically through the TRACEFORK
//! family of options; one `waitpid(-1)` loop multiplexes the whole tree.

pub(crate) mod memory;
mod regs;
mod state;

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{Result, TracerError};
use crate::event::{
    Backend, PolicyQuery, ProcessEventKind, RunStats, TraceEvent, Verdict, NO_FD,
};
use crate::oracle::OracleClient;
use crate::output::OutputManager;
use crate::syscalls::{self, ArgKind, SyscallSig};

use state::{FdTable, PendingSyscall, Phase, ProcessTable};

pub struct Tracer {
    command: Vec<String>,
    oracle: Option<OracleClient>,
    output: OutputManager,
    processes: ProcessTable,
    fds: FdTable,
    stats: RunStats,
    timeout: Option<Duration>,
    shutdown: Arc<AtomicBool>,
    start: Instant,
}

impl Tracer {
    pub fn new(
        command: Vec<String>,
        oracle: Option<OracleClient>,
        output: OutputManager,
        timeout: Option<Duration>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            command,
            oracle,
            output,
            processes: ProcessTable::new(),
            fds: FdTable::new(),
            stats: RunStats::default(),
            timeout,
            shutdown,
            start: Instant::now(),
        }
    }

    /// Fork the subject and supervise it until the tree is gone. Returns
    /// the exit code to propagate.
    pub fn run(mut self) -> Result<i32> {
        self.start = Instant::now();
        match unsafe { fork() }.map_err(TracerError::Fork)? {
            ForkResult::Child => self.run_subject(),
            ForkResult::Parent { child } => {
                let result = self.supervise(child);
                let code = *result.as_ref().unwrap_or(&-1);
                let duration_ms = self.start.elapsed().as_millis() as u64;
                let summary = self.stats.into_summary(code, duration_ms);
                self.output.emit(&TraceEvent::Summary(summary))?;
                self.output.flush()?;
                result
            }
        }
    }

    fn run_subject(&self) -> ! {
        if let Err(e) = ptrace::traceme() {
            eprintln!("warden: cannot enable tracing: {e}");
            std::process::exit(127);
        }
        // Hand control to the engine before exec so options are set first.
        let _ = signal::raise(Signal::SIGSTOP);

        let err = Command::new(&self.command[0])
            .args(&self.command[1..])
            .exec();
        eprintln!("warden: cannot execute {}: {err}", self.command[0]);
        std::process::exit(127);
    }

    fn supervise(&mut self, root: Pid) -> Result<i32> {
        match waitpid(root, None).map_err(TracerError::Wait)? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            status => {
                log::error!("subject stopped unexpectedly before exec: {status:?}");
                return Err(TracerError::Ptrace(Errno::ECHILD).into());
            }
        }

        let options = Options::PTRACE_O_TRACESYSGOOD
            | Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEVFORK
            | Options::PTRACE_O_TRACECLONE
            | Options::PTRACE_O_TRACEEXEC
            | Options::PTRACE_O_EXITKILL;
        ptrace::setoptions(root, options).map_err(TracerError::Ptrace)?;

        self.processes.observe(root);
        self.stats.process_count = 1;
        self.output
            .emit(&TraceEvent::process(root.as_raw(), ProcessEventKind::Attached))?;
        self.resume(root, None)?;

        self.event_loop(root)
    }

    fn event_loop(&mut self, root: Pid) -> Result<i32> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                log::info!("shutdown requested, killing subject tree");
                self.kill_tree();
                return Ok(128 + Signal::SIGTERM as i32);
            }
            if let Some(limit) = self.timeout {
                if self.start.elapsed() > limit {
                    log::warn!("subject exceeded {}s limit, killing tree", limit.as_secs());
                    self.kill_tree();
                    return Err(TracerError::Timeout(limit.as_secs()).into());
                }
            }

            let status = match waitpid(None::<Pid>, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(TracerError::Wait(e).into()),
            };

            match status {
                WaitStatus::PtraceSyscall(pid) => self.handle_syscall_stop(pid)?,
                WaitStatus::PtraceEvent(pid, _, event) => self.handle_ptrace_event(pid, event)?,
                WaitStatus::Stopped(pid, sig) => self.handle_signal_stop(pid, sig)?,
                WaitStatus::Exited(pid, code) => {
                    self.handle_gone(pid, ProcessEventKind::Exited { code })?;
                    // Root exit ends the session; EXITKILL sweeps any
                    // stragglers when the engine drops the tree.
                    if pid == root {
                        return Ok(code);
                    }
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    self.handle_gone(
                        pid,
                        ProcessEventKind::Signaled { signal: sig.to_string() },
                    )?;
                    if pid == root {
                        return Ok(128 + sig as i32);
                    }
                }
                _ => {}
            }
        }

        Ok(0)
    }

    fn handle_syscall_stop(&mut self, pid: Pid) -> Result<()> {
        let regs = match regs::read(pid) {
            Ok(regs) => regs,
            Err(e) => {
                // The process can die between the stop and our read.
                log::debug!("register read failed for pid {pid}: {e}");
                return self.resume(pid, None);
            }
        };
        // During an entry stop the kernel parks -ENOSYS in rax.
        let entry_marker = regs::return_value(&regs) == -(libc::ENOSYS as i64);

        let record = self.processes.observe(pid);
        if !record.seen_syscall {
            // First stop of this process. A fresh entry carries the marker;
            // a child surfacing from its parent's clone is at that clone's
            // exit, with the child-side return value of 0.
            record.seen_syscall = true;
            record.phase = if entry_marker { Phase::Entry } else { Phase::Exit };
        }
        let phase = self.processes.advance_phase(pid).unwrap_or(Phase::Entry);

        match phase {
            Phase::Entry => self.on_syscall_entry(pid, &regs)?,
            Phase::Exit => self.on_syscall_exit(pid, &regs)?,
        }
        self.resume(pid, None)
    }

    fn on_syscall_entry(&mut self, pid: Pid, regs: &regs::UserRegs) -> Result<()> {
        self.stats.total_syscalls += 1;

        let nr = regs::syscall_number(regs);
        let Some(sig) = syscalls::signature(nr) else {
            return Ok(());
        };

        let args = regs::syscall_args(regs);
        let (target, fd) = self.extract_target(pid, sig, &args);

        if sig.name == "rename" && is_dirfd_relative(nr, &args) {
            log::debug!("pid {pid}: rename via descriptor-relative dirfd, dirfd not resolved");
        }

        let last_ret = self.processes.get_mut(pid).map_or(0, |r| r.last_ret);
        let query = PolicyQuery {
            verb: sig.name,
            target,
            pid: pid.as_raw(),
            fd,
            ret: last_ret,
        };

        let verdict = match &mut self.oracle {
            Some(oracle) => {
                self.stats.queried += 1;
                oracle.ask(&query)
            }
            None => Verdict::Allow,
        };

        if verdict.is_block() {
            let mut poisoned = *regs;
            regs::poison_syscall(&mut poisoned);
            match regs::write(pid, &poisoned) {
                Ok(()) => self.stats.blocked += 1,
                Err(e) => log::warn!("could not poison syscall for pid {pid}: {e}"),
            }
        }

        if let Some(record) = self.processes.get_mut(pid) {
            record.pending = Some(PendingSyscall {
                nr,
                name: sig.name,
                fd,
                target: query.target,
                verdict,
            });
        }
        Ok(())
    }

    fn on_syscall_exit(&mut self, pid: Pid, regs: &regs::UserRegs) -> Result<()> {
        let ret = regs::return_value(regs);

        let pending = match self.processes.get_mut(pid) {
            Some(record) => {
                record.last_ret = ret;
                record.pending.take()
            }
            None => None,
        };
        let Some(pending) = pending else {
            return Ok(());
        };

        if syscalls::is_open_family(pending.nr) {
            if pending.verdict == Verdict::Allow && ret >= 0 {
                self.fds.record_open(pid, ret as i32, pending.target.clone());
            }
        } else if syscalls::is_dup_family(pending.nr) {
            if ret >= 0 {
                self.fds.duplicate(pid, pending.fd, ret as i32);
            }
        } else if syscalls::is_close(pending.nr) {
            // The kernel releases the descriptor even on most close errors.
            self.fds.forget(pid, pending.fd);
        }

        let query = PolicyQuery {
            verb: pending.name,
            target: pending.target,
            pid: pid.as_raw(),
            fd: pending.fd,
            ret,
        };
        self.output.emit(&TraceEvent::syscall(
            pid.as_raw(),
            &query,
            Some(ret),
            pending.verdict,
            Backend::Ptrace,
        ))
    }

    fn extract_target(&mut self, pid: Pid, sig: &SyscallSig, args: &[u64; 6]) -> (String, i32) {
        match sig.kind {
            ArgKind::None => (String::new(), NO_FD),
            ArgKind::Str => {
                let target = memory::read_string(pid, args[sig.arg_index], memory::MAX_STRING_LEN)
                    .unwrap_or_else(|e| {
                        log::debug!("path read failed for pid {pid}: {e}");
                        String::new()
                    });
                (target, NO_FD)
            }
            ArgKind::Int => {
                let fd = args[sig.arg_index] as i32;
                let target = self.fds.resolve(pid, fd).unwrap_or("").to_string();
                (target, fd)
            }
            ArgKind::SockAddr => {
                let fd = args[0] as i32;
                let target = memory::read_sockaddr(pid, args[sig.arg_index], args[2] as usize)
                    .unwrap_or_else(|e| {
                        log::debug!("sockaddr read failed for pid {pid}: {e}");
                        String::new()
                    });
                (target, fd)
            }
        }
    }

    fn handle_ptrace_event(&mut self, pid: Pid, event: i32) -> Result<()> {
        match event {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                match ptrace::getevent(pid) {
                    Ok(msg) => {
                        let child = Pid::from_raw(msg as i32);
                        let depth = self.processes.observe_child(pid, child);
                        self.stats.process_count += 1;
                        self.output.emit(&TraceEvent::process(
                            child.as_raw(),
                            ProcessEventKind::Forked {
                                parent_pid: pid.as_raw(),
                                depth,
                            },
                        ))?;
                    }
                    Err(e) => log::debug!("fork event without child pid: {e}"),
                }
            }
            libc::PTRACE_EVENT_EXEC => {
                self.output
                    .emit(&TraceEvent::process(pid.as_raw(), ProcessEventKind::Exec))?;
            }
            _ => {}
        }
        self.resume(pid, None)
    }

    /// Plain signal stop. New children announce themselves with a SIGSTOP
    /// that must be swallowed; every other signal is delivered unchanged.
    fn handle_signal_stop(&mut self, pid: Pid, sig: Signal) -> Result<()> {
        self.processes.observe(pid);
        let deliver = if sig == Signal::SIGSTOP { None } else { Some(sig) };
        self.resume(pid, deliver)
    }

    fn handle_gone(&mut self, pid: Pid, kind: ProcessEventKind) -> Result<()> {
        self.processes.remove(pid);
        self.fds.remove_process(pid);
        self.output.emit(&TraceEvent::process(pid.as_raw(), kind))
    }

    fn resume(&self, pid: Pid, sig: Option<Signal>) -> Result<()> {
        match ptrace::syscall(pid, sig) {
            Ok(()) => Ok(()),
            // Died while we held it stopped; the wait loop will reap it.
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(TracerError::Ptrace(e).into()),
        }
    }

    fn kill_tree(&mut self) {
        let pids: Vec<Pid> = self.processes.pids().collect();
        for pid in pids {
            let _ = signal::kill(pid, Signal::SIGKILL);
        }
        // Reap whatever is left so no zombies outlive the engine.
        while waitpid(None::<Pid>, Some(WaitPidFlag::__WALL)).is_ok() {}
    }
}

fn is_dirfd_relative(nr: u64, args: &[u64; 6]) -> bool {
    (nr == libc::SYS_renameat as u64 || nr == libc::SYS_renameat2 as u64)
        && args[0] as i32 != libc::AT_FDCWD
}
