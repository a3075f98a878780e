//! Seccomp user-notification backend.
//!
//! A filter installed in the subject traps the watchlist to a listener
//! descriptor, which the subject hands back over a socketpair before
//! exec. The engine then services notifications: it reads the trapped
//! syscall's arguments out of subject memory, queries the oracle, and
//! answers with a continue, an EPERM, or an injected descriptor.
//!
//! Allowed opens are never re-run by the subject. The engine opens the
//! path itself and installs the resulting descriptor with ADDFD, so the
//! path that was checked is the path that was opened, whatever the
//! subject's other threads do in between.

mod filter;
mod notify;

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::{BorrowedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{Result, SupervisorError, TracerError};
use crate::event::{
    Backend, PolicyQuery, ProcessEventKind, RunStats, TraceEvent, Verdict, NO_FD,
};
use crate::oracle::OracleClient;
use crate::output::OutputManager;

use filter::NotifyFilter;
use notify::{SeccompNotif, SeccompNotifResp, SECCOMP_USER_NOTIF_FLAG_CONTINUE};

const POLL_INTERVAL_MS: u16 = 100;
const MAX_PATH_LEN: usize = 4096;

pub struct Supervisor {
    command: Vec<String>,
    oracle: Option<OracleClient>,
    output: OutputManager,
    stats: RunStats,
    seen_pids: HashSet<u32>,
    timeout: Option<Duration>,
    shutdown: Arc<AtomicBool>,
    start: Instant,
}

impl Supervisor {
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
            stats: RunStats::default(),
            seen_pids: HashSet::new(),
            timeout,
            shutdown,
            start: Instant::now(),
        }
    }

    pub fn run(mut self) -> Result<i32> {
        self.start = Instant::now();
        let (parent_sock, child_sock) = notify::socketpair()?;

        match unsafe { fork() }.map_err(SupervisorError::Fork)? {
            ForkResult::Child => {
                unsafe { libc::close(parent_sock) };
                self.run_subject(child_sock)
            }
            ForkResult::Parent { child } => {
                unsafe { libc::close(child_sock) };
                let listener = notify::recv_fd(parent_sock)?;
                unsafe { libc::close(parent_sock) };

                self.seen_pids.insert(child.as_raw() as u32);
                self.stats.process_count = 1;
                self.output
                    .emit(&TraceEvent::process(child.as_raw(), ProcessEventKind::Attached))?;

                let result = self.serve(listener, child);
                unsafe { libc::close(listener) };

                let code = *result.as_ref().unwrap_or(&-1);
                let duration_ms = self.start.elapsed().as_millis() as u64;
                let summary = self.stats.into_summary(code, duration_ms);
                self.output.emit(&TraceEvent::Summary(summary))?;
                self.output.flush()?;
                result
            }
        }
    }

    fn run_subject(&self, sock: RawFd) -> ! {
        let fail = |what: &str, e: &dyn std::fmt::Display| -> ! {
            eprintln!("warden: {what}: {e}");
            std::process::exit(127);
        };

        let filter = match NotifyFilter::build() {
            Ok(f) => f,
            Err(e) => fail("cannot build filter", &e),
        };
        let listener = match notify::install_filter_with_listener(&filter.prog()) {
            Ok(fd) => fd,
            Err(e) => fail("cannot install filter", &e),
        };
        if let Err(e) = notify::send_fd(sock, listener) {
            fail("cannot hand over listener", &e);
        }
        unsafe {
            libc::close(listener);
            libc::close(sock);
        }

        let err = Command::new(&self.command[0])
            .args(&self.command[1..])
            .exec();
        fail(&format!("cannot execute {}", self.command[0]), &err)
    }

    fn serve(&mut self, listener: RawFd, root: Pid) -> Result<i32> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                log::info!("shutdown requested, killing subject");
                return Ok(self.kill_and_reap(root));
            }
            if let Some(limit) = self.timeout {
                if self.start.elapsed() > limit {
                    log::warn!("subject exceeded {}s limit, killing", limit.as_secs());
                    self.kill_and_reap(root);
                    return Err(TracerError::Timeout(limit.as_secs()).into());
                }
            }

            match waitpid(root, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.output.emit(&TraceEvent::process(
                        root.as_raw(),
                        ProcessEventKind::Exited { code },
                    ))?;
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.output.emit(&TraceEvent::process(
                        root.as_raw(),
                        ProcessEventKind::Signaled { signal: sig.to_string() },
                    ))?;
                    return Ok(128 + sig as i32);
                }
                _ => {}
            }

            let borrowed = unsafe { BorrowedFd::borrow_raw(listener) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(SupervisorError::Notify(std::io::Error::from(e)).into())
                }
            }

            let Some(notif) = notify::notif_recv(listener)? else {
                continue;
            };
            self.dispatch(listener, &notif)?;
        }
    }

    fn dispatch(&mut self, listener: RawFd, notif: &SeccompNotif) -> Result<()> {
        self.stats.total_syscalls += 1;
        if self.seen_pids.insert(notif.pid) {
            self.stats.process_count = self.seen_pids.len() as u64;
        }

        let nr = notif.data.nr as libc::c_long;
        if nr == libc::SYS_openat {
            return self.handle_openat(listener, notif);
        }

        let (verb, target) = match nr {
            libc::SYS_execve => (
                "execve",
                self.read_path(notif, notif.data.args[0]).unwrap_or_default(),
            ),
            libc::SYS_connect => (
                "connect",
                self.read_sockaddr(notif, notif.data.args[1], notif.data.args[2] as usize)
                    .unwrap_or_default(),
            ),
            libc::SYS_init_module => ("init_module", String::new()),
            libc::SYS_mprotect => ("mprotect", "PROT_EXEC".to_string()),
            _ => {
                log::debug!("unexpected trapped syscall {nr}, continuing");
                return self.respond_continue(listener, notif.id);
            }
        };

        // The id check covers the memory reads above. A stale id means the
        // subject replaced the blocked syscall; drop the notification.
        if !notify::notif_id_valid(listener, notif.id) {
            log::debug!("notification {} went stale, dropping", notif.id);
            return Ok(());
        }

        let verdict = self.consult(verb, &target, notif, NO_FD);
        let query = self.query(verb, target, notif, NO_FD, 0);

        // mprotect and init_module are detection surface: the oracle hears
        // about them, but the call always proceeds. Blocking mprotect would
        // take the dynamic loader down with the subject.
        let enforce = !matches!(nr, libc::SYS_mprotect | libc::SYS_init_module);
        if verdict.is_block() && !enforce {
            log::warn!(
                "pid {}: oracle flagged {verb}, detection-only syscall continues",
                notif.pid
            );
        }

        if verdict.is_block() && enforce {
            self.stats.blocked += 1;
            self.respond_error(listener, notif.id, libc::EPERM)?;
            self.output.emit(&TraceEvent::syscall(
                notif.pid as i32,
                &query,
                Some(-(libc::EPERM as i64)),
                verdict,
                Backend::Notify,
            ))
        } else {
            self.respond_continue(listener, notif.id)?;
            self.output.emit(&TraceEvent::syscall(
                notif.pid as i32,
                &query,
                None,
                verdict,
                Backend::Notify,
            ))
        }
    }

    /// Allowed opens are performed by the engine and the descriptor is
    /// injected, answering the notification atomically.
    fn handle_openat(&mut self, listener: RawFd, notif: &SeccompNotif) -> Result<()> {
        let path = match self.read_path(notif, notif.data.args[1]) {
            Some(path) => path,
            None => {
                // Attribution lost; let the kernel run the original call.
                log::warn!("could not read openat path from pid {}", notif.pid);
                return self.respond_continue(listener, notif.id);
            }
        };
        if path.is_empty() {
            // AT_EMPTY_PATH and friends; keep kernel semantics.
            return self.respond_continue(listener, notif.id);
        }
        if !notify::notif_id_valid(listener, notif.id) {
            log::debug!("notification {} went stale, dropping", notif.id);
            return Ok(());
        }

        let verdict = self.consult("openat", &path, notif, NO_FD);
        if verdict.is_block() {
            self.stats.blocked += 1;
            self.respond_error(listener, notif.id, libc::EPERM)?;
            let query = self.query("openat", path, notif, NO_FD, 0);
            return self.output.emit(&TraceEvent::syscall(
                notif.pid as i32,
                &query,
                Some(-(libc::EPERM as i64)),
                verdict,
                Backend::Notify,
            ));
        }

        let flags = notif.data.args[2] as i32;
        let mode = notif.data.args[3] as libc::mode_t;
        let c_path = match std::ffi::CString::new(path.clone()) {
            Ok(s) => s,
            Err(_) => {
                self.respond_error(listener, notif.id, libc::EINVAL)?;
                return Ok(());
            }
        };

        // Open on the subject's behalf. O_CLOEXEC is stripped here and
        // re-applied on the injected copy. Relative paths resolve against
        // the subject's dirfd or cwd through /proc, never the engine's cwd.
        let local = if path.starts_with('/') {
            unsafe { libc::open(c_path.as_ptr(), flags & !libc::O_CLOEXEC, mode) }
        } else {
            let dirfd = notif.data.args[0] as i32;
            let base = if dirfd == libc::AT_FDCWD {
                format!("/proc/{}/cwd", notif.pid)
            } else {
                format!("/proc/{}/fd/{dirfd}", notif.pid)
            };
            match open_base(&base) {
                Some(base_fd) => {
                    let fd = unsafe {
                        libc::openat(base_fd, c_path.as_ptr(), flags & !libc::O_CLOEXEC, mode)
                    };
                    unsafe { libc::close(base_fd) };
                    fd
                }
                None => {
                    // Cannot pin the subject's base; give up injection for
                    // this call rather than resolve against the wrong cwd.
                    log::warn!(
                        "pid {}: cannot resolve base for {path:?}, continuing original openat",
                        notif.pid
                    );
                    return self.respond_continue(listener, notif.id);
                }
            }
        };
        if local < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            self.respond_error(listener, notif.id, errno)?;
            let query = self.query("openat", path, notif, NO_FD, 0);
            return self.output.emit(&TraceEvent::syscall(
                notif.pid as i32,
                &query,
                Some(-(errno as i64)),
                verdict,
                Backend::Notify,
            ));
        }

        let newfd_flags = if flags & libc::O_CLOEXEC != 0 {
            libc::O_CLOEXEC as u32
        } else {
            0
        };
        let injected = notify::notif_addfd(listener, notif.id, local, newfd_flags);
        unsafe { libc::close(local) };

        let ret = match injected {
            Ok(fd) => Some(fd as i64),
            Err(e) => {
                // Subject died between recv and addfd.
                log::debug!("descriptor injection failed: {e}");
                None
            }
        };
        let query = self.query("openat", path, notif, NO_FD, 0);
        self.output.emit(&TraceEvent::syscall(
            notif.pid as i32,
            &query,
            ret,
            verdict,
            Backend::Notify,
        ))
    }

    fn consult(&mut self, verb: &'static str, target: &str, notif: &SeccompNotif, fd: i32) -> Verdict {
        match &mut self.oracle {
            Some(oracle) => {
                self.stats.queried += 1;
                let query = PolicyQuery {
                    verb,
                    target: target.to_string(),
                    pid: notif.pid as i32,
                    fd,
                    ret: 0,
                };
                oracle.ask(&query)
            }
            None => Verdict::Allow,
        }
    }

    fn query(
        &self,
        verb: &'static str,
        target: String,
        notif: &SeccompNotif,
        fd: i32,
        ret: i64,
    ) -> PolicyQuery {
        PolicyQuery {
            verb,
            target,
            pid: notif.pid as i32,
            fd,
            ret,
        }
    }

    fn respond_continue(&self, listener: RawFd, id: u64) -> Result<()> {
        let mut resp = SeccompNotifResp {
            id,
            val: 0,
            error: 0,
            flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE,
        };
        notify::notif_send(listener, &mut resp)
    }

    fn respond_error(&self, listener: RawFd, id: u64, errno: i32) -> Result<()> {
        let mut resp = SeccompNotifResp {
            id,
            val: 0,
            error: -errno,
            flags: 0,
        };
        notify::notif_send(listener, &mut resp)
    }

    /// NUL-terminated string from subject memory via /proc/pid/mem.
    fn read_path(&self, notif: &SeccompNotif, addr: u64) -> Option<String> {
        let data = self.read_mem(notif.pid, addr, MAX_PATH_LEN)?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Some(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    fn read_sockaddr(&self, notif: &SeccompNotif, addr: u64, len: usize) -> Option<String> {
        if addr == 0 {
            return None;
        }
        let data = self.read_mem(notif.pid, addr, len.min(128))?;
        Some(crate::tracer::memory::format_sockaddr(&data))
    }

    fn read_mem(&self, pid: u32, addr: u64, len: usize) -> Option<Vec<u8>> {
        if addr == 0 {
            return None;
        }
        let mut file = match File::open(format!("/proc/{pid}/mem")) {
            Ok(f) => f,
            Err(e) => {
                log::debug!("cannot open /proc/{pid}/mem: {e}");
                return None;
            }
        };
        if file.seek(SeekFrom::Start(addr)).is_err() {
            return None;
        }
        let mut buf = vec![0u8; len];
        match file.read(&mut buf) {
            Ok(0) | Err(_) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
        }
    }

    fn kill_and_reap(&self, root: Pid) -> i32 {
        let _ = signal::kill(root, Signal::SIGKILL);
        let _ = waitpid(root, None);
        128 + Signal::SIGTERM as i32
    }
}

/// O_PATH handle on a directory named through /proc, following the link to
/// wherever the subject currently points it.
fn open_base(path: &str) -> Option<RawFd> {
    let c_path = std::ffi::CString::new(path).ok()?;
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        log::debug!("cannot open {path}: {}", std::io::Error::last_os_error());
        return None;
    }
    Some(fd)
}
