//! Classic-BPF seccomp filter for the notification backend.
//!
//! Hand-assembled rather than generated: the program is small and its
//! jump structure is pinned by tests. Watchlisted syscalls trap to the
//! user-notification listener, io_uring is denied outright (it would
//! carry syscalls past the filter), mprotect only traps when PROT_EXEC
//! is requested, and everything else runs natively.

use crate::error::{Result, SupervisorError};

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_JSET: u16 = 0x40;
const BPF_RET: u16 = 0x06;
const BPF_K: u16 = 0x00;

pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

// struct seccomp_data field offsets.
const OFF_NR: u32 = 0;
const OFF_ARCH: u32 = 4;
const OFF_ARG2: u32 = 16 + 2 * 8;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

#[repr(C)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

const fn stmt(code: u16, k: u32) -> SockFilter {
    SockFilter { code, jt: 0, jf: 0, k }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

/// Owns the instruction buffer backing a [`SockFprog`].
pub struct NotifyFilter {
    program: Vec<SockFilter>,
}

impl NotifyFilter {
    pub fn build() -> Result<Self> {
        let program = vec![
            // [0-2] Wrong architecture means the syscall numbers below are
            // meaningless; kill rather than misclassify.
            stmt(BPF_LD | BPF_W | BPF_ABS, OFF_ARCH),
            jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0),
            stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
            // [3] Load the syscall number.
            stmt(BPF_LD | BPF_W | BPF_ABS, OFF_NR),
            // [4-5] io_uring: denied, jump to the EPERM return at [13].
            jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_io_uring_setup as u32, 8, 0),
            jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_io_uring_enter as u32, 7, 0),
            // [6] mprotect: argument check at [14].
            jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_mprotect as u32, 7, 0),
            // [7-10] Watchlist, trapped to the listener at [12].
            jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_execve as u32, 4, 0),
            jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_openat as u32, 3, 0),
            jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_init_module as u32, 2, 0),
            jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_connect as u32, 1, 0),
            // [11] Everything else runs natively.
            stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
            // [12] Trap to the listener.
            stmt(BPF_RET | BPF_K, SECCOMP_RET_USER_NOTIF),
            // [13] Deny with EPERM.
            stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | libc::EPERM as u32),
            // [14-17] mprotect traps only when PROT_EXEC is in the
            // protection argument.
            stmt(BPF_LD | BPF_W | BPF_ABS, OFF_ARG2),
            jump(BPF_JMP | BPF_JSET | BPF_K, libc::PROT_EXEC as u32, 0, 1),
            stmt(BPF_RET | BPF_K, SECCOMP_RET_USER_NOTIF),
            stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        ];

        if program.len() > u16::MAX as usize {
            return Err(SupervisorError::FilterInstall(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "filter too long",
            ))
            .into());
        }
        Ok(Self { program })
    }

    /// Kernel-facing view. Valid only while `self` is alive.
    pub fn prog(&self) -> SockFprog {
        SockFprog {
            len: self.program.len() as u16,
            filter: self.program.as_ptr(),
        }
    }

    pub fn instructions(&self) -> &[SockFilter] {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal cBPF evaluator, enough for the opcodes used above.
    fn run(filter: &[SockFilter], nr: u32, arch: u32, arg2: u64) -> u32 {
        let mut acc: u32 = 0;
        let mut pc = 0usize;
        loop {
            let insn = &filter[pc];
            match insn.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    acc = match insn.k {
                        OFF_NR => nr,
                        OFF_ARCH => arch,
                        OFF_ARG2 => arg2 as u32,
                        k => panic!("unexpected load offset {k}"),
                    };
                    pc += 1;
                }
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    let off = if acc == insn.k { insn.jt } else { insn.jf };
                    pc += 1 + off as usize;
                }
                c if c == BPF_JMP | BPF_JSET | BPF_K => {
                    let off = if acc & insn.k != 0 { insn.jt } else { insn.jf };
                    pc += 1 + off as usize;
                }
                c if c == BPF_RET | BPF_K => return insn.k,
                c => panic!("unexpected opcode {c:#x}"),
            }
        }
    }

    fn action(nr: libc::c_long, arg2: u64) -> u32 {
        let filter = NotifyFilter::build().unwrap();
        run(filter.instructions(), nr as u32, AUDIT_ARCH_X86_64, arg2)
    }

    #[test]
    fn jump_targets_stay_in_range() {
        let filter = NotifyFilter::build().unwrap();
        let len = filter.instructions().len();
        for (i, insn) in filter.instructions().iter().enumerate() {
            assert!(i + 1 + insn.jt as usize <= len, "jt out of range at {i}");
            assert!(i + 1 + insn.jf as usize <= len, "jf out of range at {i}");
        }
    }

    #[test]
    fn foreign_architecture_is_killed() {
        let filter = NotifyFilter::build().unwrap();
        let action = run(filter.instructions(), libc::SYS_openat as u32, 0x4000_003e, 0);
        assert_eq!(action, SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn watchlist_traps_to_listener() {
        assert_eq!(action(libc::SYS_openat, 0), SECCOMP_RET_USER_NOTIF);
        assert_eq!(action(libc::SYS_execve, 0), SECCOMP_RET_USER_NOTIF);
        assert_eq!(action(libc::SYS_connect, 0), SECCOMP_RET_USER_NOTIF);
        assert_eq!(action(libc::SYS_init_module, 0), SECCOMP_RET_USER_NOTIF);
    }

    #[test]
    fn io_uring_is_denied() {
        assert_eq!(
            action(libc::SYS_io_uring_setup, 0),
            SECCOMP_RET_ERRNO | libc::EPERM as u32
        );
        assert_eq!(
            action(libc::SYS_io_uring_enter, 0),
            SECCOMP_RET_ERRNO | libc::EPERM as u32
        );
    }

    #[test]
    fn mprotect_traps_only_on_exec() {
        let exec = (libc::PROT_READ | libc::PROT_EXEC) as u64;
        assert_eq!(action(libc::SYS_mprotect, exec), SECCOMP_RET_USER_NOTIF);

        let rw = (libc::PROT_READ | libc::PROT_WRITE) as u64;
        assert_eq!(action(libc::SYS_mprotect, rw), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn unwatched_syscalls_run_natively() {
        assert_eq!(action(libc::SYS_getpid, 0), SECCOMP_RET_ALLOW);
        assert_eq!(action(libc::SYS_read, 0), SECCOMP_RET_ALLOW);
        assert_eq!(action(libc::SYS_write, 0), SECCOMP_RET_ALLOW);
    }
}
