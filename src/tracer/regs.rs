//! x86_64 register access for stopped tracees.
//!
//! nix does not expose PTRACE_GETREGS/SETREGS with the libc struct on all
//! targets, so the raw ptrace calls go through libc directly.

use nix::unistd::Pid;

use crate::error::{Result, TracerError};

/// Syscall number the kernel's dispatcher rejects as unsupported. Writing
/// this into the number register at an entry stop turns the in-flight
/// syscall into a no-op that returns ENOSYS to the subject.
pub const POISONED_SYSCALL: u64 = u64::MAX;

pub type UserRegs = libc::user_regs_struct;

pub fn read(pid: Pid) -> Result<UserRegs> {
    let mut regs: UserRegs = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::ptrace(libc::PTRACE_GETREGS, pid.as_raw(), 0, &mut regs as *mut _) };
    if res < 0 {
        return Err(TracerError::Ptrace(nix::Error::last()).into());
    }
    Ok(regs)
}

pub fn write(pid: Pid, regs: &UserRegs) -> Result<()> {
    let res = unsafe { libc::ptrace(libc::PTRACE_SETREGS, pid.as_raw(), 0, regs as *const _) };
    if res < 0 {
        return Err(TracerError::Ptrace(nix::Error::last()).into());
    }
    Ok(())
}

pub fn syscall_number(regs: &UserRegs) -> u64 {
    regs.orig_rax
}

pub fn syscall_args(regs: &UserRegs) -> [u64; 6] {
    [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9]
}

pub fn return_value(regs: &UserRegs) -> i64 {
    regs.rax as i64
}

/// Rewrite the syscall number so the kernel rejects the call.
pub fn poison_syscall(regs: &mut UserRegs) {
    regs.orig_rax = POISONED_SYSCALL;
}
