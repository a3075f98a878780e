//! Static syscall signature table for the breakpoint tracer.
//!
//! Maps a syscall number to its human name, the register slot of the
//! security-relevant argument, and how that argument should be extracted
//! from the subject. Loaded once, read-only afterwards.

use std::collections::HashMap;
use std::sync::LazyLock;

/// Extraction strategy for the critical argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Nothing to extract.
    None,
    /// Null-terminated string in subject memory (file paths).
    Str,
    /// Plain integer register value (descriptors, flags).
    Int,
    /// Socket address struct in subject memory; the descriptor is arg 0.
    SockAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct SyscallSig {
    pub name: &'static str,
    /// Index into the six syscall argument registers.
    pub arg_index: usize,
    pub kind: ArgKind,
}

const fn sig(name: &'static str, arg_index: usize, kind: ArgKind) -> SyscallSig {
    SyscallSig {
        name,
        arg_index,
        kind,
    }
}

static WATCHLIST: LazyLock<HashMap<u64, SyscallSig>> = LazyLock::new(|| {
    let mut m = HashMap::new();

    // Filesystem integrity
    m.insert(libc::SYS_mkdir as u64, sig("mkdir", 0, ArgKind::Str));
    m.insert(libc::SYS_mkdirat as u64, sig("mkdir", 1, ArgKind::Str));
    m.insert(libc::SYS_unlink as u64, sig("unlink", 0, ArgKind::Str));
    m.insert(libc::SYS_unlinkat as u64, sig("unlink", 1, ArgKind::Str));
    m.insert(libc::SYS_rmdir as u64, sig("rmdir", 0, ArgKind::Str));
    m.insert(libc::SYS_rename as u64, sig("rename", 0, ArgKind::Str));
    m.insert(libc::SYS_renameat as u64, sig("rename", 1, ArgKind::Str));
    m.insert(libc::SYS_renameat2 as u64, sig("rename", 1, ArgKind::Str));

    // Execution and file access
    m.insert(libc::SYS_execve as u64, sig("execve", 0, ArgKind::Str));
    m.insert(libc::SYS_open as u64, sig("open", 0, ArgKind::Str));
    m.insert(libc::SYS_openat as u64, sig("openat", 1, ArgKind::Str));

    // Data flow, attributed through the descriptor table
    m.insert(libc::SYS_read as u64, sig("read", 0, ArgKind::Int));
    m.insert(libc::SYS_write as u64, sig("write", 0, ArgKind::Int));

    // Descriptor cloning; untracked duplicates would let the subject
    // shed the path attribution of an already-open descriptor.
    m.insert(libc::SYS_dup as u64, sig("dup", 0, ArgKind::Int));
    m.insert(libc::SYS_dup2 as u64, sig("dup", 0, ArgKind::Int));
    m.insert(libc::SYS_dup3 as u64, sig("dup", 0, ArgKind::Int));

    // Network egress
    m.insert(libc::SYS_socket as u64, sig("socket", 0, ArgKind::Int));
    m.insert(libc::SYS_connect as u64, sig("connect", 1, ArgKind::SockAddr));
    m.insert(libc::SYS_sendto as u64, sig("sendto", 0, ArgKind::Int));
    m.insert(libc::SYS_sendmsg as u64, sig("sendmsg", 0, ArgKind::Int));

    // Descriptor lifecycle
    m.insert(libc::SYS_close as u64, sig("close", 0, ArgKind::Int));

    m
});

/// Look up the signature for a watched syscall. `None` means the syscall
/// is not security-relevant and must be resumed without a query.
pub fn signature(nr: u64) -> Option<&'static SyscallSig> {
    WATCHLIST.get(&nr)
}

/// Open-family calls record a (fd, path) mapping at syscall exit.
pub fn is_open_family(nr: u64) -> bool {
    nr == libc::SYS_open as u64 || nr == libc::SYS_openat as u64
}

/// Dup-family calls copy an existing mapping to the returned descriptor.
pub fn is_dup_family(nr: u64) -> bool {
    nr == libc::SYS_dup as u64 || nr == libc::SYS_dup2 as u64 || nr == libc::SYS_dup3 as u64
}

pub fn is_close(nr: u64) -> bool {
    nr == libc::SYS_close as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watched_path_syscalls() {
        let s = signature(libc::SYS_mkdir as u64).unwrap();
        assert_eq!(s.name, "mkdir");
        assert_eq!(s.arg_index, 0);
        assert_eq!(s.kind, ArgKind::Str);

        // openat carries the path in the second argument slot.
        let s = signature(libc::SYS_openat as u64).unwrap();
        assert_eq!(s.name, "openat");
        assert_eq!(s.arg_index, 1);
        assert_eq!(s.kind, ArgKind::Str);
    }

    #[test]
    fn watched_descriptor_syscalls() {
        let s = signature(libc::SYS_write as u64).unwrap();
        assert_eq!(s.kind, ArgKind::Int);
        assert_eq!(s.arg_index, 0);

        let s = signature(libc::SYS_connect as u64).unwrap();
        assert_eq!(s.kind, ArgKind::SockAddr);
    }

    #[test]
    fn unwatched_syscalls_are_skipped() {
        assert!(signature(libc::SYS_getpid as u64).is_none());
        assert!(signature(libc::SYS_futex as u64).is_none());
        assert!(signature(u64::MAX).is_none());
    }

    #[test]
    fn family_predicates() {
        assert!(is_open_family(libc::SYS_openat as u64));
        assert!(is_open_family(libc::SYS_open as u64));
        assert!(!is_open_family(libc::SYS_close as u64));

        assert!(is_dup_family(libc::SYS_dup as u64));
        assert!(is_dup_family(libc::SYS_dup3 as u64));
        assert!(!is_dup_family(libc::SYS_read as u64));

        assert!(is_close(libc::SYS_close as u64));
    }
}
