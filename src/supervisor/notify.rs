//! Raw seccomp user-notification interface.
//!
//! The kernel structs and ioctls are not exposed by libc, so they are
//! declared here verbatim from `linux/seccomp.h`. Layout must match the
//! kernel exactly; the size tests below pin it.

use std::io;
use std::os::fd::RawFd;

use crate::error::{Result, SupervisorError};
use crate::supervisor::filter::SockFprog;

pub const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
pub const SECCOMP_FILTER_FLAG_NEW_LISTENER: libc::c_ulong = 1 << 3;

pub const SECCOMP_IOCTL_NOTIF_RECV: libc::c_ulong = 0xc050_2100;
pub const SECCOMP_IOCTL_NOTIF_SEND: libc::c_ulong = 0xc018_2101;
pub const SECCOMP_IOCTL_NOTIF_ID_VALID: libc::c_ulong = 0x4008_2102;
pub const SECCOMP_IOCTL_NOTIF_ADDFD: libc::c_ulong = 0x4018_2103;

/// Response flag: let the original syscall proceed in the subject.
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

/// Addfd flag: install the descriptor and answer the notification in one
/// atomic step, with the new descriptor number as the return value.
pub const SECCOMP_ADDFD_FLAG_SEND: u32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompNotif {
    pub id: u64,
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

impl SeccompNotif {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    pub error: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifAddfd {
    pub id: u64,
    pub flags: u32,
    pub srcfd: u32,
    pub newfd: u32,
    pub newfd_flags: u32,
}

/// Install `prog` with a user-notification listener attached. Must run in
/// the subject process after `PR_SET_NO_NEW_PRIVS`. Returns the listener
/// descriptor.
pub fn install_filter_with_listener(prog: &SockFprog) -> Result<RawFd> {
    let res = unsafe {
        libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0)
    };
    if res != 0 {
        return Err(SupervisorError::FilterInstall(io::Error::last_os_error()).into());
    }

    let fd = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_NEW_LISTENER,
            prog as *const SockFprog,
        )
    };
    if fd < 0 {
        return Err(SupervisorError::FilterInstall(io::Error::last_os_error()).into());
    }
    Ok(fd as RawFd)
}

/// Block until the next trapped syscall arrives. `Ok(None)` means the
/// notification was aborted before we claimed it (subject died mid-call).
pub fn notif_recv(listener: RawFd) -> Result<Option<SeccompNotif>> {
    let mut notif = SeccompNotif::zeroed();
    let res = unsafe { libc::ioctl(listener, SECCOMP_IOCTL_NOTIF_RECV, &mut notif) };
    if res < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::EINTR) => Ok(None),
            _ => Err(SupervisorError::Notify(err).into()),
        };
    }
    Ok(Some(notif))
}

/// Answer a claimed notification. ENOENT means the subject already died;
/// that is not an error.
pub fn notif_send(listener: RawFd, resp: &mut SeccompNotifResp) -> Result<()> {
    let res = unsafe { libc::ioctl(listener, SECCOMP_IOCTL_NOTIF_SEND, resp) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        return Err(SupervisorError::Notify(err).into());
    }
    Ok(())
}

/// Check that the notification id still refers to a live, blocked syscall.
/// Required after reading subject memory: a stale id means the subject
/// raced us and nothing we read can be trusted.
pub fn notif_id_valid(listener: RawFd, id: u64) -> bool {
    let res = unsafe { libc::ioctl(listener, SECCOMP_IOCTL_NOTIF_ID_VALID, &id) };
    res == 0
}

/// Install a descriptor into the subject and answer the notification in
/// the same ioctl. Returns the descriptor number the subject received.
pub fn notif_addfd(listener: RawFd, id: u64, srcfd: RawFd, newfd_flags: u32) -> Result<i32> {
    let addfd = SeccompNotifAddfd {
        id,
        flags: SECCOMP_ADDFD_FLAG_SEND,
        srcfd: srcfd as u32,
        newfd: 0,
        newfd_flags,
    };
    let res = unsafe { libc::ioctl(listener, SECCOMP_IOCTL_NOTIF_ADDFD, &addfd) };
    if res < 0 {
        return Err(SupervisorError::Notify(io::Error::last_os_error()).into());
    }
    Ok(res)
}

/// Create a unix socketpair for moving the listener descriptor from the
/// subject to the engine.
pub fn socketpair() -> Result<(RawFd, RawFd)> {
    let mut fds = [0; 2];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if res < 0 {
        return Err(SupervisorError::FdTransfer(io::Error::last_os_error()).into());
    }
    Ok((fds[0], fds[1]))
}

/// Send one descriptor over a unix socket as SCM_RIGHTS ancillary data.
pub fn send_fd(sock: RawFd, fd: RawFd) -> Result<()> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: 1,
    };
    let mut cmsg_buf = vec![0u8; unsafe { libc::CMSG_SPACE(4) } as usize];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(4) as usize;
        std::ptr::copy_nonoverlapping(&fd as *const RawFd as *const u8, libc::CMSG_DATA(cmsg), 4);
    }

    let res = unsafe { libc::sendmsg(sock, &msg, 0) };
    if res < 0 {
        return Err(SupervisorError::FdTransfer(io::Error::last_os_error()).into());
    }
    Ok(())
}

/// Receive one descriptor sent with [`send_fd`].
pub fn recv_fd(sock: RawFd) -> Result<RawFd> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: 1,
    };
    let mut cmsg_buf = vec![0u8; unsafe { libc::CMSG_SPACE(4) } as usize];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let res = unsafe { libc::recvmsg(sock, &mut msg, 0) };
    if res < 0 {
        return Err(SupervisorError::FdTransfer(io::Error::last_os_error()).into());
    }

    let fd = unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(SupervisorError::FdTransfer(io::Error::new(
                io::ErrorKind::InvalidData,
                "no descriptor in control message",
            ))
            .into());
        }
        let mut fd: RawFd = -1;
        std::ptr::copy_nonoverlapping(libc::CMSG_DATA(cmsg), &mut fd as *mut RawFd as *mut u8, 4);
        fd
    };
    if fd < 0 {
        return Err(SupervisorError::FdTransfer(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid descriptor received",
        ))
        .into());
    }
    Ok(fd)
}
