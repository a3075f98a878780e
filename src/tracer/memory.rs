//! Bounds-checked access to subject memory.
//!
//! Strings are read word by word with `PTRACE_PEEKDATA` until a NUL byte
//! or the length cap, whichever comes first; the result is truncated,
//! never overrun. Bulk reads try `process_vm_readv` first and fall back
//! to ptrace when the fast path is unavailable.

use nix::unistd::Pid;

use crate::error::{Result, TracerError};

/// Cap on extracted path strings.
pub const MAX_STRING_LEN: usize = 4096;

/// Read a NUL-terminated string from subject memory, truncating at
/// `max_len`. Invalid UTF-8 degrades to a lossy conversion rather than an
/// error; the caller still gets something attributable.
pub fn read_string(pid: Pid, addr: u64, max_len: usize) -> Result<String> {
    let mut bytes = Vec::new();
    let mut current = addr;

    while bytes.len() < max_len {
        let word = nix::sys::ptrace::read(pid, current as *mut libc::c_void).map_err(|e| {
            TracerError::MemoryRead {
                addr,
                source: std::io::Error::from(e),
            }
        })?;
        for byte in word.to_le_bytes() {
            if byte == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(byte);
            if bytes.len() == max_len {
                break;
            }
        }
        current += std::mem::size_of::<libc::c_long>() as u64;
    }

    bytes.truncate(max_len);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Bulk read from subject memory. Partial reads are returned as-is.
pub fn read_memory(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    match read_memory_process_vm(pid, addr, len) {
        Ok(data) => Ok(data),
        Err(e) => {
            log::debug!("process_vm_readv failed, falling back to ptrace: {e}");
            read_memory_ptrace(pid, addr, len)
        }
    }
}

fn read_memory_process_vm(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];

    let local_iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: len,
    };
    let remote_iov = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: len,
    };

    let res = unsafe { libc::process_vm_readv(pid.as_raw(), &local_iov, 1, &remote_iov, 1, 0) };
    if res < 0 {
        return Err(TracerError::MemoryRead {
            addr,
            source: std::io::Error::last_os_error(),
        }
        .into());
    }

    buf.truncate(res as usize);
    Ok(buf)
}

fn read_memory_ptrace(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    let mut current = addr;

    while buf.len() < len {
        match nix::sys::ptrace::read(pid, current as *mut libc::c_void) {
            Ok(word) => {
                let bytes = word.to_le_bytes();
                let remaining = len - buf.len();
                buf.extend_from_slice(&bytes[..remaining.min(bytes.len())]);
                current += std::mem::size_of::<libc::c_long>() as u64;
            }
            Err(e) => {
                // Partial reads are fine once we have something.
                if buf.is_empty() {
                    return Err(TracerError::MemoryRead {
                        addr,
                        source: std::io::Error::from(e),
                    }
                    .into());
                }
                break;
            }
        }
    }

    Ok(buf)
}

/// Render a socket address from subject memory as a policy target string.
pub fn read_sockaddr(pid: Pid, addr: u64, len: usize) -> Result<String> {
    if addr == 0 {
        return Ok(String::new());
    }
    let data = read_memory(pid, addr, len.min(128))?;
    Ok(format_sockaddr(&data))
}

/// Decode the raw bytes of a sockaddr into `ip:port`, `unix:path`, or a
/// family tag for everything else.
pub fn format_sockaddr(data: &[u8]) -> String {
    if data.len() < 2 {
        return String::new();
    }
    let family = u16::from_le_bytes([data[0], data[1]]) as i32;

    match family {
        libc::AF_INET if data.len() >= 8 => {
            let port = u16::from_be_bytes([data[2], data[3]]);
            format!("{}.{}.{}.{}:{}", data[4], data[5], data[6], data[7], port)
        }
        libc::AF_INET6 if data.len() >= 4 => {
            let port = u16::from_be_bytes([data[2], data[3]]);
            format!("[ipv6]:{port}")
        }
        libc::AF_UNIX => {
            let path = data[2..]
                .split(|&b| b == 0)
                .next()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default();
            format!("unix:{path}")
        }
        _ => format!("family:{family}"),
    }
}
