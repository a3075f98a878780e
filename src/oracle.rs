//! Client side of the decision-oracle channel.
//!
//! The oracle is an external process reachable over two pre-existing named
//! pipes: requests go out as newline-terminated records, verdicts come back
//! as exactly one byte per request (`'0'` = block, anything else = allow).
//! The client fails open: a slow, absent, or malformed response is treated
//! as an allow so the subject never hangs on a dead oracle.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{ConfigError, Result};
use crate::event::{PolicyQuery, Verdict};

pub const DEFAULT_REQ_PATH: &str = "/tmp/warden_req";
pub const DEFAULT_RESP_PATH: &str = "/tmp/warden_resp";

/// Hard deadline on the verdict round-trip, in milliseconds.
pub const VERDICT_TIMEOUT_MS: u16 = 100;

/// How long `connect` waits for the oracle to pick up the request pipe.
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

const CONNECT_RETRY_MS: u64 = 25;

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub req_path: PathBuf,
    pub resp_path: PathBuf,
    pub timeout_ms: u16,
    pub connect_timeout_ms: u64,
}

impl OracleConfig {
    /// Channel paths from the environment, falling back to the well-known
    /// defaults.
    pub fn from_env() -> Self {
        Self {
            req_path: env::var("WARDEN_ORACLE_REQ")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_REQ_PATH)),
            resp_path: env::var("WARDEN_ORACLE_RESP")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_RESP_PATH)),
            timeout_ms: VERDICT_TIMEOUT_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug)]
pub struct OracleClient {
    req: File,
    resp: File,
    timeout_ms: u16,
}

impl OracleClient {
    /// Connect to both channels. A missing request pipe is a fatal
    /// configuration error, and so is an oracle that exists but never
    /// opens its end within the connect deadline; a wedged oracle must
    /// surface at startup, not hang the engine.
    pub fn connect(config: &OracleConfig) -> Result<Self> {
        if !config.req_path.exists() {
            return Err(ConfigError::OracleChannelMissing {
                path: config.req_path.display().to_string(),
            }
            .into());
        }
        if !config.resp_path.exists() {
            return Err(ConfigError::OracleResponseMissing {
                path: config.resp_path.display().to_string(),
            }
            .into());
        }

        let req = open_request(config)?;
        let resp = open_response(config)?;
        log::debug!(
            "oracle link established ({} / {})",
            config.req_path.display(),
            config.resp_path.display()
        );

        Ok(Self {
            req,
            resp,
            timeout_ms: config.timeout_ms,
        })
    }

    /// Send one query and wait for the verdict within the deadline.
    pub fn ask(&mut self, query: &PolicyQuery) -> Verdict {
        self.drain_stale();

        let line = query.encode();
        if let Err(e) = self.req.write_all(line.as_bytes()) {
            log::warn!("oracle request write failed, failing open: {e}");
            return Verdict::Allow;
        }

        let mut fds = [PollFd::new(self.resp.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(self.timeout_ms)) {
            Ok(0) => {
                log::debug!("oracle verdict timed out for {}, failing open", query.verb);
                Verdict::Allow
            }
            Ok(_) => {
                let mut buf = [0u8; 1];
                match self.resp.read(&mut buf) {
                    Ok(1) => Verdict::from_byte(buf[0]),
                    Ok(_) => {
                        log::warn!("oracle response channel closed, failing open");
                        Verdict::Allow
                    }
                    Err(e) => {
                        log::warn!("oracle response read failed, failing open: {e}");
                        Verdict::Allow
                    }
                }
            }
            Err(e) => {
                log::warn!("oracle response poll failed, failing open: {e}");
                Verdict::Allow
            }
        }
    }

    /// Discard verdict bytes already queued in the response pipe. A query
    /// that timed out may still get its answer later; that byte belongs to
    /// the abandoned query, and reading it as the next answer would shift
    /// every verdict one syscall late.
    fn drain_stale(&mut self) {
        loop {
            let mut fds = [PollFd::new(self.resp.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    let mut buf = [0u8; 1];
                    match self.resp.read(&mut buf) {
                        Ok(1) => {
                            log::debug!("discarding stale oracle verdict {:?}", buf[0] as char);
                        }
                        _ => return,
                    }
                }
            }
        }
    }
}

/// Open the request pipe for writing without blocking on a reader. A FIFO
/// with no reader yields ENXIO; retry until the oracle picks it up or the
/// deadline passes.
fn open_request(config: &OracleConfig) -> Result<File> {
    let deadline = Instant::now() + Duration::from_millis(config.connect_timeout_ms);
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&config.req_path)
        {
            Ok(file) => {
                clear_nonblock(file.as_raw_fd())?;
                return Ok(file);
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if Instant::now() >= deadline {
                    return Err(ConfigError::OracleUnresponsive {
                        path: config.req_path.display().to_string(),
                        waited_ms: config.connect_timeout_ms,
                    }
                    .into());
                }
                thread::sleep(Duration::from_millis(CONNECT_RETRY_MS));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// The read side of a FIFO opens without a writer being present; if the
/// oracle never attaches, every poll times out and fails open.
fn open_response(config: &OracleConfig) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&config.resp_path)?;
    clear_nonblock(file.as_raw_fd())?;
    Ok(file)
}

fn clear_nonblock(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NO_FD;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use std::io::{BufRead, BufReader};
    use std::sync::atomic::{AtomicU32, Ordering};

    static PIPE_SEQ: AtomicU32 = AtomicU32::new(0);

    fn pipe_pair() -> (PathBuf, PathBuf) {
        let n = PIPE_SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = env::temp_dir().join(format!("warden-oracle-test-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let req = dir.join("req");
        let resp = dir.join("resp");
        mkfifo(&req, Mode::from_bits_truncate(0o600)).unwrap();
        mkfifo(&resp, Mode::from_bits_truncate(0o600)).unwrap();
        (req, resp)
    }

    fn config(req: PathBuf, resp: PathBuf, timeout_ms: u16) -> OracleConfig {
        OracleConfig {
            req_path: req,
            resp_path: resp,
            timeout_ms,
            connect_timeout_ms: 1000,
        }
    }

    fn query() -> PolicyQuery {
        PolicyQuery {
            verb: "mkdir",
            target: "/tmp/x".to_string(),
            pid: 1,
            fd: NO_FD,
            ret: 0,
        }
    }

    /// Scripted oracle: reads one request line, optionally answers a byte.
    fn scripted_oracle(req: PathBuf, resp: PathBuf, answer: Option<u8>) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let reader = File::open(&req).unwrap();
            let mut resp = OpenOptions::new().write(true).open(&resp).unwrap();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).unwrap();
            if let Some(b) = answer {
                resp.write_all(&[b]).unwrap();
            }
            line
        })
    }

    #[test]
    fn explicit_allow() {
        let (req, resp) = pipe_pair();
        let oracle = scripted_oracle(req.clone(), resp.clone(), Some(b'1'));

        let mut client = OracleClient::connect(&config(req, resp, 500)).unwrap();
        assert_eq!(client.ask(&query()), Verdict::Allow);

        let line = oracle.join().unwrap();
        assert_eq!(line, "SYSCALL:mkdir:/tmp/x:pid=1:fd=-1:ret=0\n");
    }

    #[test]
    fn explicit_block() {
        let (req, resp) = pipe_pair();
        let oracle = scripted_oracle(req.clone(), resp.clone(), Some(b'0'));

        let mut client = OracleClient::connect(&config(req, resp, 500)).unwrap();
        assert_eq!(client.ask(&query()), Verdict::Block);
        oracle.join().unwrap();
    }

    #[test]
    fn timeout_fails_open() {
        let (req, resp) = pipe_pair();
        // Oracle reads the request but never answers.
        let oracle = scripted_oracle(req.clone(), resp.clone(), None);

        let mut client = OracleClient::connect(&config(req, resp, 50)).unwrap();
        assert_eq!(client.ask(&query()), Verdict::Allow);
        oracle.join().unwrap();
    }

    #[test]
    fn late_verdict_does_not_leak_into_next_query() {
        let (req, resp) = pipe_pair();
        let (req_c, resp_c) = (req.clone(), resp.clone());
        let oracle = thread::spawn(move || {
            let reader = File::open(&req_c).unwrap();
            let mut writer = OpenOptions::new().write(true).open(&resp_c).unwrap();
            let mut lines = BufReader::new(reader);
            let mut line = String::new();

            // First query: answer with a block, but well past the client's
            // deadline.
            lines.read_line(&mut line).unwrap();
            thread::sleep(Duration::from_millis(150));
            writer.write_all(&[b'0']).unwrap();

            // Second query: prompt allow.
            line.clear();
            lines.read_line(&mut line).unwrap();
            writer.write_all(&[b'1']).unwrap();
        });

        let mut client = OracleClient::connect(&config(req, resp, 50)).unwrap();
        assert_eq!(client.ask(&query()), Verdict::Allow);

        // Let the late block byte land in the pipe.
        thread::sleep(Duration::from_millis(300));

        // The stale '0' must be discarded, not read as this query's answer.
        assert_eq!(client.ask(&query()), Verdict::Allow);
        oracle.join().unwrap();
    }

    #[test]
    fn missing_request_channel_is_fatal() {
        let config = config(
            PathBuf::from("/nonexistent/warden_req"),
            PathBuf::from("/nonexistent/warden_resp"),
            50,
        );
        let err = OracleClient::connect(&config).unwrap_err();
        assert!(err.to_string().contains("oracle request channel"));
    }

    #[test]
    fn unresponsive_oracle_is_diagnosed_at_startup() {
        // Pipes exist but nothing ever opens them.
        let (req, resp) = pipe_pair();
        let mut config = config(req, resp, 50);
        config.connect_timeout_ms = 100;

        let err = OracleClient::connect(&config).unwrap_err();
        assert!(err.to_string().contains("not listening"));
    }
}
