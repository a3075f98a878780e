use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel descriptor value for queries that carry no descriptor.
pub const NO_FD: i32 = -1;

/// One policy question, built per intercepted security-relevant syscall.
///
/// `ret` carries the subject's last observed return value so the oracle can
/// correlate entry-time queries with the outcome of the previous call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyQuery {
    pub verb: &'static str,
    pub target: String,
    pub pid: i32,
    pub fd: i32,
    pub ret: i64,
}

impl PolicyQuery {
    /// Encode as one line of the oracle request protocol.
    pub fn encode(&self) -> String {
        format!(
            "SYSCALL:{}:{}:pid={}:fd={}:ret={}\n",
            self.verb, self.target, self.pid, self.fd, self.ret
        )
    }
}

/// Binary oracle verdict. Anything other than an explicit block byte
/// (including timeouts and protocol errors) maps to `Allow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Block,
}

impl Verdict {
    pub fn from_byte(b: u8) -> Self {
        if b == b'0' {
            Verdict::Block
        } else {
            Verdict::Allow
        }
    }

    pub fn is_block(self) -> bool {
        self == Verdict::Block
    }
}

/// Which interception backend produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Breakpoint tracer: stops the subject at every syscall boundary.
    Ptrace,
    /// Seccomp user notification: traps only the watchlist.
    Notify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TraceEvent {
    Syscall(SyscallEvent),
    Process(ProcessEvent),
    Summary(RunSummary),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallEvent {
    pub timestamp: DateTime<Utc>,
    pub pid: i32,
    pub syscall: String,
    pub target: String,
    pub fd: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<i64>,
    pub verdict: Verdict,
    pub backend: Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub timestamp: DateTime<Utc>,
    pub pid: i32,
    #[serde(flatten)]
    pub kind: ProcessEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessEventKind {
    Attached,
    Forked { parent_pid: i32, depth: u32 },
    Exec,
    Exited { code: i32 },
    Signaled { signal: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub timestamp: DateTime<Utc>,
    pub total_syscalls: u64,
    pub queried: u64,
    pub blocked: u64,
    pub process_count: u64,
    pub duration_ms: u64,
    pub exit_code: i32,
}

/// Counters both backends keep while a subject runs.
#[derive(Debug, Default)]
pub struct RunStats {
    pub total_syscalls: u64,
    pub queried: u64,
    pub blocked: u64,
    pub process_count: u64,
}

impl RunStats {
    pub fn into_summary(self, exit_code: i32, duration_ms: u64) -> RunSummary {
        RunSummary {
            timestamp: Utc::now(),
            total_syscalls: self.total_syscalls,
            queried: self.queried,
            blocked: self.blocked,
            process_count: self.process_count,
            duration_ms,
            exit_code,
        }
    }
}

impl TraceEvent {
    pub fn syscall(
        pid: i32,
        query: &PolicyQuery,
        return_value: Option<i64>,
        verdict: Verdict,
        backend: Backend,
    ) -> Self {
        TraceEvent::Syscall(SyscallEvent {
            timestamp: Utc::now(),
            pid,
            syscall: query.verb.to_string(),
            target: query.target.clone(),
            fd: query.fd,
            return_value,
            verdict,
            backend,
        })
    }

    pub fn process(pid: i32, kind: ProcessEventKind) -> Self {
        TraceEvent::Process(ProcessEvent {
            timestamp: Utc::now(),
            pid,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_wire_format() {
        let q = PolicyQuery {
            verb: "mkdir",
            target: "/tmp/x".to_string(),
            pid: 1234,
            fd: NO_FD,
            ret: 0,
        };
        assert_eq!(q.encode(), "SYSCALL:mkdir:/tmp/x:pid=1234:fd=-1:ret=0\n");
    }

    #[test]
    fn query_with_descriptor() {
        let q = PolicyQuery {
            verb: "write",
            target: "/etc/passwd".to_string(),
            pid: 42,
            fd: 3,
            ret: 128,
        };
        assert_eq!(q.encode(), "SYSCALL:write:/etc/passwd:pid=42:fd=3:ret=128\n");
    }

    #[test]
    fn verdict_byte_mapping() {
        assert_eq!(Verdict::from_byte(b'0'), Verdict::Block);
        assert_eq!(Verdict::from_byte(b'1'), Verdict::Allow);
        // Any non-'0' byte fails open.
        assert_eq!(Verdict::from_byte(b'x'), Verdict::Allow);
        assert_eq!(Verdict::from_byte(0), Verdict::Allow);
    }
}
