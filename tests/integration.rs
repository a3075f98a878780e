//! End-to-end tests driving the warden binary against a scripted oracle.
//!
//! Each test gets its own pair of named pipes so they can run in
//! parallel; the oracle side is a thread applying a per-test rule to
//! every request line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

const BIN: &str = env!("CARGO_BIN_EXE_warden");

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

fn scratch_dir() -> PathBuf {
    let n = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("warden-it-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Scripted oracle over a fresh pipe pair. The rule maps a request line
/// to a verdict byte; `None` means stay silent for that request.
struct MockOracle {
    req: PathBuf,
    resp: PathBuf,
    handle: JoinHandle<Vec<String>>,
}

impl MockOracle {
    fn start<F>(dir: &Path, rule: F) -> Self
    where
        F: Fn(&str) -> Option<u8> + Send + 'static,
    {
        let req = dir.join("oracle_req");
        let resp = dir.join("oracle_resp");
        mkfifo(&req, Mode::from_bits_truncate(0o600)).unwrap();
        mkfifo(&resp, Mode::from_bits_truncate(0o600)).unwrap();

        let (req_c, resp_c) = (req.clone(), resp.clone());
        let handle = thread::spawn(move || {
            let reader = BufReader::new(File::open(&req_c).unwrap());
            let mut writer = OpenOptions::new().write(true).open(&resp_c).unwrap();
            let mut seen = Vec::new();
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if let Some(byte) = rule(&line) {
                    if writer.write_all(&[byte]).is_err() {
                        break;
                    }
                }
                seen.push(line);
            }
            seen
        });

        Self { req, resp, handle }
    }

    /// Wait for the subject side to hang up and return every request seen.
    fn finish(self) -> Vec<String> {
        self.handle.join().unwrap()
    }
}

fn warden(oracle: &MockOracle) -> Command {
    let mut cmd = Command::new(BIN);
    cmd.env("WARDEN_ORACLE_REQ", &oracle.req)
        .env("WARDEN_ORACLE_RESP", &oracle.resp)
        .arg("--no-color");
    cmd
}

fn events(path: &Path) -> Vec<serde_json::Value> {
    let data = std::fs::read_to_string(path).unwrap();
    data.lines()
        .map(|l| serde_json::from_str(l).expect("every event line is valid JSON"))
        .collect()
}

fn assert_success(out: &Output) {
    assert!(
        out.status.success(),
        "expected success, got {:?}\nstderr: {}",
        out.status,
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn blocked_mkdir_never_reaches_the_filesystem() {
    let dir = scratch_dir();
    let victim = dir.join("forbidden");
    let victim_str = victim.to_str().unwrap().to_string();

    let oracle = MockOracle::start(&dir, move |line| {
        if line.contains(":mkdir:") && line.contains(&victim_str) {
            Some(b'0')
        } else {
            Some(b'1')
        }
    });

    let out = warden(&oracle)
        .args(["mkdir", victim.to_str().unwrap()])
        .output()
        .unwrap();

    assert!(!victim.exists(), "blocked mkdir must not create the directory");
    assert!(!out.status.success(), "subject sees the failed syscall");

    let seen = oracle.finish();
    assert!(seen.iter().any(|l| l.contains(":mkdir:")));
}

#[test]
fn allowed_run_exits_cleanly() {
    let dir = scratch_dir();
    let oracle = MockOracle::start(&dir, |_| Some(b'1'));

    let out = warden(&oracle).arg("/bin/true").output().unwrap();
    assert_success(&out);
    oracle.finish();
}

#[test]
fn reads_are_attributed_to_the_opened_path() {
    let dir = scratch_dir();
    let log = dir.join("events.jsonl");
    let oracle = MockOracle::start(&dir, |_| Some(b'1'));

    let out = warden(&oracle)
        .args(["--output", log.to_str().unwrap(), "cat", "/etc/passwd"])
        .output()
        .unwrap();
    assert_success(&out);
    oracle.finish();

    let read_on_passwd = events(&log).into_iter().any(|e| {
        e["event_type"] == "syscall" && e["syscall"] == "read" && e["target"] == "/etc/passwd"
    });
    assert!(read_on_passwd, "read must resolve through the descriptor table");
}

#[test]
fn silent_oracle_fails_open() {
    let dir = scratch_dir();
    let victim = dir.join("created_anyway");

    // Reads every request, never answers.
    let oracle = MockOracle::start(&dir, |_| None);

    let out = warden(&oracle)
        .args(["mkdir", victim.to_str().unwrap()])
        .output()
        .unwrap();
    assert_success(&out);
    assert!(victim.exists(), "timeouts must not stall or deny the subject");
    oracle.finish();
}

#[test]
fn fork_children_are_followed_with_depth() {
    let dir = scratch_dir();
    let log = dir.join("events.jsonl");
    let oracle = MockOracle::start(&dir, |_| Some(b'1'));

    // Two commands force the shell to fork for the first one.
    let out = warden(&oracle)
        .args([
            "--output",
            log.to_str().unwrap(),
            "sh",
            "-c",
            "/bin/true; /bin/true",
        ])
        .output()
        .unwrap();
    assert_success(&out);
    oracle.finish();

    let forked = events(&log).into_iter().any(|e| {
        e["event_type"] == "process" && e["kind"] == "forked" && e["depth"].as_u64() >= Some(1)
    });
    assert!(forked, "child processes must be observed with their tree depth");
}

#[test]
fn run_summary_is_emitted_last() {
    let dir = scratch_dir();
    let log = dir.join("events.jsonl");
    let oracle = MockOracle::start(&dir, |_| Some(b'1'));

    let out = warden(&oracle)
        .args(["--output", log.to_str().unwrap(), "/bin/true"])
        .output()
        .unwrap();
    assert_success(&out);
    oracle.finish();

    let all = events(&log);
    let last = all.last().expect("event log is not empty");
    assert_eq!(last["event_type"], "summary");
    assert_eq!(last["exit_code"], 0);
    assert!(last["total_syscalls"].as_u64() > Some(0));
}

#[test]
fn missing_oracle_channel_is_a_startup_error() {
    let out = Command::new(BIN)
        .env("WARDEN_ORACLE_REQ", "/nonexistent/warden_req")
        .env("WARDEN_ORACLE_RESP", "/nonexistent/warden_resp")
        .args(["--no-color", "/bin/true"])
        .output()
        .unwrap();

    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("oracle request channel"),
        "diagnostic names the missing channel: {stderr}"
    );
}

#[test]
fn trace_only_needs_no_oracle() {
    let out = Command::new(BIN)
        .env("WARDEN_ORACLE_REQ", "/nonexistent/warden_req")
        .env("WARDEN_ORACLE_RESP", "/nonexistent/warden_resp")
        .args(["--no-color", "--trace-only", "/bin/true"])
        .output()
        .unwrap();
    assert_success(&out);
}

#[test]
fn notify_backend_allows_and_injects_descriptors() {
    let dir = scratch_dir();
    let oracle = MockOracle::start(&dir, |_| Some(b'1'));

    let out = warden(&oracle)
        .args(["--backend", "notify", "cat", "/etc/passwd"])
        .output()
        .unwrap();
    assert_success(&out);
    assert!(
        !out.stdout.is_empty(),
        "injected descriptor must read the real file"
    );
    oracle.finish();
}

#[test]
fn notify_backend_resolves_relative_paths_in_subject_cwd() {
    let dir = scratch_dir();
    std::fs::write(dir.join("inner.txt"), "subject cwd contents\n").unwrap();
    let oracle = MockOracle::start(&dir, |_| Some(b'1'));

    // The subject changes directory; its relative open must resolve there,
    // not in the engine's cwd.
    let out = warden(&oracle)
        .args([
            "--backend",
            "notify",
            "sh",
            "-c",
            &format!("cd {} && cat inner.txt", dir.display()),
        ])
        .output()
        .unwrap();
    assert_success(&out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        stdout.contains("subject cwd contents"),
        "relative open must land in the subject's directory: {stdout}"
    );
    oracle.finish();
}

#[test]
fn notify_backend_blocks_openat() {
    let dir = scratch_dir();
    let secret = dir.join("secret.txt");
    std::fs::write(&secret, "do not read\n").unwrap();
    let secret_str = secret.to_str().unwrap().to_string();

    let oracle = MockOracle::start(&dir, move |line| {
        if line.contains(":openat:") && line.contains(&secret_str) {
            Some(b'0')
        } else {
            Some(b'1')
        }
    });

    let out = warden(&oracle)
        .args(["--backend", "notify", "cat", secret.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!out.status.success(), "denied open must fail the subject");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(!stdout.contains("do not read"));
    oracle.finish();
}
