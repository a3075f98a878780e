//! Human-readable terminal sink.
//!
//! Block verdicts and the run summary are always printed. Allowed
//! syscalls and process-tree events appear from verbosity 1 up; color is
//! controlled globally through the `colored` override in main.

use colored::Colorize;

use crate::error::Result;
use crate::event::{ProcessEventKind, SyscallEvent, TraceEvent, Verdict};
use crate::output::OutputSink;

pub struct TerminalSink {
    verbosity: u8,
}

impl TerminalSink {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }

    fn print_syscall(&self, event: &SyscallEvent) {
        let tag = match event.verdict {
            Verdict::Block => "BLOCKED".red().bold(),
            Verdict::Allow => "allowed".green(),
        };
        let target = if event.target.is_empty() {
            String::new()
        } else {
            format!(" {}", event.target.cyan())
        };
        let fd = if event.fd >= 0 {
            format!(" fd={}", event.fd)
        } else {
            String::new()
        };
        let ret = match event.return_value {
            Some(v) => format!(" = {v}"),
            None => String::new(),
        };
        println!(
            "[{}] {} {}{}{}{}",
            event.pid,
            tag,
            event.syscall.yellow(),
            target,
            fd,
            ret
        );
    }

    fn print_process(&self, pid: i32, kind: &ProcessEventKind) {
        match kind {
            ProcessEventKind::Attached => {
                println!("{} pid {pid}", "attached".blue().bold());
            }
            ProcessEventKind::Forked { parent_pid, depth } => {
                let indent = "  ".repeat(*depth as usize);
                println!(
                    "{indent}{} pid {pid} (parent {parent_pid}, depth {depth})",
                    "forked".blue()
                );
            }
            ProcessEventKind::Exec => {
                println!("{} pid {pid}", "exec".blue());
            }
            ProcessEventKind::Exited { code } => {
                println!("{} pid {pid} (code {code})", "exited".blue());
            }
            ProcessEventKind::Signaled { signal } => {
                println!("{} pid {pid} ({signal})", "killed".magenta());
            }
        }
    }
}

impl OutputSink for TerminalSink {
    fn emit(&mut self, event: &TraceEvent) -> Result<()> {
        match event {
            TraceEvent::Syscall(s) => {
                if s.verdict.is_block() || self.verbosity >= 1 {
                    self.print_syscall(s);
                }
            }
            TraceEvent::Process(p) => {
                if self.verbosity >= 1 {
                    self.print_process(p.pid, &p.kind);
                }
            }
            TraceEvent::Summary(s) => {
                println!();
                println!("{}", "run summary".bold());
                println!("  syscalls observed: {}", s.total_syscalls);
                println!("  oracle queries:    {}", s.queried);
                println!("  blocked:           {}", s.blocked);
                println!("  processes:         {}", s.process_count);
                println!("  duration:          {} ms", s.duration_ms);
                println!("  exit code:         {}", s.exit_code);
            }
        }
        Ok(())
    }
}
