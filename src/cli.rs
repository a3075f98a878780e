use std::path::PathBuf;

use clap::Parser;

use crate::event::Backend;

/// Runs an untrusted program under syscall supervision, consulting an
/// external policy oracle before security-relevant calls proceed.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
pub struct Cli {
    /// Interception backend
    #[arg(long, value_enum, default_value = "ptrace")]
    pub backend: Backend,

    /// Observe and report only, never consult the oracle
    #[arg(long)]
    pub trace_only: bool,

    /// Kill the subject after this many seconds (0 disables the limit)
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,

    /// Append events as JSON lines to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Increase terminal verbosity (-v shows allowed calls and process events)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Program to run under supervision, with its arguments
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["warden", "/bin/true"]);
        assert_eq!(cli.backend, Backend::Ptrace);
        assert!(!cli.trace_only);
        assert_eq!(cli.timeout, 0);
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.command, vec!["/bin/true"]);
    }

    #[test]
    fn subject_arguments_are_not_parsed_as_flags() {
        let cli = Cli::parse_from(["warden", "-v", "--backend", "notify", "ls", "-la", "/tmp"]);
        assert_eq!(cli.backend, Backend::Notify);
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.command, vec!["ls", "-la", "/tmp"]);
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["warden", "--trace-only"]).is_err());
    }
}
