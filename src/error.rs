use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tracer error: {0}")]
    Tracer(#[from] TracerError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("oracle request channel not found at {path} (start the policy oracle first)")]
    OracleChannelMissing { path: String },

    #[error("oracle response channel not found at {path}")]
    OracleResponseMissing { path: String },

    #[error("oracle not listening on {path} after {waited_ms} ms")]
    OracleUnresponsive { path: String, waited_ms: u64 },
}

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("Ptrace error: {0}")]
    Ptrace(#[source] nix::Error),

    #[error("Wait failed: {0}")]
    Wait(#[source] nix::Error),

    #[error("Fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("Memory read failed at {addr:#x}: {source}")]
    MemoryRead {
        addr: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout after {0} seconds")]
    Timeout(u64),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Seccomp filter installation failed: {0}")]
    FilterInstall(#[source] std::io::Error),

    #[error("Listener fd transfer failed: {0}")]
    FdTransfer(#[source] std::io::Error),

    #[error("Notification channel failed: {0}")]
    Notify(#[source] std::io::Error),

    #[error("Fork failed: {0}")]
    Fork(#[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;
