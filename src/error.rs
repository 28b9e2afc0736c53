use std::io;
use thiserror::Error;

/// Failures raised by the proxy engine.
///
/// Per-connection variants stay inside the session that produced them and
/// per-listener variants stay inside that listener. Only `DuplicatePort` can
/// stop the server from starting.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    ListenFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("listener on {addr} stopped accepting: {source}")]
    AcceptFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no target available for port {port}")]
    TargetUnavailable { port: u16 },

    #[error("failed to dial target {target}: {source}")]
    DialFailure {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("tunnel I/O error: {0}")]
    TunnelIo(#[from] io::Error),

    #[error("port {port} is claimed by both {first:?} and {second:?}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
}

impl ProxyError {
    /// Shutdown is an expected way for work to end, not an operator-facing fault.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
