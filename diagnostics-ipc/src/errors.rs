use std::{fmt, time::Duration};

/// The reason an advertise message was rejected
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeFault {
    /// The peer did not send the `ADVR_V1` magic
    Magic([u8; 8]),
    /// The peer is a different process than the one we were waiting for
    ProcessId { expected: u32, advertised: u64 },
}

impl fmt::Display for HandshakeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Magic(magic) => write!(f, "unexpected advertise magic {magic:02x?}"),
            Self::ProcessId {
                expected,
                advertised,
            } => write!(
                f,
                "expected process {expected} but process {advertised} connected"
            ),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the socket name is invalid")]
    InvalidName,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no runtime connected back within {0:?}")]
    RendezvousTimeout(Duration),
    #[error("runtime handshake failed: {0}")]
    HandshakeMismatch(HandshakeFault),
    #[error("protocol error: {0}")]
    ProtocolFraming(String),
    #[error("the runtime rejected the {command} command with status {status:#010x}")]
    SessionRejected { command: &'static str, status: u32 },
    #[error("the connection was closed while reading the {stage}")]
    TransportClosed { stage: &'static str },
    #[error("unable to find a diagnostics socket for process {pid}")]
    NoRuntimeEndpoint { pid: u32 },
    #[error("the operation was cancelled")]
    Cancelled,
    #[error(transparent)]
    Scroll(#[from] scroll::Error),
}
