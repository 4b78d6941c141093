use std::io;

use thiserror::Error;

/// A relay frame that could not be understood. The frame is dropped; the
/// connection stays up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad magic {0:#06x}")]
    BadMagic(u16),
    #[error("unknown protocol {0:#04x}")]
    UnknownProtocol(u8),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("unknown message kind {0:#04x}")]
    BadKind(u8),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device transport failed: {0}")]
    Transport(#[from] io::Error),
    #[error("device queue is closed")]
    Closed,
    #[error("device queue is full; try later")]
    QueueFull,
    #[error("command dropped by a queue drain")]
    Drained,
    #[error("writes to ${0:06x} are not permitted")]
    NotPermitted(u32),
    #[error("unknown device driver '{0}'")]
    UnknownDriver(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("could not resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    #[error("could not start relay worker: {0}")]
    Spawn(#[source] io::Error),
}
