use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("remote forward refused: {0}")]
    RemoteBind(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the session layer should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Io(_))
    }
}

/// Why a single channel could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFailure {
    Refused,
    HostUnreachable,
    NetworkUnreachable,
    Prohibited,
    TimedOut,
    /// No live session (the tunnel is reconnecting or stopping).
    SessionUnavailable,
    Other,
}

impl ChannelFailure {
    /// SOCKS5 reply code (RFC 1928 section 6).
    pub fn socks5_reply(self) -> u8 {
        match self {
            Self::Refused => 0x05,
            Self::HostUnreachable | Self::TimedOut => 0x04,
            Self::NetworkUnreachable => 0x03,
            Self::Prohibited => 0x02,
            Self::SessionUnavailable | Self::Other => 0x01,
        }
    }

    /// HTTP status code and reason phrase for a failed CONNECT.
    pub fn http_status(self) -> (u16, &'static str) {
        match self {
            Self::TimedOut => (504, "Gateway Timeout"),
            Self::SessionUnavailable => (503, "Service Unavailable"),
            _ => (502, "Bad Gateway"),
        }
    }

    /// Classify a local socket error the way an SSH server would report it.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Self::Refused,
            ErrorKind::HostUnreachable => Self::HostUnreachable,
            ErrorKind::NetworkUnreachable => Self::NetworkUnreachable,
            ErrorKind::TimedOut => Self::TimedOut,
            ErrorKind::PermissionDenied => Self::Prohibited,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ChannelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused => write!(f, "connection refused"),
            Self::HostUnreachable => write!(f, "host unreachable"),
            Self::NetworkUnreachable => write!(f, "network unreachable"),
            Self::Prohibited => write!(f, "administratively prohibited"),
            Self::TimedOut => write!(f, "timed out"),
            Self::SessionUnavailable => write!(f, "session unavailable"),
            Self::Other => write!(f, "general failure"),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{target}: {kind}")]
pub struct ChannelError {
    pub kind: ChannelFailure,
    /// `host:port` the channel was opened towards.
    pub target: String,
}

impl ChannelError {
    pub fn new(kind: ChannelFailure, host: &str, port: u16) -> Self {
        Self {
            kind,
            target: format_target(host, port),
        }
    }
}

/// Render `host:port`, bracketing IPv6 literals.
pub fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
