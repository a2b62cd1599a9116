//! Shared building blocks for the burrow tunnel engine.
//!
//! - [`Error`]: the error taxonomy every crate reports through
//! - [`config`]: tunnel definitions, credentials and their validation
//! - [`event`]: the structured log sink the engine writes to

pub mod config;
mod error;
pub mod event;

pub use config::{
    AuthMethod, Credential, DynamicOptions, HostKeyPolicy, KeepalivePolicy, ProxyKind,
    ReconnectPolicy, Timeouts, TunnelConfig, TunnelMode, UpstreamProxy,
};
pub use error::{format_target, ChannelError, ChannelFailure, Error};
pub use event::{
    ChannelSink, LogEvent, LogLevel, LogSink, MemorySink, Phase, TracingSink, TunnelLog,
};

pub type Result<T> = std::result::Result<T, Error>;
