//! Structured tunnel events.
//!
//! Everything the engine wants a user to see goes through a [`TunnelLog`],
//! which writes to `tracing` and to a pluggable [`LogSink`]. The sink is how a
//! log viewer receives events without scraping tracing output.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Which part of the tunnel lifecycle produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connect,
    Reconnect,
    Listen,
    Accept,
    Handshake,
    Channel,
    Relay,
    Stop,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Reconnect => "reconnect",
            Self::Listen => "listen",
            Self::Accept => "accept",
            Self::Handshake => "handshake",
            Self::Channel => "channel",
            Self::Relay => "relay",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub tunnel_id: String,
    pub level: LogLevel,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<u64>,
    pub message: String,
    /// Bytes received from the far side of the tunnel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_in: Option<u64>,
    /// Bytes sent towards the far side of the tunnel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
}

pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Discards events; [`TunnelLog`] already mirrors everything into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, _event: LogEvent) {}
}

/// Forwards events to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelSink {
    fn emit(&self, event: LogEvent) {
        // Consumer gone; events are still in tracing.
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LogEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// True if any recorded message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn emit(&self, event: LogEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

// ---------------------------------------------------------------------------
// TunnelLog
// ---------------------------------------------------------------------------

/// Per-tunnel event writer. Cheap to clone; clones share the connection counter.
#[derive(Clone)]
pub struct TunnelLog {
    tunnel_id: Arc<str>,
    sink: Arc<dyn LogSink>,
    next_conn: Arc<AtomicU64>,
}

impl fmt::Debug for TunnelLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelLog")
            .field("tunnel_id", &self.tunnel_id)
            .finish_non_exhaustive()
    }
}

impl TunnelLog {
    pub fn new(tunnel_id: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            tunnel_id: Arc::from(tunnel_id.into()),
            sink,
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Allocates the identifier used to correlate one client connection's events.
    pub fn next_connection(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn debug(&self, phase: Phase, message: impl Into<String>) {
        self.emit(LogLevel::Debug, phase, None, message.into());
    }

    pub fn info(&self, phase: Phase, message: impl Into<String>) {
        self.emit(LogLevel::Info, phase, None, message.into());
    }

    pub fn warn(&self, phase: Phase, message: impl Into<String>) {
        self.emit(LogLevel::Warn, phase, None, message.into());
    }

    pub fn error(&self, phase: Phase, message: impl Into<String>) {
        self.emit(LogLevel::Error, phase, None, message.into());
    }

    /// Event scoped to one client connection.
    pub fn conn(&self, conn: u64, level: LogLevel, phase: Phase, message: impl Into<String>) {
        self.emit(level, phase, Some(conn), message.into());
    }

    /// Final event of a relayed connection with its byte counts.
    pub fn transferred(&self, conn: u64, bytes_in: u64, bytes_out: u64, message: impl Into<String>) {
        let message = message.into();
        info!(
            tunnel = %self.tunnel_id,
            conn,
            phase = %Phase::Relay,
            bytes_in,
            bytes_out,
            "{message}"
        );
        self.sink.emit(LogEvent {
            timestamp: Utc::now(),
            tunnel_id: self.tunnel_id.to_string(),
            level: LogLevel::Info,
            phase: Phase::Relay,
            connection: Some(conn),
            message,
            bytes_in: Some(bytes_in),
            bytes_out: Some(bytes_out),
        });
    }

    fn emit(&self, level: LogLevel, phase: Phase, conn: Option<u64>, message: String) {
        let tunnel = &*self.tunnel_id;
        match level {
            LogLevel::Debug => debug!(tunnel, conn, %phase, "{message}"),
            LogLevel::Info => info!(tunnel, conn, %phase, "{message}"),
            LogLevel::Warn => warn!(tunnel, conn, %phase, "{message}"),
            LogLevel::Error => error!(tunnel, conn, %phase, "{message}"),
        }
        self.sink.emit(LogEvent {
            timestamp: Utc::now(),
            tunnel_id: self.tunnel_id.to_string(),
            level,
            phase,
            connection: conn,
            message,
            bytes_in: None,
            bytes_out: None,
        });
    }
}
