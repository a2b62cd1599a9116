//! Tunnel definitions handed to the engine by its collaborators.
//!
//! Every struct deserializes from a minimal JSON object: fields that have a
//! sensible default are optional. Nothing here touches the network; call
//! [`TunnelConfig::validate`] and [`Credential::validate`] before starting a
//! tunnel.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Tunnel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// `local_host:local_port` -> `remote_host:remote_port` via the server.
    Local,
    /// Server binds `remote_host:remote_port` -> `local_host:local_port`.
    Remote,
    /// SOCKS5 + HTTP CONNECT proxy on `local_host:local_port`.
    Dynamic,
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Dynamic => write!(f, "dynamic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub mode: TunnelMode,
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(default)]
    pub local_port: u16,
    /// Target host for Local, bind address on the server for Remote, unused for Dynamic.
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub keepalive: KeepalivePolicy,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub dynamic: DynamicOptions,
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

impl TunnelConfig {
    /// Human-readable forwarding rule, e.g. `127.0.0.1:8080 -> db:5432`.
    pub fn rule(&self) -> String {
        let local = crate::format_target(&self.local_host, self.local_port);
        let remote = crate::format_target(&self.remote_host, self.remote_port);
        match self.mode {
            TunnelMode::Local => format!("{local} -> {remote}"),
            TunnelMode::Remote => format!("server {remote} -> {local}"),
            TunnelMode::Dynamic => format!("SOCKS5/HTTP proxy on {local}"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("tunnel id must not be empty".into()));
        }
        if self.local_host.trim().is_empty() {
            return Err(Error::Config(format!("{}: local_host must not be empty", self.id)));
        }
        match self.mode {
            TunnelMode::Local => {
                if self.remote_host.trim().is_empty() || self.remote_port == 0 {
                    return Err(Error::Config(format!(
                        "{}: local forwarding needs remote_host and a non-zero remote_port",
                        self.id
                    )));
                }
            }
            TunnelMode::Remote => {
                if self.local_port == 0 {
                    return Err(Error::Config(format!(
                        "{}: remote forwarding needs a non-zero local_port to connect to",
                        self.id
                    )));
                }
                if self.remote_host.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "{}: remote forwarding needs remote_host (the server-side bind address)",
                        self.id
                    )));
                }
            }
            TunnelMode::Dynamic => {}
        }
        self.reconnect
            .validate()
            .map_err(|msg| Error::Config(format!("{}: {msg}", self.id)))?;
        if self.timeouts.connect_ms == 0 || self.timeouts.channel_open_ms == 0 {
            return Err(Error::Config(format!("{}: timeouts must be non-zero", self.id)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepalivePolicy {
    /// Seconds between SSH keepalive requests; 0 disables them.
    pub interval_secs: u64,
    /// Unanswered keepalives before the session is declared lost.
    pub max_missed: usize,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            max_missed: 3,
        }
    }
}

impl KeepalivePolicy {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Fraction of each delay randomised, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: None,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be non-zero".into());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("reconnect.max_delay_ms must be >= initial_delay_ms".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("reconnect.jitter must be within [0, 1]".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// TCP connect + SSH handshake + authentication.
    pub connect_ms: u64,
    pub channel_open_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            channel_open_ms: 10_000,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn channel_open(&self) -> Duration {
        Duration::from_millis(self.channel_open_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicOptions {
    /// Resolve SOCKS5 domain targets on this machine before forwarding, so
    /// local `/etc/hosts` entries apply. Falls back to the name on failure.
    pub resolve_locally: bool,
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    Password {
        password: String,
    },
    /// Private key material (OpenSSH or PEM text).
    PrivateKey {
        key: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.debug_struct("Password").finish_non_exhaustive(),
            Self::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("encrypted", &passphrase.is_some())
                .finish_non_exhaustive(),
            Self::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("encrypted", &passphrase.is_some())
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

fn default_ssh_port() -> u16 {
    22
}

impl Credential {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("ssh host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("ssh port must be non-zero".into()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Config("ssh username must not be empty".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "fingerprint", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any server key (`StrictHostKeyChecking=no`).
    #[default]
    AcceptAll,
    /// Accept only the key with this `SHA256:...` fingerprint.
    Fingerprint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Socks5,
}

/// A proxy used to reach the SSH server itself.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamProxy {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    /// SOCKS5 username/password (RFC 1929); ignored for HTTP.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
