//! The tunnel definition file read by `burrow`.
//!
//! ```json
//! {
//!   "tunnels": [
//!     {
//!       "id": "db",
//!       "mode": "local",
//!       "local_port": 15432,
//!       "remote_host": "db.internal",
//!       "remote_port": 5432,
//!       "ssh": {
//!         "host": "bastion.example.com",
//!         "username": "deploy",
//!         "auth": { "type": "key_file", "path": "/home/deploy/.ssh/id_ed25519" }
//!       }
//!     }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use common::{Credential, Error, HostKeyPolicy, Result, TunnelConfig, UpstreamProxy};
use serde::{Deserialize, Serialize};

/// Directory under the platform config dir holding `tunnels.json`.
const CONFIG_DIR_NAME: &str = "burrow";
const CONFIG_FILE_NAME: &str = "tunnels.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelFile {
    pub tunnels: Vec<TunnelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelEntry {
    #[serde(flatten)]
    pub tunnel: TunnelConfig,
    pub ssh: SshEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshEntry {
    #[serde(flatten)]
    pub credential: Credential,
    #[serde(default)]
    pub host_key: HostKeyPolicy,
    #[serde(default)]
    pub proxy: Option<UpstreamProxy>,
}

impl TunnelFile {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid tunnel file: {e}")))
    }

    /// Check every entry and reject duplicate ids.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.tunnels {
            let id = &entry.tunnel.id;
            entry.tunnel.validate()?;
            entry.ssh.credential.validate().map_err(|e| match e {
                Error::Config(msg) => Error::Config(format!("tunnel {id}: {msg}")),
                other => other,
            })?;
            if !seen.insert(id.as_str()) {
                return Err(Error::Config(format!("duplicate tunnel id {id}")));
            }
        }
        Ok(())
    }

    /// Entries whose id is in `only`, or all of them when `only` is empty.
    pub fn select(&self, only: &[String]) -> Result<Vec<&TunnelEntry>> {
        if only.is_empty() {
            return Ok(self.tunnels.iter().collect());
        }
        only.iter()
            .map(|id| {
                self.tunnels
                    .iter()
                    .find(|entry| &entry.tunnel.id == id)
                    .ok_or_else(|| Error::Config(format!("no tunnel with id {id}")))
            })
            .collect()
    }
}

/// Read, parse and validate a tunnel file.
pub fn load(path: &Path) -> Result<TunnelFile> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let file = TunnelFile::parse(&text)?;
    file.validate()?;
    Ok(file)
}

/// `~/.config/burrow/tunnels.json` or the platform equivalent.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AuthMethod, TunnelMode};

    const SAMPLE: &str = r#"{
        "tunnels": [
            {
                "id": "db",
                "mode": "local",
                "local_port": 15432,
                "remote_host": "db.internal",
                "remote_port": 5432,
                "ssh": {
                    "host": "bastion",
                    "username": "deploy",
                    "auth": { "type": "password", "password": "hunter2" }
                }
            },
            {
                "id": "proxy",
                "mode": "dynamic",
                "local_port": 1080,
                "reconnect": { "max_attempts": 5 },
                "ssh": {
                    "host": "bastion",
                    "port": 2222,
                    "username": "deploy",
                    "auth": { "type": "key_file", "path": "/keys/id_ed25519" },
                    "host_key": { "policy": "fingerprint", "fingerprint": "SHA256:abc" },
                    "proxy": { "kind": "socks5", "host": "corp-proxy", "port": 1080 }
                }
            }
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let file = TunnelFile::parse(SAMPLE).unwrap();
        file.validate().unwrap();
        assert_eq!(file.tunnels.len(), 2);

        let db = &file.tunnels[0];
        assert_eq!(db.tunnel.mode, TunnelMode::Local);
        assert_eq!(db.tunnel.local_host, "127.0.0.1");
        assert_eq!(db.ssh.credential.port, 22);
        assert_eq!(db.ssh.host_key, HostKeyPolicy::AcceptAll);
        assert!(db.ssh.proxy.is_none());

        let proxy = &file.tunnels[1];
        assert_eq!(proxy.tunnel.reconnect.max_attempts, Some(5));
        assert_eq!(proxy.ssh.credential.port, 2222);
        assert!(matches!(
            proxy.ssh.credential.auth,
            AuthMethod::KeyFile { ref path, passphrase: None } if path == Path::new("/keys/id_ed25519")
        ));
        assert_eq!(
            proxy.ssh.host_key,
            HostKeyPolicy::Fingerprint("SHA256:abc".into())
        );
        assert_eq!(proxy.ssh.proxy.as_ref().unwrap().port, 1080);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut file = TunnelFile::parse(SAMPLE).unwrap();
        file.tunnels[1].tunnel.id = "db".into();
        let err = file.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate tunnel id db"), "{err}");
    }

    #[test]
    fn test_invalid_entry_names_tunnel() {
        let mut file = TunnelFile::parse(SAMPLE).unwrap();
        file.tunnels[0].ssh.credential.username.clear();
        let err = file.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.starts_with("tunnel db:")), "{err}");
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = TunnelFile::parse("{\"tunnels\": [ {\"id\": 1} ]}").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_select() {
        let file = TunnelFile::parse(SAMPLE).unwrap();
        assert_eq!(file.select(&[]).unwrap().len(), 2);

        let picked = file.select(&["proxy".to_string()]).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].tunnel.id, "proxy");

        assert!(file.select(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("cannot read"), "{err}");
    }

    #[test]
    fn test_default_path_file_name() {
        let path = default_path();
        assert!(path.ends_with(Path::new(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)));
    }
}
