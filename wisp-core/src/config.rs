#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Wisp configuration handling. Parses a TOML file into a strongly-typed
//! structure; the same structure is constructible in code for embedding.
//!
//! Only the four §network knobs are exposed here. Engine timing is a
//! compile-time concern and lives with the overlay engine.

use serde::Deserialize;
use std::{fs, path::Path};

use crate::error::{Error, Result};

/// Default public STUN server used when none is configured.
pub const DEFAULT_STUN_SERVER: &str = "84.247.170.241:3478";

/// Node configuration shared by every Wisp component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Network name. All members of a mesh share it.
    pub network_id: String,

    /// Shared secret. Knowledge of it is the only admission control;
    /// it never leaves the process.
    pub network_secret: String,

    /// UDP listen port. `0` lets the OS assign one.
    pub local_port: u16,

    /// STUN server as `host:port` for reflexive address discovery.
    pub stun_server: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            network_id: String::new(),
            network_secret: String::new(),
            local_port: 0,
            stun_server: DEFAULT_STUN_SERVER.to_string(),
        }
    }
}

impl MeshConfig {
    /// Convenience constructor for the common case.
    pub fn new(network_id: impl Into<String>, network_secret: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            network_secret: network_secret.into(),
            ..Self::default()
        }
    }

    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg = toml::from_str::<MeshConfig>(&data)?;
        Ok(cfg)
    }

    /// Reject configurations that cannot name or join a network.
    pub fn validate(&self) -> Result<()> {
        if self.network_id.is_empty() {
            return Err(Error::config("network_id must not be empty"));
        }
        if self.network_secret.is_empty() {
            return Err(Error::config("network_secret must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_points_at_public_stun() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.stun_server, DEFAULT_STUN_SERVER);
        assert_eq!(cfg.local_port, 0);
    }

    #[test]
    fn validate_rejects_empty_fields() {
        assert!(MeshConfig::default().validate().is_err());
        assert!(MeshConfig::new("net", "").validate().is_err());
        assert!(MeshConfig::new("", "s").validate().is_err());
        assert!(MeshConfig::new("net", "s").validate().is_ok());
    }

    #[test]
    fn from_file_parses_toml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "network_id = \"home\"\nnetwork_secret = \"hunter2\"\nlocal_port = 41001"
        )
        .unwrap();
        let cfg = MeshConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.network_id, "home");
        assert_eq!(cfg.local_port, 41001);
        assert_eq!(cfg.stun_server, DEFAULT_STUN_SERVER);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn from_file_rejects_malformed_toml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "network_id = [not toml").unwrap();
        assert!(matches!(
            MeshConfig::from_file(f.path()),
            Err(Error::Config(_))
        ));
    }
}
