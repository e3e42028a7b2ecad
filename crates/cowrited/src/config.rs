//! Daemon configuration file
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 7070
//! metrics_port = 9090
//!
//! [session]
//! idle_grace_ms = 30000
//! merge = "splice"
//!
//! [presence]
//! liveness_timeout_ms = 30000
//!
//! [autosave]
//! debounce_ms = 2000
//! max_latency_ms = 10000
//!
//! [auth]
//! mode = "hmac"
//! secret = "change-me"
//!
//! [storage]
//! backend = "sqlite"
//! path = "/var/lib/cowrite/documents.db"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use cowrite_core::{AutosaveConfig, EngineConfig, PresenceConfig, SessionConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub server: ServerSection,
    pub session: SessionConfig,
    pub presence: PresenceConfig,
    pub autosave: AutosaveConfig,
    pub auth: AuthSection,
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    /// Prometheus endpoint; disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7070,
            metrics_port: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// HMAC signed tokens
    #[default]
    Hmac,
    /// A fixed token table
    Static,
    /// Any non-empty token; the token is the user id
    Anonymous,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticToken {
    pub token: String,
    pub user_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    pub mode: AuthMode,
    pub secret: Option<String>,
    /// Lifetime of issued tokens
    pub token_ttl_secs: u64,
    pub tokens: Vec<StaticToken>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            secret: None,
            token_ttl_secs: 24 * 60 * 60,
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub backend: StorageBackend,
    pub path: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Checks settings that only make sense together; run after CLI overrides
    pub fn validate(&self) -> Result<()> {
        match self.auth.mode {
            AuthMode::Hmac if self.auth.secret.as_deref().map_or(true, str::is_empty) => {
                bail!("auth.secret is required when auth.mode = \"hmac\"")
            }
            AuthMode::Static if self.auth.tokens.is_empty() => {
                bail!("auth.tokens must list at least one token when auth.mode = \"static\"")
            }
            _ => {}
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.is_none() {
            bail!("storage.path is required when storage.backend = \"sqlite\"");
        }
        if self.presence.liveness_timeout_ms == 0 {
            bail!("presence.liveness_timeout_ms must be positive");
        }
        if self.autosave.max_latency_ms < self.autosave.debounce_ms {
            bail!("autosave.max_latency_ms must not be shorter than autosave.debounce_ms");
        }
        Ok(())
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            session: self.session.clone(),
            presence: self.presence.clone(),
            autosave: self.autosave.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::MergeStrategy;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = DaemonConfig::from_toml(
            r#"
            [server]
            port = 8080

            [auth]
            secret = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.autosave.debounce_ms, 2_000);
        assert_eq!(config.session.merge, MergeStrategy::LastAppliedWins);
    }

    #[test]
    fn test_full_file() {
        let config = DaemonConfig::from_toml(
            r#"
            [server]
            bind = "127.0.0.1"
            metrics_port = 9090

            [session]
            idle_grace_ms = 30000
            merge = "splice"

            [presence]
            liveness_timeout_ms = 20000

            [autosave]
            debounce_ms = 500
            max_latency_ms = 4000

            [auth]
            mode = "static"
            tokens = [
                { token = "t-alice", user_id = "alice", display_name = "Alice" },
                { token = "t-bob", user_id = "bob" },
            ]

            [storage]
            backend = "sqlite"
            path = "/tmp/cowrite.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.metrics_port, Some(9090));
        assert_eq!(config.session.merge, MergeStrategy::Splice);
        assert_eq!(config.auth.mode, AuthMode::Static);
        assert_eq!(config.auth.tokens.len(), 2);
        assert_eq!(config.auth.tokens[1].display_name, None);

        let engine = config.engine();
        assert_eq!(engine.presence.liveness_timeout_ms, 20_000);
        assert_eq!(engine.autosave.max_latency_ms, 4_000);
    }

    #[test]
    fn test_hmac_requires_secret() {
        assert!(DaemonConfig::from_toml("").unwrap().validate().is_err());
        let anonymous = DaemonConfig::from_toml("[auth]\nmode = \"anonymous\"").unwrap();
        assert!(anonymous.validate().is_ok());
    }

    #[test]
    fn test_sqlite_requires_path() {
        let text = "[auth]\nmode = \"anonymous\"\n[storage]\nbackend = \"sqlite\"";
        assert!(DaemonConfig::from_toml(text).unwrap().validate().is_err());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let text = "[auth]\nmode = \"anonymous\"\n[server]\nprot = 1";
        assert!(DaemonConfig::from_toml(text).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cowrite.toml");
        std::fs::write(&path, "[auth]\nmode = \"anonymous\"\n").unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.auth.mode, AuthMode::Anonymous);
        assert!(DaemonConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
