//! Configuration for tickwatch server

use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub staleness: StalenessConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite cache file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

/// Anti-forgery enforcement for mutation endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Off by default so deployments can roll the check out incrementally
    #[serde(default)]
    pub enforce_antiforgery: bool,

    /// The origin browsers are expected to declare, e.g.
    /// "https://tickwatch.example"
    #[serde(default)]
    pub canonical_origin: Option<String>,
}

/// Per-bucket rate limits for mutation endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_snapshot_per_minute")]
    pub snapshot_per_minute: u32,

    #[serde(default = "default_changes_per_minute")]
    pub changes_per_minute: u32,
}

/// Freshness thresholds for the derived read paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessConfig {
    /// Cache age after which the per-repo sync report goes stale
    #[serde(default = "default_sync_stale_secs")]
    pub sync_stale_secs: i64,

    /// Coarser threshold used for the repo summaries on the feed
    #[serde(default = "default_feed_stale_secs")]
    pub feed_stale_secs: i64,

    /// Hours without a cache refresh before an in-progress ticket is
    /// flagged in the feed
    #[serde(default = "default_attention_hours")]
    pub attention_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Human-readable name for the token; doubles as the caller identity
    pub name: String,
    /// The hashed API token (argon2 hash, or plain text for backwards compat)
    pub token_hash: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3040
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tickwatch.sqlite")
}

fn default_snapshot_per_minute() -> u32 {
    30
}

fn default_changes_per_minute() -> u32 {
    120
}

fn default_sync_stale_secs() -> i64 {
    300
}

fn default_feed_stale_secs() -> i64 {
    3 * 60 * 60
}

fn default_attention_hours() -> i64 {
    24
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            snapshot_per_minute: default_snapshot_per_minute(),
            changes_per_minute: default_changes_per_minute(),
        }
    }
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            sync_stale_secs: default_sync_stale_secs(),
            feed_stale_secs: default_feed_stale_secs(),
            attention_hours: default_attention_hours(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: default_bind(),
                port: default_port(),
            },
            database: DatabaseConfig {
                path: default_db_path(),
            },
            security: SecurityConfig::default(),
            limits: LimitsConfig::default(),
            staleness: StalenessConfig::default(),
            tokens: Vec::new(),
        }
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("TICKWATCH_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        // Check for config in current directory
        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Check /data/config.toml (Docker default)
        let data_config = PathBuf::from("/data/config.toml");
        if data_config.exists() {
            return Ok(data_config);
        }

        // Then check XDG config
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("tickwatch");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // Add helpful comments
        let with_comments = format!(
            "# tickwatch configuration\n\n\
             {}\n\n\
             # Add tokens with: tickwatch token --name <client-name>\n",
            content
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }

    /// Authenticate a bearer token, returning the matching token's name
    /// (supports both hashed and legacy plain tokens)
    pub fn authenticate(&self, token: &str) -> Option<&str> {
        let argon2 = Argon2::default();

        for t in &self.tokens {
            // Try to parse as argon2 hash
            if let Ok(parsed_hash) = PasswordHash::new(&t.token_hash) {
                if argon2
                    .verify_password(token.as_bytes(), &parsed_hash)
                    .is_ok()
                {
                    return Some(&t.name);
                }
            } else {
                // Fallback: plain text comparison (legacy/backwards compat)
                if t.token_hash == token {
                    return Some(&t.name);
                }
            }
        }
        None
    }
}

/// Hash a token using argon2
pub fn hash_token(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash token: {}", e))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sections_fall_back_to_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            [database]
            "#,
        )
        .unwrap();
        assert!(!cfg.security.enforce_antiforgery);
        assert_eq!(cfg.limits.snapshot_per_minute, 30);
        assert_eq!(cfg.staleness.sync_stale_secs, 300);
        assert_eq!(cfg.staleness.attention_hours, 24);
    }

    #[test]
    fn authenticate_matches_legacy_plain_tokens() {
        let mut cfg = Config::default();
        cfg.tokens.push(TokenConfig {
            name: "ci-bot".to_string(),
            token_hash: "tkw_plaintext".to_string(),
        });
        assert_eq!(cfg.authenticate("tkw_plaintext"), Some("ci-bot"));
        assert_eq!(cfg.authenticate("wrong"), None);
    }

    #[test]
    fn authenticate_matches_hashed_tokens() {
        let mut cfg = Config::default();
        let hash = hash_token("tkw_secret").unwrap();
        cfg.tokens.push(TokenConfig {
            name: "laptop".to_string(),
            token_hash: hash,
        });
        assert_eq!(cfg.authenticate("tkw_secret"), Some("laptop"));
        assert_eq!(cfg.authenticate("tkw_other"), None);
    }
}
