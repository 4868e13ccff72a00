use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::log_warning;
use crate::update_path;

// ============================================================================
// Updater Config
// ============================================================================

/// Where releases come from and how long each step may take.
///
/// Every field has a default, so a partial `config.json` only overrides what it names.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Release repository owner
    pub owner: String,
    /// Release repository name
    pub repo: String,
    /// Product name used in asset names and as the binary entry inside archives
    pub product: String,
    /// Base URL of the release metadata API
    pub api_base: String,
    /// Base URL that serves release downloads and `checksums.txt`
    pub download_base: String,
    pub user_agent: String,
    /// Timeout applied to each release, asset and checksum request
    pub http_timeout_secs: u64,
    /// Upper bound for the post-swap self-check
    pub validate_timeout_secs: u64,
    /// Arguments passed to a binary to make it report its version
    pub validate_args: Vec<String>,
    /// Age after which a leftover `update.lock` is considered abandoned
    pub lock_stale_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            owner: "aceteam-ai".to_string(),
            repo: "citadel-cli".to_string(),
            product: "citadel".to_string(),
            api_base: "https://api.github.com".to_string(),
            download_base: "https://github.com".to_string(),
            user_agent: "citadel-cli".to_string(),
            http_timeout_secs: 30,
            validate_timeout_secs: 5,
            validate_args: vec!["version".to_string()],
            lock_stale_secs: 3600,
        }
    }
}

impl UpdaterConfig {
    pub fn default_path() -> PathBuf {
        update_path!("config.json")
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => log_warning(&format!(
                        "Ignoring invalid updater config {}: {}",
                        path.display(),
                        e
                    )),
                },
                Err(e) => log_warning(&format!(
                    "Could not read updater config {}: {}",
                    path.display(),
                    e
                )),
            }
        }
        Self::default()
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_release_layout() {
        let config = UpdaterConfig::default();
        assert_eq!(config.product, "citadel");
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
        assert_eq!(config.validate_timeout(), Duration::from_secs(5));
        assert_eq!(config.validate_args, vec!["version".to_string()]);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"api_base": "http://127.0.0.1:9000", "http_timeout_secs": 3}"#,
        )
        .unwrap();

        let config = UpdaterConfig::load_from(&path);
        assert_eq!(config.api_base, "http://127.0.0.1:9000");
        assert_eq!(config.http_timeout_secs, 3);
        assert_eq!(config.repo, "citadel-cli");
    }

    #[test]
    fn test_missing_or_invalid_config_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert_eq!(UpdaterConfig::load_from(&missing), UpdaterConfig::default());

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{not json").unwrap();
        assert_eq!(UpdaterConfig::load_from(&broken), UpdaterConfig::default());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = UpdaterConfig {
            owner: "example".to_string(),
            validate_args: vec!["--version".to_string()],
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(UpdaterConfig::load_from(&path), config);
    }
}
