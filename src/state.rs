//! Update state persistence.
//!
//! Tracks the running/previous versions, check cadence, channel and the
//! auto-update preference. Persisted as JSON to `<update dir>/state.json`.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, UpdateError};
use crate::logging::log_warning;
use crate::update_path;
use crate::utils::sidecar_path;

/// Minimum time between two automatic update checks.
pub const CHECK_INTERVAL_HOURS: i64 = 24;

pub fn check_interval() -> Duration {
    Duration::hours(CHECK_INTERVAL_HOURS)
}

/// Release track a node follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Published, non-prerelease releases only (default).
    #[default]
    Stable,
    /// Release candidates as well.
    Rc,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Rc => write!(f, "rc"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Ok(Self::Stable),
            "rc" => Ok(Self::Rc),
            other => Err(format!("unknown release channel: {}", other)),
        }
    }
}

/// Persistent update state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateState {
    pub current_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub previous_version: String,
    /// Newest tag seen by the last check, kept so availability can be shown
    /// without a network round trip.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub available_update: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_update: Option<DateTime<Utc>>,
    pub auto_update: bool,
    pub channel: Channel,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            current_version: String::new(),
            previous_version: String::new(),
            available_update: String::new(),
            last_check: None,
            last_update: None,
            auto_update: true,
            channel: Channel::Stable,
        }
    }
}

/// Older state files store "never" as the zero time `0001-01-01T00:00:00Z`.
fn deserialize_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(value.filter(|ts| ts.year() > 1))
}

impl UpdateState {
    /// Whether an automatic check is due now.
    pub fn should_check(&self) -> bool {
        self.should_check_at(Utc::now())
    }

    pub fn should_check_at(&self, now: DateTime<Utc>) -> bool {
        if !self.auto_update {
            return false;
        }
        match self.last_check {
            None => true,
            Some(last) => now - last >= check_interval(),
        }
    }

    pub fn mark_checked(&mut self) {
        self.mark_checked_at(Utc::now());
    }

    pub fn mark_checked_at(&mut self, now: DateTime<Utc>) {
        self.last_check = Some(now);
    }

    /// Record a fully validated update from `from` to `to`.
    pub fn record_update(&mut self, from: &str, to: &str) {
        self.previous_version = from.to_string();
        self.current_version = to.to_string();
        self.available_update.clear();
        self.last_update = Some(Utc::now());
    }

    /// Swap current and previous after the backup binary was restored.
    pub fn record_rollback(&mut self) {
        if !self.previous_version.is_empty() {
            std::mem::swap(&mut self.current_version, &mut self.previous_version);
        }
    }
}

// ============================================================================
// State Store
// ============================================================================

/// Whole-record JSON persistence for [`UpdateState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<update dir>/state.json`
    pub fn default_location() -> Self {
        Self::open(update_path!("state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state. A missing or unreadable-as-JSON file yields the default state.
    pub fn load(&self) -> Result<UpdateState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(UpdateState::default()),
            Err(e) => {
                return Err(UpdateError::State {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                log_warning(&format!(
                    "Ignoring corrupt update state {}: {}",
                    self.path.display(),
                    e
                ));
                Ok(UpdateState::default())
            }
        }
    }

    /// Persist the whole state, replacing the previous file atomically.
    pub fn save(&self, state: &UpdateState) -> Result<()> {
        let state_error = |reason: String| UpdateError::State {
            path: self.path.clone(),
            reason,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| state_error(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(state).map_err(|e| state_error(e.to_string()))?;

        let tmp = sidecar_path(&self.path, "tmp");
        fs::write(&tmp, json).map_err(|e| state_error(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            state_error(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("update").join("state.json"));
        (dir, store)
    }

    #[test]
    fn test_default_state() {
        let state = UpdateState::default();
        assert!(state.auto_update);
        assert_eq!(state.channel, Channel::Stable);
        assert!(state.last_check.is_none());
        assert!(state.last_update.is_none());
        assert!(state.previous_version.is_empty());
    }

    #[test]
    fn test_missing_file_loads_default() {
        let (_dir, store) = store();
        assert_eq!(store.load().unwrap(), UpdateState::default());
    }

    #[test]
    fn test_corrupt_file_loads_default() {
        let (_dir, store) = store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{\"auto_update\": tru").unwrap();
        assert_eq!(store.load().unwrap(), UpdateState::default());
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = store();
        let state = UpdateState {
            current_version: "v1.3.0".to_string(),
            previous_version: "v1.2.0".to_string(),
            available_update: "v1.4.0-rc.1".to_string(),
            last_check: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap()),
            last_update: Some(Utc::now()),
            auto_update: false,
            channel: Channel::Rc,
        };

        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
        assert!(!sidecar_path(store.path(), "tmp").exists());
    }

    #[test]
    fn test_go_zero_time_means_never() {
        let json = r#"{
            "current_version": "v1.1.0",
            "last_check": "0001-01-01T00:00:00Z",
            "auto_update": true,
            "channel": "stable"
        }"#;
        let state: UpdateState = serde_json::from_str(json).unwrap();
        assert!(state.last_check.is_none());
        assert!(state.should_check_at(Utc::now()));
    }

    #[test]
    fn test_should_check_table() {
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 8, 0, 0).unwrap();
        let mut state = UpdateState::default();

        // never checked
        assert!(state.should_check_at(now));

        state.mark_checked_at(now - Duration::hours(23));
        assert!(!state.should_check_at(now));

        state.mark_checked_at(now - Duration::hours(24));
        assert!(state.should_check_at(now));

        state.mark_checked_at(now - Duration::days(3));
        assert!(state.should_check_at(now));

        state.auto_update = false;
        assert!(!state.should_check_at(now));
        state.last_check = None;
        assert!(!state.should_check_at(now));
    }

    #[test]
    fn test_record_update_keeps_one_generation() {
        let mut state = UpdateState {
            current_version: "v1.2.0".to_string(),
            available_update: "v1.3.0".to_string(),
            ..Default::default()
        };

        state.record_update("v1.2.0", "v1.3.0");
        assert_eq!(state.previous_version, "v1.2.0");
        assert_eq!(state.current_version, "v1.3.0");
        assert!(state.available_update.is_empty());
        assert!(state.last_update.is_some());

        state.record_update("v1.3.0", "v1.4.0");
        assert_eq!(state.previous_version, "v1.3.0");
    }

    #[test]
    fn test_record_rollback_swaps_versions() {
        let mut state = UpdateState::default();
        state.record_update("v1.2.0", "v1.3.0");
        state.record_rollback();
        assert_eq!(state.current_version, "v1.2.0");
        assert_eq!(state.previous_version, "v1.3.0");

        let mut fresh = UpdateState {
            current_version: "v1.0.0".to_string(),
            ..Default::default()
        };
        fresh.record_rollback();
        assert_eq!(fresh.current_version, "v1.0.0");
    }

    #[test]
    fn test_channel_serde_and_parse() {
        assert_eq!(serde_json::to_string(&Channel::Rc).unwrap(), "\"rc\"");
        let stable: Channel = serde_json::from_str("\"stable\"").unwrap();
        assert_eq!(stable, Channel::Stable);
        assert_eq!("RC".parse::<Channel>().unwrap(), Channel::Rc);
        assert!("beta".parse::<Channel>().is_err());
        assert_eq!(Channel::Stable.to_string(), "stable");
    }
}
