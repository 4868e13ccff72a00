//! Self-updater for the Citadel node agent
//!
//! Ties the release source, the binary swapper and the persisted state into
//! the flows the agent runs: periodic checks, install, rollback, and status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::UpdaterConfig;
use crate::error::Result;
use crate::github::Release;
use crate::lock::UpdateLock;
use crate::logging::{
    init_logger, log_check, log_error, log_info, log_install, log_rollback, log_warning,
};
use crate::paths::pending_binary_name;
use crate::release::{is_newer_version, ReleaseClient};
use crate::state::{Channel, StateStore, UpdateState};
use crate::swapper::BinarySwapper;
use crate::update_path;
use crate::utils::remove_if_exists;

/// Version of the running binary as it appears in release tags.
pub const CURRENT_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// Result of [`Updater::install`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    UpToDate,
    Updated { from: String, to: String },
}

/// Snapshot of the updater, for `citadel update status`.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateStatus {
    /// Version compiled into the running binary
    pub running_version: String,
    /// Version recorded by the last install or rollback
    pub recorded_version: String,
    pub previous_version: String,
    pub available_update: String,
    pub last_check: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub auto_update: bool,
    pub channel: Channel,
    pub has_previous_version: bool,
    pub check_due: bool,
}

pub struct Updater {
    current_version: String,
    config: UpdaterConfig,
    update_dir: PathBuf,
    client: ReleaseClient,
    swapper: BinarySwapper,
    store: StateStore,
}

impl Updater {
    pub fn new(
        current_version: impl Into<String>,
        config: UpdaterConfig,
        update_dir: impl Into<PathBuf>,
    ) -> Self {
        let current_version = current_version.into();
        let update_dir = update_dir.into();

        Self {
            client: ReleaseClient::new(current_version.clone(), &config),
            swapper: BinarySwapper::new(&config, &update_dir),
            store: StateStore::open(update_dir.join("state.json")),
            current_version,
            config,
            update_dir,
        }
    }

    /// The running binary, `config.json` and the default update directory.
    pub fn from_defaults() -> Self {
        if let Err(e) = init_logger(&update_path!("logs")) {
            log_warning(&format!("Update log file unavailable: {}", e));
        }
        Self::new(CURRENT_VERSION, UpdaterConfig::load(), update_path!())
    }

    pub fn with_client(mut self, client: ReleaseClient) -> Self {
        self.client = client;
        self
    }

    pub fn with_swapper(mut self, swapper: BinarySwapper) -> Self {
        self.swapper = swapper;
        self
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = store;
        self
    }

    fn lock(&self) -> Result<UpdateLock> {
        UpdateLock::acquire(&self.update_dir, self.config.lock_stale_after())
    }

    pub fn update_dir(&self) -> &Path {
        &self.update_dir
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Where a downloaded binary waits before it is applied.
    pub fn pending_path(&self) -> PathBuf {
        self.update_dir.join(pending_binary_name())
    }

    pub fn state(&self) -> Result<UpdateState> {
        self.store.load()
    }

    /// Ask the release source for a newer release on the configured channel.
    ///
    /// `last_check` is stamped whether or not the query succeeds. The network
    /// call runs unlocked; the state is re-read and saved under the update lock.
    pub fn check(&self) -> Result<Option<Release>> {
        let result = self.query_release();
        let _lock = self.lock()?;
        self.record_check(&result)?;
        result
    }

    /// [`Updater::check`] for callers already holding the update lock.
    fn check_locked(&self) -> Result<Option<Release>> {
        let result = self.query_release();
        self.record_check(&result)?;
        result
    }

    fn query_release(&self) -> Result<Option<Release>> {
        let channel = self.store.load()?.channel;
        self.client.clone().with_channel(channel).check_for_update()
    }

    fn record_check(&self, result: &Result<Option<Release>>) -> Result<()> {
        let mut state = self.store.load()?;
        state.mark_checked();
        if state.current_version.is_empty() {
            state.current_version = self.current_version.clone();
        }

        match result {
            Ok(Some(release)) => {
                // An install may have landed this tag while the query was in flight
                if is_newer_version(&state.current_version, &release.tag_name).unwrap_or(true) {
                    state.available_update = release.tag_name.clone();
                } else {
                    state.available_update.clear();
                }
            }
            Ok(None) => state.available_update.clear(),
            Err(e) => log_error(&format!("Update check failed: {}", e)),
        }

        self.store.save(&state)
    }

    /// [`Updater::check`] if auto-update is on and the last check is old enough.
    pub fn check_if_due(&self) -> Result<Option<Release>> {
        let state = self.store.load()?;
        if !state.should_check() {
            log_check("Update check not due");
            return Ok(None);
        }
        self.check()
    }

    /// Check, download, verify and apply the newest release.
    pub fn install(&self) -> Result<InstallOutcome> {
        let _lock = self.lock()?;

        let release = match self.check_locked()? {
            Some(release) => release,
            None => return Ok(InstallOutcome::UpToDate),
        };

        let pending = self.pending_path();
        log_install(&format!(
            "Installing {} over {}",
            release.tag_name, self.current_version
        ));

        let applied = self
            .client
            .download_and_verify(&release, &pending)
            .and_then(|()| self.swapper.apply_update(&pending));
        if let Err(e) = applied {
            let _ = remove_if_exists(&pending);
            log_error(&format!("Update to {} failed: {}", release.tag_name, e));
            return Err(e);
        }

        let mut state = self.store.load()?;
        state.record_update(&self.current_version, &release.tag_name);
        self.store.save(&state)?;

        log_info(&format!(
            "Updated {} -> {}; restart the agent to run the new version",
            self.current_version, release.tag_name
        ));
        Ok(InstallOutcome::Updated {
            from: self.current_version.clone(),
            to: release.tag_name,
        })
    }

    /// Restore the previous binary and swap the recorded versions.
    pub fn rollback(&self) -> Result<()> {
        let _lock = self.lock()?;

        self.swapper.rollback()?;

        let mut state = self.store.load()?;
        state.record_rollback();
        self.store.save(&state)?;

        log_rollback(&format!("Rolled back to {}", state.current_version));
        Ok(())
    }

    pub fn status(&self) -> Result<UpdateStatus> {
        let state = self.store.load()?;
        Ok(UpdateStatus {
            running_version: self.current_version.clone(),
            recorded_version: state.current_version.clone(),
            previous_version: state.previous_version.clone(),
            available_update: state.available_update.clone(),
            last_check: state.last_check,
            last_update: state.last_update,
            auto_update: state.auto_update,
            channel: state.channel,
            has_previous_version: self.swapper.has_previous_version(),
            check_due: state.should_check(),
        })
    }

    pub fn set_auto_update(&self, enabled: bool) -> Result<()> {
        let _lock = self.lock()?;
        let mut state = self.store.load()?;
        state.auto_update = enabled;
        self.store.save(&state)?;
        log_info(&format!(
            "Automatic updates {}",
            if enabled { "enabled" } else { "disabled" }
        ));
        Ok(())
    }

    pub fn set_channel(&self, channel: Channel) -> Result<()> {
        let _lock = self.lock()?;
        let mut state = self.store.load()?;
        state.channel = channel;
        self.store.save(&state)?;
        log_info(&format!("Release channel set to {}", channel));
        Ok(())
    }
}
