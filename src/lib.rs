//! Citadel update engine
//!
//! Self-update for the Citadel node agent: discovers releases, downloads and
//! verifies the platform binary, swaps it in place with a one-level backup,
//! and rolls back when the new binary fails its self-check.
//!
//! [`Updater`] is the entry point the agent's `update` commands drive.

#[macro_use]
pub mod paths;

pub mod archive;
pub mod config;
pub mod error;
pub mod github;
pub mod lock;
pub mod logging;
pub mod release;
pub mod state;
pub mod swapper;
pub mod updater;
pub mod utils;

pub use config::UpdaterConfig;
pub use error::{Result, UpdateError};
pub use release::{is_newer_version, parse_version, Platform, ReleaseClient};
pub use state::{Channel, StateStore, UpdateState};
pub use swapper::{BinarySwapper, ExePathResolver, ExecutableReplacer};
pub use updater::{InstallOutcome, UpdateStatus, Updater, CURRENT_VERSION};
