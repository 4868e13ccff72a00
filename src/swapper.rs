//! Binary swapper
//!
//! Moves the node from "running binary A" to "running binary B" without ever
//! leaving the executable path missing or half written, and puts A back if B
//! does not pass its self-check.
//!
//! The physical swap sits behind [`ExecutableReplacer`]. Both strategies are
//! compiled everywhere so the same tests exercise each of them; the one used
//! in production is picked by [`platform_replacer`].

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::logging::{log_error, log_info, log_install, log_rollback, log_warning};
use crate::paths::previous_binary_name;
use crate::utils::{copy_file_synced, remove_if_exists, set_executable, sidecar_path};

/// Attempts made when spawning a freshly written binary hits `ETXTBSY`
const SPAWN_ATTEMPTS: u32 = 5;

// ============================================================================
// Executable Path Resolution
// ============================================================================

/// Answers "where is the binary being updated?".
pub trait ExePathResolver: Send + Sync {
    fn resolve(&self) -> Result<PathBuf>;
}

/// The running executable, with symlinks followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentExe;

impl ExePathResolver for CurrentExe {
    fn resolve(&self) -> Result<PathBuf> {
        let exe = std::env::current_exe()
            .map_err(|e| UpdateError::io("failed to get executable path", e))?;
        Ok(fs::canonicalize(&exe).unwrap_or(exe))
    }
}

/// A fixed binary path, for embedding and tests.
#[derive(Debug, Clone)]
pub struct FixedPath(pub PathBuf);

impl ExePathResolver for FixedPath {
    fn resolve(&self) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

// ============================================================================
// Replacement Strategies
// ============================================================================

/// Puts the contents of `src` at `dst`.
///
/// Implementations guarantee `dst` resolves to either the old or the new
/// binary at every instant, never to a partial file.
pub trait ExecutableReplacer: Send + Sync {
    fn replace(&self, src: &Path, dst: &Path) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Copy next to the target, then rename over it. Rename within a directory
/// is atomic on Unix filesystems.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameReplacer;

impl ExecutableReplacer for RenameReplacer {
    fn replace(&self, src: &Path, dst: &Path) -> Result<()> {
        let tmp = sidecar_path(dst, "tmp");
        let replace_failed = |step: &str, e: io::Error| UpdateError::ReplaceFailed {
            target: dst.to_path_buf(),
            reason: format!("{}: {}", step, e),
        };

        if let Err(e) = copy_file_synced(src, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(replace_failed("copy to temp file", e));
        }
        if let Err(e) = set_executable(&tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(replace_failed("chmod temp file", e));
        }
        if let Err(e) = fs::rename(&tmp, dst) {
            let _ = fs::remove_file(&tmp);
            return Err(replace_failed("rename into place", e));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rename"
    }
}

/// Windows keeps running executables locked against writes but not against
/// renames: move the live file aside to `.old`, then copy into the freed path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarReplacer;

impl ExecutableReplacer for SidecarReplacer {
    fn replace(&self, src: &Path, dst: &Path) -> Result<()> {
        let old = sidecar_path(dst, "old");
        let _ = fs::remove_file(&old);

        if let Err(e) = fs::rename(dst, &old) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(UpdateError::ReplaceFailed {
                    target: dst.to_path_buf(),
                    reason: format!("failed to move current binary aside: {}", e),
                });
            }
        }

        if let Err(e) = copy_file_synced(src, dst) {
            let _ = fs::remove_file(dst);
            if old.exists() {
                let _ = fs::rename(&old, dst);
            }
            return Err(UpdateError::ReplaceFailed {
                target: dst.to_path_buf(),
                reason: format!("failed to copy new binary: {}", e),
            });
        }

        // `.old` may still be locked by the running process; it is removed by
        // the next cleanup
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sidecar"
    }
}

/// The replacement strategy for the platform this binary runs on.
pub fn platform_replacer() -> Box<dyn ExecutableReplacer> {
    if cfg!(windows) {
        Box::new(SidecarReplacer)
    } else {
        Box::new(RenameReplacer)
    }
}

// ============================================================================
// Binary Swapper
// ============================================================================

pub struct BinarySwapper {
    resolver: Box<dyn ExePathResolver>,
    replacer: Box<dyn ExecutableReplacer>,
    backup_path: PathBuf,
    validate_args: Vec<String>,
    validate_timeout: Duration,
}

impl BinarySwapper {
    /// Swapper for the running executable with the backup kept in `update_dir`.
    pub fn new(config: &UpdaterConfig, update_dir: &Path) -> Self {
        Self::with_parts(
            Box::new(CurrentExe),
            platform_replacer(),
            update_dir.join(previous_binary_name()),
            config,
        )
    }

    pub fn with_parts(
        resolver: Box<dyn ExePathResolver>,
        replacer: Box<dyn ExecutableReplacer>,
        backup_path: PathBuf,
        config: &UpdaterConfig,
    ) -> Self {
        Self {
            resolver,
            replacer,
            backup_path,
            validate_args: config.validate_args.clone(),
            validate_timeout: config.validate_timeout(),
        }
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Copy the live binary into the backup slot.
    ///
    /// The copy lands in `<backup>.tmp` first and is renamed over the previous
    /// backup, so a crash mid-copy leaves the old backup intact.
    pub fn backup_current(&self) -> Result<()> {
        let current = self.resolver.resolve()?;

        if let Some(parent) = self.backup_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                UpdateError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }

        let tmp = sidecar_path(&self.backup_path, "tmp");
        let result =
            copy_file_synced(&current, &tmp).and_then(|_| fs::rename(&tmp, &self.backup_path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(UpdateError::io(
                format!(
                    "failed to back up {} to {}",
                    current.display(),
                    self.backup_path.display()
                ),
                e,
            ));
        }

        log_install(&format!(
            "Backed up {} to {}",
            current.display(),
            self.backup_path.display()
        ));
        Ok(())
    }

    /// Replace the live binary with `new_binary`, validate it, and roll back on failure.
    pub fn apply_update(&self, new_binary: &Path) -> Result<()> {
        let current = self.resolver.resolve()?;
        log_install(&format!(
            "Applying {} to {} ({} strategy)",
            new_binary.display(),
            current.display(),
            self.replacer.name()
        ));

        self.cleanup_old_binaries();
        self.backup_current()?;

        if let Err(e) = self.replacer.replace(new_binary, &current) {
            log_error(&format!("Replace failed: {}", e));
            return Err(self.recover(e));
        }

        if let Err(e) = self.validate_binary(&current) {
            log_error(&format!("New binary failed validation: {}", e));
            let _ = fs::remove_file(new_binary);
            return Err(self.recover(e));
        }

        let _ = fs::remove_file(new_binary);
        log_install(&format!("Installed new binary at {}", current.display()));
        Ok(())
    }

    /// Roll back after a failed step, keeping the original cause.
    fn recover(&self, cause: UpdateError) -> UpdateError {
        match self.rollback() {
            Ok(()) => {
                self.cleanup_old_binaries();
                cause
            }
            Err(rollback) => {
                log_error(&format!(
                    "Rollback failed, binary may be broken: {}",
                    rollback
                ));
                UpdateError::RollbackFailed {
                    original: Box::new(cause),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    /// Restore the backup over the live binary using the same replacer.
    pub fn rollback(&self) -> Result<()> {
        if !self.has_previous_version() {
            return Err(UpdateError::NoPreviousVersion {
                backup: self.backup_path.clone(),
            });
        }

        let current = self.resolver.resolve()?;
        self.replacer.replace(&self.backup_path, &current)?;
        log_rollback(&format!(
            "Restored {} from {}",
            current.display(),
            self.backup_path.display()
        ));
        Ok(())
    }

    /// Run `path` with the version arguments; it must exit 0 within the timeout.
    pub fn validate_binary(&self, path: &Path) -> Result<()> {
        let validation_failed = |reason: String| UpdateError::ValidationFailed {
            path: path.to_path_buf(),
            reason,
        };

        let mut child = spawn_with_retry(
            Command::new(path)
                .args(&self.validate_args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null()),
        )
        .map_err(|e| validation_failed(format!("failed to start: {}", e)))?;

        match child.wait_timeout(self.validate_timeout) {
            Ok(Some(status)) if status.success() => {
                log_info(&format!("Validated {}", path.display()));
                Ok(())
            }
            Ok(Some(status)) => Err(validation_failed(format!(
                "exited with code {:?}",
                status.code()
            ))),
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(validation_failed(format!(
                    "timed out after {} seconds",
                    self.validate_timeout.as_secs_f32()
                )))
            }
            Err(e) => {
                let _ = child.kill();
                Err(validation_failed(e.to_string()))
            }
        }
    }

    /// Best-effort removal of `.old` / `.tmp` leftovers next to the live binary.
    pub fn cleanup_old_binaries(&self) {
        let current = match self.resolver.resolve() {
            Ok(path) => path,
            Err(_) => return,
        };

        for ext in ["old", "tmp"] {
            let path = sidecar_path(&current, ext);
            if let Err(e) = remove_if_exists(&path) {
                log_warning(&format!("Could not remove {}: {}", path.display(), e));
            }
        }
        let _ = remove_if_exists(&sidecar_path(&self.backup_path, "tmp"));
    }

    pub fn has_previous_version(&self) -> bool {
        self.backup_path.is_file()
    }

    /// Version string reported by the backup binary.
    pub fn previous_version_info(&self) -> Result<String> {
        if !self.has_previous_version() {
            return Err(UpdateError::NoPreviousVersion {
                backup: self.backup_path.clone(),
            });
        }

        let path = &self.backup_path;
        let failed = |reason: String| UpdateError::ValidationFailed {
            path: path.clone(),
            reason,
        };

        let mut child = spawn_with_retry(
            Command::new(path)
                .args(&self.validate_args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null()),
        )
        .map_err(|e| failed(format!("failed to start: {}", e)))?;

        // Version output is a line or two; it fits in the pipe buffer
        match child.wait_timeout(self.validate_timeout) {
            Ok(Some(status)) if status.success() => {
                let mut output = String::new();
                if let Some(mut stdout) = child.stdout.take() {
                    stdout
                        .read_to_string(&mut output)
                        .map_err(|e| failed(e.to_string()))?;
                }
                Ok(output.trim().to_string())
            }
            Ok(Some(status)) => Err(failed(format!("exited with code {:?}", status.code()))),
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(failed("timed out".to_string()))
            }
            Err(e) => {
                let _ = child.kill();
                Err(failed(e.to_string()))
            }
        }
    }
}

/// Spawn, retrying while the kernel still sees a writer on the file (`ETXTBSY`).
fn spawn_with_retry(command: &mut Command) -> io::Result<std::process::Child> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Err(e) if is_text_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn is_text_busy(e: &io::Error) -> bool {
    // ETXTBSY
    cfg!(unix) && e.raw_os_error() == Some(26)
}
