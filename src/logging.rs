//! Update engine logging
//!
//! Writes a header describing the running binary, then timestamped,
//! level-prefixed lines to `<update dir>/logs/` and to stderr.

use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::update_path;

static LOGGER: OnceLock<Arc<Mutex<UpdateLogger>>> = OnceLock::new();

// ============================================================================
// Runtime Information
// ============================================================================

#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub crate_version: String,
    pub os: String,
    pub arch: String,
    pub executable: String,
    pub update_dir: String,
}

impl RuntimeInfo {
    pub fn detect() -> Self {
        Self {
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            executable: std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "Unknown".to_string()),
            update_dir: update_path!().display().to_string(),
        }
    }

    pub fn to_log_header(&self) -> String {
        format!(
r#"================================================================================
citadel update log - {}
================================================================================
Engine:        citadel_update v{}
Platform:      {} / {}
Executable:    {}
Update dir:    {}
================================================================================"#,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.crate_version,
            self.os,
            self.arch,
            self.executable,
            self.update_dir,
        )
    }
}

// ============================================================================
// Log Levels
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Check, // Release lookups
    Download,
    Install,
    Rollback,
    Warning,
    Error,
}

impl LogLevel {
    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Info => "[INFO]",
            LogLevel::Check => "[CHECK]",
            LogLevel::Download => "[DOWNLOAD]",
            LogLevel::Install => "[INSTALL]",
            LogLevel::Rollback => "[ROLLBACK]",
            LogLevel::Warning => "[WARNING]",
            LogLevel::Error => "[ERROR]",
        }
    }
}

// ============================================================================
// Logger
// ============================================================================

pub struct UpdateLogger {
    log_file: Option<File>,
    log_path: Option<PathBuf>,
}

impl UpdateLogger {
    /// A logger that only writes to stderr until a file is attached.
    pub fn new() -> Self {
        Self {
            log_file: None,
            log_path: None,
        }
    }

    /// Start mirroring lines into `update_<stamp>.log` under `log_dir`.
    ///
    /// A logger keeps the first file it was given.
    pub fn attach_file(&mut self, log_dir: &Path) -> io::Result<PathBuf> {
        if let Some(path) = &self.log_path {
            return Ok(path.clone());
        }

        fs::create_dir_all(log_dir)?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let log_path = log_dir.join(format!("update_{}.log", timestamp));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        writeln!(file, "{}", RuntimeInfo::detect().to_log_header())?;

        self.log_file = Some(file);
        self.log_path = Some(log_path.clone());
        Ok(log_path)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    fn write_raw(&mut self, msg: &str) {
        if let Some(ref mut file) = self.log_file {
            let _ = writeln!(file, "{}", msg);
            let _ = file.flush();
        }

        // stdout belongs to the agent
        eprintln!("{}", msg);
    }

    pub fn log(&mut self, level: LogLevel, message: &str) {
        self.write_raw(&format_line(level, message));
    }
}

impl Default for UpdateLogger {
    fn default() -> Self {
        Self::new()
    }
}

fn format_line(level: LogLevel, message: &str) -> String {
    let timestamp = Local::now().format("%H:%M:%S");
    format!("[{}] {} {}", timestamp, level.prefix(), message)
}

// ============================================================================
// Global Logger Access
// ============================================================================

/// Point the global logger at `log_dir` (call once at startup).
///
/// Until this is called, log lines only go to stderr.
pub fn init_logger(log_dir: &Path) -> io::Result<PathBuf> {
    logger().lock().attach_file(log_dir)
}

/// File the global logger is writing to, if one was attached.
pub fn log_file_path() -> Option<PathBuf> {
    logger().lock().log_path().map(Path::to_path_buf)
}

fn logger() -> Arc<Mutex<UpdateLogger>> {
    LOGGER
        .get_or_init(|| Arc::new(Mutex::new(UpdateLogger::new())))
        .clone()
}

// ============================================================================
// Convenience Logging Functions
// ============================================================================

pub fn log_info(message: &str) {
    logger().lock().log(LogLevel::Info, message);
}

pub fn log_check(message: &str) {
    logger().lock().log(LogLevel::Check, message);
}

pub fn log_download(message: &str) {
    logger().lock().log(LogLevel::Download, message);
}

pub fn log_install(message: &str) {
    logger().lock().log(LogLevel::Install, message);
}

pub fn log_rollback(message: &str) {
    logger().lock().log(LogLevel::Rollback, message);
}

pub fn log_warning(message: &str) {
    logger().lock().log(LogLevel::Warning, message);
}

pub fn log_error(message: &str) {
    logger().lock().log(LogLevel::Error, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_has_level_prefix() {
        let line = format_line(LogLevel::Rollback, "restored v1.2.0");
        assert!(line.contains("[ROLLBACK] restored v1.2.0"));
        assert!(line.starts_with('['));
    }

    #[test]
    fn test_header_names_platform() {
        let info = RuntimeInfo::detect();
        let header = info.to_log_header();
        assert!(header.contains(&info.os));
        assert!(header.contains(&info.arch));
        assert!(header.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_logger_without_file_is_stderr_only() {
        let mut logger = UpdateLogger::new();
        logger.log(LogLevel::Info, "no file yet");
        assert!(logger.log_path().is_none());
    }

    #[test]
    fn test_attached_file_gets_header_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let mut logger = UpdateLogger::new();

        let path = logger.attach_file(&log_dir).unwrap();
        assert!(path.starts_with(&log_dir));
        logger.log(LogLevel::Install, "swapped v1.3.0 in");

        // A second attach keeps the first file
        let other = dir.path().join("elsewhere");
        assert_eq!(logger.attach_file(&other).unwrap(), path);
        assert!(!other.exists());

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("citadel update log"));
        assert!(content.contains("[INSTALL] swapped v1.3.0 in"));
    }
}
