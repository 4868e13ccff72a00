//! Release source
//!
//! Answers "is there a newer release?" against the GitHub release API and
//! produces verified binaries for it.

use semver::Version;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::archive::{extract_binary, find_checksum, sha256_file, ArchiveFormat};
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::github::Release;
use crate::logging::{log_check, log_download, log_warning};
use crate::state::Channel;
use crate::utils::{set_executable, sidecar_path};

/// How many releases the rc channel looks at
const RC_PAGE_SIZE: u32 = 30;

// ============================================================================
// Platform
// ============================================================================

/// OS / architecture pair as spelled in release asset names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self::new(os, arch)
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    pub fn archive_format(&self) -> ArchiveFormat {
        ArchiveFormat::for_os(&self.os)
    }

    /// Name of the executable inside a release archive.
    pub fn binary_entry(&self, product: &str) -> String {
        if self.is_windows() {
            format!("{}.exe", product)
        } else {
            product.to_string()
        }
    }
}

// ============================================================================
// Version Comparison
// ============================================================================

/// Parse a release tag, tolerating a leading `v` and missing minor/patch parts.
pub fn parse_version(tag: &str) -> Result<Version> {
    let tag = tag.trim();
    let trimmed = tag.strip_prefix('v').unwrap_or(tag);
    let invalid = |reason: String| UpdateError::InvalidVersion {
        version: tag.to_string(),
        reason,
    };

    match Version::parse(trimmed) {
        Ok(v) => Ok(v),
        Err(e) => {
            // "1" and "1.2" are accepted as "1.0.0" and "1.2.0"
            let core = trimmed.split(['-', '+']).next().unwrap_or_default();
            let parts = core.split('.').count();
            if core.is_empty() || parts >= 3 || core.len() != trimmed.len() {
                return Err(invalid(e.to_string()));
            }
            let padded = format!("{}{}", core, ".0".repeat(3 - parts));
            Version::parse(&padded).map_err(|_| invalid(e.to_string()))
        }
    }
}

/// True if `candidate` is strictly newer than `current`.
///
/// A `dev` or empty `current` is older than every release.
pub fn is_newer_version(current: &str, candidate: &str) -> Result<bool> {
    let bare = current.trim();
    let bare = bare.strip_prefix('v').unwrap_or(bare);
    if bare.is_empty() || bare == "dev" {
        return Ok(true);
    }

    let current = parse_version(current)?;
    let candidate = parse_version(candidate)?;
    // Build metadata carries no precedence
    Ok(candidate.cmp_precedence(&current).is_gt())
}

// ============================================================================
// Release Client
// ============================================================================

#[derive(Clone)]
pub struct ReleaseClient {
    current_version: String,
    channel: Channel,
    platform: Platform,
    config: UpdaterConfig,
    agent: ureq::Agent,
}

impl ReleaseClient {
    pub fn new(current_version: impl Into<String>, config: &UpdaterConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.http_timeout())
            .user_agent(&config.user_agent)
            .build();

        Self {
            current_version: current_version.into(),
            channel: Channel::default(),
            platform: Platform::current(),
            config: config.clone(),
            agent,
        }
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Returns the newest eligible release if it is newer than the running version.
    pub fn check_for_update(&self) -> Result<Option<Release>> {
        let release = self.latest_release()?;

        if !is_newer_version(&self.current_version, &release.tag_name)? {
            log_check(&format!(
                "Running {} is up to date (latest {} on {} channel)",
                self.current_version, release.tag_name, self.channel
            ));
            return Ok(None);
        }

        log_check(&format!(
            "Update available: {} -> {}",
            self.current_version, release.tag_name
        ));
        Ok(Some(release))
    }

    /// Fetch the newest eligible release for the channel without comparing versions.
    pub fn latest_release(&self) -> Result<Release> {
        match self.channel {
            Channel::Stable => {
                let url = format!(
                    "{}/repos/{}/{}/releases/latest",
                    self.config.api_base, self.config.owner, self.config.repo
                );
                self.get_json(&url)
            }
            Channel::Rc => {
                let url = format!(
                    "{}/repos/{}/{}/releases?per_page={}",
                    self.config.api_base, self.config.owner, self.config.repo, RC_PAGE_SIZE
                );
                let releases: Vec<Release> = self.get_json(&url)?;
                newest_release(releases).ok_or_else(|| UpdateError::DownloadFailed {
                    url,
                    reason: "no published releases".to_string(),
                })
            }
        }
    }

    /// `{product}_{tag}_{os}_{arch}{ext}`
    pub fn asset_name(&self, release: &Release) -> String {
        format!(
            "{}_{}_{}_{}{}",
            self.config.product,
            release.tag_name,
            self.platform.os,
            self.platform.arch,
            self.platform.archive_format().extension()
        )
    }

    pub fn download_url(&self, release: &Release) -> String {
        let name = self.asset_name(release);
        match release.asset(&name) {
            Some(asset) => asset.browser_download_url.clone(),
            None => format!(
                "{}/{}/{}/releases/download/{}/{}",
                self.config.download_base,
                self.config.owner,
                self.config.repo,
                release.tag_name,
                name
            ),
        }
    }

    pub fn checksum_url(&self, release: &Release) -> String {
        format!(
            "{}/{}/{}/releases/download/{}/checksums.txt",
            self.config.download_base, self.config.owner, self.config.repo, release.tag_name
        )
    }

    /// Path the raw archive is downloaded to before extraction.
    pub fn archive_path(dest: &Path) -> PathBuf {
        sidecar_path(dest, "archive")
    }

    /// Download and extract the platform binary to `dest` without checksum verification.
    pub fn download(&self, release: &Release, dest: &Path) -> Result<()> {
        let archive = Self::archive_path(dest);
        self.download_archive(release, &archive)?;

        let result = self.extract(&archive, dest);
        let _ = fs::remove_file(&archive);
        result
    }

    /// Check a downloaded archive against the release's `checksums.txt`.
    pub fn verify_checksum(&self, archive: &Path, release: &Release) -> Result<()> {
        let asset = self.asset_name(release);
        let url = self.checksum_url(release);
        let manifest = self.get_string(&url)?;

        let expected = find_checksum(&manifest, &asset)
            .ok_or_else(|| UpdateError::ChecksumMissing { asset: asset.clone() })?;
        let actual = sha256_file(archive).map_err(|e| {
            UpdateError::io(format!("failed to hash {}", archive.display()), e)
        })?;

        if actual != expected {
            return Err(UpdateError::ChecksumMismatch {
                asset,
                expected,
                actual,
            });
        }

        log_download(&format!("Checksum verified for {}", asset));
        Ok(())
    }

    /// Download, verify, and only then extract the platform binary to `dest`.
    pub fn download_and_verify(&self, release: &Release, dest: &Path) -> Result<()> {
        let archive = Self::archive_path(dest);
        self.download_archive(release, &archive)?;

        let result = self
            .verify_checksum(&archive, release)
            .and_then(|()| self.extract(&archive, dest));
        let _ = fs::remove_file(&archive);
        result
    }

    fn download_archive(&self, release: &Release, archive: &Path) -> Result<()> {
        let url = self.download_url(release);
        log_download(&format!("Downloading {}", url));

        if let Some(parent) = archive.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                UpdateError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }

        let response = self.call(&url, false)?;
        let mut reader = response.into_reader();
        let mut file = fs::File::create(archive).map_err(|e| {
            UpdateError::io(format!("failed to create {}", archive.display()), e)
        })?;

        let copied = std::io::copy(&mut reader, &mut file).and_then(|n| file.flush().map(|_| n));
        match copied {
            Ok(bytes) => {
                log_download(&format!("Downloaded {} bytes to {}", bytes, archive.display()));
                Ok(())
            }
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(archive);
                Err(UpdateError::DownloadFailed {
                    url,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        let entry = self.platform.binary_entry(&self.config.product);
        extract_binary(archive, self.platform.archive_format(), &entry, dest)?;

        if !self.platform.is_windows() {
            set_executable(dest)
                .map_err(|e| UpdateError::io(format!("failed to chmod {}", dest.display()), e))?;
        }
        Ok(())
    }

    fn call(&self, url: &str, api: bool) -> Result<ureq::Response> {
        let mut request = self.agent.get(url);
        if api {
            request = request.set("Accept", "application/vnd.github.v3+json");
        }

        request.call().map_err(|e| {
            let reason = match e {
                ureq::Error::Status(code, response) => {
                    format!("server returned {} {}", code, response.status_text())
                }
                ureq::Error::Transport(t) => t.to_string(),
            };
            UpdateError::DownloadFailed {
                url: url.to_string(),
                reason,
            }
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.call(url, true)?
            .into_json()
            .map_err(|e| UpdateError::DownloadFailed {
                url: url.to_string(),
                reason: format!("invalid release metadata: {}", e),
            })
    }

    fn get_string(&self, url: &str) -> Result<String> {
        self.call(url, false)?
            .into_string()
            .map_err(|e| UpdateError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Greatest non-draft release by semver; tags that don't parse are skipped.
fn newest_release(releases: Vec<Release>) -> Option<Release> {
    releases
        .into_iter()
        .filter(|r| !r.draft)
        .filter_map(|r| match parse_version(&r.tag_name) {
            Ok(v) => Some((v, r)),
            Err(e) => {
                log_warning(&format!("Skipping release with unparseable tag: {}", e));
                None
            }
        })
        .max_by(|(a, _), (b, _)| a.cmp_precedence(b))
        .map(|(_, r)| r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::Asset;

    fn release(tag: &str) -> Release {
        Release {
            tag_name: tag.to_string(),
            name: Some(format!("Citadel {}", tag)),
            draft: false,
            prerelease: false,
            assets: Vec::new(),
            html_url: None,
        }
    }

    #[test]
    fn test_version_ordering_both_directions() {
        let ordered = ["v0.9.9", "v1.0.0-rc.1", "v1.0.0", "v1.2.0", "v1.2.10", "v2.0.0"];
        for (i, older) in ordered.iter().enumerate() {
            for newer in &ordered[i + 1..] {
                assert!(is_newer_version(older, newer).unwrap(), "{older} < {newer}");
                assert!(!is_newer_version(newer, older).unwrap(), "{newer} > {older}");
            }
        }
    }

    #[test]
    fn test_equal_version_is_not_newer() {
        assert!(!is_newer_version("v1.3.0", "v1.3.0").unwrap());
        assert!(!is_newer_version("1.3.0", "v1.3.0").unwrap());
    }

    #[test]
    fn test_build_metadata_is_ignored() {
        assert!(!is_newer_version("v1.3.0", "v1.3.0+build.7").unwrap());
        assert!(!is_newer_version("v1.3.0+build.7", "v1.3.0").unwrap());
        assert!(!is_newer_version("v1.3.0+build.1", "v1.3.0+build.9").unwrap());
        assert!(is_newer_version("v1.3.0+build.9", "v1.3.1+build.1").unwrap());
    }

    #[test]
    fn test_only_one_leading_v_is_stripped() {
        assert!(parse_version("v2.0.0").is_ok());
        assert!(matches!(
            parse_version("vv2.0.0"),
            Err(UpdateError::InvalidVersion { .. })
        ));
        assert!(matches!(
            is_newer_version("v1.0.0", "vv2.0.0"),
            Err(UpdateError::InvalidVersion { .. })
        ));
        assert!(is_newer_version("v1.0.0", " v2.0.0 ").unwrap());
    }

    #[test]
    fn test_dev_and_empty_always_older() {
        for candidate in ["v0.0.1", "v1.3.0", "v99.0.0-rc.1"] {
            assert!(is_newer_version("dev", candidate).unwrap());
            assert!(is_newer_version("", candidate).unwrap());
        }
        // Even garbage candidates are "newer" than a dev build
        assert!(is_newer_version("vdev", "whatever").unwrap());
    }

    #[test]
    fn test_malformed_versions_are_errors() {
        let err = is_newer_version("v1.2.3", "latest").unwrap_err();
        assert!(matches!(
            err,
            UpdateError::InvalidVersion { ref version, .. } if version == "latest"
        ));

        assert!(is_newer_version("banana", "v1.0.0").is_err());
        assert!(is_newer_version("v1.2.3", "v1.2.3.4").is_err());
    }

    #[test]
    fn test_short_versions_are_padded() {
        assert_eq!(parse_version("v1.2").unwrap(), Version::new(1, 2, 0));
        assert_eq!(parse_version("3").unwrap(), Version::new(3, 0, 0));
        assert!(is_newer_version("v1.2", "v1.2.1").unwrap());
    }

    #[test]
    fn test_asset_name_convention() {
        let config = UpdaterConfig::default();
        let r = release("v1.3.0");

        let linux =
            ReleaseClient::new("v1.2.0", &config).with_platform(Platform::new("linux", "amd64"));
        assert_eq!(linux.asset_name(&r), "citadel_v1.3.0_linux_amd64.tar.gz");

        let windows =
            ReleaseClient::new("v1.2.0", &config).with_platform(Platform::new("windows", "arm64"));
        assert_eq!(windows.asset_name(&r), "citadel_v1.3.0_windows_arm64.zip");
        assert_eq!(windows.platform().binary_entry("citadel"), "citadel.exe");
    }

    #[test]
    fn test_download_url_prefers_listed_asset() {
        let config = UpdaterConfig::default();
        let client =
            ReleaseClient::new("v1.2.0", &config).with_platform(Platform::new("linux", "arm64"));

        let mut r = release("v1.3.0");
        assert_eq!(
            client.download_url(&r),
            concat!(
                "https://github.com/aceteam-ai/citadel-cli/releases/download/",
                "v1.3.0/citadel_v1.3.0_linux_arm64.tar.gz"
            )
        );

        r.assets.push(Asset {
            name: "citadel_v1.3.0_linux_arm64.tar.gz".to_string(),
            browser_download_url: "https://cdn.example.invalid/linux_arm64".to_string(),
            size: 10,
        });
        assert_eq!(client.download_url(&r), "https://cdn.example.invalid/linux_arm64");
        assert_eq!(
            client.checksum_url(&r),
            "https://github.com/aceteam-ai/citadel-cli/releases/download/v1.3.0/checksums.txt"
        );
    }

    #[test]
    fn test_newest_release_skips_drafts_and_bad_tags() {
        let mut draft = release("v9.0.0");
        draft.draft = true;
        let mut rc = release("v1.4.0-rc.2");
        rc.prerelease = true;

        let picked = newest_release(vec![
            release("v1.3.0"),
            draft,
            release("nightly"),
            rc,
            release("v1.3.5"),
        ])
        .unwrap();
        assert_eq!(picked.tag_name, "v1.4.0-rc.2");

        assert!(newest_release(Vec::new()).is_none());
    }

    #[test]
    fn test_current_platform_uses_release_spelling() {
        let platform = Platform::current();
        assert_ne!(platform.os, "macos");
        assert_ne!(platform.arch, "x86_64");
        assert_ne!(platform.arch, "aarch64");
    }
}
