//! Shared filesystem helpers used across the update engine

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// `path` with `.ext` appended to the full file name (`citadel` -> `citadel.old`).
pub fn sidecar_path(path: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Copy `src` to `dst` byte for byte, keep the source permissions, and fsync.
pub fn copy_file_synced(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut src_file = fs::File::open(src)?;
    let permissions = src_file.metadata()?.permissions();

    let mut dst_file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)?;

    let copied = io::copy(&mut src_file, &mut dst_file)?;
    dst_file.sync_all()?;
    drop(dst_file);

    fs::set_permissions(dst, permissions)?;
    Ok(copied)
}

/// Mark a file executable (0755). No-op on Windows.
pub fn set_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_path_appends_extension() {
        assert_eq!(
            sidecar_path(Path::new("/usr/local/bin/citadel"), "old"),
            PathBuf::from("/usr/local/bin/citadel.old")
        );
        assert_eq!(
            sidecar_path(Path::new("C:/tools/citadel.exe"), "tmp"),
            PathBuf::from("C:/tools/citadel.exe.tmp")
        );
    }

    #[test]
    fn test_copy_file_synced_preserves_content_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"payload").unwrap();
        set_executable(&src).unwrap();
        fs::write(&dst, b"a much longer previous payload").unwrap();

        assert_eq!(copy_file_synced(&src, &dst).unwrap(), 7);
        assert_eq!(fs::read(&dst).unwrap(), b"payload");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dst).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_remove_if_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        fs::write(&path, b"x").unwrap();
        remove_if_exists(&path).unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
