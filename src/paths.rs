use std::{path::PathBuf, sync::LazyLock};

/// Environment variable that relocates the whole update directory.
pub const UPDATE_DIR_ENV: &str = "CITADEL_UPDATE_DIR";

pub static DEFAULT_UPDATE_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    if let Some(dir) = std::env::var_os(UPDATE_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }

    let mut path = dirs::home_dir().unwrap_or_default();
    path.push("citadel-node");
    path.push("update");
    path
});

/// Computes a path inside the update directory.
///
/// Returns a `&Path` referencing the update directory itself if no arguments are passed in,
/// or a `PathBuf` created by joining all of the arguments to the update directory if at
/// least one argument is passed in.
///
/// # Examples
///
/// ```
/// // Assuming `CITADEL_UPDATE_DIR` is not set, the update directory is ~/citadel-node/update
/// let state = citadel_update::update_path!("state.json");
/// assert!(state.ends_with("state.json"));
/// ```
#[macro_export]
macro_rules! update_path {
    () => {
        $crate::paths::DEFAULT_UPDATE_DIR.as_path()
    };

    ( $( $path:expr ),+ $(,)? ) => {
        [
            $crate::paths::DEFAULT_UPDATE_DIR.as_path(),
            $( std::path::Path::new(&$path) ),+
        ].into_iter().collect::<std::path::PathBuf>()
    };
}

/// File name of the one-generation-deep backup binary.
pub fn previous_binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "citadel.previous.exe"
    } else {
        "citadel.previous"
    }
}

/// File name of a downloaded binary waiting to be applied.
pub fn pending_binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "citadel.pending.exe"
    } else {
        "citadel.pending"
    }
}
