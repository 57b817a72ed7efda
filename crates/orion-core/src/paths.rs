use std::env;
use std::path::PathBuf;

/// Directory name under the home directory used when no data dir is given.
pub const DEFAULT_DATA_DIR_NAME: &str = ".orion";

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Option<PathBuf> {
    ["HOME", "USERPROFILE"]
        .into_iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// `$HOME/.orion`, or `./.orion` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    match get_home_dir() {
        Some(home) => home.join(DEFAULT_DATA_DIR_NAME),
        None => {
            log::warn!("Home directory not set; using ./{DEFAULT_DATA_DIR_NAME}");
            PathBuf::from(DEFAULT_DATA_DIR_NAME)
        }
    }
}
