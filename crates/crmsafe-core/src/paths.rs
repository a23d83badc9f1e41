use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const CRMSAFE_DIR: &str = ".crmsafe";
pub const CONFIG_FILE: &str = ".crmsafe/config.yaml";
pub const DEFAULT_REPORTS_DIR: &str = ".crmsafe/reports";

pub const LOCK_FILE: &str = ".execution.lock";
pub const RECORD_PREFIX: &str = "execution-";
pub const RECORD_EXT: &str = "json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn crmsafe_dir(root: &Path) -> PathBuf {
    root.join(CRMSAFE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve a configured reports directory against the project root.
/// Absolute paths are returned unchanged.
pub fn reports_dir(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

pub fn lock_path(reports_dir: &Path) -> PathBuf {
    reports_dir.join(LOCK_FILE)
}

pub fn record_path(reports_dir: &Path, execution_id: &str) -> PathBuf {
    reports_dir.join(format!("{RECORD_PREFIX}{execution_id}.{RECORD_EXT}"))
}

/// True if `path` looks like an execution record written by `RecordStore`.
pub fn is_record_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(RECORD_PREFIX)
        && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
