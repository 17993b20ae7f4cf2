//! Whole-file JSON persistence for healer state documents.
//!
//! Every state file (monitor state, LLM cache, wisdom, pause) goes through
//! these two helpers:
//!
//! - Writes are atomic: pretty JSON goes to a temp file which is synced and
//!   renamed over the target while an exclusive lock file is held.
//! - Reads never fail on bad content: a missing file yields the default
//!   value, and a corrupt file is moved aside to `<name>.corrupt` with a
//!   warning before the default is returned.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{HealerError, Result};

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Suffix given to unreadable files that were moved aside.
const CORRUPT_SUFFIX: &str = ".corrupt";

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Saves `value` to `path` atomically as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, the lock cannot be
/// taken, or the write/rename fails.
pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let lock_file = File::create(sibling(path, LOCK_SUFFIX))?;
    FileExt::lock_exclusive(&lock_file).map_err(|e| HealerError::Lock {
        message: format!("{}: {e}", path.display()),
    })?;

    let tmp_path = sibling(path, TMP_SUFFIX);
    let json = serde_json::to_string_pretty(value)?;

    let mut tmp_file = File::create(&tmp_path)?;
    tmp_file.write_all(json.as_bytes())?;
    tmp_file.sync_all()?;

    fs::rename(&tmp_path, path)?;

    FileExt::unlock(&lock_file).map_err(|e| HealerError::Lock {
        message: format!("{}: {e}", path.display()),
    })?;
    Ok(())
}

/// Loads `T` from `path`, falling back to `T::default()`.
///
/// Never fails: unreadable or corrupt files are logged and treated as empty.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!("[healer] Cannot read {}: {}. Using defaults.", path.display(), e);
            return T::default();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "[healer] Corrupted state file at {}: {}. Moving aside and starting fresh.",
                path.display(),
                e
            );
            let _ = fs::rename(path, sibling(path, CORRUPT_SUFFIX));
            T::default()
        }
    }
}
