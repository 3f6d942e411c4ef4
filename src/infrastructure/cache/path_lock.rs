//! Process-wide registry of per-file locks.
//!
//! Every component that reads or writes a persisted file takes the lock for
//! that file's path first, so two cache instances pointed at the same file
//! never interleave their writes.

use std::collections::HashMap;
use std::path::{self, Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

type Registry = Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Lock shared by every user of `path`.
///
/// Paths are keyed by their absolute, lexically normalized form, so
/// `dir/./x.json`, `dir/sub/../x.json` and a relative spelling of the same
/// file all map to one lock, whether or not the file or its directory exist
/// yet.
pub fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let key = normalize(path);
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut locks = registry.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(key).or_default())
}

/// Acquire `lock`, ignoring poisoning: the guarded data is `()`.
pub fn acquire(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize(path: &Path) -> PathBuf {
    let absolute = path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_path_shares_lock() {
        let dir = tempfile::tempdir().unwrap();
        let a = lock_for(&dir.path().join("topology.json"));
        let b = lock_for(&dir.path().join(".").join("topology.json"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_different_paths_do_not_share() {
        let dir = tempfile::tempdir().unwrap();
        let a = lock_for(&dir.path().join("topology.json"));
        let b = lock_for(&dir.path().join("metadata.json"));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_key_is_stable_across_directory_creation() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-yet").join("topology.json");
        let before = lock_for(&file);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        let after = lock_for(&file);
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_relative_and_absolute_spellings_share_lock() {
        let relative = Path::new("relative-cache-dir").join("metadata.json");
        let absolute = std::env::current_dir()
            .unwrap()
            .join("relative-cache-dir")
            .join("sub")
            .join("..")
            .join("metadata.json");
        assert!(Arc::ptr_eq(&lock_for(&relative), &lock_for(&absolute)));
    }
}
