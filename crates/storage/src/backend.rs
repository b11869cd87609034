//! Partition backend selection.
//!
//! The engine supports on-disk partitions and in-memory partitions. The
//! backend is resolved once when the engine opens; everything downstream
//! branches on the resolved kind rather than re-probing at call sites.

use std::path::Path;

use tracing::info;

use strata_types::BackendChoice;

/// Filename of the store inside each partition directory.
pub(crate) const STORE_FILE: &str = "store.redb";

/// The concrete partition backend an engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One store file per partition directory under the data root.
    File,
    /// Partitions held entirely in memory, lost on close.
    Memory,
}

impl BackendKind {
    /// Whether this backend accepts atomic write batches from multiple
    /// threads concurrently. Backends that do not are fronted by a
    /// serializing write queue.
    pub fn supports_concurrent_atomic_writes(self) -> bool {
        matches!(self, BackendKind::File)
    }
}

/// Returns true if `base` contains at least one file-backend partition:
/// a directory with a numeric name holding a store file.
pub fn has_file_data(base: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(base) else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.parse::<u64>().is_ok() && entry.path().join(STORE_FILE).is_file() {
            return true;
        }
    }
    false
}

/// Resolves a configured backend choice against the data directory.
pub fn resolve(choice: BackendChoice, base: &Path) -> BackendKind {
    match choice {
        BackendChoice::File => BackendKind::File,
        BackendChoice::Memory => BackendKind::Memory,
        BackendChoice::Auto => {
            let existing = has_file_data(base);
            info!(
                path = %base.display(),
                existing_data = existing,
                "auto-selected file backend"
            );
            BackendKind::File
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_write_capability() {
        assert!(BackendKind::File.supports_concurrent_atomic_writes());
        assert!(!BackendKind::Memory.supports_concurrent_atomic_writes());
    }

    #[test]
    fn test_has_file_data_empty_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!has_file_data(dir.path()));
    }

    #[test]
    fn test_has_file_data_missing_dir() {
        assert!(!has_file_data(Path::new("/nonexistent/strata-test")));
    }

    #[test]
    fn test_has_file_data_detects_partition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let partition = dir.path().join("3");
        std::fs::create_dir(&partition).expect("create partition dir");
        std::fs::write(partition.join(STORE_FILE), b"").expect("touch store");
        assert!(has_file_data(dir.path()));
    }

    #[test]
    fn test_has_file_data_ignores_non_numeric_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let other = dir.path().join("logs");
        std::fs::create_dir(&other).expect("create dir");
        std::fs::write(other.join(STORE_FILE), b"").expect("touch store");
        assert!(!has_file_data(dir.path()));
    }

    #[test]
    fn test_resolve_explicit_choices() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            resolve(BackendChoice::Memory, dir.path()),
            BackendKind::Memory
        );
        assert_eq!(resolve(BackendChoice::File, dir.path()), BackendKind::File);
        assert_eq!(resolve(BackendChoice::Auto, dir.path()), BackendKind::File);
    }
}
