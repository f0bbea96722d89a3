//! In-memory list of books believed to be on the device.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::types::BookEntry;

/// Ordered book list owned by the device session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    entries: Vec<BookEntry>,
}

impl Catalog {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an entry. Identity checks are the caller's job.
    pub fn add_book(&mut self, entry: BookEntry) {
        self.entries.push(entry);
    }

    /// Remove the entry with the same identity, returning it.
    pub fn remove_book(&mut self, entry: &BookEntry) -> Option<BookEntry> {
        let idx = self.entries.iter().position(|e| e == entry)?;
        Some(self.entries.remove(idx))
    }

    /// Drop every entry stored under one of `paths`. Returns how many went.
    pub fn remove_paths(&mut self, paths: &[String]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !paths.contains(&e.path));
        before - self.entries.len()
    }

    pub fn contains(&self, entry: &BookEntry) -> bool {
        self.entries.iter().any(|e| e == entry)
    }

    pub fn contains_uuid(&self, uuid: &str) -> bool {
        self.entries.iter().any(|e| e.uuid == uuid)
    }

    pub fn find_by_path(&self, path: &str) -> Option<&BookEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BookEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The device has no notion of collections.
    pub fn supports_collections(&self) -> bool {
        false
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a BookEntry;
    type IntoIter = std::slice::Iter<'a, BookEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<BookEntry> for Catalog {
    fn from_iter<T: IntoIterator<Item = BookEntry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Catalog persisted between CLI invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub books: Catalog,
}

impl CatalogSnapshot {
    /// Load from `data_dir`; a missing file is an empty catalog.
    pub fn load(data_dir: &Path) -> Result<Self, std::io::Error> {
        let path = Self::snapshot_path(data_dir);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), std::io::Error> {
        let path = Self::snapshot_path(data_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
    }

    pub fn snapshot_path(data_dir: &Path) -> PathBuf {
        data_dir.join("catalog.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::BookMetadata;

    fn entry(uuid: &str, path: &str) -> BookEntry {
        BookEntry::from_metadata(&BookMetadata::new(path, uuid), path)
    }

    #[test]
    fn test_add_preserves_order() {
        let mut catalog = Catalog::new();
        catalog.add_book(entry("1", "a"));
        catalog.add_book(entry("2", "b"));
        catalog.add_book(entry("3", "c"));
        let paths: Vec<_> = catalog.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_paths_ignores_identity() {
        // Same uuid under two paths: only the named path goes.
        let mut catalog: Catalog = [entry("dup", "a"), entry("dup", "b"), entry("3", "c")]
            .into_iter()
            .collect();
        assert_eq!(catalog.remove_paths(&["b".to_string(), "c".to_string()]), 2);
        let paths: Vec<_> = catalog.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a"]);
        assert_eq!(catalog.remove_paths(&["zzz".to_string()]), 0);
    }

    #[test]
    fn test_remove_by_identity() {
        let mut catalog: Catalog = [entry("1", "a"), entry("2", "b")].into_iter().collect();
        // Same uuid, different path: still the same book.
        let removed = catalog.remove_book(&entry("1", "elsewhere")).unwrap();
        assert_eq!(removed.path, "a");
        assert_eq!(catalog.len(), 1);
        assert!(catalog.remove_book(&entry("9", "b")).is_none());
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_lookup() {
        let catalog: Catalog = [entry("1", "a"), entry("2", "b")].into_iter().collect();
        assert!(catalog.contains(&entry("2", "zzz")));
        assert!(catalog.contains_uuid("1"));
        assert!(!catalog.contains_uuid("3"));
        assert_eq!(catalog.find_by_path("b").map(|e| e.uuid.as_str()), Some("2"));
        assert!(catalog.find_by_path("c").is_none());
        assert!(!catalog.supports_collections());
    }

    #[test]
    fn test_snapshot_round_trip_on_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(CatalogSnapshot::load(tmp.path()).unwrap().books.is_empty());

        let snapshot = CatalogSnapshot {
            books: [entry("1", "calibre/a")].into_iter().collect(),
        };
        snapshot.save(tmp.path()).unwrap();
        let loaded = CatalogSnapshot::load(tmp.path()).unwrap();
        assert_eq!(loaded.books.len(), 1);
        assert_eq!(loaded.books.find_by_path("calibre/a").unwrap().uuid, "1");
    }

    #[test]
    fn test_snapshot_corrupt_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(CatalogSnapshot::snapshot_path(tmp.path()), "{not json").unwrap();
        let err = CatalogSnapshot::load(tmp.path()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
