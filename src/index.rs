//! Composite in-memory index: primary record map plus the secondary
//! structures used for candidate selection.
//!
//! Keys are the case-folded, separator-normalized full path. Every write
//! keeps four structures in step: the primary map, the per-directory key
//! sets, the per-extension key sets and the path trie. Writers serialize
//! through the engine's lock; this type itself is single-threaded.

use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};

use crate::error::{Result, SearchError};
use crate::options::SearchQuery;
use crate::pool::{PoolKind, StringPool};
use crate::record::{normalize_key, FileRecord};
use crate::trie::{PathTrieIndex, RecordKey};

#[derive(Debug)]
pub struct CompositeIndex {
    pool: Arc<StringPool>,
    primary: FnvHashMap<RecordKey, FileRecord>,
    by_directory: FnvHashMap<Box<str>, FnvHashSet<RecordKey>>,
    by_extension: FnvHashMap<Box<str>, FnvHashSet<RecordKey>>,
    trie: PathTrieIndex,
    file_count: usize,
    dir_count: usize,
}

impl CompositeIndex {
    pub fn new(pool: Arc<StringPool>) -> Self {
        Self {
            pool,
            primary: FnvHashMap::default(),
            by_directory: FnvHashMap::default(),
            by_extension: FnvHashMap::default(),
            trie: PathTrieIndex::new(),
            file_count: 0,
            dir_count: 0,
        }
    }

    /// The primary key for a record: its normalized full path.
    pub fn key_of(&self, record: &FileRecord) -> Option<RecordKey> {
        let full_path = record.full_path(&self.pool)?;
        Some(Arc::from(normalize_key(&full_path)))
    }

    /// Inserts a record; an existing record under the same key is replaced.
    pub fn add(&mut self, record: FileRecord) -> Result<RecordKey> {
        let key = self
            .key_of(&record)
            .ok_or(SearchError::InvalidId(record.name_id))?;
        self.insert_inner(key.clone(), record);
        Ok(key)
    }

    /// Applies a batch atomically with respect to validation: every record
    /// is resolved against the pool before any of them is applied.
    pub fn add_batch(&mut self, records: &[FileRecord]) -> Result<usize> {
        let mut keyed = Vec::with_capacity(records.len());
        for record in records {
            let key = self
                .key_of(record)
                .ok_or(SearchError::InvalidId(record.name_id))?;
            keyed.push((key, *record));
        }
        let applied = keyed.len();
        for (key, record) in keyed {
            self.insert_inner(key, record);
        }
        Ok(applied)
    }

    /// Removes the record at `full_path` (any separator/casing form).
    pub fn remove(&mut self, full_path: &str) -> bool {
        let key = normalize_key(full_path);
        self.remove_inner(&key)
    }

    /// Replaces the record under its own path. Returns whether a previous
    /// record existed. Old and new are never both visible: the caller holds
    /// the write lock across this call.
    pub fn update(&mut self, record: FileRecord) -> Result<bool> {
        let key = self
            .key_of(&record)
            .ok_or(SearchError::InvalidId(record.name_id))?;
        let existed = self.primary.contains_key(key.as_ref());
        self.insert_inner(key, record);
        Ok(existed)
    }

    pub fn get(&self, full_path: &str) -> Option<FileRecord> {
        self.primary.get(normalize_key(full_path).as_str()).copied()
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub fn directory_count(&self) -> usize {
        self.dir_count
    }

    pub fn clear(&mut self) {
        self.primary.clear();
        self.by_directory.clear();
        self.by_extension.clear();
        self.trie.clear();
        self.file_count = 0;
        self.dir_count = 0;
    }

    /// True when the trie holds a node for the full segmentation of `path`.
    pub fn contains_path(&self, path: &str) -> bool {
        self.trie.contains_path(&normalize_key(path))
    }

    /// All keys under a root, used by refresh reconciliation.
    pub fn keys_under(&self, root: &str) -> Vec<RecordKey> {
        self.trie.files_under(&normalize_key(root))
    }

    /// Narrowest candidate set for a query. First matching rule wins:
    /// base path (recursive via trie / direct via directory map), then
    /// extension, then the union over search locations, then everything.
    ///
    /// Records are copied out so iteration and matching happen after the
    /// read lock is released.
    pub fn query_candidates(&self, query: &SearchQuery) -> Vec<(RecordKey, FileRecord)> {
        let extension = query.normalized_extension();

        if let Some(base) = &query.base_path {
            let base_key = normalize_key(&base.to_string_lossy());
            let mut candidates = if query.include_subdirectories {
                self.resolve_keys(self.trie.files_under(&base_key))
            } else {
                self.resolve_set(self.by_directory.get(base_key.as_str()))
            };
            if let Some(ext) = &extension {
                candidates.retain(|(_, record)| self.extension_is(record, ext));
            }
            return candidates;
        }

        if let Some(ext) = &extension {
            return self.resolve_set(self.by_extension.get(ext.as_str()));
        }

        if !query.search_locations.is_empty() {
            let mut seen: FnvHashSet<RecordKey> = FnvHashSet::default();
            let mut candidates = Vec::new();
            for location in &query.search_locations {
                let base_key = normalize_key(&location.to_string_lossy());
                let pairs = if query.include_subdirectories {
                    self.resolve_keys(self.trie.files_under(&base_key))
                } else {
                    self.resolve_set(self.by_directory.get(base_key.as_str()))
                };
                for (key, record) in pairs {
                    if seen.insert(key.clone()) {
                        candidates.push((key, record));
                    }
                }
            }
            return candidates;
        }

        self.primary
            .iter()
            .map(|(key, record)| (key.clone(), *record))
            .collect()
    }

    fn resolve_keys(&self, keys: Vec<RecordKey>) -> Vec<(RecordKey, FileRecord)> {
        keys.into_iter()
            .filter_map(|key| self.primary.get(&key).map(|record| (key, *record)))
            .collect()
    }

    fn resolve_set(&self, set: Option<&FnvHashSet<RecordKey>>) -> Vec<(RecordKey, FileRecord)> {
        set.map(|keys| {
            keys.iter()
                .filter_map(|key| self.primary.get(key).map(|record| (key.clone(), *record)))
                .collect()
        })
        .unwrap_or_default()
    }

    fn extension_is(&self, record: &FileRecord, ext: &str) -> bool {
        self.pool
            .get(PoolKind::Extension, record.extension_id)
            .map(|stored| stored == ext)
            .unwrap_or(false)
    }

    fn directory_key_of(&self, record: &FileRecord) -> Option<Box<str>> {
        let directory = self.pool.get(PoolKind::Directory, record.directory_id)?;
        Some(Box::from(normalize_key(directory)))
    }

    fn extension_key_of(&self, record: &FileRecord) -> Option<Box<str>> {
        let extension = self.pool.get(PoolKind::Extension, record.extension_id)?;
        if extension.is_empty() {
            None
        } else {
            // Extensions are interned lowercased, so this is already in
            // secondary-key form.
            Some(Box::from(extension))
        }
    }

    fn insert_inner(&mut self, key: RecordKey, record: FileRecord) {
        // Replace semantics: clear any previous row first so secondary
        // structures never hold stale memberships.
        self.remove_inner(&key);

        if let Some(dir_key) = self.directory_key_of(&record) {
            self.by_directory
                .entry(dir_key)
                .or_default()
                .insert(key.clone());
        }
        if let Some(ext_key) = self.extension_key_of(&record) {
            self.by_extension
                .entry(ext_key)
                .or_default()
                .insert(key.clone());
        }
        self.trie.add(&key, key.clone());
        if record.is_directory() {
            self.dir_count += 1;
        } else {
            self.file_count += 1;
        }
        self.primary.insert(key, record);
    }

    fn remove_inner(&mut self, key: &str) -> bool {
        let Some(record) = self.primary.remove(key) else {
            return false;
        };

        if let Some(dir_key) = self.directory_key_of(&record) {
            if let Some(set) = self.by_directory.get_mut(dir_key.as_ref()) {
                set.retain(|k| k.as_ref() != key);
                if set.is_empty() {
                    self.by_directory.remove(dir_key.as_ref());
                }
            }
        }
        if let Some(ext_key) = self.extension_key_of(&record) {
            if let Some(set) = self.by_extension.get_mut(ext_key.as_ref()) {
                set.retain(|k| k.as_ref() != key);
                if set.is_empty() {
                    self.by_extension.remove(ext_key.as_ref());
                }
            }
        }
        self.trie.remove(key, key);
        if record.is_directory() {
            self.dir_count -= 1;
        } else {
            self.file_count -= 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{volume_tag_of, FileAttributes};

    fn make_index() -> CompositeIndex {
        CompositeIndex::new(Arc::new(StringPool::new()))
    }

    fn record(index: &CompositeIndex, path: &str, size: i64) -> FileRecord {
        record_with(index, path, size, FileAttributes::empty())
    }

    fn record_with(
        index: &CompositeIndex,
        path: &str,
        size: i64,
        attributes: FileAttributes,
    ) -> FileRecord {
        let (directory_id, name_id, extension_id) = index.pool.intern_path_components(path);
        FileRecord {
            name_id,
            directory_id,
            extension_id,
            size,
            created_ticks: 10,
            modified_ticks: 20,
            accessed_ticks: 30,
            attributes,
            volume_tag: volume_tag_of(path),
            file_ref: 0,
        }
    }

    /// Cross-structure consistency: every primary entry is present in each
    /// applicable secondary structure and vice versa.
    fn check_invariants(index: &CompositeIndex) {
        for (key, record) in &index.primary {
            let dir_key = index.directory_key_of(record).unwrap();
            assert!(
                index.by_directory[dir_key.as_ref()].contains(key),
                "directory set missing {key}"
            );
            if let Some(ext_key) = index.extension_key_of(record) {
                assert!(
                    index.by_extension[ext_key.as_ref()].contains(key),
                    "extension set missing {key}"
                );
            }
            assert!(index.trie.contains_path(key), "trie missing {key}");
        }
        for set in index.by_directory.values() {
            for key in set {
                assert!(index.primary.contains_key(key.as_ref()));
            }
        }
        for set in index.by_extension.values() {
            for key in set {
                assert!(index.primary.contains_key(key.as_ref()));
            }
        }
        assert_eq!(
            index.file_count + index.dir_count,
            index.primary.len(),
            "type counters out of step"
        );
    }

    #[test]
    fn add_get_remove_round_trip() {
        let mut index = make_index();
        let rec = record(&index, "C:\\src\\Main.cs", 100);
        index.add(rec).unwrap();
        check_invariants(&index);

        let fetched = index.get("c:/src/main.cs").unwrap();
        assert_eq!(fetched, rec);
        // Any separator/casing form resolves to the same row.
        assert_eq!(index.get("C:\\SRC\\MAIN.CS"), Some(rec));

        assert!(index.remove("C:\\src\\Main.cs"));
        assert!(index.get("c:/src/main.cs").is_none());
        assert!(index.is_empty());
        check_invariants(&index);
    }

    #[test]
    fn add_batch_is_idempotent() {
        let mut index = make_index();
        let records = vec![
            record(&index, "/a/one.txt", 1),
            record(&index, "/a/two.txt", 2),
            record(&index, "/a/b/three.txt", 3),
        ];
        index.add_batch(&records).unwrap();
        index.add_batch(&records).unwrap();
        assert_eq!(index.len(), 3);
        check_invariants(&index);
    }

    #[test]
    fn update_replaces_atomically() {
        let mut index = make_index();
        let before = record(&index, "/a/file.txt", 10);
        let after = FileRecord {
            size: 999,
            ..record(&index, "/a/file.txt", 10)
        };
        index.add(before).unwrap();
        assert!(index.update(after).unwrap());
        assert_eq!(index.get("/a/file.txt").unwrap().size, 999);
        assert_eq!(index.len(), 1);
        check_invariants(&index);
    }

    #[test]
    fn add_remove_add_round_trip() {
        let mut index = make_index();
        let rec = record(&index, "/x/y.log", 5);
        index.add(rec).unwrap();
        assert!(index.remove("/x/y.log"));
        index.add(rec).unwrap();
        assert_eq!(index.get("/x/y.log"), Some(rec));
        check_invariants(&index);
    }

    #[test]
    fn candidates_by_base_path_recursive() {
        let mut index = make_index();
        index.add(record(&index, "C:\\src\\main.cs", 1)).unwrap();
        index
            .add(record(&index, "C:\\src\\tests\\UserServiceTests.cs", 2))
            .unwrap();
        index.add(record(&index, "C:\\docs\\readme.md", 3)).unwrap();

        let query = SearchQuery::text("").with_base_path("C:\\src");
        let candidates = index.query_candidates(&query);
        assert_eq!(candidates.len(), 2);

        let query = SearchQuery::text("")
            .with_base_path("C:\\src")
            .with_extension(".cs");
        assert_eq!(index.query_candidates(&query).len(), 2);
    }

    #[test]
    fn candidates_by_directory_non_recursive() {
        let mut index = make_index();
        index.add(record(&index, "D:\\root\\a.txt", 1)).unwrap();
        index.add(record(&index, "D:\\root\\sub\\b.txt", 2)).unwrap();

        let query = SearchQuery {
            base_path: Some("D:\\root".into()),
            include_subdirectories: false,
            ..SearchQuery::default()
        };
        let candidates = index.query_candidates(&query);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.as_ref(), "d:/root/a.txt");
    }

    #[test]
    fn candidates_by_extension() {
        let mut index = make_index();
        index.add(record(&index, "/a/x.log", 1)).unwrap();
        index.add(record(&index, "/b/y.LOG", 2)).unwrap();
        index.add(record(&index, "/c/z.txt", 3)).unwrap();

        let query = SearchQuery::text("").with_extension("log");
        let candidates = index.query_candidates(&query);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn candidates_by_locations_deduplicate() {
        let mut index = make_index();
        index.add(record(&index, "/a/x.txt", 1)).unwrap();
        index.add(record(&index, "/b/y.txt", 2)).unwrap();

        let query = SearchQuery {
            search_locations: vec!["/a".into(), "/a".into(), "/b".into()],
            ..SearchQuery::default()
        };
        assert_eq!(index.query_candidates(&query).len(), 2);
    }

    #[test]
    fn candidates_default_to_everything() {
        let mut index = make_index();
        index.add(record(&index, "/a/x.txt", 1)).unwrap();
        index.add(record(&index, "/b/y.txt", 2)).unwrap();
        assert_eq!(index.query_candidates(&SearchQuery::default()).len(), 2);
    }

    #[test]
    fn counters_track_types() {
        let mut index = make_index();
        index
            .add(record_with(
                &index,
                "/a/dir",
                0,
                FileAttributes::DIRECTORY,
            ))
            .unwrap();
        index.add(record(&index, "/a/dir/file.txt", 1)).unwrap();
        assert_eq!(index.file_count(), 1);
        assert_eq!(index.directory_count(), 1);
        index.remove("/a/dir/file.txt");
        assert_eq!(index.file_count(), 0);
        check_invariants(&index);
    }

    #[test]
    fn clear_resets_everything() {
        let mut index = make_index();
        index.add(record(&index, "/a/x.txt", 1)).unwrap();
        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.file_count(), 0);
        assert!(!index.contains_path("/a"));
    }
}
