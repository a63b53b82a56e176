//! Portable volume enumerator: a bounded-channel breadth-first walk over
//! OS directory APIs.
//!
//! Seed directories go on a work channel consumed by a small worker pool.
//! Directories close to the root are re-enqueued so the pool can spread
//! out; anything deeper than `INLINE_DEPTH` is descended inline, which
//! keeps the work channel from growing with the tree. A counter of
//! outstanding directories detects completion: the worker that retires the
//! last directory shuts the pool down, which closes the output channel.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};

use crate::cancel::CancellationToken;
use crate::enumerate::ScanCounters;
use crate::options::IndexingOptions;
use crate::pool::{extension_of, StringPool};
use crate::record::{
    normalize_key, system_time_to_ticks, volume_tag_of, FileAttributes, FileRecord,
};

/// Directories at or below this depth are enqueued for the pool; deeper
/// ones are descended inline by the worker that found them.
const INLINE_DEPTH: usize = 2;

enum Work {
    Dir(PathBuf, usize),
    Done,
}

struct ScanContext {
    pool: Arc<StringPool>,
    options: IndexingOptions,
    excluded_paths: Vec<String>,
    excluded_extensions: Vec<String>,
    output: Sender<FileRecord>,
    token: CancellationToken,
    counters: Arc<ScanCounters>,
    pending: Arc<AtomicUsize>,
    work_tx: Sender<Work>,
    workers: usize,
}

/// Starts an enumeration session on a background thread. Records stream
/// out on `output`; the channel closes when the walk is complete.
pub fn spawn_enumeration(
    pool: Arc<StringPool>,
    options: IndexingOptions,
    locations: Vec<PathBuf>,
    output: Sender<FileRecord>,
    token: CancellationToken,
    counters: Arc<ScanCounters>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        run_enumeration(pool, options, locations, output, token, counters);
    })
}

fn run_enumeration(
    pool: Arc<StringPool>,
    options: IndexingOptions,
    locations: Vec<PathBuf>,
    output: Sender<FileRecord>,
    token: CancellationToken,
    counters: Arc<ScanCounters>,
) {
    let workers = options.effective_threads();
    let (work_tx, work_rx) = unbounded::<Work>();
    let pending = Arc::new(AtomicUsize::new(0));

    let context = Arc::new(ScanContext {
        excluded_paths: options
            .excluded_paths
            .iter()
            .map(|p| normalize_key(p))
            .collect(),
        excluded_extensions: options
            .excluded_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect(),
        pool,
        options,
        output,
        token,
        counters,
        pending: pending.clone(),
        work_tx: work_tx.clone(),
        workers,
    });

    // Seed the work channel. Plain-file locations are emitted directly.
    for location in &locations {
        let metadata = match fs::symlink_metadata(location) {
            Ok(metadata) => metadata,
            Err(error) => {
                context.counters.errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("skipping root {}: {error}", location.display());
                continue;
            }
        };
        if metadata.is_dir() {
            pending.fetch_add(1, Ordering::AcqRel);
            let _ = work_tx.send(Work::Dir(location.clone(), 0));
        } else {
            emit_entry(&context, location, &metadata, false);
        }
    }

    if pending.load(Ordering::Acquire) == 0 {
        return;
    }

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let context = context.clone();
            let work_rx = work_rx.clone();
            thread::spawn(move || {
                while let Ok(work) = work_rx.recv() {
                    match work {
                        Work::Dir(path, depth) => {
                            if context.token.check().is_some() {
                                scan_directory(&context, &path, depth);
                            }
                            if context.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                                for _ in 0..context.workers {
                                    let _ = context.work_tx.send(Work::Done);
                                }
                            }
                        }
                        Work::Done => break,
                    }
                }
            })
        })
        .collect();

    drop(work_tx);
    for handle in handles {
        let _ = handle.join();
    }
}

fn scan_directory(context: &ScanContext, directory: &Path, depth: usize) {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(error) => {
            context.counters.errors.fetch_add(1, Ordering::Relaxed);
            log::debug!("skipping directory: {}", classify_io_error(directory, error));
            return;
        }
    };

    for entry in entries {
        if context.token.is_cancelled() {
            return;
        }
        let Ok(entry) = entry else {
            context.counters.errors.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        let Ok(file_type) = entry.file_type() else {
            context.counters.errors.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        let path = entry.path();

        let follow = file_type.is_symlink() && context.options.follow_symlinks;
        let metadata = if follow {
            fs::metadata(&path)
        } else {
            entry.metadata()
        };
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(error) => {
                context.counters.errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("skipping entry: {}", classify_io_error(&path, error));
                continue;
            }
        };

        let descend = metadata.is_dir() && (!file_type.is_symlink() || follow);
        if !emit_entry(context, &path, &metadata, file_type.is_symlink()) {
            continue;
        }
        if descend {
            if depth <= INLINE_DEPTH {
                context.pending.fetch_add(1, Ordering::AcqRel);
                if context.work_tx.send(Work::Dir(path, depth + 1)).is_err() {
                    context.pending.fetch_sub(1, Ordering::AcqRel);
                }
            } else {
                scan_directory(context, &path, depth + 1);
            }
        }
    }
}

/// Applies the session filters and writes a record for `path`. Returns
/// false when the entry was filtered out (directories are then not
/// descended into).
fn emit_entry(
    context: &ScanContext,
    path: &Path,
    metadata: &fs::Metadata,
    is_symlink: bool,
) -> bool {
    let full_path = path.to_string_lossy();
    let is_dir = metadata.is_dir();

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty() {
        return false;
    }

    let mut attributes = platform_attributes(metadata);
    if is_dir {
        attributes |= FileAttributes::DIRECTORY;
    }
    if is_symlink {
        attributes |= FileAttributes::REPARSE_POINT;
    }
    if name.starts_with('.') {
        attributes |= FileAttributes::HIDDEN;
    }

    if attributes.contains(FileAttributes::HIDDEN) && !context.options.include_hidden {
        context.counters.skipped.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    if attributes.contains(FileAttributes::SYSTEM) && !context.options.include_system {
        context.counters.skipped.fetch_add(1, Ordering::Relaxed);
        return false;
    }

    if !context.excluded_paths.is_empty() {
        let normalized = normalize_key(&full_path);
        if context
            .excluded_paths
            .iter()
            .any(|excluded| normalized.contains(excluded.as_str()))
        {
            context.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
    }

    if !is_dir {
        if let Some(extension) = extension_of(&name) {
            let lowered = extension.to_lowercase();
            if context
                .excluded_extensions
                .iter()
                .any(|excluded| *excluded == lowered)
            {
                context.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        if let Some(cap) = context.options.max_file_size {
            if metadata.len() as i64 > cap {
                context.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
    }

    let size = if is_dir || !context.options.collect_file_size {
        0
    } else {
        metadata.len() as i64
    };
    let (directory_id, name_id, extension_id) =
        context.pool.intern_path_components(&full_path);
    let record = FileRecord {
        name_id,
        directory_id,
        extension_id,
        size,
        created_ticks: metadata
            .created()
            .map(system_time_to_ticks)
            .unwrap_or(0),
        modified_ticks: metadata
            .modified()
            .map(system_time_to_ticks)
            .unwrap_or(0),
        accessed_ticks: metadata
            .accessed()
            .map(system_time_to_ticks)
            .unwrap_or(0),
        attributes,
        volume_tag: volume_tag_of(&full_path),
        file_ref: file_reference(metadata),
    };

    if is_dir {
        context.counters.directories.fetch_add(1, Ordering::Relaxed);
    } else {
        context.counters.files.fetch_add(1, Ordering::Relaxed);
    }
    // A closed output channel means the consumer is gone; stop producing.
    if context.output.send(record).is_err() {
        context.token.cancel();
        return false;
    }
    true
}

/// Per-path failures are recovered locally; this only shapes the debug log.
fn classify_io_error(path: &Path, error: std::io::Error) -> crate::error::SearchError {
    if error.kind() == std::io::ErrorKind::PermissionDenied {
        crate::error::SearchError::AccessDenied(path.to_path_buf())
    } else {
        crate::error::SearchError::IoTransient {
            path: path.to_path_buf(),
            source: error,
        }
    }
}

#[cfg(unix)]
fn file_reference(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn file_reference(_metadata: &fs::Metadata) -> u64 {
    0
}

#[cfg(windows)]
fn platform_attributes(metadata: &fs::Metadata) -> FileAttributes {
    use std::os::windows::fs::MetadataExt;
    FileAttributes::from_bits_truncate(metadata.file_attributes())
}

#[cfg(not(windows))]
fn platform_attributes(_metadata: &fs::Metadata) -> FileAttributes {
    FileAttributes::empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::fs::File;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn collect(
        options: IndexingOptions,
        locations: Vec<PathBuf>,
    ) -> (Vec<FileRecord>, Arc<ScanCounters>, Arc<StringPool>) {
        let pool = Arc::new(StringPool::new());
        let counters = Arc::new(ScanCounters::default());
        let (tx, rx) = bounded(1024);
        let handle = spawn_enumeration(
            pool.clone(),
            options,
            locations,
            tx,
            CancellationToken::new(),
            counters.clone(),
        );
        let records: Vec<_> = rx.iter().collect();
        handle.join().unwrap();
        (records, counters, pool)
    }

    fn names(records: &[FileRecord], pool: &StringPool) -> Vec<String> {
        let mut names: Vec<String> = records
            .iter()
            .filter_map(|r| {
                pool.get(crate::pool::PoolKind::Name, r.name_id)
                    .map(|n| n.to_string())
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn walks_nested_directories() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b/c")).unwrap();
        File::create(temp.path().join("top.txt")).unwrap();
        File::create(temp.path().join("a/mid.txt")).unwrap();
        File::create(temp.path().join("a/b/c/deep.txt")).unwrap();

        let (records, counters, pool) =
            collect(IndexingOptions::default(), vec![temp.path().to_path_buf()]);

        let names = names(&records, &pool);
        for expected in ["top.txt", "mid.txt", "deep.txt", "a", "b", "c"] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(counters.files(), 3);
        assert_eq!(counters.directories(), 3);
    }

    #[test]
    fn respects_excluded_extensions() {
        let temp = TempDir::new().unwrap();
        File::create(temp.path().join("keep.rs")).unwrap();
        File::create(temp.path().join("drop.tmp")).unwrap();

        let options = IndexingOptions {
            excluded_extensions: vec![".tmp".to_string()],
            ..IndexingOptions::default()
        };
        let (records, _, pool) = collect(options, vec![temp.path().to_path_buf()]);
        let names = names(&records, &pool);
        assert!(names.contains(&"keep.rs".to_string()));
        assert!(!names.contains(&"drop.tmp".to_string()));
    }

    #[test]
    fn respects_excluded_paths() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("node_modules")).unwrap();
        File::create(temp.path().join("node_modules/dep.js")).unwrap();
        File::create(temp.path().join("app.js")).unwrap();

        let options = IndexingOptions {
            excluded_paths: vec!["node_modules".to_string()],
            ..IndexingOptions::default()
        };
        let (records, _, pool) = collect(options, vec![temp.path().to_path_buf()]);
        let names = names(&records, &pool);
        assert!(names.contains(&"app.js".to_string()));
        assert!(!names.contains(&"dep.js".to_string()));
        assert!(!names.contains(&"node_modules".to_string()));
    }

    #[test]
    fn hidden_entries_skipped_by_default() {
        let temp = TempDir::new().unwrap();
        File::create(temp.path().join(".hidden")).unwrap();
        File::create(temp.path().join("visible.txt")).unwrap();

        let (records, _, pool) =
            collect(IndexingOptions::default(), vec![temp.path().to_path_buf()]);
        let default_names = names(&records, &pool);
        assert!(!default_names.contains(&".hidden".to_string()));
        assert!(default_names.contains(&"visible.txt".to_string()));

        let options = IndexingOptions {
            include_hidden: true,
            ..IndexingOptions::default()
        };
        let (records, _, pool) = collect(options, vec![temp.path().to_path_buf()]);
        assert!(names(&records, &pool).contains(&".hidden".to_string()));
    }

    #[test]
    fn size_cap_filters_large_files() {
        let temp = TempDir::new().unwrap();
        let mut big = File::create(temp.path().join("big.bin")).unwrap();
        big.write_all(&[0u8; 4096]).unwrap();
        File::create(temp.path().join("small.bin")).unwrap();

        let options = IndexingOptions {
            max_file_size: Some(1024),
            ..IndexingOptions::default()
        };
        let (records, _, pool) = collect(options, vec![temp.path().to_path_buf()]);
        let names = names(&records, &pool);
        assert!(!names.contains(&"big.bin".to_string()));
        assert!(names.contains(&"small.bin".to_string()));
    }

    #[test]
    fn missing_root_is_recovered() {
        let temp = TempDir::new().unwrap();
        File::create(temp.path().join("ok.txt")).unwrap();
        let missing = temp.path().join("does-not-exist");

        let (records, counters, pool) = collect(
            IndexingOptions::default(),
            vec![missing, temp.path().to_path_buf()],
        );
        assert!(names(&records, &pool).contains(&"ok.txt".to_string()));
        assert_eq!(counters.errors(), 1);
    }

    #[test]
    fn cancellation_stops_early() {
        let temp = TempDir::new().unwrap();
        for i in 0..50 {
            File::create(temp.path().join(format!("f{i}.txt"))).unwrap();
        }
        let pool = Arc::new(StringPool::new());
        let counters = Arc::new(ScanCounters::default());
        let token = CancellationToken::new();
        token.cancel();
        let (tx, rx) = bounded(1024);
        let handle = spawn_enumeration(
            pool,
            IndexingOptions::default(),
            vec![temp.path().to_path_buf()],
            tx,
            token,
            counters,
        );
        let records: Vec<_> = rx.iter().collect();
        handle.join().unwrap();
        assert!(records.is_empty());
    }
}
