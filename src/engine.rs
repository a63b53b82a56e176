//! The search engine orchestrator.
//!
//! Owns the string pool, the composite index, the enumeration session and
//! the change observer, and exposes the public operations: start/stop
//! indexing, search, refresh, clear and statistics. Mutating operations
//! serialize through the index write lock; queries copy candidates out
//! under a short read section and never hold a lock while matching.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use fnv::FnvHashSet;
use parking_lot::{Mutex, RwLock};

use crate::cancel::CancellationToken;
use crate::enumerate::standard::spawn_enumeration;
use crate::enumerate::ScanCounters;
use crate::error::Result;
use crate::index::CompositeIndex;
use crate::observer::{ChangeEvent, ChangeObserver, ObserverOptions};
use crate::options::{IndexingOptions, SearchQuery};
use crate::persist::{spawn_mirror, MirrorOp, PersistenceGateway};
use crate::pool::{PoolStatistics, StringPool};
use crate::query::{CompiledQuery, QueryEvaluator, SearchOutcome};
use crate::record::{
    normalize_key, system_time_to_ticks, truncate_ticks_to_seconds, volume_tag_of, FileAttributes,
    FileEntry, FileRecord,
};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Indexing = 1,
    Monitoring = 2,
    IndexingAndMonitoring = 3,
}

impl EngineState {
    fn load(atomic: &AtomicU8) -> Self {
        match atomic.load(Ordering::Relaxed) {
            1 => Self::Indexing,
            2 => Self::Monitoring,
            3 => Self::IndexingAndMonitoring,
            _ => Self::Idle,
        }
    }

    fn store(self, atomic: &AtomicU8) {
        atomic.store(self as u8, Ordering::Relaxed);
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Indexing => "indexing",
            Self::Monitoring => "monitoring",
            Self::IndexingAndMonitoring => "indexing+monitoring",
        }
    }
}

/// Progress notification emitted while an indexing session runs.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub files_indexed: u64,
    pub directories_indexed: u64,
    pub errors: u64,
    pub done: bool,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStatistics {
    pub state: &'static str,
    pub total_indexed_files: usize,
    pub total_indexed_directories: usize,
    pub total_indexed: usize,
    pub pool: PoolStatistics,
    pub enumeration_errors: u64,
    pub skipped_entries: u64,
    /// Records applied per second during the most recent session.
    pub records_per_second: f64,
    pub monitoring: bool,
    pub dropped_change_events: u64,
}

/// The outcome of one search call.
#[derive(Debug)]
pub struct SearchResult {
    pub entries: Vec<FileEntry>,
    pub total_matches: usize,
    pub truncated: bool,
    pub outcome: SearchOutcome,
    pub elapsed: Duration,
}

struct EngineShared {
    pool: Arc<StringPool>,
    index: RwLock<CompositeIndex>,
    state: AtomicU8,
    counters: Arc<ScanCounters>,
    records_per_second: AtomicU64,
    progress_tx: Mutex<Option<Sender<ProgressEvent>>>,
    mirror_tx: Mutex<Option<tokio::sync::mpsc::Sender<MirrorOp>>>,
    dropped_change_events: AtomicU64,
}

struct IndexingSession {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

/// An embeddable, in-memory file search engine.
pub struct SearchEngine {
    shared: Arc<EngineShared>,
    session: Mutex<Option<IndexingSession>>,
    options: Mutex<IndexingOptions>,
}

impl Default for SearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchEngine {
    pub fn new() -> Self {
        let pool = Arc::new(StringPool::new());
        let shared = Arc::new(EngineShared {
            index: RwLock::new(CompositeIndex::new(pool.clone())),
            pool,
            state: AtomicU8::new(EngineState::Idle as u8),
            counters: Arc::new(ScanCounters::default()),
            records_per_second: AtomicU64::new(0),
            progress_tx: Mutex::new(None),
            mirror_tx: Mutex::new(None),
            dropped_change_events: AtomicU64::new(0),
        });
        Self {
            shared,
            session: Mutex::new(None),
            options: Mutex::new(IndexingOptions::default()),
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState::load(&self.shared.state)
    }

    /// Begins background enumeration of the configured locations. Calling
    /// this while a session is already running is a no-op.
    pub fn start_indexing(&self, options: IndexingOptions) -> Result<()> {
        let mut session = self.session.lock();
        if let Some(active) = session.as_ref() {
            let running = active
                .join
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false);
            if running && !active.token.is_cancelled() {
                log::debug!("start_indexing ignored: session already running");
                return Ok(());
            }
        }
        if let Some(mut finished) = session.take() {
            if let Some(handle) = finished.join.take() {
                let _ = handle.join();
            }
        }

        *self.options.lock() = options.clone();
        let token = CancellationToken::new();
        let shared = self.shared.clone();
        let thread_token = token.clone();
        let join = thread::spawn(move || {
            run_indexing_session(shared, options, thread_token);
        });

        *session = Some(IndexingSession {
            token,
            join: Some(join),
        });
        Ok(())
    }

    /// Cancels enumeration and observation cooperatively and waits for the
    /// session to wind down.
    pub fn stop_indexing(&self) {
        let mut session = self.session.lock();
        if let Some(mut active) = session.take() {
            active.token.cancel();
            if let Some(handle) = active.join.take() {
                let _ = handle.join();
            }
        }
        EngineState::Idle.store(&self.shared.state);
    }

    /// Runs a structured query against the index (and the live filesystem
    /// where the index does not cover the requested roots).
    pub fn search(&self, query: &SearchQuery) -> Result<SearchResult> {
        self.search_with(query, &CancellationToken::new())
    }

    /// `search` with an external cancellation token.
    pub fn search_with(
        &self,
        query: &SearchQuery,
        token: &CancellationToken,
    ) -> Result<SearchResult> {
        let started = Instant::now();
        let compiled = CompiledQuery::compile(query.clone())?;
        let evaluator = QueryEvaluator::new(&self.shared.index, self.shared.pool.clone());
        let output = evaluator.evaluate(&compiled, token)?;
        Ok(SearchResult {
            total_matches: output.total_matches,
            truncated: output.truncated,
            outcome: output.outcome,
            entries: output.entries,
            elapsed: started.elapsed(),
        })
    }

    /// Convenience text search over the whole index.
    pub fn search_text(&self, text: &str) -> Result<SearchResult> {
        self.search(&SearchQuery::text(text))
    }

    /// Re-enumerates the given roots (or the session's configured
    /// locations) and merges the result into the index: new entries are
    /// added, changed entries replaced, vanished entries removed.
    pub fn refresh(&self, locations: Option<&[PathBuf]>) -> Result<()> {
        let options = self.options.lock().clone();
        let roots: Vec<PathBuf> = match locations {
            Some(roots) => roots.to_vec(),
            None => options.locations.clone(),
        };
        let token = CancellationToken::new();
        for root in &roots {
            refresh_root(&self.shared, &options, root, &token);
        }
        Ok(())
    }

    /// Empties every index structure and resets counters. Interned strings
    /// are retained; ids stay valid for the engine's lifetime.
    pub fn clear(&self) {
        self.shared.index.write().clear();
        self.shared.counters.reset();
        self.shared.records_per_second.store(0, Ordering::Relaxed);
        send_mirror(&self.shared, MirrorOp::Clear);
    }

    pub fn statistics(&self) -> EngineStatistics {
        let index = self.shared.index.read();
        let state = EngineState::load(&self.shared.state);
        EngineStatistics {
            state: state.as_str(),
            total_indexed_files: index.file_count(),
            total_indexed_directories: index.directory_count(),
            total_indexed: index.len(),
            pool: self.shared.pool.statistics(),
            enumeration_errors: self.shared.counters.errors(),
            skipped_entries: self.shared.counters.skipped(),
            records_per_second: f64::from_bits(
                self.shared.records_per_second.load(Ordering::Relaxed),
            ),
            monitoring: matches!(
                state,
                EngineState::Monitoring | EngineState::IndexingAndMonitoring
            ),
            dropped_change_events: self.shared.dropped_change_events.load(Ordering::Relaxed),
        }
    }

    /// Subscribes to progress events for running and future sessions.
    /// Events are dropped rather than blocking the indexer when the
    /// subscriber lags.
    pub fn subscribe_progress(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = bounded(256);
        *self.shared.progress_tx.lock() = Some(tx);
        rx
    }

    /// Attaches a durable mirror. Index mutations are forwarded to it on
    /// the given runtime from now on.
    pub fn attach_persistence(
        &self,
        gateway: Arc<dyn PersistenceGateway>,
        handle: &tokio::runtime::Handle,
    ) {
        let tx = spawn_mirror(handle, gateway);
        *self.shared.mirror_tx.lock() = Some(tx);
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        self.stop_indexing();
    }
}

// ---------------------------------------------------------------------------
// Indexing session
// ---------------------------------------------------------------------------

fn run_indexing_session(
    shared: Arc<EngineShared>,
    options: IndexingOptions,
    token: CancellationToken,
) {
    let started = Instant::now();
    shared.counters.reset();
    EngineState::Indexing.store(&shared.state);
    log::info!(
        "indexing started: {} location(s), {} worker thread(s)",
        options.locations.len(),
        options.effective_threads()
    );

    let (tx, rx) = bounded::<FileRecord>(options.channel_capacity.max(1));
    let handles = spawn_session_enumerators(&shared, &options, tx, &token);

    let mut batch: Vec<FileRecord> = Vec::with_capacity(options.batch_size.max(1));
    for record in rx.iter() {
        batch.push(record);
        if batch.len() >= options.batch_size.max(1) {
            apply_batch(&shared, &mut batch);
            emit_progress(&shared, false);
        }
    }
    apply_batch(&shared, &mut batch);

    for handle in handles {
        let _ = handle.join();
    }

    let applied = shared.counters.files() + shared.counters.directories();
    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        shared
            .records_per_second
            .store((applied as f64 / elapsed).to_bits(), Ordering::Relaxed);
    }
    emit_progress(&shared, true);
    log::info!(
        "indexing finished: {applied} records in {:.2}s (cancelled={})",
        elapsed,
        token.is_cancelled()
    );

    if options.enable_monitoring && !token.is_cancelled() {
        EngineState::Monitoring.store(&shared.state);
        run_monitoring(&shared, &options, &token);
    }
    EngineState::Idle.store(&shared.state);
}

/// Picks an enumerator per root: the master-file-table fast path where the
/// platform, privileges and options allow it, the standard walker
/// otherwise.
fn spawn_session_enumerators(
    shared: &Arc<EngineShared>,
    options: &IndexingOptions,
    tx: Sender<FileRecord>,
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    #[cfg(windows)]
    {
        use crate::enumerate::mft;
        use crate::options::MftMode;

        let mut handles = Vec::new();
        let mut standard_roots = Vec::new();
        for root in &options.locations {
            let letter = if options.mft_mode == MftMode::Never {
                None
            } else {
                mft::volume_letter_of(root)
                    .filter(|_| is_volume_root(root))
                    .filter(|letter| mft::is_eligible(*letter))
            };
            match letter {
                Some(letter) => {
                    let pool = shared.pool.clone();
                    let opts = options.clone();
                    let tx = tx.clone();
                    let token = token.clone();
                    let shared = shared.clone();
                    handles.push(thread::spawn(move || {
                        if let Err(error) = mft::enumerate_volume(
                            letter,
                            &pool,
                            &opts,
                            &tx,
                            &token,
                            shared.counters.as_ref(),
                        ) {
                            log::warn!(
                                "mft enumeration failed for {letter}:, degrading to standard: {error}"
                            );
                            let handle = spawn_enumeration(
                                pool,
                                opts,
                                vec![PathBuf::from(format!("{letter}:\\"))],
                                tx,
                                token,
                                shared.counters.clone(),
                            );
                            let _ = handle.join();
                        }
                    }));
                }
                None => standard_roots.push(root.clone()),
            }
        }
        if !standard_roots.is_empty() {
            handles.push(spawn_enumeration(
                shared.pool.clone(),
                options.clone(),
                standard_roots,
                tx,
                token.clone(),
                shared.counters.clone(),
            ));
        }
        handles
    }

    #[cfg(not(windows))]
    {
        vec![spawn_enumeration(
            shared.pool.clone(),
            options.clone(),
            options.locations.clone(),
            tx,
            token.clone(),
            shared.counters.clone(),
        )]
    }
}

#[cfg(windows)]
fn is_volume_root(path: &Path) -> bool {
    let text = path.to_string_lossy();
    matches!(text.len(), 2 | 3) && text.as_bytes()[1] == b':'
}

fn apply_batch(shared: &Arc<EngineShared>, batch: &mut Vec<FileRecord>) {
    if batch.is_empty() {
        return;
    }
    match shared.index.write().add_batch(batch) {
        Ok(_) => mirror_records(shared, batch),
        Err(error) => log::warn!("batch insert rejected: {error}"),
    }
    batch.clear();
}

fn mirror_records(shared: &Arc<EngineShared>, records: &[FileRecord]) {
    let tx = shared.mirror_tx.lock().clone();
    let Some(tx) = tx else {
        return;
    };
    let entries: Vec<FileEntry> = records
        .iter()
        .filter_map(|record| record.to_entry(&shared.pool))
        .collect();
    if !entries.is_empty() {
        let _ = tx.try_send(MirrorOp::Add(entries));
    }
}

fn send_mirror(shared: &Arc<EngineShared>, op: MirrorOp) {
    let tx = shared.mirror_tx.lock().clone();
    if let Some(tx) = tx {
        let _ = tx.try_send(op);
    }
}

fn emit_progress(shared: &Arc<EngineShared>, done: bool) {
    let guard = shared.progress_tx.lock();
    if let Some(tx) = guard.as_ref() {
        let _ = tx.try_send(ProgressEvent {
            files_indexed: shared.counters.files(),
            directories_indexed: shared.counters.directories(),
            errors: shared.counters.errors(),
            done,
        });
    }
}

// ---------------------------------------------------------------------------
// Change observation
// ---------------------------------------------------------------------------

fn run_monitoring(shared: &Arc<EngineShared>, options: &IndexingOptions, token: &CancellationToken) {
    let observer_options = ObserverOptions {
        event_capacity: options.channel_capacity.max(1),
        drop_oldest_on_overflow: options.drop_oldest_on_overflow,
    };
    let observer = match ChangeObserver::monitor(&options.locations, &observer_options) {
        Ok(observer) => observer,
        Err(error) => {
            log::warn!("monitoring disabled: {error}");
            return;
        }
    };

    while token.check().is_some() {
        match observer.events().recv_timeout(Duration::from_millis(200)) {
            Ok(event) => apply_change_event(shared, options, event, token),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                shared
                    .dropped_change_events
                    .store(observer.dropped_events(), Ordering::Relaxed);
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    shared
        .dropped_change_events
        .store(observer.dropped_events(), Ordering::Relaxed);
}

/// Applies one observer event to the index. `Renamed(a, b)` is treated as
/// `remove(a); add(b)`; `Resync` re-enumerates the affected root.
fn apply_change_event(
    shared: &Arc<EngineShared>,
    options: &IndexingOptions,
    event: ChangeEvent,
    token: &CancellationToken,
) {
    match event {
        ChangeEvent::Created(path) | ChangeEvent::Modified(path) => {
            upsert_path(shared, options, &path);
        }
        ChangeEvent::Deleted(path) => {
            remove_path(shared, &path);
        }
        ChangeEvent::Renamed(from, to) => {
            remove_path(shared, &from);
            upsert_path(shared, options, &to);
        }
        ChangeEvent::Resync(root) => {
            log::info!("resync requested for {}", root.display());
            EngineState::IndexingAndMonitoring.store(&shared.state);
            refresh_root(shared, options, &root, token);
            EngineState::Monitoring.store(&shared.state);
        }
    }
}

fn upsert_path(shared: &Arc<EngineShared>, options: &IndexingOptions, path: &Path) {
    if !change_passes_filters(options, path) {
        return;
    }
    let Some(record) = record_from_path(&shared.pool, path, options) else {
        // The path may already be gone again; treat as a delete.
        remove_path(shared, path);
        return;
    };
    match shared.index.write().add(record) {
        Ok(_) => mirror_records(shared, std::slice::from_ref(&record)),
        Err(error) => log::warn!("change apply failed for {}: {error}", path.display()),
    }
}

fn remove_path(shared: &Arc<EngineShared>, path: &Path) {
    let text = path.to_string_lossy();
    if shared.index.write().remove(&text) {
        send_mirror(shared, MirrorOp::Remove(normalize_key(&text)));
    }
}

fn change_passes_filters(options: &IndexingOptions, path: &Path) -> bool {
    if !options.excluded_paths.is_empty() {
        let normalized = normalize_key(&path.to_string_lossy());
        if options
            .excluded_paths
            .iter()
            .any(|excluded| normalized.contains(normalize_key(excluded).as_str()))
        {
            return false;
        }
    }
    if !options.include_hidden {
        if let Some(name) = path.file_name() {
            if name.to_string_lossy().starts_with('.') {
                return false;
            }
        }
    }
    true
}

/// Builds a record for a single live path, observer-style.
fn record_from_path(
    pool: &Arc<StringPool>,
    path: &Path,
    options: &IndexingOptions,
) -> Option<FileRecord> {
    let metadata = fs::symlink_metadata(path).ok()?;
    let full_path = path.to_string_lossy();
    let name = path.file_name()?.to_string_lossy();

    let mut attributes = FileAttributes::empty();
    if metadata.is_dir() {
        attributes |= FileAttributes::DIRECTORY;
    }
    if name.starts_with('.') {
        attributes |= FileAttributes::HIDDEN;
    }

    let size = if metadata.is_dir() || !options.collect_file_size {
        0
    } else {
        metadata.len() as i64
    };
    let (directory_id, name_id, extension_id) = pool.intern_path_components(&full_path);
    Some(FileRecord {
        name_id,
        directory_id,
        extension_id,
        size,
        created_ticks: metadata.created().map(system_time_to_ticks).unwrap_or(0),
        modified_ticks: metadata.modified().map(system_time_to_ticks).unwrap_or(0),
        accessed_ticks: metadata.accessed().map(system_time_to_ticks).unwrap_or(0),
        attributes,
        volume_tag: volume_tag_of(&full_path),
        file_ref: file_reference(&metadata),
    })
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

// ---------------------------------------------------------------------------
// Refresh / resync
// ---------------------------------------------------------------------------

/// Re-enumerates one root and merges it into the index: unchanged rows are
/// left alone (timestamps compared at second precision so enumerator
/// provenance does not cause spurious updates), changed rows replaced,
/// vanished rows removed.
fn refresh_root(
    shared: &Arc<EngineShared>,
    options: &IndexingOptions,
    root: &Path,
    token: &CancellationToken,
) {
    let existing = shared.index.read().keys_under(&root.to_string_lossy());
    let mut seen: FnvHashSet<String> = FnvHashSet::default();

    let counters = Arc::new(ScanCounters::default());
    let (tx, rx) = bounded(options.channel_capacity.max(1));
    let handle = spawn_enumeration(
        shared.pool.clone(),
        options.clone(),
        vec![root.to_path_buf()],
        tx,
        token.clone(),
        counters,
    );

    let mut batch: Vec<FileRecord> = Vec::with_capacity(options.batch_size.max(1));
    for record in rx.iter() {
        let Some(full_path) = record.full_path(&shared.pool) else {
            continue;
        };
        let key = normalize_key(&full_path);
        seen.insert(key.clone());

        let unchanged = shared.index.read().get(&key).map(|current| {
            current.size == record.size
                && truncate_ticks_to_seconds(current.modified_ticks)
                    == truncate_ticks_to_seconds(record.modified_ticks)
                && current.attributes == record.attributes
        });
        if unchanged == Some(true) {
            continue;
        }

        batch.push(record);
        if batch.len() >= options.batch_size.max(1) {
            apply_batch(shared, &mut batch);
        }
    }
    apply_batch(shared, &mut batch);
    let _ = handle.join();

    if token.is_cancelled() {
        return;
    }
    let stale: Vec<_> = existing
        .into_iter()
        .filter(|key| !seen.contains(key.as_ref()))
        .collect();
    if !stale.is_empty() {
        let mut index = shared.index.write();
        for key in &stale {
            index.remove(key);
        }
        drop(index);
        for key in stale {
            send_mirror(shared, MirrorOp::Remove(key.to_string()));
        }
    }
}
