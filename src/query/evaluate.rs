//! Query evaluation: candidate selection, predicate filtering and the
//! live filesystem fallback.
//!
//! Candidate rows are copied out under a short read section; matching and
//! materialization happen without any lock held. Large candidate sets are
//! filtered in parallel, smaller ones sequentially with sparse cancellation
//! checks between batches.

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::bounded;
use fnv::FnvHashSet;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::cancel::{CancellationToken, CANCEL_CHECK_INTERVAL};
use crate::enumerate::standard::spawn_enumeration;
use crate::enumerate::ScanCounters;
use crate::error::Result;
use crate::index::CompositeIndex;
use crate::matcher;
use crate::options::IndexingOptions;
use crate::pool::{PoolKind, StringPool};
use crate::query::{CompiledQuery, SearchOutcome, TextMode};
use crate::record::{normalize_key, FileEntry, FileRecord};

/// Candidate sets at least this large are filtered with rayon.
const PARALLEL_THRESHOLD: usize = 8192;

/// Below this many indexed records the index is not trusted at all and
/// queries with roots fall through to a live scan.
const FALLBACK_INDEX_MINIMUM: usize = 10;

/// Result of one evaluation run.
#[derive(Debug)]
pub struct EvalOutput {
    pub entries: Vec<FileEntry>,
    pub total_matches: usize,
    pub truncated: bool,
    pub outcome: SearchOutcome,
}

pub struct QueryEvaluator<'a> {
    index: &'a RwLock<CompositeIndex>,
    pool: Arc<StringPool>,
}

impl<'a> QueryEvaluator<'a> {
    pub fn new(index: &'a RwLock<CompositeIndex>, pool: Arc<StringPool>) -> Self {
        Self { index, pool }
    }

    pub fn evaluate(
        &self,
        compiled: &CompiledQuery,
        token: &CancellationToken,
    ) -> Result<EvalOutput> {
        let max_results = compiled.query.max_results.unwrap_or(usize::MAX);

        // Collect candidates and coverage under one short read section.
        let (candidates, uncovered_roots) = {
            let index = self.index.read();
            let candidates = index.query_candidates(&compiled.query);
            let roots = requested_roots(&compiled.query);
            let uncovered = if index.len() < FALLBACK_INDEX_MINIMUM {
                roots
            } else {
                roots
                    .into_iter()
                    .filter(|root| !index.contains_path(&root.to_string_lossy()))
                    .collect()
            };
            (candidates, uncovered)
        };

        let mut entries = Vec::new();
        let mut outcome = if candidates.len() >= PARALLEL_THRESHOLD {
            self.filter_parallel(compiled, &candidates, &mut entries, token, max_results)
        } else {
            self.filter_sequential(compiled, &candidates, &mut entries, token, max_results)
        };

        if outcome == SearchOutcome::Complete && !uncovered_roots.is_empty() {
            outcome = self.live_scan(compiled, uncovered_roots, &mut entries, token, max_results);
        }

        Ok(EvalOutput {
            total_matches: entries.len(),
            truncated: outcome == SearchOutcome::Truncated,
            outcome,
            entries,
        })
    }

    fn filter_sequential(
        &self,
        compiled: &CompiledQuery,
        candidates: &[(crate::trie::RecordKey, FileRecord)],
        entries: &mut Vec<FileEntry>,
        token: &CancellationToken,
        max_results: usize,
    ) -> SearchOutcome {
        for (i, (_, record)) in candidates.iter().enumerate() {
            if token.check_sparse(i).is_none() {
                return SearchOutcome::Cancelled;
            }
            if i & (CANCEL_CHECK_INTERVAL - 1) == 0 && compiled.deadline_expired() {
                return SearchOutcome::TimedOut;
            }
            if !record_matches(compiled, record, &self.pool) {
                continue;
            }
            let Some(entry) = record.to_entry(&self.pool) else {
                continue;
            };
            entries.push(entry);
            if entries.len() >= max_results {
                return SearchOutcome::Truncated;
            }
        }
        SearchOutcome::Complete
    }

    fn filter_parallel(
        &self,
        compiled: &CompiledQuery,
        candidates: &[(crate::trie::RecordKey, FileRecord)],
        entries: &mut Vec<FileEntry>,
        token: &CancellationToken,
        max_results: usize,
    ) -> SearchOutcome {
        let mut matched: Vec<(usize, FileEntry)> = candidates
            .par_iter()
            .enumerate()
            .filter_map(|(i, (_, record))| {
                if token.is_cancelled() || compiled.deadline_expired() {
                    return None;
                }
                if !record_matches(compiled, record, &self.pool) {
                    return None;
                }
                record.to_entry(&self.pool).map(|entry| (i, entry))
            })
            .collect();

        if token.is_cancelled() {
            return SearchOutcome::Cancelled;
        }
        if compiled.deadline_expired() {
            return SearchOutcome::TimedOut;
        }

        // Restore candidate order before applying the cap.
        matched.sort_by_key(|(i, _)| *i);
        let truncated = matched.len() > max_results;
        entries.extend(matched.into_iter().take(max_results).map(|(_, e)| e));
        if truncated {
            SearchOutcome::Truncated
        } else {
            SearchOutcome::Complete
        }
    }

    /// Direct filesystem walk over roots the index does not cover. Reuses
    /// the standard enumerator and applies the full predicate set plus a
    /// deduplication set seeded with already-collected paths.
    fn live_scan(
        &self,
        compiled: &CompiledQuery,
        roots: Vec<PathBuf>,
        entries: &mut Vec<FileEntry>,
        token: &CancellationToken,
        max_results: usize,
    ) -> SearchOutcome {
        let mut seen: FnvHashSet<String> = entries
            .iter()
            .map(|entry| normalize_key(&entry.full_path))
            .collect();

        let scan_options = IndexingOptions {
            include_hidden: compiled.query.include_hidden,
            include_system: compiled.query.include_system,
            ..IndexingOptions::default()
        };
        let live_token = CancellationToken::new();
        let counters = Arc::new(ScanCounters::default());
        let (tx, rx) = bounded(1024);
        let handle = spawn_enumeration(
            self.pool.clone(),
            scan_options,
            roots,
            tx,
            live_token.clone(),
            counters,
        );

        let mut outcome = SearchOutcome::Complete;
        for (i, record) in rx.iter().enumerate() {
            if token.check_sparse(i).is_none() {
                outcome = SearchOutcome::Cancelled;
                break;
            }
            if i & (CANCEL_CHECK_INTERVAL - 1) == 0 && compiled.deadline_expired() {
                outcome = SearchOutcome::TimedOut;
                break;
            }
            if !compiled.query.include_subdirectories {
                if let Some(base) = &compiled.base_key {
                    let directory = self
                        .pool
                        .get(PoolKind::Directory, record.directory_id)
                        .unwrap_or("");
                    if normalize_key(directory) != *base {
                        continue;
                    }
                }
            }
            if !record_matches(compiled, &record, &self.pool) {
                continue;
            }
            let Some(entry) = record.to_entry(&self.pool) else {
                continue;
            };
            if !seen.insert(normalize_key(&entry.full_path)) {
                continue;
            }
            entries.push(entry);
            if entries.len() >= max_results {
                outcome = SearchOutcome::Truncated;
                break;
            }
        }

        live_token.cancel();
        drop(rx);
        let _ = handle.join();
        outcome
    }
}

fn requested_roots(query: &crate::options::SearchQuery) -> Vec<PathBuf> {
    match &query.base_path {
        Some(base) => vec![base.clone()],
        None => query.search_locations.clone(),
    }
}

/// Applies the predicate chain, cheapest first: type, hidden/system, size,
/// dates, extension, then text.
pub(crate) fn record_matches(
    compiled: &CompiledQuery,
    record: &FileRecord,
    pool: &StringPool,
) -> bool {
    let query = &compiled.query;

    if record.is_directory() {
        if !query.include_directories {
            return false;
        }
    } else if !query.include_files {
        return false;
    }
    if record.is_hidden() && !query.include_hidden {
        return false;
    }
    if record.is_system() && !query.include_system {
        return false;
    }

    if !record.is_directory() {
        if let Some(min) = query.min_size {
            if record.size < min {
                return false;
            }
        }
        if let Some(max) = query.max_size {
            if record.size > max {
                return false;
            }
        }
    }

    let (min_created, max_created) = compiled.created_bounds;
    if let Some(min) = min_created {
        if record.created_ticks < min {
            return false;
        }
    }
    if let Some(max) = max_created {
        if record.created_ticks > max {
            return false;
        }
    }
    let (min_modified, max_modified) = compiled.modified_bounds;
    if let Some(min) = min_modified {
        if record.modified_ticks < min {
            return false;
        }
    }
    if let Some(max) = max_modified {
        if record.modified_ticks > max {
            return false;
        }
    }

    if let Some(extension) = &compiled.extension {
        if record.is_directory() {
            return false;
        }
        match pool.get(PoolKind::Extension, record.extension_id) {
            Some(stored) if stored == extension => {}
            _ => return false,
        }
    }

    let Some(name) = pool.get(PoolKind::Name, record.name_id) else {
        return false;
    };
    let Some(directory) = pool.get(PoolKind::Directory, record.directory_id) else {
        return false;
    };
    let full_path = if directory.is_empty() {
        name.to_string()
    } else {
        format!("{directory}/{name}")
    };

    if !compiled.excluded.is_empty() {
        let normalized = normalize_key(&full_path);
        if compiled
            .excluded
            .iter()
            .any(|excluded| normalized.contains(excluded.as_str()))
        {
            return false;
        }
    }

    text_matches(compiled, name, &full_path)
}

fn text_matches(compiled: &CompiledQuery, name: &str, full_path: &str) -> bool {
    let query = &compiled.query;
    let target = if query.search_file_name_only {
        name
    } else {
        full_path
    };
    match &compiled.text {
        TextMode::All => true,
        TextMode::SubstringCi(needle) => matcher::contains_ci(target, needle),
        TextMode::SubstringCs(needle) => matcher::contains_cs(target, needle),
        TextMode::Regex(regex) => regex.is_match(target),
        TextMode::Wildcard { regex, pattern } => {
            // Separator-free wildcard patterns match the whole name.
            let target = if query.search_file_name_only || compiled.wildcard_on_name {
                name
            } else {
                full_path
            };
            match regex {
                Some(regex) => regex.is_match(target),
                None => matcher::matches_wildcard(target, pattern, query.case_sensitive),
            }
        }
    }
}
