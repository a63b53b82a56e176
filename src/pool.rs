//! String interning pools for file names, directories and extensions.
//!
//! Each pool is an append-only arena: a list of large character chunks plus
//! a hash table keyed on `(hash, content)` that resolves a borrowed span to
//! a stable 32-bit id. Ids are monotonically increasing within a pool and
//! are never recycled for the lifetime of the pool; id `0` is reserved for
//! the empty string.
//!
//! The lookup path hashes the borrowed input and compares content under the
//! read lock only; a cache hit never allocates and never takes the write
//! lock. New strings take a short write section.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use fnv::{FnvHashMap, FnvHasher};
use parking_lot::RwLock;

/// Size of each arena chunk. Strings never span chunks; capacity is
/// reserved up front so chunk buffers never reallocate and spans keep
/// stable addresses.
const CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Which of the three pools a string belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Name,
    Directory,
    Extension,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    chunk: u32,
    offset: u32,
    len: u32,
}

#[derive(Default)]
struct PoolInner {
    chunks: Vec<String>,
    spans: Vec<Span>,
    buckets: FnvHashMap<u64, Vec<u32>>,
}

impl PoolInner {
    fn resolve(&self, span: Span) -> &str {
        &self.chunks[span.chunk as usize][span.offset as usize..(span.offset + span.len) as usize]
    }
}

/// A single interning pool.
pub struct Pool {
    inner: RwLock<PoolInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Pool")
            .field("len", &inner.spans.len())
            .field("chunks", &inner.chunks.len())
            .finish()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// Creates a pool with id `0` pre-bound to the empty string.
    pub fn new() -> Self {
        let mut inner = PoolInner::default();
        inner.spans.push(Span {
            chunk: 0,
            offset: 0,
            len: 0,
        });
        Self {
            inner: RwLock::new(inner),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Interns `value`, returning its id. Empty input returns id `0`.
    ///
    /// The fast path hashes the borrowed span and compares content under
    /// the read lock; only a previously unseen string takes the write lock.
    pub fn intern(&self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        let hash = hash_span(value);

        {
            let inner = self.inner.read();
            if let Some(id) = lookup(&inner, hash, value) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return id;
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write();
        // Re-check: another thread may have interned between the locks.
        if let Some(id) = lookup(&inner, hash, value) {
            return id;
        }

        let span = append(&mut inner, value);
        let id = inner.spans.len() as u32;
        inner.spans.push(span);
        inner.buckets.entry(hash).or_default().push(id);
        id
    }

    /// Returns the string for `id`.
    ///
    /// Invalid ids are a programmer error: this panics in debug builds and
    /// returns `None` in release.
    pub fn get(&self, id: u32) -> Option<&'static str> {
        if id == 0 {
            return Some("");
        }
        let inner = self.inner.read();
        let span = match inner.spans.get(id as usize) {
            Some(span) => *span,
            None => {
                debug_assert!(false, "invalid pool id {id}");
                return None;
            }
        };
        let value = inner.resolve(span);
        // SAFETY: chunk buffers are append-only, have their full capacity
        // reserved at creation and are never dropped or reallocated while
        // the pool is alive. The pool is owned by the engine and outlives
        // every record that references an id, so extending the lifetime of
        // the span to 'static is sound for the same reason it is in a
        // never-freed arena.
        Some(unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(value.as_ptr(), value.len()))
        })
    }

    /// Number of interned strings, including the reserved empty string.
    pub fn len(&self) -> usize {
        self.inner.read().spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Bytes of string data currently held by the arena.
    pub fn bytes_used(&self) -> usize {
        self.inner.read().chunks.iter().map(|c| c.len()).sum()
    }

    fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

fn hash_span(value: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(value.as_bytes());
    hasher.finish()
}

fn lookup(inner: &PoolInner, hash: u64, value: &str) -> Option<u32> {
    let ids = inner.buckets.get(&hash)?;
    ids.iter()
        .copied()
        .find(|&id| inner.resolve(inner.spans[id as usize]) == value)
}

fn append(inner: &mut PoolInner, value: &str) -> Span {
    let fits = inner
        .chunks
        .last()
        .map(|chunk| chunk.capacity() - chunk.len() >= value.len())
        .unwrap_or(false);
    if !fits {
        inner
            .chunks
            .push(String::with_capacity(CHUNK_SIZE.max(value.len())));
    }
    let chunk_index = inner.chunks.len() - 1;
    let chunk = &mut inner.chunks[chunk_index];
    let offset = chunk.len();
    chunk.push_str(value);
    Span {
        chunk: chunk_index as u32,
        offset: offset as u32,
        len: value.len() as u32,
    }
}

// ---------------------------------------------------------------------------
// The three engine pools
// ---------------------------------------------------------------------------

/// Process-wide string pool: one arena each for names, directories and
/// extensions. Lives as long as the engine.
#[derive(Debug, Default)]
pub struct StringPool {
    names: Pool,
    directories: Pool,
    extensions: Pool,
}

/// Snapshot of pool sizes for statistics reporting.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatistics {
    pub names: usize,
    pub directories: usize,
    pub extensions: usize,
    pub bytes_used: usize,
    pub hit_rate: f64,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Name => &self.names,
            PoolKind::Directory => &self.directories,
            PoolKind::Extension => &self.extensions,
        }
    }

    /// Interns `value` into the pool for `kind`.
    pub fn intern(&self, kind: PoolKind, value: &str) -> u32 {
        self.pool(kind).intern(value)
    }

    /// Resolves an id back to its string.
    pub fn get(&self, kind: PoolKind, id: u32) -> Option<&'static str> {
        self.pool(kind).get(id)
    }

    /// Splits a full path once and interns all three components.
    ///
    /// The directory component is stored with canonical `/` separators;
    /// original casing is preserved in all components. The extension is
    /// stored lowercased without its leading dot.
    pub fn intern_path_components(&self, full_path: &str) -> (u32, u32, u32) {
        let (directory, name) = split_directory_name(full_path);
        let directory_id = if directory.contains('\\') {
            self.directories.intern(&directory.replace('\\', "/"))
        } else {
            self.directories.intern(directory)
        };
        let name_id = self.names.intern(name);
        let extension_id = match extension_of(name) {
            Some(ext) if ext.chars().all(|c| c.is_ascii_lowercase() || !c.is_alphabetic()) => {
                self.extensions.intern(ext)
            }
            Some(ext) => self.extensions.intern(&ext.to_lowercase()),
            None => 0,
        };
        (directory_id, name_id, extension_id)
    }

    pub fn statistics(&self) -> PoolStatistics {
        let hits = self.names.hit_count()
            + self.directories.hit_count()
            + self.extensions.hit_count();
        let misses = self.names.miss_count()
            + self.directories.miss_count()
            + self.extensions.miss_count();
        let total = hits + misses;
        PoolStatistics {
            names: self.names.len(),
            directories: self.directories.len(),
            extensions: self.extensions.len(),
            bytes_used: self.names.bytes_used()
                + self.directories.bytes_used()
                + self.extensions.bytes_used(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// Splits a full path into `(directory, name)` at the last separator of
/// either kind. A path without separators is all name.
pub fn split_directory_name(full_path: &str) -> (&str, &str) {
    match full_path.rfind(['/', '\\']) {
        Some(pos) => (&full_path[..pos], &full_path[pos + 1..]),
        None => ("", full_path),
    }
}

/// Extension of a file name, without the leading dot. Dotfiles such as
/// `.gitignore` have no extension.
pub fn extension_of(name: &str) -> Option<&str> {
    let pos = name.rfind('.')?;
    if pos == 0 || pos + 1 == name.len() {
        return None;
    }
    Some(&name[pos + 1..])
}
