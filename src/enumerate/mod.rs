//! Volume enumerators: the portable directory walker and the NTFS
//! master-file-table fast path.
//!
//! Both produce `FileRecord`s on a bounded channel. The orchestrator picks
//! the MFT path when the platform, privileges and options allow it and
//! silently degrades to the standard walker otherwise.

pub mod mft;
pub mod standard;

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for an enumeration session.
#[derive(Debug, Default)]
pub struct ScanCounters {
    pub files: AtomicU64,
    pub directories: AtomicU64,
    pub errors: AtomicU64,
    pub skipped: AtomicU64,
}

impl ScanCounters {
    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }

    pub fn directories(&self) -> u64 {
        self.directories.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.files.store(0, Ordering::Relaxed);
        self.directories.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
    }
}
