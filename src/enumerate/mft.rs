//! NTFS master-file-table fast path.
//!
//! Enumeration happens volume-wide through a privileged control operation
//! that fills a caller-sized buffer with variable-length records. The
//! parser here is pure code over `&[u8]` with explicit little-endian
//! reads, so the wire handling is testable on every platform; only the
//! raw-volume plumbing is Windows-specific.
//!
//! Record layout (little-endian):
//!   0..4    record length (u32)
//!   4..6    major version (u16), only version 2 is consumed
//!   8..16   file reference number (u64)
//!   16..24  parent file reference number (u64)
//!   32..40  timestamp (FILETIME, i64)
//!   40..44  reason flags (u32)
//!   52..56  file attributes (u32)
//!   56..58  file name length in bytes (u16)
//!   58..60  file name offset (u16)
//!   name    UTF-16LE bytes at the offset
//!
//! A record whose length is zero or overflows the remaining buffer
//! terminates the batch cleanly. Deletion-marked records and `$`-prefixed
//! volume metadata files are skipped. Unpaired surrogates in names decode
//! to the replacement character; they never fail the batch.

use std::char::REPLACEMENT_CHARACTER;
use std::sync::Arc;

use fnv::FnvHashMap;

use crate::pool::{PoolKind, StringPool};
use crate::record::filetime_to_ticks;

pub const MIN_BUFFER_SIZE: usize = 64 * 1024;
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;
const BUFFER_ALIGN: usize = 4096;

/// Reason bit marking a deletion tombstone.
pub const REASON_FILE_DELETE: u32 = 0x0000_0200;

/// The NTFS root directory's file reference number.
pub const ROOT_FILE_REFERENCE: u64 = 5;

const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;

/// Sequence bits are masked off so references match across record versions.
const REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Shortest well-formed record; shorter lengths terminate the batch.
const MIN_RECORD_LEN: usize = 64;

/// Clamps a requested enumeration buffer size to [64 KiB, 4 MiB] and
/// aligns it down to 4 KiB.
pub fn clamp_buffer_size(requested: usize) -> usize {
    requested.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE) & !(BUFFER_ALIGN - 1)
}

/// One parsed entry: strings are already interned, the parent reference is
/// retained for the second resolution phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MftRecord {
    pub file_ref: u64,
    pub parent_ref: u64,
    pub attributes: u32,
    pub modified_ticks: i64,
    pub name_id: u32,
}

impl MftRecord {
    #[inline]
    pub fn is_directory(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }
}

/// Outcome of parsing one enumeration buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedBatch {
    /// Continuation cursor for the next control operation.
    pub next_file_ref: u64,
    pub parsed: usize,
    pub skipped: usize,
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn read_i64(data: &[u8], offset: usize) -> Option<i64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(i64::from_le_bytes(bytes.try_into().ok()?))
}

/// Parses one enumeration buffer: a u64 continuation cursor followed by
/// packed records. Returns `None` when the buffer is too short to carry
/// the cursor.
pub fn parse_enum_buffer(
    buffer: &[u8],
    pool: &StringPool,
    scratch: &mut String,
    out: &mut Vec<MftRecord>,
) -> Option<ParsedBatch> {
    let next_file_ref = read_u64(buffer, 0)?;
    let mut parsed = 0usize;
    let mut skipped = 0usize;

    let mut offset = 8usize;
    while offset + 4 <= buffer.len() {
        let record_len = read_u32(buffer, offset)? as usize;
        if record_len < MIN_RECORD_LEN || offset + record_len > buffer.len() {
            // Malformed length: stop the batch, keep the session alive.
            log::debug!(
                "terminating enumeration batch: {}",
                crate::error::SearchError::CorruptRecord(offset)
            );
            break;
        }
        match parse_record(&buffer[offset..offset + record_len], pool, scratch) {
            Some(record) => {
                out.push(record);
                parsed += 1;
            }
            None => skipped += 1,
        }
        offset += record_len;
    }

    Some(ParsedBatch {
        next_file_ref,
        parsed,
        skipped,
    })
}

fn parse_record(data: &[u8], pool: &StringPool, scratch: &mut String) -> Option<MftRecord> {
    let major_version = read_u16(data, 4)?;
    if major_version != 2 {
        return None;
    }

    let file_ref = read_u64(data, 8)? & REFERENCE_MASK;
    let parent_ref = read_u64(data, 16)? & REFERENCE_MASK;
    let timestamp = read_i64(data, 32)?;
    let reason = read_u32(data, 40)?;
    if reason & REASON_FILE_DELETE != 0 {
        return None;
    }
    let attributes = read_u32(data, 52)?;
    let name_len = read_u16(data, 56)? as usize;
    let name_offset = read_u16(data, 58)? as usize;

    if name_len == 0 || name_len % 2 != 0 || name_offset + name_len > data.len() {
        return None;
    }

    let name_bytes = &data[name_offset..name_offset + name_len];
    scratch.clear();
    let units = name_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    for decoded in char::decode_utf16(units) {
        scratch.push(decoded.unwrap_or(REPLACEMENT_CHARACTER));
    }

    // Volume metadata files ($MFT, $Bitmap, ...) are not user-visible.
    if scratch.starts_with('$') {
        return None;
    }

    Some(MftRecord {
        file_ref,
        parent_ref,
        attributes,
        modified_ticks: filetime_to_ticks(timestamp),
        name_id: pool.intern(PoolKind::Name, scratch),
    })
}

// ---------------------------------------------------------------------------
// Parent resolution (phase two)
// ---------------------------------------------------------------------------

/// Resolves parent reference chains into directory path strings.
///
/// Directories are registered during the enumeration pass; `resolve` walks
/// a record's parent chain up to the volume root, memoizing every
/// intermediate directory so a full-volume resolution is linear overall.
#[derive(Debug)]
pub struct ParentResolver {
    parents: FnvHashMap<u64, (u64, u32)>,
    resolved: FnvHashMap<u64, Arc<str>>,
}

impl ParentResolver {
    /// `volume_root` is the path prefix for the volume, e.g. `C:`.
    pub fn new(volume_root: &str) -> Self {
        let mut resolved = FnvHashMap::default();
        resolved.insert(ROOT_FILE_REFERENCE, Arc::from(volume_root));
        Self {
            parents: FnvHashMap::default(),
            resolved,
        }
    }

    pub fn add_directory(&mut self, record: &MftRecord) {
        self.parents
            .insert(record.file_ref, (record.parent_ref, record.name_id));
    }

    pub fn directory_count(&self) -> usize {
        self.parents.len()
    }

    /// Full path of the directory with reference `file_ref`, or `None` for
    /// orphaned chains (parent records missing from the table).
    pub fn resolve(&mut self, file_ref: u64, pool: &StringPool) -> Option<Arc<str>> {
        if let Some(path) = self.resolved.get(&file_ref) {
            return Some(path.clone());
        }

        let mut chain: Vec<(u64, u32)> = Vec::new();
        let mut current = file_ref;
        let base = loop {
            if let Some(path) = self.resolved.get(&current) {
                break path.clone();
            }
            let (parent, name_id) = *self.parents.get(&current)?;
            chain.push((current, name_id));
            current = parent;
            // A reference chain longer than this is a cycle in corrupt data.
            if chain.len() > 4096 {
                return None;
            }
        };

        let mut path = base.to_string();
        for (frn, name_id) in chain.into_iter().rev() {
            let name = pool.get(PoolKind::Name, name_id)?;
            path.push('/');
            path.push_str(name);
            self.resolved.insert(frn, Arc::from(path.as_str()));
        }
        self.resolved.get(&file_ref).cloned()
    }

    /// Pre-resolves every registered directory so later per-file lookups
    /// are cache hits.
    pub fn resolve_all(&mut self, pool: &StringPool) {
        let refs: Vec<u64> = self.parents.keys().copied().collect();
        for file_ref in refs {
            let _ = self.resolve(file_ref, pool);
        }
    }

    /// Cache-only lookup; valid after `resolve_all`.
    pub fn path_of(&self, file_ref: u64) -> Option<Arc<str>> {
        self.resolved.get(&file_ref).cloned()
    }
}

// ---------------------------------------------------------------------------
// Raw volume plumbing (Windows only)
// ---------------------------------------------------------------------------

#[cfg(windows)]
pub use windows_io::{enumerate_volume, is_eligible, volume_letter_of};

#[cfg(windows)]
mod windows_io {
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crossbeam_channel::Sender;
    use rayon::prelude::*;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    };
    use windows::Win32::System::Ioctl::FSCTL_ENUM_USN_DATA;
    use windows::Win32::System::IO::DeviceIoControl;

    use super::*;
    use crate::cancel::CancellationToken;
    use crate::enumerate::ScanCounters;
    use crate::error::{Result, SearchError};
    use crate::options::IndexingOptions;
    use crate::pool::extension_of;
    use crate::record::{system_time_to_ticks, FileAttributes, FileRecord};

    struct VolumeHandle(HANDLE);

    // SAFETY: volume handles wrap a kernel object that is thread-safe.
    unsafe impl Send for VolumeHandle {}

    impl Drop for VolumeHandle {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    #[repr(C)]
    struct MftEnumData {
        start_file_reference_number: u64,
        low_usn: i64,
        high_usn: i64,
    }

    /// Drive letter of a root path such as `C:\` or `C:/Users`.
    pub fn volume_letter_of(path: &Path) -> Option<char> {
        let text = path.to_string_lossy();
        let mut chars = text.chars();
        let letter = chars.next()?;
        (chars.next() == Some(':') && letter.is_ascii_alphabetic())
            .then(|| letter.to_ascii_uppercase())
    }

    /// True when a raw volume handle can be opened, which requires the
    /// privilege the enumeration control operation needs.
    pub fn is_eligible(letter: char) -> bool {
        open_volume(letter).is_ok()
    }

    fn open_volume(letter: char) -> Result<VolumeHandle> {
        const GENERIC_READ: u32 = 0x8000_0000;
        let path: Vec<u16> = format!("\\\\.\\{letter}:")
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let handle = unsafe {
            CreateFileW(
                PCWSTR(path.as_ptr()),
                GENERIC_READ,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS,
                None,
            )
        }
        .map_err(|error| {
            SearchError::IoFatal(std::io::Error::other(format!(
                "raw volume open for {letter}: failed: {error}"
            )))
        })?;
        Ok(VolumeHandle(handle))
    }

    /// Enumerates the volume's master file table and streams full records
    /// on `output`. Per-record parse work allocates nothing beyond name
    /// interning; the parse scratch buffer is reused across records.
    pub fn enumerate_volume(
        letter: char,
        pool: &Arc<StringPool>,
        options: &IndexingOptions,
        output: &Sender<FileRecord>,
        token: &CancellationToken,
        counters: &ScanCounters,
    ) -> Result<()> {
        let volume = open_volume(letter)?;
        let volume_root = format!("{letter}:");
        let volume_tag = letter as u8;

        let mut buffer = vec![0u8; clamp_buffer_size(options.mft_buffer_size)];
        let mut scratch = String::new();
        let mut records: Vec<MftRecord> = Vec::new();

        // Pass 1: drain the enumeration control operation.
        let mut cursor = MftEnumData {
            start_file_reference_number: 0,
            low_usn: 0,
            high_usn: i64::MAX,
        };
        loop {
            token.check().ok_or(SearchError::Cancelled)?;
            let mut bytes_returned: u32 = 0;
            let io = unsafe {
                DeviceIoControl(
                    volume.0,
                    FSCTL_ENUM_USN_DATA,
                    Some(&cursor as *const _ as *const _),
                    std::mem::size_of::<MftEnumData>() as u32,
                    Some(buffer.as_mut_ptr() as *mut _),
                    buffer.len() as u32,
                    Some(&mut bytes_returned),
                    None,
                )
            };
            if io.is_err() || bytes_returned < 8 {
                break;
            }
            let batch = match parse_enum_buffer(
                &buffer[..bytes_returned as usize],
                pool,
                &mut scratch,
                &mut records,
            ) {
                Some(batch) => batch,
                None => break,
            };
            counters
                .skipped
                .fetch_add(batch.skipped as u64, Ordering::Relaxed);
            cursor.start_file_reference_number = batch.next_file_ref;
        }

        // Pass 2: resolve parent chains, then convert and stream.
        let mut resolver = ParentResolver::new(&volume_root);
        for record in records.iter().filter(|r| r.is_directory()) {
            resolver.add_directory(record);
        }
        resolver.resolve_all(pool);

        let excluded_paths: Vec<String> = options
            .excluded_paths
            .iter()
            .map(|p| crate::record::normalize_key(p))
            .collect();
        let excluded_extensions: Vec<String> = options
            .excluded_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();

        let rows: Vec<Option<FileRecord>> = records
            .par_iter()
            .map(|record| {
                let directory = resolver.path_of(record.parent_ref)?;
                let name = pool.get(crate::pool::PoolKind::Name, record.name_id)?;

                let mut attributes = FileAttributes::from_bits_truncate(record.attributes);
                if record.is_directory() {
                    attributes |= FileAttributes::DIRECTORY;
                }
                if attributes.contains(FileAttributes::HIDDEN) && !options.include_hidden {
                    return None;
                }
                if attributes.contains(FileAttributes::SYSTEM) && !options.include_system {
                    return None;
                }

                let full_path = format!("{directory}/{name}");
                if !excluded_paths.is_empty() {
                    let normalized = crate::record::normalize_key(&full_path);
                    if excluded_paths.iter().any(|e| normalized.contains(e.as_str())) {
                        return None;
                    }
                }
                let extension_id = match extension_of(name) {
                    Some(ext) if !record.is_directory() => {
                        let lowered = ext.to_lowercase();
                        if excluded_extensions.iter().any(|e| *e == lowered) {
                            return None;
                        }
                        pool.intern(crate::pool::PoolKind::Extension, &lowered)
                    }
                    _ => 0,
                };

                // Sizes and full timestamps are not carried by the
                // enumeration records; stat when the session asks for them.
                let (size, created_ticks, accessed_ticks) = if options.collect_file_size
                    && !record.is_directory()
                {
                    match std::fs::symlink_metadata(&full_path) {
                        Ok(metadata) => (
                            metadata.len() as i64,
                            metadata.created().map(system_time_to_ticks).unwrap_or(0),
                            metadata.accessed().map(system_time_to_ticks).unwrap_or(0),
                        ),
                        Err(_) => (0, 0, 0),
                    }
                } else {
                    (0, 0, 0)
                };
                if let Some(cap) = options.max_file_size {
                    if size > cap {
                        return None;
                    }
                }

                Some(FileRecord {
                    name_id: record.name_id,
                    directory_id: pool.intern(crate::pool::PoolKind::Directory, &directory),
                    extension_id,
                    size,
                    created_ticks,
                    modified_ticks: record.modified_ticks,
                    accessed_ticks,
                    attributes,
                    volume_tag,
                    file_ref: record.file_ref,
                })
            })
            .collect();

        for row in rows.into_iter().flatten() {
            token.check().ok_or(SearchError::Cancelled)?;
            if row.is_directory() {
                counters.directories.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.files.fetch_add(1, Ordering::Relaxed);
            }
            if output.send(row).is_err() {
                break;
            }
        }
        Ok(())
    }
}
