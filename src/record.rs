//! Compact file records and the materialized external view.
//!
//! A `FileRecord` is a fixed-size row of pool ids, sizes, timestamps and
//! attribute bits; strings are never stored inline. The public `FileEntry`
//! view concatenates `directory` + `/` + `name` on demand.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::pool::{PoolKind, StringPool};

/// 100-nanosecond intervals per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Offset between the Windows FILETIME epoch (1601) and the Unix epoch,
/// in 100-nanosecond ticks.
pub const FILETIME_UNIX_DIFF: i64 = 116_444_736_000_000_000;

bitflags::bitflags! {
    /// File attribute bits, matching the NTFS attribute flag values so the
    /// master-file-table path can store them without translation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        const READ_ONLY     = 0x0001;
        const HIDDEN        = 0x0002;
        const SYSTEM        = 0x0004;
        const DIRECTORY     = 0x0010;
        const ARCHIVE       = 0x0020;
        const REPARSE_POINT = 0x0400;
        const COMPRESSED    = 0x0800;
    }
}

impl Serialize for FileAttributes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for FileAttributes {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Ok(Self::from_bits_truncate(u32::deserialize(deserializer)?))
    }
}

/// A compact indexed row. All strings live in the engine's `StringPool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    pub name_id: u32,
    pub directory_id: u32,
    pub extension_id: u32,
    pub size: i64,
    pub created_ticks: i64,
    pub modified_ticks: i64,
    pub accessed_ticks: i64,
    pub attributes: FileAttributes,
    pub volume_tag: u8,
    pub file_ref: u64,
}

impl FileRecord {
    #[inline]
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    #[inline]
    pub fn is_hidden(&self) -> bool {
        self.attributes.contains(FileAttributes::HIDDEN)
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.attributes.contains(FileAttributes::SYSTEM)
    }

    /// Materializes the full path, original casing, canonical separator.
    pub fn full_path(&self, pool: &StringPool) -> Option<String> {
        let directory = pool.get(PoolKind::Directory, self.directory_id)?;
        let name = pool.get(PoolKind::Name, self.name_id)?;
        Some(join_path(directory, name))
    }

    /// Builds the external view for this record.
    pub fn to_entry(&self, pool: &StringPool) -> Option<FileEntry> {
        let directory = pool.get(PoolKind::Directory, self.directory_id)?;
        let name = pool.get(PoolKind::Name, self.name_id)?;
        let extension = pool.get(PoolKind::Extension, self.extension_id)?;
        Some(FileEntry {
            full_path: join_path(directory, name),
            name: name.to_string(),
            directory_path: directory.to_string(),
            extension: extension.to_string(),
            size: self.size,
            created_time: ticks_to_system_time(self.created_ticks),
            modified_time: ticks_to_system_time(self.modified_ticks),
            accessed_time: ticks_to_system_time(self.accessed_ticks),
            attributes: self.attributes,
            volume_tag: self.volume_tag as char,
            file_ref: self.file_ref,
        })
    }
}

/// The materialized, user-facing view of an indexed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub full_path: String,
    pub name: String,
    pub directory_path: String,
    pub extension: String,
    pub size: i64,
    pub created_time: SystemTime,
    pub modified_time: SystemTime,
    pub accessed_time: SystemTime,
    pub attributes: FileAttributes,
    pub volume_tag: char,
    pub file_ref: u64,
}

impl FileEntry {
    #[inline]
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    #[inline]
    pub fn is_hidden(&self) -> bool {
        self.attributes.contains(FileAttributes::HIDDEN)
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.attributes.contains(FileAttributes::SYSTEM)
    }

    /// Human-readable size, e.g. `1.5 MB`.
    pub fn formatted_size(&self) -> String {
        format_size(self.size)
    }
}

fn join_path(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else if directory.ends_with('/') {
        format!("{directory}{name}")
    } else {
        format!("{directory}/{name}")
    }
}

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Canonicalizes a path into its primary-key form: single `/` separator,
/// trailing separator stripped, Unicode-lowercased.
///
/// Idempotent: `normalize_key(normalize_key(p)) == normalize_key(p)`.
pub fn normalize_key(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    if normalized.chars().any(|c| c.is_uppercase()) {
        normalized.to_lowercase()
    } else {
        normalized
    }
}

/// The volume discriminator for a path: the drive letter on Windows-style
/// paths, `/` otherwise.
pub fn volume_tag_of(path: &str) -> u8 {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        bytes[0].to_ascii_uppercase()
    } else {
        b'/'
    }
}

// ---------------------------------------------------------------------------
// Timestamp conversions
// ---------------------------------------------------------------------------

/// Rebases a raw FILETIME value onto Unix-epoch ticks.
pub fn filetime_to_ticks(filetime: i64) -> i64 {
    if filetime <= FILETIME_UNIX_DIFF {
        return 0;
    }
    filetime - FILETIME_UNIX_DIFF
}

/// Converts a `SystemTime` to 100-nanosecond ticks since the Unix epoch.
/// Times before the epoch map to 0.
pub fn system_time_to_ticks(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_nanos() / 100).min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

/// Converts Unix-epoch ticks back to a `SystemTime`.
pub fn ticks_to_system_time(ticks: i64) -> SystemTime {
    if ticks <= 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_nanos(ticks as u64 * 100)
}

/// Truncates ticks to whole seconds. Used when comparing timestamps of
/// records produced by different enumerators, whose native precision
/// differs.
pub fn truncate_ticks_to_seconds(ticks: i64) -> i64 {
    (ticks / TICKS_PER_SECOND) * TICKS_PER_SECOND
}

fn format_size(size: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if size < 0 {
        return "0 B".to_string();
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
