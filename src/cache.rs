//! Content-addressed artifact cache.
//!
//! Each compiled script is stored as `cache/<checksum>.cache`, where the checksum is
//! taken over the script source. Editing a script therefore only invalidates its own
//! entry, and byte-identical scripts share one.
//!
//! # File layout
//!
//! ```text
//! u16 BE length | header bytes (UTF-8)
//! u16 BE length | origin path bytes (UTF-8, absolute)
//! u16 BE length | checksum bytes (lowercase hex)
//! bincode       | CompiledArtifact
//! ```
//!
//! Entries are written to a temporary file in the cache directory and renamed into
//! place, so a reader never observes a half-written entry. An entry is never
//! rewritten in place: a stale or foreign entry is rejected and has to be deleted.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{HostError, HostResult};
use crate::scripting::CompiledArtifact;

/// File extension of cache entries (and of precompiled inputs).
pub const CACHE_EXTENSION: &str = "cache";

/// Length of a checksum in hex characters.
pub const CHECKSUM_LEN: usize = 32;

/// 128-bit content hash of `bytes` as zero-padded lowercase hex.
pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..CHECKSUM_LEN / 2])
}

/// Whether `s` has the shape of a checksum.
pub fn is_checksum(s: &str) -> bool {
    s.len() == CHECKSUM_LEN && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// A persisted compilation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Cache generation; must equal the compiler's header
    pub header: String,
    /// Absolute path of the source that produced the artifact
    pub origin: PathBuf,
    /// Checksum of that source
    pub checksum: String,
    /// The compiled artifact
    pub artifact: CompiledArtifact,
}

/// Size of the cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries
    pub files: usize,
    /// Total size in bytes
    pub bytes: u64,
}

/// Reads and writes cache entries in one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Store rooted at `dir`; the directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the entry for `checksum`.
    pub fn locate(&self, checksum: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", checksum, CACHE_EXTENSION))
    }

    /// Read the entry at `path`.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be opened, `CorruptCache` if it does not parse.
    pub fn load(&self, path: &Path) -> HostResult<CacheEntry> {
        let mut reader = BufReader::new(File::open(path)?);
        let corrupt = |reason: String| HostError::CorruptCache {
            path: path.to_path_buf(),
            reason,
        };

        let header = read_str(&mut reader).map_err(|e| corrupt(format!("header: {}", e)))?;
        let origin = read_str(&mut reader).map_err(|e| corrupt(format!("origin: {}", e)))?;
        let checksum = read_str(&mut reader).map_err(|e| corrupt(format!("checksum: {}", e)))?;
        let artifact: CompiledArtifact = bincode::deserialize_from(&mut reader)
            .map_err(|e| corrupt(format!("artifact: {}", e)))?;

        Ok(CacheEntry {
            header,
            origin: PathBuf::from(origin),
            checksum,
            artifact,
        })
    }

    /// Persist `artifact` at `target`.
    ///
    /// Concurrent saves of the same checksum carry identical content, so the last
    /// rename simply wins.
    pub fn save(
        &self,
        artifact: CompiledArtifact,
        target: &Path,
        origin: &Path,
        checksum: &str,
        header: &str,
    ) -> HostResult<CacheEntry> {
        let dir = target.parent().unwrap_or(self.dir.as_path());
        std::fs::create_dir_all(dir)?;

        let origin = std::path::absolute(origin)?;
        let origin_str = origin.to_string_lossy();

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            write_str(&mut writer, header)?;
            write_str(&mut writer, &origin_str)?;
            write_str(&mut writer, checksum)?;
            bincode::serialize_into(&mut writer, &artifact)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(target).map_err(|e| e.error)?;

        debug!(checksum, path = %target.display(), "Cache entry written");
        Ok(CacheEntry {
            header: header.to_string(),
            origin,
            checksum: checksum.to_string(),
            artifact,
        })
    }

    /// Strict header comparison.
    pub fn verify_header(entry: &CacheEntry, expected: &str) -> bool {
        entry.header == expected
    }

    /// Count and total size of the entries in the cache directory.
    pub fn stats(&self) -> io::Result<CacheStats> {
        let mut stats = CacheStats::default();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(CACHE_EXTENSION) {
                stats.files += 1;
                stats.bytes += entry.metadata()?.len();
            }
        }
        Ok(stats)
    }
}

fn write_str<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string of {} bytes does not fit a cache field", value.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(value.as_bytes())
}

fn read_str<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
