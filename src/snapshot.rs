//! Durable snapshot framing and the byte-blob boundary the host supplies.
//!
//! Layout: `SOQS` magic, u16 schema version (big-endian), u8 payload kind,
//! u8 reserved, 32-byte SHA-256 of the payload, then the payload itself.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{AppError, AppResult};

pub const MAGIC: [u8; 4] = *b"SOQS";
pub const SCHEMA_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 1 + 1 + 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    /// Full image of the embedded relational engine.
    SqliteImage = 1,
    /// JSON document listing every record of the object store.
    JsonRecords = 2,
}

impl PayloadKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PayloadKind::SqliteImage),
            2 => Some(PayloadKind::JsonRecords),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot is truncated ({0} bytes)")]
    Truncated(usize),
    #[error("snapshot does not start with the expected magic")]
    BadMagic,
    #[error("snapshot schema version {found} is newer than supported {supported}")]
    UnsupportedVersion { found: u16, supported: u16 },
    #[error("unknown snapshot payload kind {0}")]
    UnknownKind(u8),
    #[error("snapshot payload kind does not match this store")]
    KindMismatch,
    #[error("snapshot checksum mismatch")]
    Checksum,
}

impl SnapshotError {
    pub fn code(&self) -> &'static str {
        match self {
            SnapshotError::Truncated(_) => "SNAPSHOT/TRUNCATED",
            SnapshotError::BadMagic => "SNAPSHOT/BAD_MAGIC",
            SnapshotError::UnsupportedVersion { .. } => "SNAPSHOT/UNSUPPORTED_VERSION",
            SnapshotError::UnknownKind(_) => "SNAPSHOT/UNKNOWN_KIND",
            SnapshotError::KindMismatch => "SNAPSHOT/KIND_MISMATCH",
            SnapshotError::Checksum => "SNAPSHOT/CHECKSUM",
        }
    }
}

impl From<SnapshotError> for AppError {
    fn from(error: SnapshotError) -> Self {
        AppError::new(error.code(), error.to_string())
    }
}

/// Decoded view over a framed snapshot.
#[derive(Debug, PartialEq, Eq)]
pub struct Snapshot<'a> {
    pub version: u16,
    pub kind: PayloadKind,
    pub payload: &'a [u8],
}

pub fn encode(kind: PayloadKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&SCHEMA_VERSION.to_be_bytes());
    out.push(kind as u8);
    out.push(0);
    out.extend_from_slice(&Sha256::digest(payload));
    out.extend_from_slice(payload);
    out
}

pub fn decode(blob: &[u8]) -> Result<Snapshot<'_>, SnapshotError> {
    if blob.len() < HEADER_LEN {
        return Err(SnapshotError::Truncated(blob.len()));
    }
    let (header, payload) = blob.split_at(HEADER_LEN);
    if header[..4] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version > SCHEMA_VERSION {
        return Err(SnapshotError::UnsupportedVersion {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    let kind = PayloadKind::from_byte(header[6]).ok_or(SnapshotError::UnknownKind(header[6]))?;
    if Sha256::digest(payload).as_slice() != &header[8..HEADER_LEN] {
        return Err(SnapshotError::Checksum);
    }
    Ok(Snapshot {
        version,
        kind,
        payload,
    })
}

/// Decode and insist on a particular payload kind.
pub fn decode_kind(blob: &[u8], expected: PayloadKind) -> Result<&[u8], SnapshotError> {
    let snapshot = decode(blob)?;
    if snapshot.kind != expected {
        return Err(SnapshotError::KindMismatch);
    }
    Ok(snapshot.payload)
}

/// Read/write primitives for one durable byte blob.
///
/// On the desktop host this is a file in the app data directory; a host that
/// keeps the file behind an IPC boundary supplies its own implementation.
pub trait BlobStore: Send + Sync {
    /// Returns `Ok(None)` when nothing has been written yet.
    fn read(&self) -> AppResult<Option<Vec<u8>>>;
    fn write(&self, bytes: &[u8]) -> AppResult<()>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlobStore for FileBlobStore {
    fn read(&self) -> AppResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::from(err)
                .with_context("operation", "read_snapshot")
                .with_context("path", self.path.display().to_string())),
        }
    }

    fn write(&self, bytes: &[u8]) -> AppResult<()> {
        write_atomic(&self.path, bytes).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_snapshot")
                .with_context("path", self.path.display().to_string())
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Write via a sibling temp file, fsync, then rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    if let Ok(dir) = fs::File::open(parent) {
        dir.sync_all().ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn framed_payload_decodes() {
        let blob = encode(PayloadKind::SqliteImage, b"image-bytes");
        let snapshot = decode(&blob).unwrap();
        assert_eq!(snapshot.version, SCHEMA_VERSION);
        assert_eq!(snapshot.kind, PayloadKind::SqliteImage);
        assert_eq!(snapshot.payload, b"image-bytes");
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut blob = encode(PayloadKind::JsonRecords, b"[]");
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert_eq!(decode(&blob), Err(SnapshotError::Checksum));
    }

    #[test]
    fn raw_sqlite_file_is_rejected_as_bad_magic() {
        let mut blob = b"SQLite format 3\0".to_vec();
        blob.resize(128, 0);
        assert_eq!(decode(&blob), Err(SnapshotError::BadMagic));
    }

    #[test]
    fn newer_version_is_refused() {
        let mut blob = encode(PayloadKind::SqliteImage, b"x");
        blob[4..6].copy_from_slice(&(SCHEMA_VERSION + 1).to_be_bytes());
        let err = decode(&blob).unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT/UNSUPPORTED_VERSION");
    }

    #[test]
    fn short_blob_is_truncated() {
        assert_eq!(decode(b"SOQS"), Err(SnapshotError::Truncated(4)));
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let blob = encode(PayloadKind::JsonRecords, b"[]");
        assert_eq!(
            decode_kind(&blob, PayloadKind::SqliteImage),
            Err(SnapshotError::KindMismatch)
        );
    }

    #[test]
    fn file_blob_store_reads_back_and_reports_absent() {
        let tmp = tempdir().unwrap();
        let store = FileBlobStore::new(tmp.path().join("nested").join("queue.snapshot"));
        assert_eq!(store.read().unwrap(), None);
        store.write(b"first").unwrap();
        store.write(b"second").unwrap();
        assert_eq!(store.read().unwrap().as_deref(), Some(&b"second"[..]));
    }
}
