//! Content-addressed blob store.
//!
//! Large config values are lifted out of the Raft log and stored here as
//! immutable, lz4-frame-compressed files named by the SHA-256 of their
//! uncompressed bytes:
//!
//! ```text
//! {data_root}/blobs/{id[0:2]}/{id}    # committed blobs
//! {data_root}/blobs/.tmp-{uuid}       # in-flight writes
//! ```
//!
//! Writes stage into a temp file, fsync, then atomically rename into place.
//! Two writers racing on the same content both succeed: whoever loses the
//! rename sees the winner's identical file and discards its own temp.
//! Startup sweeps `.tmp-*` orphans left by a crash.
//!
//! Ids are validated against `^[0-9a-f]{64}$` at every entry point, and a
//! stored file that no longer hashes to its own name is treated as absent.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use lz4_flex::frame::FrameDecoder;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed blob id {0:?}: expected 64 lowercase hex characters")]
    InvalidId(String),

    #[error("blob content hashes to {actual}, not {expected}")]
    HashMismatch { expected: String, actual: String },

    #[error("compressed blob exceeds the {limit}-byte ceiling")]
    CompressedTooLarge { limit: u64 },

    #[error("decompressed blob exceeds the {limit}-byte ceiling")]
    DecompressedTooLarge { limit: u64 },

    #[error("decompression failed: {0}")]
    Decompress(String),
}

pub type Result<T> = std::result::Result<T, BlobError>;

/// Returns true for a well-formed blob id (64 lowercase hex characters).
pub fn is_valid_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn check_id(id: &str) -> Result<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(BlobError::InvalidId(id.to_string()))
    }
}

/// Local content-addressed blob storage rooted at `{data_root}/blobs`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    max_compressed: u64,
    max_decompressed: u64,
}

impl BlobStore {
    /// Opens the store, creating the root and deleting any `.tmp-*` orphans
    /// from a previous crash.
    pub fn open(root: PathBuf, max_compressed: u64, max_decompressed: u64) -> Result<Self> {
        fs::create_dir_all(&root)?;
        let store = Self {
            root,
            max_compressed,
            max_decompressed,
        };
        let swept = store.sweep_orphans()?;
        if swept > 0 {
            info!(count = swept, "removed orphaned blob temp files");
        }
        Ok(store)
    }

    fn sweep_orphans(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(".tmp-") {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(&id[0..2]).join(id)
    }

    fn temp_path(&self) -> PathBuf {
        self.root.join(format!(".tmp-{}", Uuid::new_v4()))
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        check_id(id)?;
        Ok(self.path_for(id).exists())
    }

    /// Moves a completed temp file into its final content-addressed slot.
    /// Losing a rename race against an identical file is success.
    fn commit_temp(&self, temp: &Path, id: &str) -> Result<()> {
        let target = self.path_for(id);
        if target.exists() {
            let _ = fs::remove_file(temp);
            return Ok(());
        }
        let parent = target.parent().expect("sharded path has a parent");
        fs::create_dir_all(parent)?;
        match fs::rename(temp, &target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(temp);
            }
            Err(e) => {
                let _ = fs::remove_file(temp);
                return Err(e.into());
            }
        }
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Compresses and stores `src`, returning the computed blob id. One pass:
    /// the source is hashed while the compressed stream goes to disk.
    pub fn put_from_stream<R: Read>(&self, src: &mut R) -> Result<String> {
        let temp = self.temp_path();
        let file = OpenOptions::new().write(true).create_new(true).open(&temp)?;

        let mut limited = LimitedReader::new(src, self.max_decompressed);
        let result = codec::hash_and_compress(&mut limited, &file);
        let (id, _uncompressed) = match result {
            Ok(ok) => ok,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                if limited.exhausted() {
                    return Err(BlobError::DecompressedTooLarge {
                        limit: self.max_decompressed,
                    });
                }
                return Err(e.into());
            }
        };

        if file.metadata()?.len() > self.max_compressed {
            let _ = fs::remove_file(&temp);
            return Err(BlobError::CompressedTooLarge {
                limit: self.max_compressed,
            });
        }
        file.sync_all()?;
        drop(file);

        self.commit_temp(&temp, &id)?;
        Ok(id)
    }

    /// Stores an already-compressed stream under `id`, validating the content
    /// by decompressing and re-hashing before the file becomes visible.
    /// Idempotent: returns `false` without reading when the blob is present.
    pub fn put_compressed<R: Read>(&self, id: &str, src: &mut R) -> Result<bool> {
        check_id(id)?;
        if self.path_for(id).exists() {
            return Ok(false);
        }

        let temp = self.temp_path();
        let mut file = OpenOptions::new().write(true).create_new(true).open(&temp)?;

        let copied = copy_capped(src, &mut file, self.max_compressed);
        if let Err(e) = copied {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        file.sync_all()?;
        drop(file);

        match self.verify_temp(&temp, id) {
            Ok(()) => {}
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e);
            }
        }

        self.commit_temp(&temp, id)?;
        Ok(true)
    }

    /// Decompresses and re-hashes a staged file against its claimed id.
    fn verify_temp(&self, temp: &Path, id: &str) -> Result<()> {
        let file = File::open(temp)?;
        let mut decoder = FrameDecoder::new(file);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total: u64 = 0;
        loop {
            let n = decoder
                .read(&mut buf)
                .map_err(|e| BlobError::Decompress(e.to_string()))?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > self.max_decompressed {
                return Err(BlobError::DecompressedTooLarge {
                    limit: self.max_decompressed,
                });
            }
            hasher.update(&buf[..n]);
        }
        let actual = hex::encode(hasher.finalize());
        if actual != id {
            return Err(BlobError::HashMismatch {
                expected: id.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Opens the compressed file for streaming (peer GETs replicate the
    /// compressed form verbatim). Absent ⇒ `None`.
    pub fn open_read(&self, id: &str) -> Result<Option<File>> {
        check_id(id)?;
        match File::open(self.path_for(id)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn compressed_len(&self, id: &str) -> Result<Option<u64>> {
        check_id(id)?;
        match fs::metadata(self.path_for(id)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Decompresses a blob, enforcing the size ceiling and re-checking the
    /// content hash. A file that fails either check is treated as absent.
    pub fn read_decompressed(&self, id: &str) -> Result<Option<Vec<u8>>> {
        check_id(id)?;
        let file = match self.open_read(id)? {
            Some(file) => file,
            None => return Ok(None),
        };
        let mut decoder = FrameDecoder::new(file);
        let mut hasher = Sha256::new();
        let mut out = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match decoder.read(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!(blob_id = %id, error = %e, "blob failed to decompress, treating as absent");
                    return Ok(None);
                }
            };
            if n == 0 {
                break;
            }
            if out.len() as u64 + n as u64 > self.max_decompressed {
                return Err(BlobError::DecompressedTooLarge {
                    limit: self.max_decompressed,
                });
            }
            hasher.update(&buf[..n]);
            out.extend_from_slice(&buf[..n]);
        }
        let actual = hex::encode(hasher.finalize());
        if actual != id {
            warn!(blob_id = %id, actual = %actual, "blob content hash mismatch, treating as absent");
            return Ok(None);
        }
        Ok(Some(out))
    }

    /// All blob ids currently in the store.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for blob in fs::read_dir(shard.path())? {
                let name = blob?.file_name().to_string_lossy().into_owned();
                if is_valid_id(&name) {
                    ids.push(name);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ── IO helpers ───────────────────────────────────────────────────────────────

/// Reader that fails once `limit` bytes have been consumed and the source
/// still has more, letting callers distinguish "source ended" from "ceiling
/// hit".
struct LimitedReader<'a, R> {
    inner: &'a mut R,
    remaining: u64,
    exhausted: bool,
}

impl<'a, R: Read> LimitedReader<'a, R> {
    fn new(inner: &'a mut R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            exhausted: false,
        }
    }

    fn exhausted(&self) -> bool {
        self.exhausted
    }
}

impl<R: Read> Read for LimitedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            // One extra probe: if the source still has bytes, the cap is hit.
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe)? > 0 {
                self.exhausted = true;
                return Err(io::Error::other("size ceiling exceeded"));
            }
            return Ok(0);
        }
        let take = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..take])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn copy_capped<R: Read, W: Write>(src: &mut R, dst: &mut W, cap: u64) -> Result<u64> {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total: u64 = 0;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        if total > cap {
            return Err(BlobError::CompressedTooLarge { limit: cap });
        }
        dst.write_all(&buf[..n])?;
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
