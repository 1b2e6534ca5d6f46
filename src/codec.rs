//! Command and snapshot serialization.
//!
//! ## Command wire format
//!
//! ```text
//! [0x00 …]   optional zero padding added by the log layer — skipped
//! [0xCF]     frame magic (non-zero sentinel)
//! [0x01]     format version
//! [tag]      command discriminator, 1..=6
//! [payload]  lz4 block (size-prepended) over the bincode encoding
//! ```
//!
//! Config values are low-entropy (JSON, YAML, dotted keys), which is what
//! the lz4 block mode is good at. Decoding is deterministic: byte-identical
//! input yields an identical command, and an unknown version or tag is a
//! hard error rather than a silent drop.
//!
//! ## Snapshot stream
//!
//! An lz4 *frame* over JSON lines: a `{"version":1}` header line followed by
//! one externally-tagged row per line (`{"namespace":…}`, `{"entry":…}`,
//! `{"audit":…}`). The producer writes rows straight out of a store
//! enumeration; nothing buffers the whole snapshot as one value.

use std::io::{self, BufRead, BufReader, Read, Write};

use lz4_flex::block::{compress_prepend_size, decompress_size_prepended};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{AuditEvent, ConfigEntry, Namespace, StoreDump};

/// Non-zero sentinel opening every encoded command.
pub const COMMAND_MAGIC: u8 = 0xCF;
/// Current command format version.
pub const COMMAND_VERSION: u8 = 0x01;
/// Current snapshot envelope version. Unrecognized versions fail the restore.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Fixed chunk size for the streaming hash-and-compress pass. Kept below the
/// allocator's large-object threshold.
const HASH_CHUNK: usize = 64 * 1024;

// ── Commands ─────────────────────────────────────────────────────────────────

/// The replicated command set. Every variant carries a stable tag byte (see
/// [`Command::tag`]) that survives format evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    SetConfig {
        namespace: String,
        key: String,
        value: String,
        entry_type: String,
        author: String,
        ts: i64,
    },
    DeleteConfig {
        namespace: String,
        key: String,
        author: String,
        ts: i64,
    },
    SetNamespace {
        path: String,
        description: Option<String>,
        owner: String,
        author: String,
        ts: i64,
    },
    DeleteNamespace {
        path: String,
        author: String,
        ts: i64,
    },
    SetConfigBlobRef {
        namespace: String,
        key: String,
        blob_id: String,
        entry_type: String,
        author: String,
        ts: i64,
    },
    Batch {
        commands: Vec<Command>,
    },
}

impl Command {
    /// Stable wire discriminator.
    pub fn tag(&self) -> u8 {
        match self {
            Command::SetConfig { .. } => 1,
            Command::DeleteConfig { .. } => 2,
            Command::SetNamespace { .. } => 3,
            Command::DeleteNamespace { .. } => 4,
            Command::SetConfigBlobRef { .. } => 5,
            Command::Batch { .. } => 6,
        }
    }

    /// Rough pre-encoding size, used by the batcher to cap batch bytes
    /// without encoding twice.
    pub fn estimated_bytes(&self) -> usize {
        const OVERHEAD: usize = 48;
        match self {
            Command::SetConfig {
                namespace,
                key,
                value,
                entry_type,
                author,
                ..
            } => {
                OVERHEAD + namespace.len() + key.len() + value.len() + entry_type.len() + author.len()
            }
            Command::DeleteConfig {
                namespace,
                key,
                author,
                ..
            } => OVERHEAD + namespace.len() + key.len() + author.len(),
            Command::SetNamespace {
                path,
                description,
                owner,
                author,
                ..
            } => {
                OVERHEAD
                    + path.len()
                    + description.as_deref().map_or(0, str::len)
                    + owner.len()
                    + author.len()
            }
            Command::DeleteNamespace { path, author, .. } => OVERHEAD + path.len() + author.len(),
            Command::SetConfigBlobRef {
                namespace,
                key,
                blob_id,
                entry_type,
                author,
                ..
            } => {
                OVERHEAD
                    + namespace.len()
                    + key.len()
                    + blob_id.len()
                    + entry_type.len()
                    + author.len()
            }
            Command::Batch { commands } => {
                OVERHEAD + commands.iter().map(Command::estimated_bytes).sum::<usize>()
            }
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty input: no frame start found")]
    EmptyInput,

    #[error("bad frame magic 0x{0:02x}")]
    BadMagic(u8),

    #[error("unsupported command format version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown command tag {0}")]
    UnknownTag(u8),

    #[error("frame tag {header} does not match decoded command tag {decoded}")]
    TagMismatch { header: u8, decoded: u8 },

    #[error("truncated frame: missing {0}")]
    Truncated(&'static str),

    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("frame compression failed: {0}")]
    Frame(#[from] lz4_flex::frame::Error),

    #[error("payload encoding failed: {0}")]
    Payload(#[from] bincode::Error),

    #[error("snapshot row encoding failed: {0}")]
    SnapshotRow(#[from] serde_json::Error),

    #[error("unsupported snapshot version {0} (current is {SNAPSHOT_VERSION})")]
    UnsupportedSnapshotVersion(u32),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

// ── Command encode / decode ──────────────────────────────────────────────────

/// Encodes `command` into `buf`, replacing its contents. The buffer is the
/// caller's to reuse across calls.
pub fn encode_command(command: &Command, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    buf.clear();
    buf.push(COMMAND_MAGIC);
    buf.push(COMMAND_VERSION);
    buf.push(command.tag());
    let payload = bincode::serialize(command)?;
    buf.extend_from_slice(&compress_prepend_size(&payload));
    Ok(())
}

/// Convenience wrapper allocating a fresh buffer.
pub fn encode_command_to_vec(command: &Command) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(command.estimated_bytes());
    encode_command(command, &mut buf)?;
    Ok(buf)
}

/// Decodes a command, tolerating any run of leading zero bytes prepended by
/// the log layer.
pub fn decode_command(bytes: &[u8]) -> Result<Command, CodecError> {
    let start = bytes
        .iter()
        .position(|&b| b != 0)
        .ok_or(CodecError::EmptyInput)?;
    let bytes = &bytes[start..];

    if bytes[0] != COMMAND_MAGIC {
        return Err(CodecError::BadMagic(bytes[0]));
    }
    let version = *bytes.get(1).ok_or(CodecError::Truncated("version byte"))?;
    if version != COMMAND_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let tag = *bytes.get(2).ok_or(CodecError::Truncated("tag byte"))?;
    if !(1..=6).contains(&tag) {
        return Err(CodecError::UnknownTag(tag));
    }
    let body = bytes.get(3..).ok_or(CodecError::Truncated("payload"))?;
    let payload = decompress_size_prepended(body)?;
    let command: Command = bincode::deserialize(&payload)?;
    if command.tag() != tag {
        return Err(CodecError::TagMismatch {
            header: tag,
            decoded: command.tag(),
        });
    }
    Ok(command)
}

// ── Streaming hash + compress ────────────────────────────────────────────────

/// Reads `src` to the end, computing the SHA-256 of the source bytes while
/// writing the lz4-frame-compressed stream to `dst`, in a single pass with a
/// fixed 64 KiB buffer. Returns the lowercase-hex digest (the blob id) and
/// the number of uncompressed bytes consumed.
pub fn hash_and_compress<R: Read, W: Write>(src: &mut R, dst: W) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut encoder = FrameEncoder::new(dst);
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut total: u64 = 0;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
        total += n as u64;
    }
    encoder.finish().map_err(io::Error::other)?;
    Ok((hex::encode(hasher.finalize()), total))
}

// ── Snapshot stream ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SnapshotRow {
    Namespace(Namespace),
    Entry(ConfigEntry),
    Audit(AuditEvent),
}

/// Writes the versioned snapshot stream for `dump` into `w`.
pub fn write_snapshot<W: Write>(w: W, dump: &StoreDump) -> Result<(), CodecError> {
    let mut encoder = FrameEncoder::new(w);
    serde_json::to_writer(
        &mut encoder,
        &SnapshotHeader {
            version: SNAPSHOT_VERSION,
        },
    )?;
    encoder.write_all(b"\n")?;
    for ns in &dump.namespaces {
        serde_json::to_writer(&mut encoder, &SnapshotRow::Namespace(ns.clone()))?;
        encoder.write_all(b"\n")?;
    }
    for entry in &dump.entries {
        serde_json::to_writer(&mut encoder, &SnapshotRow::Entry(entry.clone()))?;
        encoder.write_all(b"\n")?;
    }
    for event in &dump.audit {
        serde_json::to_writer(&mut encoder, &SnapshotRow::Audit(event.clone()))?;
        encoder.write_all(b"\n")?;
    }
    encoder.finish()?;
    Ok(())
}

/// Reads a snapshot stream back into a [`StoreDump`], failing hard on an
/// unrecognized envelope version.
pub fn read_snapshot<R: Read>(r: R) -> Result<StoreDump, CodecError> {
    let reader = BufReader::new(FrameDecoder::new(r));
    let mut lines = reader.lines();

    let header_line = lines
        .next()
        .ok_or(CodecError::Truncated("snapshot header"))??;
    let header: SnapshotHeader = serde_json::from_str(&header_line)?;
    if header.version != SNAPSHOT_VERSION {
        return Err(CodecError::UnsupportedSnapshotVersion(header.version));
    }

    let mut dump = StoreDump::default();
    for line in lines {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SnapshotRow>(&line)? {
            SnapshotRow::Namespace(ns) => dump.namespaces.push(ns),
            SnapshotRow::Entry(entry) => dump.entries.push(entry),
            SnapshotRow::Audit(event) => dump.audit.push(event),
        }
    }
    Ok(dump)
}

// ── Tests ────────────────────────────────────────────────────────────────────
