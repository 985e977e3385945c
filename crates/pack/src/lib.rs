//! Pack file format.
//!
//! A pack concatenates encrypted blob bodies and closes with an encrypted
//! header describing them:
//!
//! ```text
//! [ blob_0 ][ blob_1 ] ... [ blob_n ][ encrypted_header ][ header_length: u32 LE ]
//! ```
//!
//! Every blob body is a ciphertext from the [`crypto`] layer. The header is
//! itself such a ciphertext over a run of fixed-size records, one per blob
//! in body order:
//!
//! ```text
//! tag: u8 | length: u32 LE | [uncompressed_length: u32 LE] | id: 32 bytes
//! ```
//!
//! Tags 0 and 1 are uncompressed data and tree blobs (37-byte records);
//! tags 2 and 3 are their compressed variants and carry the extra
//! uncompressed-length field (41 bytes). The trailing `header_length`
//! counts the encrypted header only.
//!
//! Reading targets remote object stores where each request is expensive:
//! [`list`] issues a single range read sized for a typical header and only
//! falls back to a second, exactly-sized read when the header is larger.

#![deny(unsafe_code)]

mod packer;

pub use packer::Packer;

use holdfast_core::{Blob, BlobHandle, BlobType, Id, ReadAt, ID_SIZE};
use std::io;
use std::num::NonZeroU32;
use thiserror::Error;
use tracing::debug;

/// Size of an uncompressed-blob header record.
pub const ENTRY_SIZE: usize = 1 + 4 + ID_SIZE;

/// Size of a compressed-blob header record.
pub const ENTRY_SIZE_COMPRESSED: usize = 1 + 4 + 4 + ID_SIZE;

/// Size of the trailing header length field.
pub const HEADER_LENGTH_SIZE: usize = 4;

/// Upper bound on `header_length + HEADER_LENGTH_SIZE`.
pub const MAX_HEADER_SIZE: usize = 16 * 1024 * 1024 + 4;

/// Smallest well-formed pack: one uncompressed entry, crypto overhead, and
/// the length suffix.
pub const MIN_FILE_SIZE: usize = ENTRY_SIZE + crypto::EXTENSION + HEADER_LENGTH_SIZE;

// Number of header entries the first (eager) range read is sized for; a
// round-trip versus wasted-bytes tradeoff, not a correctness knob.
const EAGER_ENTRIES: usize = 15;

/// Errors from pack encoding and decoding.
#[derive(Debug, Error)]
pub enum PackError {
    /// Structurally invalid pack file.
    #[error("invalid pack file: {0}")]
    InvalidFile(String),
    /// Failure in the encryption layer.
    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),
    /// I/O failure on the backing reader or writer.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Operation on a packer that was already finalized.
    #[error("packer already finalized")]
    Finalized,
}

/// Header record size for a blob of this shape.
pub fn entry_size(uncompressed_length: Option<NonZeroU32>) -> usize {
    if uncompressed_length.is_some() {
        ENTRY_SIZE_COMPRESSED
    } else {
        ENTRY_SIZE
    }
}

// Append one header record.
fn write_entry(out: &mut Vec<u8>, blob: &Blob) {
    let tag: u8 = match (blob.handle.tpe, blob.is_compressed()) {
        (BlobType::Data, false) => 0,
        (BlobType::Tree, false) => 1,
        (BlobType::Data, true) => 2,
        (BlobType::Tree, true) => 3,
    };
    out.push(tag);
    out.extend_from_slice(&blob.length.to_le_bytes());
    if let Some(ulen) = blob.uncompressed_length {
        out.extend_from_slice(&ulen.get().to_le_bytes());
    }
    out.extend_from_slice(blob.handle.id.as_ref());
}

// Plaintext header: concatenated records in body order.
pub(crate) fn make_header(blobs: &[Blob]) -> Vec<u8> {
    let size = blobs.iter().map(|b| entry_size(b.uncompressed_length)).sum();
    let mut out = Vec::with_capacity(size);
    for blob in blobs {
        write_entry(&mut out, blob);
    }
    out
}

// Parse the decrypted header, assigning cumulative offsets from zero. Any
// leftover bytes that do not form a whole record invalidate the file.
fn parse_entries(header: &[u8]) -> Result<Vec<Blob>, PackError> {
    let mut blobs = Vec::with_capacity(header.len() / ENTRY_SIZE);
    let mut rest = header;
    let mut offset = 0u64;
    while !rest.is_empty() {
        let tag = rest[0];
        let (tpe, compressed) = match tag {
            0 => (BlobType::Data, false),
            1 => (BlobType::Tree, false),
            2 => (BlobType::Data, true),
            3 => (BlobType::Tree, true),
            t => return Err(PackError::InvalidFile(format!("invalid blob tag {t}"))),
        };
        let size = if compressed { ENTRY_SIZE_COMPRESSED } else { ENTRY_SIZE };
        if rest.len() < size {
            return Err(PackError::InvalidFile(format!(
                "{} trailing header bytes do not form an entry",
                rest.len()
            )));
        }
        let mut at = 1;
        let mut word = [0u8; 4];
        word.copy_from_slice(&rest[at..at + 4]);
        let length = u32::from_le_bytes(word);
        at += 4;
        let uncompressed_length = if compressed {
            word.copy_from_slice(&rest[at..at + 4]);
            at += 4;
            NonZeroU32::new(u32::from_le_bytes(word))
        } else {
            None
        };
        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(&rest[at..at + ID_SIZE]);

        blobs.push(Blob {
            handle: BlobHandle { tpe, id: Id(id) },
            length,
            offset,
            uncompressed_length,
        });
        offset += u64::from(length);
        rest = &rest[size..];
    }
    Ok(blobs)
}

// Fetch the encrypted header from the tail of the pack, eagerly reading
// enough for EAGER_ENTRIES records so that typical packs cost one round
// trip. Returns the encrypted header and its length field value.
fn read_header<R: ReadAt>(rd: &R, size: u64) -> Result<(Vec<u8>, u32), PackError> {
    if size < MIN_FILE_SIZE as u64 {
        return Err(PackError::InvalidFile("file is too small".into()));
    }

    let eager = EAGER_ENTRIES * ENTRY_SIZE + crypto::EXTENSION + HEADER_LENGTH_SIZE;
    let bufsize = usize::try_from(size).map_or(eager, |s| eager.min(s));
    let mut buf = vec![0u8; bufsize];
    rd.read_exact_at(size - bufsize as u64, &mut buf)?;

    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[bufsize - 4..]);
    let hlen = u32::from_le_bytes(word);
    let hlen_bytes = hlen as usize;
    if hlen_bytes < crypto::EXTENSION {
        return Err(PackError::InvalidFile("header too small".into()));
    }
    if u64::from(hlen) > size - HEADER_LENGTH_SIZE as u64 {
        return Err(PackError::InvalidFile("header larger than file".into()));
    }
    if hlen_bytes > MAX_HEADER_SIZE - HEADER_LENGTH_SIZE {
        return Err(PackError::InvalidFile("header too large".into()));
    }

    let total = hlen_bytes + HEADER_LENGTH_SIZE;
    if total <= bufsize {
        // Eager read already covers the header.
        debug!(header_length = hlen, "pack header served from eager read");
        let start = bufsize - total;
        buf.drain(..start);
        buf.truncate(hlen_bytes);
        return Ok((buf, hlen));
    }

    debug!(header_length = hlen, "pack header needs a second read");
    let mut full = vec![0u8; hlen_bytes];
    rd.read_exact_at(size - total as u64, &mut full)?;
    Ok((full, hlen))
}

/// Decode the pack at `rd` of total `size` bytes: decrypt the header and
/// return the described blobs in body order, offsets starting at zero,
/// together with the header footprint (encrypted header plus length field).
pub fn list<R: ReadAt>(
    key: &crypto::Key,
    rd: &R,
    size: u64,
) -> Result<(Vec<Blob>, u32), PackError> {
    let (encrypted, hlen) = read_header(rd, size)?;
    let mut buf = crypto::small_buffer();
    let header = key.decrypt(buf.as_mut_vec(), &encrypted)?;
    let blobs = parse_entries(header)?;
    debug!(blobs = blobs.len(), header_length = hlen, "pack header decoded");
    Ok((blobs, hlen + HEADER_LENGTH_SIZE as u32))
}
