//! In-memory aggregation of blobs into a single pack.

use crate::{
    entry_size, make_header, PackError, ENTRY_SIZE_COMPRESSED, HEADER_LENGTH_SIZE, MAX_HEADER_SIZE,
};
use holdfast_core::{Blob, BlobHandle, BlobType, Id};
use std::io::Write;
use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

struct Inner<W> {
    wr: W,
    bytes: u64,
    blobs: Vec<Blob>,
    finalized: bool,
}

/// Aggregates already-encrypted blobs into one pack behind a mutex.
///
/// Blob offsets are assigned in `add` order; [`Packer::finalize`] writes the
/// encrypted header and the length suffix, after which every further
/// operation fails with [`PackError::Finalized`].
pub struct Packer<W> {
    key: crypto::Key,
    inner: Mutex<Inner<W>>,
}

impl<W: Write> Packer<W> {
    /// Create a packer writing blob bodies to `wr`.
    pub fn new(key: crypto::Key, wr: W) -> Self {
        Self {
            key,
            inner: Mutex::new(Inner { wr, bytes: 0, blobs: Vec::new(), finalized: false }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<W>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one blob body. `ciphertext` is written to the sink verbatim
    /// and a header record is queued for it. Returns the bytes this blob
    /// accounts for in the finished pack, header record included.
    pub fn add(
        &self,
        tpe: BlobType,
        id: Id,
        ciphertext: &[u8],
        uncompressed_length: Option<NonZeroU32>,
    ) -> Result<usize, PackError> {
        let mut inner = self.lock();
        if inner.finalized {
            return Err(PackError::Finalized);
        }
        inner.wr.write_all(ciphertext)?;
        let blob = Blob {
            handle: BlobHandle { tpe, id },
            length: ciphertext.len() as u32,
            offset: inner.bytes,
            uncompressed_length,
        };
        inner.bytes += ciphertext.len() as u64;
        inner.blobs.push(blob);
        Ok(ciphertext.len() + entry_size(uncompressed_length))
    }

    /// Encrypt and write the header plus its length suffix, freezing the
    /// packer. Returns the total size of the finished pack in bytes.
    pub fn finalize(&self) -> Result<u64, PackError> {
        let mut inner = self.lock();
        if inner.finalized {
            return Err(PackError::Finalized);
        }
        let header = make_header(&inner.blobs);
        let mut buf = crypto::stream_buffer();
        let encrypted = self.key.encrypt(buf.as_mut_vec(), &header)?;

        inner.wr.write_all(encrypted)?;
        inner.wr.write_all(&(encrypted.len() as u32).to_le_bytes())?;
        inner.bytes += (encrypted.len() + HEADER_LENGTH_SIZE) as u64;
        inner.wr.flush()?;
        inner.finalized = true;
        debug!(blobs = inner.blobs.len(), bytes = inner.bytes, "pack finalized");
        Ok(inner.bytes)
    }

    /// True when one more header record could push the header past
    /// [`MAX_HEADER_SIZE`]; callers should finalize and start a new pack.
    pub fn header_full(&self) -> bool {
        let inner = self.lock();
        let worst_case: usize = inner
            .blobs
            .iter()
            .map(|b| entry_size(b.uncompressed_length))
            .sum::<usize>()
            + ENTRY_SIZE_COMPRESSED
            + crypto::EXTENSION;
        worst_case > MAX_HEADER_SIZE - HEADER_LENGTH_SIZE
    }

    /// Bytes written so far (bodies only until finalize, total after).
    pub fn size(&self) -> u64 {
        self.lock().bytes
    }

    /// Number of blobs added.
    pub fn count(&self) -> usize {
        self.lock().blobs.len()
    }

    /// Snapshot of the queued blob records.
    pub fn blobs(&self) -> Vec<Blob> {
        self.lock().blobs.clone()
    }

    /// True once [`Packer::finalize`] ran.
    pub fn finalized(&self) -> bool {
        self.lock().finalized
    }

    /// Consume the packer and hand back the sink. Fails unless the pack was
    /// finalized, so partially written packs cannot leak out silently.
    pub fn into_inner(self) -> Result<W, PackError> {
        let inner = self.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        if !inner.finalized {
            return Err(PackError::Finalized);
        }
        Ok(inner.wr)
    }
}
