//! Repository: blob save and load over the chunker, cipher, packer and
//! index.
//!
//! Write path: plaintext blob -> SHA-256 content id -> duplicate check
//! against the index -> encrypt -> append to the open pack. When the open
//! pack reaches its size target (or its header budget) it is finalized,
//! content-addressed by the SHA-256 of its bytes, handed to the
//! [`PackStore`], and the index entries are patched with the pack id. Read
//! path is symmetric: index lookup, ranged pack read, decrypt, digest
//! verification.
//!
//! [`Repository::save_stream`] runs the content-defined chunker over a
//! reader and saves every chunk as a data blob, which is the whole ingest
//! pipeline in one call.

#![deny(unsafe_code)]

mod observer;
mod store;

pub use observer::{set_observer, RepoObserver, RepoSpan};
pub use store::{LocalStore, PackStore, StoreError, StoredPack};

use chunker::{Chunker, ChunkerError};
use gf2poly::Pol;
use holdfast_core::{hash, BlobType, Id};
use index::Index;
use observer::observer;
use pack::Packer;
use std::io::Read;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Pack size at which the open pack is finalized and stored.
pub const DEFAULT_PACK_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from repository operations.
#[derive(Debug, Error)]
pub enum RepoError {
    /// No blob with this type and id.
    #[error("blob not found")]
    NotFound,
    /// Stored blob bytes do not hash back to their id.
    #[error("integrity: digest mismatch")]
    Integrity,
    /// Failure in the encryption layer.
    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),
    /// Failure in the pack layer.
    #[error(transparent)]
    Pack(#[from] pack::PackError),
    /// Failure in the index.
    #[error(transparent)]
    Index(#[from] index::IndexError),
    /// Failure in the chunker.
    #[error(transparent)]
    Chunker(#[from] ChunkerError),
    /// Failure in the pack store.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Failure generating the chunker polynomial.
    #[error(transparent)]
    Pol(#[from] gf2poly::PolError),
}

/// Repository configuration.
#[derive(Debug, Clone, Copy)]
pub struct RepoConfig {
    /// Pack size target; the open pack is flushed once it grows past this.
    pub pack_size: u64,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self { pack_size: DEFAULT_PACK_SIZE }
    }
}

/// A deduplicating, encrypted blob repository over a [`PackStore`].
pub struct Repository<S> {
    store: S,
    key: crypto::Key,
    chunker_pol: Pol,
    config: RepoConfig,
    index: Index,
    open_pack: Mutex<Option<Packer<Vec<u8>>>>,
}

impl<S: PackStore> Repository<S> {
    /// Open a repository with the given key. A key without a chunker
    /// polynomial gets a freshly drawn irreducible one.
    pub fn open(store: S, mut key: crypto::Key) -> Result<Self, RepoError> {
        let chunker_pol = match key.chunker_polynomial {
            Some(pol) => pol,
            None => {
                let pol = Pol::random_irreducible()?;
                key.chunker_polynomial = Some(pol);
                pol
            }
        };
        Ok(Self {
            store,
            key,
            chunker_pol,
            config: RepoConfig::default(),
            index: Index::new(),
            open_pack: Mutex::new(None),
        })
    }

    /// Override the default configuration.
    #[must_use]
    pub fn with_config(mut self, config: RepoConfig) -> Self {
        self.config = config;
        self
    }

    /// The repository key.
    pub fn key(&self) -> &crypto::Key {
        &self.key
    }

    /// The in-memory index.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock_pack(&self) -> MutexGuard<'_, Option<Packer<Vec<u8>>>> {
        self.open_pack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Save one blob. The id is the SHA-256 of `data` unless the caller
    /// already computed it. Known blobs are not stored twice; the previous
    /// id is returned.
    pub fn save(&self, tpe: BlobType, data: &[u8], id: Option<Id>) -> Result<Id, RepoError> {
        let _span = observer().span("repo.save");
        let id = id.unwrap_or_else(|| hash(data));
        if self.index.has(&id) {
            observer().duplicate_blobs(1);
            return Ok(id);
        }

        let mut ct_buf = crypto::small_buffer();
        let ciphertext = self.key.encrypt(ct_buf.as_mut_vec(), data)?;

        let mut slot = self.lock_pack();
        let packer = slot.get_or_insert_with(|| Packer::new(self.key.clone(), Vec::new()));
        let offset = packer.size();
        packer.add(tpe, id, ciphertext, None)?;
        self.index.store(tpe, id, None, offset, ciphertext.len() as u32);

        if packer.size() >= self.config.pack_size || packer.header_full() {
            self.flush_locked(&mut slot)?;
        }
        observer().saved_bytes(data.len() as u64);
        Ok(id)
    }

    /// Finalize and store the open pack, if any. Returns the stored pack id.
    pub fn flush(&self) -> Result<Option<Id>, RepoError> {
        let mut slot = self.lock_pack();
        self.flush_locked(&mut slot)
    }

    fn flush_locked(
        &self,
        slot: &mut MutexGuard<'_, Option<Packer<Vec<u8>>>>,
    ) -> Result<Option<Id>, RepoError> {
        let Some(packer) = slot.take() else {
            return Ok(None);
        };
        if packer.count() == 0 {
            return Ok(None);
        }
        let blobs = packer.blobs();
        packer.finalize()?;
        let bytes = packer.into_inner()?;
        let pack_id = hash(&bytes);
        self.store.save_pack(&pack_id, &bytes)?;

        let ids: Vec<Id> = blobs.iter().map(|b| b.handle.id).collect();
        self.index.patch_pack_id(&ids, pack_id);
        observer().pack_bytes(bytes.len() as u64);
        debug!(pack = %pack_id, blobs = ids.len(), bytes = bytes.len(), "pack flushed");
        Ok(Some(pack_id))
    }

    /// Load a blob's plaintext into `buf` (cleared first) and return it.
    ///
    /// A blob whose pack is still open is flushed first so every load is
    /// served from the store. The plaintext digest is verified against the
    /// id before anything is returned.
    pub fn load_blob<'a>(
        &self,
        tpe: BlobType,
        id: &Id,
        buf: &'a mut Vec<u8>,
    ) -> Result<&'a [u8], RepoError> {
        let _span = observer().span("repo.load");
        let location = match self.index.lookup(id) {
            Ok(l) => l,
            Err(index::IndexError::NotFound) => return Err(RepoError::NotFound),
            Err(e) => return Err(e.into()),
        };
        if location.tpe != tpe {
            return Err(RepoError::NotFound);
        }
        let pack_id = match location.pack_id {
            Some(pack_id) => pack_id,
            None => {
                self.flush()?;
                self.index
                    .lookup(id)
                    .ok()
                    .and_then(|l| l.pack_id)
                    .ok_or(RepoError::NotFound)?
            }
        };

        let mut ciphertext = vec![0u8; location.length as usize];
        let reader = StoredPack::new(&self.store, pack_id);
        holdfast_core::ReadAt::read_exact_at(&reader, location.offset, &mut ciphertext)
            .map_err(StoreError::Io)?;

        let mut pt_buf = crypto::small_buffer();
        let plaintext = self.key.decrypt(pt_buf.as_mut_vec(), &ciphertext)?;
        if hash(plaintext) != *id {
            return Err(RepoError::Integrity);
        }
        observer().loaded_bytes(plaintext.len() as u64);
        buf.clear();
        buf.extend_from_slice(plaintext);
        Ok(&buf[..])
    }

    /// Chunk `rd` with the repository polynomial and save every chunk as a
    /// data blob. Returns the chunk ids with their lengths, in stream order.
    pub fn save_stream<R: Read>(&self, rd: R) -> Result<Vec<(Id, u64)>, RepoError> {
        let _span = observer().span("repo.save_stream");
        let mut chunker = Chunker::new(rd, self.chunker_pol)?.with_digest();
        let mut data = Vec::new();
        let mut chunks = Vec::new();
        loop {
            match chunker.next(&mut data) {
                Ok(chunk) => {
                    // with_digest guarantees the digest is present.
                    let id = chunk.digest.map(Id).ok_or(RepoError::Integrity)?;
                    self.save(BlobType::Data, &data, Some(id))?;
                    observer().chunks(1);
                    chunks.push((id, chunk.length));
                }
                Err(ChunkerError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        debug!(chunks = chunks.len(), "stream ingested");
        Ok(chunks)
    }

    /// Persist the current session's index entries, encrypted, to the store.
    /// Flushes the open pack first so no entry is left unpatched.
    pub fn save_index(&self) -> Result<(), RepoError> {
        self.flush()?;
        let mut wr = self.key.encrypt_to(Vec::new())?;
        self.index.encode(&mut wr)?;
        let bytes = wr.finish()?;
        self.store.save_index(&bytes)?;
        debug!(bytes = bytes.len(), "index saved");
        Ok(())
    }

    /// Load the persisted index, if any, and merge it into the in-memory
    /// one (entries arrive marked old).
    pub fn load_index(&self) -> Result<(), RepoError> {
        let Some(bytes) = self.store.load_index()? else {
            return Ok(());
        };
        let rd = self.key.decrypt_from(bytes.as_slice())?;
        let loaded = Index::decode(rd)?;
        self.index.merge(loaded);
        Ok(())
    }
}

/// Deterministic test payload of the given length.
pub fn deterministic_bytes(len: usize) -> Vec<u8> {
    let mut v = Vec::with_capacity(len);
    for i in 0..len {
        v.push((i as u8).wrapping_mul(37).wrapping_add(11));
    }
    v
}
