//! Pack persistence.
//!
//! [`PackStore`] is the seam between the repository and whatever holds the
//! finished packs; [`LocalStore`] implements it on a local directory with
//! the durability sequence used for content-addressed stores: write to a
//! temporary file, `fsync`, atomic rename into a sharded path, then `fsync`
//! the parent directory. Interrupted writes leave `.incomplete` artifacts
//! that [`LocalStore::cleanup_incomplete`] sweeps away.

use holdfast_core::{Id, ReadAt};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from pack persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// No stored object with the requested id.
    #[error("not found")]
    NotFound,
    /// An id prefix matched more than one stored object.
    #[error("id prefix {0} matches multiple packs")]
    MultipleMatches(String),
}

/// Persistence for finished packs and the encrypted index.
pub trait PackStore: Send + Sync {
    /// Persist a finished pack under its content id. Idempotent: storing an
    /// id that already exists is a no-op.
    fn save_pack(&self, id: &Id, bytes: &[u8]) -> Result<(), StoreError>;

    /// Size in bytes of a stored pack.
    fn pack_size(&self, id: &Id) -> Result<u64, StoreError>;

    /// Positional read from a stored pack.
    fn read_pack_at(&self, id: &Id, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Persist the encrypted index, replacing any previous one.
    fn save_index(&self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Load the encrypted index, or `None` when none was saved yet.
    fn load_index(&self) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Positional-read adapter exposing one stored pack as a [`ReadAt`].
pub struct StoredPack<'a, S: PackStore + ?Sized> {
    store: &'a S,
    id: Id,
}

impl<'a, S: PackStore + ?Sized> StoredPack<'a, S> {
    /// Wrap pack `id` of `store`.
    pub fn new(store: &'a S, id: Id) -> Self {
        Self { store, id }
    }
}

impl<S: PackStore + ?Sized> ReadAt for StoredPack<'_, S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.store.read_pack_at(&self.id, offset, buf).map_err(|e| match e {
            StoreError::Io(e) => e,
            StoreError::NotFound => io::Error::new(io::ErrorKind::NotFound, "pack not found"),
            StoreError::MultipleMatches(prefix) => {
                io::Error::other(format!("id prefix {prefix} matches multiple packs"))
            }
        })
    }
}

/// Directory-backed [`PackStore`].
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join("packs"))?;
        Ok(Self { root })
    }

    /// Deterministic pack path, sharded by the first two hex digit pairs.
    pub fn pack_path(&self, id: &Id) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("packs").join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index")
    }

    // Durable write: temp file, fsync, atomic rename, parent fsync.
    fn persist(&self, final_path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let incomplete = final_path.with_extension("incomplete");
        {
            let mut out = fs::File::create(&incomplete)?;
            out.write_all(bytes)?;
            out.sync_all()?;
        }
        match fs::rename(&incomplete, final_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if final_path.exists() {
                    let _ = fs::remove_file(&incomplete);
                } else {
                    return Err(StoreError::Io(e));
                }
            }
            Err(e) => return Err(StoreError::Io(e)),
        }
        if let Some(parent) = final_path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// Resolve a pack id from a hex prefix, e.g. an abbreviated id typed by
    /// an operator. Fails with [`StoreError::NotFound`] when nothing
    /// matches and [`StoreError::MultipleMatches`] when the prefix is
    /// ambiguous.
    pub fn find_pack(&self, prefix: &str) -> Result<Id, StoreError> {
        fn walk(dir: &Path, prefix: &str, hits: &mut Vec<String>) -> io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    let _ = walk(&path, prefix, hits);
                } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    // Skip .incomplete artifacts and other non-pack files.
                    if name.starts_with(prefix) && !name.contains('.') {
                        hits.push(name.to_owned());
                    }
                }
            }
            Ok(())
        }

        let mut hits = Vec::new();
        let packs = self.root.join("packs");
        if packs.exists() {
            walk(&packs, prefix, &mut hits)?;
        }
        match hits.as_slice() {
            [] => Err(StoreError::NotFound),
            [name] => Id::from_hex(name).map_err(|_| StoreError::NotFound),
            _ => Err(StoreError::MultipleMatches(prefix.to_owned())),
        }
    }

    /// Remove any `.incomplete` artifacts under the pack tree; returns the
    /// count removed.
    pub fn cleanup_incomplete(&self) -> Result<usize, StoreError> {
        fn walk(dir: &Path, count: &mut usize) -> io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    let _ = walk(&path, count);
                } else if path.extension().map(|e| e == "incomplete").unwrap_or(false) {
                    fs::remove_file(&path)?;
                    *count += 1;
                }
            }
            Ok(())
        }
        let mut removed = 0usize;
        let packs = self.root.join("packs");
        if packs.exists() {
            let _ = walk(&packs, &mut removed);
        }
        debug!(removed, "incomplete pack artifacts cleaned up");
        Ok(removed)
    }
}

impl PackStore for LocalStore {
    fn save_pack(&self, id: &Id, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.pack_path(id);
        if path.exists() {
            return Ok(());
        }
        self.persist(&path, bytes)?;
        debug!(id = %id, bytes = bytes.len(), "pack stored");
        Ok(())
    }

    fn pack_size(&self, id: &Id) -> Result<u64, StoreError> {
        match fs::metadata(self.pack_path(id)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn read_pack_at(&self, id: &Id, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        let file = match fs::File::open(self.pack_path(id)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(StoreError::Io(e)),
        };
        Ok(file.read_at(offset, buf)?)
    }

    fn save_index(&self, bytes: &[u8]) -> Result<(), StoreError> {
        self.persist(&self.index_path(), bytes)
    }

    fn load_index(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.index_path()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_core::ID_SIZE;

    fn id(b: u8) -> Id {
        Id([b; ID_SIZE])
    }

    #[test]
    fn pack_paths_are_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        let path = store.pack_path(&id(0xab));
        let hex = id(0xab).to_hex();
        assert!(path.ends_with(format!("packs/ab/ab/{hex}")));
    }

    #[test]
    fn save_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        let body = b"pack bytes here".to_vec();
        store.save_pack(&id(1), &body).unwrap();
        assert_eq!(store.pack_size(&id(1)).unwrap(), body.len() as u64);

        let mut buf = vec![0u8; 5];
        let n = store.read_pack_at(&id(1), 5, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"bytes");

        // Idempotent re-save.
        store.save_pack(&id(1), &body).unwrap();
        assert!(matches!(store.pack_size(&id(9)), Err(StoreError::NotFound)));
    }

    #[test]
    fn index_roundtrip_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        assert!(store.load_index().unwrap().is_none());
        store.save_index(b"first").unwrap();
        store.save_index(b"second").unwrap();
        assert_eq!(store.load_index().unwrap().unwrap(), b"second");
    }

    #[test]
    fn find_pack_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();

        let mut other = [0x4du8; ID_SIZE];
        other[1] = 0x99;
        store.save_pack(&id(0x4d), b"one").unwrap();
        store.save_pack(&Id(other), b"two").unwrap();

        assert_eq!(store.find_pack(&id(0x4d).to_hex()).unwrap(), id(0x4d));
        assert_eq!(store.find_pack("4d99").unwrap(), Id(other));
        assert!(matches!(store.find_pack("4d"), Err(StoreError::MultipleMatches(_))));
        assert!(matches!(store.find_pack("ff"), Err(StoreError::NotFound)));
    }

    #[test]
    fn cleanup_removes_incomplete_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        let path = store.pack_path(&id(2)).with_extension("incomplete");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"partial").unwrap();
        assert_eq!(store.cleanup_incomplete().unwrap(), 1);
        assert!(!path.exists());
    }
}
