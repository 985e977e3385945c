//! In-memory index mapping blob ids to their pack locations.
//!
//! One reader-writer lock guards the map; lookups and iteration take the
//! read side, mutations the write side. Entries added during the current
//! session may start without a pack id while their pack is still open and
//! are patched once the pack is written; entries loaded from a persisted
//! index are marked `old` and are skipped when the index is serialized
//! again, so an index file only ever carries what this session produced.
//!
//! The persisted form is a JSON array of pack objects:
//!
//! ```json
//! [ { "id": "<hex>", "blobs": [ { "id": "<hex>", "type": "data",
//!     "offset": 0, "length": 74 } ] } ]
//! ```

#![deny(unsafe_code)]

use holdfast_core::{BlobType, Id};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::debug;

/// Errors from index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// No entry for the requested blob id.
    #[error("blob not found in index")]
    NotFound,
    /// An entry was never patched with its pack id.
    #[error("blob {0} has no pack id")]
    PackIdMissing(Id),
    /// Malformed persisted index, or a serialization failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// I/O failure while reading or writing a persisted index.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a blob lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// Containing pack, or `None` while the pack is still open.
    pub pack_id: Option<Id>,
    /// Blob type.
    pub tpe: BlobType,
    /// Byte offset of the ciphertext within the pack.
    pub offset: u64,
    /// Ciphertext length in bytes.
    pub length: u32,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    location: Location,
    old: bool,
}

/// Blob id to pack location map, shareable across threads.
#[derive(Debug, Default)]
pub struct Index {
    map: RwLock<HashMap<Id, Entry>>,
}

// Persisted JSON shape.
#[derive(Serialize, Deserialize)]
struct PackJson {
    id: Id,
    blobs: Vec<BlobJson>,
}

#[derive(Serialize, Deserialize)]
struct BlobJson {
    id: Id,
    #[serde(rename = "type")]
    tpe: BlobType,
    offset: u64,
    length: u32,
}

impl Index {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Id, Entry>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Id, Entry>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a blob's location. Pass `pack_id = None` while the containing
    /// pack is still open and patch it later via [`Index::patch_pack_id`];
    /// encoding fails for entries left unpatched. A fresh store replaces any
    /// previous entry for the id.
    pub fn store(&self, tpe: BlobType, id: Id, pack_id: Option<Id>, offset: u64, length: u32) {
        let entry = Entry { location: Location { pack_id, tpe, offset, length }, old: false };
        self.write().insert(id, entry);
    }

    /// Set the pack id on the entries for `ids` that are still unpatched.
    /// Returns how many entries were patched.
    pub fn patch_pack_id(&self, ids: &[Id], pack_id: Id) -> usize {
        let mut map = self.write();
        let mut patched = 0;
        for id in ids {
            if let Some(entry) = map.get_mut(id) {
                if entry.location.pack_id.is_none() {
                    entry.location.pack_id = Some(pack_id);
                    patched += 1;
                }
            }
        }
        patched
    }

    /// True when the index holds an entry for `id`.
    pub fn has(&self, id: &Id) -> bool {
        self.read().contains_key(id)
    }

    /// Look up a blob's location.
    pub fn lookup(&self, id: &Id) -> Result<Location, IndexError> {
        self.read().get(id).map(|e| e.location).ok_or(IndexError::NotFound)
    }

    /// Drop every entry recorded for `pack_id`. Returns the removed count.
    pub fn remove(&self, pack_id: Id) -> usize {
        let mut map = self.write();
        let before = map.len();
        map.retain(|_, entry| entry.location.pack_id != Some(pack_id));
        before - map.len()
    }

    /// Merge a loaded index into this one, marking every incoming entry as
    /// `old`. On id collision the existing entry wins; content-addressed ids
    /// make a real conflict carry identical bodies anyway.
    pub fn merge(&self, other: Index) {
        let incoming = other.map.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.write();
        for (id, mut entry) in incoming {
            entry.old = true;
            match map.entry(id) {
                std::collections::hash_map::Entry::Occupied(_) => {
                    debug!(%id, "merge: id already present, keeping existing entry");
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
            }
        }
    }

    /// Visit every entry under the read lock. Iteration order is
    /// unspecified.
    pub fn for_each<F: FnMut(&Id, &Location)>(&self, mut f: F) {
        for (id, entry) in self.read().iter() {
            f(id, &entry.location);
        }
    }

    /// Number of entries of the given type.
    pub fn count(&self, tpe: BlobType) -> usize {
        self.read().values().filter(|e| e.location.tpe == tpe).count()
    }

    /// The set of pack ids referenced by any entry. Entries whose pack is
    /// still open contribute nothing.
    pub fn packs(&self) -> Vec<Id> {
        let mut packs: Vec<Id> =
            self.read().values().filter_map(|e| e.location.pack_id).collect();
        packs.sort_unstable();
        packs.dedup();
        packs
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Serialize the current session's entries (non-`old`) as JSON, grouped
    /// by pack. Fails with [`IndexError::PackIdMissing`] when an entry was
    /// never patched with its pack id.
    pub fn encode<W: Write>(&self, wr: W) -> Result<(), IndexError> {
        let mut packs: BTreeMap<Id, Vec<BlobJson>> = BTreeMap::new();
        {
            let map = self.read();
            for (id, entry) in map.iter() {
                if entry.old {
                    continue;
                }
                let pack_id = entry.location.pack_id.ok_or(IndexError::PackIdMissing(*id))?;
                packs.entry(pack_id).or_default().push(BlobJson {
                    id: *id,
                    tpe: entry.location.tpe,
                    offset: entry.location.offset,
                    length: entry.location.length,
                });
            }
        }
        let packs: Vec<PackJson> = packs
            .into_iter()
            .map(|(id, mut blobs)| {
                blobs.sort_by_key(|b| b.offset);
                PackJson { id, blobs }
            })
            .collect();
        serde_json::to_writer(wr, &packs)?;
        Ok(())
    }

    /// Parse a persisted index. Every entry comes back marked `old`.
    pub fn decode<R: Read>(rd: R) -> Result<Self, IndexError> {
        let packs: Vec<PackJson> = serde_json::from_reader(rd)?;
        let index = Self::new();
        {
            let mut map = index.write();
            for pack in packs {
                for blob in pack.blobs {
                    let location = Location {
                        pack_id: Some(pack.id),
                        tpe: blob.tpe,
                        offset: blob.offset,
                        length: blob.length,
                    };
                    map.insert(blob.id, Entry { location, old: true });
                }
            }
        }
        debug!(entries = index.len(), "index decoded");
        Ok(index)
    }
}
