//! Holdfast core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the holdfast core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod id {
    //! Content identifiers: 32-byte SHA-256 digests with hex rendering.

    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use sha2::digest::{FixedOutput, Update};
    use std::fmt;
    use std::str::FromStr;
    use thiserror::Error;

    /// Number of bytes in an [`Id`].
    pub const ID_SIZE: usize = 32;

    /// Errors from parsing an [`Id`] out of its hex form.
    #[derive(Debug, Error)]
    pub enum IdError {
        /// Input does not decode as hex.
        #[error("invalid hex: {0}")]
        Hex(#[from] hex::FromHexError),
        /// Decoded byte count is not [`ID_SIZE`].
        #[error("invalid id length {0}, want {ID_SIZE}")]
        Length(usize),
    }

    /// 32-byte content identifier (SHA-256 over plaintext bytes).
    #[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
    pub struct Id(pub [u8; ID_SIZE]);

    impl Id {
        /// Hex-encoded lowercase string.
        pub fn to_hex(&self) -> String {
            hex::encode(self.0)
        }

        /// Parse an id from its lowercase hex form.
        pub fn from_hex(s: &str) -> Result<Self, IdError> {
            let raw = hex::decode(s)?;
            let buf: [u8; ID_SIZE] =
                raw.as_slice().try_into().map_err(|_| IdError::Length(raw.len()))?;
            Ok(Self(buf))
        }

        /// True for the all-zero id used as a placeholder before a pack is written.
        pub fn is_null(&self) -> bool {
            self.0 == [0u8; ID_SIZE]
        }
    }

    impl fmt::Debug for Id {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Id({})", &self.to_hex()[..8])
        }
    }

    impl fmt::Display for Id {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.to_hex())
        }
    }

    impl FromStr for Id {
        type Err = IdError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::from_hex(s)
        }
    }

    impl From<[u8; ID_SIZE]> for Id {
        fn from(buf: [u8; ID_SIZE]) -> Self {
            Self(buf)
        }
    }

    impl AsRef<[u8]> for Id {
        fn as_ref(&self) -> &[u8] {
            &self.0
        }
    }

    impl Serialize for Id {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&self.to_hex())
        }
    }

    impl<'de> Deserialize<'de> for Id {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            Self::from_hex(&s).map_err(serde::de::Error::custom)
        }
    }

    /// SHA-256 of `data` as an [`Id`].
    pub fn hash(data: &[u8]) -> Id {
        let mut h = sha2::Sha256::default();
        Update::update(&mut h, data);
        let out = h.finalize_fixed();
        let mut buf = [0u8; ID_SIZE];
        buf.copy_from_slice(&out);
        Id(buf)
    }

}

pub mod blob {
    //! Blob classification and location records shared by pack and index.

    use super::id::Id;
    use serde::{Deserialize, Serialize};
    use std::num::NonZeroU32;

    /// Kind of data stored in a blob.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
    #[serde(rename_all = "lowercase")]
    pub enum BlobType {
        /// File content chunk.
        Data,
        /// Serialized tree metadata.
        Tree,
    }

    /// Reference to a blob: its type plus content id.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
    pub struct BlobHandle {
        /// Blob type.
        #[serde(rename = "type")]
        pub tpe: BlobType,
        /// Content id of the plaintext.
        pub id: Id,
    }

    /// A blob's location within a pack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Blob {
        /// Type and id.
        pub handle: BlobHandle,
        /// Ciphertext length in bytes within the pack.
        pub length: u32,
        /// Byte offset of the ciphertext within the pack.
        pub offset: u64,
        /// Plaintext length before compression, when the blob is stored compressed.
        pub uncompressed_length: Option<NonZeroU32>,
    }

    impl Blob {
        /// True when the blob carries a compressed body.
        pub fn is_compressed(&self) -> bool {
            self.uncompressed_length.is_some()
        }
    }

}

pub mod readat {
    //! Random access reads, the consumed interface of the pack decoder.

    use std::io;

    /// Positional reads over some backing object (file, byte slice, remote range).
    pub trait ReadAt {
        /// Read up to `buf.len()` bytes at absolute `offset`, returning the count read.
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

        /// Read exactly `buf.len()` bytes at `offset` or fail with `UnexpectedEof`.
        fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
            while !buf.is_empty() {
                match self.read_at(offset, buf) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "failed to fill whole buffer",
                        ))
                    }
                    Ok(n) => {
                        buf = &mut buf[n..];
                        offset += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }

    impl ReadAt for [u8] {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let Ok(offset) = usize::try_from(offset) else {
                return Ok(0);
            };
            if offset >= self.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.len() - offset);
            buf[..n].copy_from_slice(&self[offset..offset + n]);
            Ok(n)
        }
    }

    impl ReadAt for Vec<u8> {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            self.as_slice().read_at(offset, buf)
        }
    }

    #[cfg(unix)]
    impl ReadAt for std::fs::File {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            std::os::unix::fs::FileExt::read_at(self, buf, offset)
        }
    }

    impl<T: ReadAt + ?Sized> ReadAt for &T {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            (**self).read_at(offset, buf)
        }
    }

}

pub use blob::{Blob, BlobHandle, BlobType};
pub use id::{hash, Id, IdError, ID_SIZE};
pub use readat::ReadAt;
