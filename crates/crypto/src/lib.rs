//! Authenticated encryption for blob and pack-header bodies.
//!
//! Construction: AES-256 in CTR mode under a fresh 16-byte random IV,
//! authenticated with Poly1305-AES. The Poly1305 one-time key is
//! `r || AES-128_k(iv)` where `k` and the masked `r` form the signing half
//! of a [`Key`]. Every ciphertext is laid out as
//!
//! ```text
//! IV (16 bytes) || AES-256-CTR(plaintext) || MAC (16 bytes)
//! ```
//!
//! and the MAC covers the IV together with the CTR output, so a flip of any
//! ciphertext bit, IV included, fails verification. The fixed 32-byte
//! overhead is [`EXTENSION`].
//!
//! Keys come from [`Key::random`] or the scrypt KDF ([`Key::derive`]); the
//! Poly1305 `r` component is masked at every construction site, including
//! deserialization of persisted key files, so externally supplied unmasked
//! keys cannot reach a Poly1305 operation.

#![deny(unsafe_code)]

mod pool;
mod stream;

pub use pool::{small_buffer, stream_buffer, PooledBuf, SMALL_BUF_SIZE, STREAM_BUF_SIZE};
pub use stream::{DecryptReader, EncryptWriter};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use gf2poly::Pol;
use poly1305::Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io;
use subtle::ConstantTimeEq;
use thiserror::Error;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// IV length in bytes.
pub const IV_SIZE: usize = 16;

/// MAC length in bytes.
pub const MAC_SIZE: usize = 16;

/// Fixed ciphertext overhead: IV prefix plus MAC suffix.
pub const EXTENSION: usize = IV_SIZE + MAC_SIZE;

/// AES-256 encryption key length.
pub const ENCRYPTION_KEY_SIZE: usize = 32;

/// Combined Poly1305-AES signing key length (`k` plus `r`).
pub const MAC_KEY_SIZE: usize = 32;

/// Errors from key derivation and authenticated encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The OS random source failed.
    #[error("rng failure: {0}")]
    Rng(String),
    /// KDF invoked with an empty salt.
    #[error("kdf: empty salt")]
    EmptySalt,
    /// KDF parameters rejected by scrypt.
    #[error("kdf: {0}")]
    Scrypt(String),
    /// MAC verification failed; no plaintext is produced.
    #[error("ciphertext verification failed")]
    Unauthenticated,
    /// Ciphertext shorter than the fixed overhead.
    #[error("ciphertext too small")]
    TooSmall,
    /// Destination buffer cannot hold the output.
    #[error("buffer too small")]
    BufferTooSmall,
    /// I/O failure on a streaming reader or writer.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Poly1305-AES signing key: AES-128 key `k` and the masked `r` value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MacKey {
    pub(crate) k: [u8; 16],
    pub(crate) r: [u8; 16],
}

impl MacKey {
    fn new(k: [u8; 16], mut r: [u8; 16]) -> Self {
        mask_r(&mut r);
        Self { k, r }
    }
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs and panic messages.
        f.write_str("MacKey(..)")
    }
}

// Clear the Poly1305 r bits the algorithm requires zero: the top four bits
// of bytes 3, 7, 11, 15 and the bottom two bits of bytes 4, 8, 12.
// Idempotent, applied at every construction site.
fn mask_r(r: &mut [u8; 16]) {
    for i in [3, 7, 11, 15] {
        r[i] &= 0x0f;
    }
    for i in [4, 8, 12] {
        r[i] &= 0xfc;
    }
}

/// Scrypt work parameters for [`Key::derive`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    /// CPU/memory cost; must be a power of two greater than one.
    #[serde(rename = "N")]
    pub n: u32,
    /// Block size.
    pub r: u32,
    /// Parallelism.
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { n: 32768, r: 8, p: 8 }
    }
}

/// Encryption and signing key material.
///
/// Serializes to the persisted key-file JSON form: base64 fields for the
/// key bytes, plus the repository's chunker polynomial in lowercase hex when
/// present. Deserialization re-masks `r` unconditionally.
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    pub(crate) encrypt: [u8; ENCRYPTION_KEY_SIZE],
    pub(crate) sign: MacKey,
    /// Chunker polynomial persisted alongside the key material.
    pub chunker_polynomial: Option<Pol>,
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(..)")
    }
}

impl Key {
    /// Create a key from raw parts. `r` is masked here, whatever the caller
    /// supplied.
    pub fn from_parts(
        encrypt: [u8; ENCRYPTION_KEY_SIZE],
        k: [u8; 16],
        r: [u8; 16],
    ) -> Self {
        Self { encrypt, sign: MacKey::new(k, r), chunker_polynomial: None }
    }

    /// Draw a fresh random key from the OS random source.
    pub fn random() -> Result<Self, CryptoError> {
        let mut encrypt = [0u8; ENCRYPTION_KEY_SIZE];
        let mut k = [0u8; 16];
        let mut r = [0u8; 16];
        fill_random(&mut encrypt)?;
        fill_random(&mut k)?;
        fill_random(&mut r)?;
        Ok(Self::from_parts(encrypt, k, r))
    }

    /// Derive a key from a password with scrypt.
    ///
    /// The 64-byte KDF output is split into the AES-256 encryption key, the
    /// Poly1305-AES `k`, and the (then masked) `r`.
    pub fn derive(params: KdfParams, salt: &[u8], password: &str) -> Result<Self, CryptoError> {
        if salt.is_empty() {
            return Err(CryptoError::EmptySalt);
        }
        if params.n < 2 || !params.n.is_power_of_two() {
            return Err(CryptoError::Scrypt(format!("N {} is not a power of two", params.n)));
        }
        let log_n = params.n.trailing_zeros() as u8;
        let scrypt_params =
            scrypt::Params::new(log_n, params.r, params.p, ENCRYPTION_KEY_SIZE + MAC_KEY_SIZE)
                .map_err(|e| CryptoError::Scrypt(e.to_string()))?;
        let mut out = [0u8; ENCRYPTION_KEY_SIZE + MAC_KEY_SIZE];
        scrypt::scrypt(password.as_bytes(), salt, &scrypt_params, &mut out)
            .map_err(|e| CryptoError::Scrypt(e.to_string()))?;

        let mut encrypt = [0u8; ENCRYPTION_KEY_SIZE];
        let mut k = [0u8; 16];
        let mut r = [0u8; 16];
        encrypt.copy_from_slice(&out[..32]);
        k.copy_from_slice(&out[32..48]);
        r.copy_from_slice(&out[48..64]);
        Ok(Self::from_parts(encrypt, k, r))
    }

    /// Ciphertext length for a plaintext of `len` bytes.
    pub const fn ciphertext_length(len: usize) -> usize {
        len + EXTENSION
    }

    /// Encrypt `plaintext` into `buf` (cleared and grown as needed) and
    /// return the ciphertext slice, `plaintext.len() + EXTENSION` bytes long.
    pub fn encrypt<'a>(
        &self,
        buf: &'a mut Vec<u8>,
        plaintext: &[u8],
    ) -> Result<&'a [u8], CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        fill_random(&mut iv)?;
        Ok(self.encrypt_with_iv(buf, plaintext, iv))
    }

    /// Encrypt into a fixed destination without growing it. Fails with
    /// [`CryptoError::BufferTooSmall`] when `out` cannot hold
    /// `plaintext.len() + EXTENSION` bytes; returns the ciphertext length.
    pub fn encrypt_into(&self, out: &mut [u8], plaintext: &[u8]) -> Result<usize, CryptoError> {
        let total = Self::ciphertext_length(plaintext.len());
        if out.len() < total {
            return Err(CryptoError::BufferTooSmall);
        }
        let mut iv = [0u8; IV_SIZE];
        fill_random(&mut iv)?;
        out[..IV_SIZE].copy_from_slice(&iv);
        let body = &mut out[IV_SIZE..IV_SIZE + plaintext.len()];
        body.copy_from_slice(plaintext);
        self.ctr(&iv).apply_keystream(body);
        let mac = self.sign_mac(&out[..IV_SIZE + plaintext.len()]);
        out[IV_SIZE + plaintext.len()..total].copy_from_slice(&mac);
        Ok(total)
    }

    // Deterministic seam shared by encrypt and the known-answer tests.
    fn encrypt_with_iv<'a>(
        &self,
        buf: &'a mut Vec<u8>,
        plaintext: &[u8],
        iv: [u8; IV_SIZE],
    ) -> &'a [u8] {
        let total = Self::ciphertext_length(plaintext.len());
        buf.clear();
        buf.reserve(total);
        buf.extend_from_slice(&iv);
        buf.extend_from_slice(plaintext);
        self.ctr(&iv).apply_keystream(&mut buf[IV_SIZE..]);
        let mac = self.sign_mac(buf);
        buf.extend_from_slice(&mac);
        &buf[..]
    }

    /// Verify and decrypt `ciphertext` into `buf` (cleared and grown as
    /// needed), returning the plaintext slice.
    ///
    /// MAC verification runs before any decryption; on mismatch the call
    /// fails with [`CryptoError::Unauthenticated`] and `buf` holds nothing.
    pub fn decrypt<'a>(
        &self,
        buf: &'a mut Vec<u8>,
        ciphertext: &[u8],
    ) -> Result<&'a [u8], CryptoError> {
        buf.clear();
        let body = self.verify(ciphertext)?;
        let iv = &ciphertext[..IV_SIZE];
        buf.extend_from_slice(body);
        self.ctr(iv).apply_keystream(buf);
        Ok(&buf[..])
    }

    // Check the MAC over IV || CTR-output and hand back the CTR-output part.
    fn verify<'c>(&self, ciphertext: &'c [u8]) -> Result<&'c [u8], CryptoError> {
        if ciphertext.len() < EXTENSION {
            return Err(CryptoError::TooSmall);
        }
        let (signed, mac) = ciphertext.split_at(ciphertext.len() - MAC_SIZE);
        let expected = self.sign_mac(signed);
        if expected[..].ct_eq(mac).into() {
            Ok(&signed[IV_SIZE..])
        } else {
            Err(CryptoError::Unauthenticated)
        }
    }

    /// Streaming encryption: wrap `wr` in a writer that emits the IV up
    /// front, CTR-encrypts what it is given, and appends the MAC on
    /// [`EncryptWriter::finish`].
    pub fn encrypt_to<W: io::Write>(&self, wr: W) -> Result<EncryptWriter<W>, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        fill_random(&mut iv)?;
        Ok(EncryptWriter::new(self.clone(), wr, iv))
    }

    /// Streaming decryption: drain `rd`, verify the MAC, and expose the
    /// plaintext as a reader backed by a pooled buffer.
    pub fn decrypt_from<R: io::Read>(&self, rd: R) -> Result<DecryptReader, CryptoError> {
        DecryptReader::new(self, rd)
    }

    pub(crate) fn ctr(&self, iv: &[u8]) -> Aes256Ctr {
        Aes256Ctr::new(GenericArray::from_slice(&self.encrypt), GenericArray::from_slice(iv))
    }

    // Poly1305-AES over msg, which starts with the 16-byte IV: the one-time
    // key is r || AES-128_k(iv).
    pub(crate) fn sign_mac(&self, msg: &[u8]) -> [u8; MAC_SIZE] {
        debug_assert!(msg.len() >= IV_SIZE);
        let mut block = [0u8; 16];
        block.copy_from_slice(&msg[..IV_SIZE]);
        let aes = Aes128::new(GenericArray::from_slice(&self.sign.k));
        aes.encrypt_block(GenericArray::from_mut_slice(&mut block));

        let mut poly_key = [0u8; 32];
        poly_key[..16].copy_from_slice(&self.sign.r);
        poly_key[16..].copy_from_slice(&block);
        let tag = Poly1305::new(GenericArray::from_slice(&poly_key)).compute_unpadded(msg);

        let mut out = [0u8; MAC_SIZE];
        out.copy_from_slice(&tag);
        out
    }
}

fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng.try_fill_bytes(buf).map_err(|e| CryptoError::Rng(e.to_string()))
}

// Persisted JSON shape. A separate repr keeps the mask re-application on
// deserialization in one place.
#[derive(Serialize, Deserialize)]
struct KeyRepr {
    sign: MacKeyRepr,
    #[serde(with = "b64")]
    encrypt: [u8; ENCRYPTION_KEY_SIZE],
    #[serde(skip_serializing_if = "Option::is_none")]
    chunker_polynomial: Option<Pol>,
}

#[derive(Serialize, Deserialize)]
struct MacKeyRepr {
    #[serde(with = "b64")]
    k: [u8; 16],
    #[serde(with = "b64")]
    r: [u8; 16],
}

impl Serialize for Key {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        KeyRepr {
            sign: MacKeyRepr { k: self.sign.k, r: self.sign.r },
            encrypt: self.encrypt,
            chunker_polynomial: self.chunker_polynomial,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = KeyRepr::deserialize(deserializer)?;
        let mut key = Key::from_parts(repr.encrypt, repr.sign.k, repr.sign.r);
        key.chunker_polynomial = repr.chunker_polynomial;
        Ok(key)
    }
}

mod b64 {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = BASE64.decode(&s).map_err(serde::de::Error::custom)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes, got {}", raw.len())))
    }
}
