//! Streaming encryption and decryption adapters.
//!
//! [`EncryptWriter`] wraps a sink: it emits the IV on the first write,
//! CTR-encrypts input in [`STREAM_BUF_SIZE`] slices staged in a pooled
//! scratch buffer, and appends the Poly1305-AES tag on
//! [`EncryptWriter::finish`]. The tag covers the IV and every ciphertext
//! byte, which are retained in a MAC buffer until then.
//!
//! [`DecryptReader`] drains its source into a pooled buffer up front,
//! verifies the tag before exposing anything, then serves the decrypted
//! plaintext through [`std::io::Read`].

use crate::pool::{PooledBuf, STREAM_POOL};
use crate::{CryptoError, Key, EXTENSION, IV_SIZE, MAC_SIZE, STREAM_BUF_SIZE};
use aes::cipher::StreamCipher;
use std::io::{self, Read, Write};

/// Encrypting [`Write`] adapter produced by [`Key::encrypt_to`].
pub struct EncryptWriter<W: Write> {
    key: Key,
    wr: W,
    iv: [u8; IV_SIZE],
    ctr: crate::Aes256Ctr,
    scratch: PooledBuf,
    // IV followed by all ciphertext, kept for the final tag computation.
    macbuf: Vec<u8>,
    started: bool,
}

impl<W: Write> EncryptWriter<W> {
    pub(crate) fn new(key: Key, wr: W, iv: [u8; IV_SIZE]) -> Self {
        let ctr = key.ctr(&iv);
        Self { key, wr, iv, ctr, scratch: STREAM_POOL.get(), macbuf: Vec::new(), started: false }
    }

    fn ensure_started(&mut self) -> io::Result<()> {
        if !self.started {
            self.wr.write_all(&self.iv)?;
            self.macbuf.extend_from_slice(&self.iv);
            self.started = true;
        }
        Ok(())
    }

    /// Append the MAC and hand back the underlying writer. Must be called;
    /// dropping the writer without finishing discards the trailing tag and
    /// leaves the sink holding an unverifiable stream.
    pub fn finish(mut self) -> Result<W, CryptoError> {
        self.ensure_started()?;
        let mac = self.key.sign_mac(&self.macbuf);
        self.wr.write_all(&mac)?;
        self.wr.flush()?;
        // Moving the sink out; the pooled scratch buffer still returns to
        // its pool when the remaining fields drop.
        Ok(self.wr)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_started()?;
        for chunk in buf.chunks(STREAM_BUF_SIZE) {
            let scratch = self.scratch.as_mut_vec();
            scratch.clear();
            scratch.extend_from_slice(chunk);
            self.ctr.apply_keystream(scratch);
            self.wr.write_all(scratch)?;
            self.macbuf.extend_from_slice(scratch);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.wr.flush()
    }
}

/// Decrypting [`Read`] adapter produced by [`Key::decrypt_from`].
///
/// The whole ciphertext is verified before the first byte is readable; the
/// backing pooled buffer goes home when the reader drops.
pub struct DecryptReader {
    buf: PooledBuf,
    pos: usize,
    end: usize,
}

impl DecryptReader {
    pub(crate) fn new<R: Read>(key: &Key, mut rd: R) -> Result<Self, CryptoError> {
        let mut buf = STREAM_POOL.get();
        rd.read_to_end(buf.as_mut_vec())?;

        if buf.len() < EXTENSION {
            return Err(CryptoError::TooSmall);
        }
        let body_len = buf.len() - MAC_SIZE;
        let (signed, mac) = buf.split_at(body_len);
        let expected = key.sign_mac(signed);
        if !bool::from(subtle::ConstantTimeEq::ct_eq(&expected[..], mac)) {
            return Err(CryptoError::Unauthenticated);
        }

        let (iv, rest) = buf.split_at_mut(IV_SIZE);
        key.ctr(iv).apply_keystream(&mut rest[..body_len - IV_SIZE]);
        Ok(Self { buf, pos: IV_SIZE, end: body_len })
    }

    /// Plaintext length.
    pub fn len(&self) -> usize {
        self.end - IV_SIZE
    }

    /// True when the stream carried an empty plaintext.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for DecryptReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.end - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_one_shot_layout() {
        let key = Key::random().unwrap();
        let payload: Vec<u8> = (0..1_300_000u32).map(|i| (i % 253) as u8).collect();

        let mut wr = key.encrypt_to(Vec::new()).unwrap();
        // Uneven write sizes exercise the chunked staging path.
        for part in payload.chunks(97_003) {
            wr.write_all(part).unwrap();
        }
        let ct = wr.finish().unwrap();
        assert_eq!(ct.len(), payload.len() + EXTENSION);

        let mut pt_buf = Vec::new();
        assert_eq!(key.decrypt(&mut pt_buf, &ct).unwrap(), payload.as_slice());
    }

    #[test]
    fn decrypt_from_roundtrip() {
        let key = Key::random().unwrap();
        let payload = b"streamed plaintext body".to_vec();
        let mut ct_buf = Vec::new();
        let ct = key.encrypt(&mut ct_buf, &payload).unwrap().to_vec();

        let mut rd = key.decrypt_from(&ct[..]).unwrap();
        assert_eq!(rd.len(), payload.len());
        let mut out = Vec::new();
        rd.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn empty_stream_roundtrip() {
        let key = Key::random().unwrap();
        let ct = key.encrypt_to(Vec::new()).unwrap().finish().unwrap();
        assert_eq!(ct.len(), EXTENSION);

        let rd = key.decrypt_from(&ct[..]).unwrap();
        assert!(rd.is_empty());
    }

    #[test]
    fn decrypt_from_rejects_tampering() {
        let key = Key::random().unwrap();
        let mut ct = key.encrypt_to(Vec::new()).unwrap();
        ct.write_all(b"data under test").unwrap();
        let mut ct = ct.finish().unwrap();
        ct[IV_SIZE] ^= 0x80;
        assert!(matches!(key.decrypt_from(&ct[..]), Err(CryptoError::Unauthenticated)));
    }
}
