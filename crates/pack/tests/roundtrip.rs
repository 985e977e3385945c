// Pack write/read round trips and the eager header-read contract.

use holdfast_core::{BlobType, Id, ReadAt, ID_SIZE};
use pack::{list, PackError, Packer, ENTRY_SIZE, HEADER_LENGTH_SIZE};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicUsize, Ordering};

fn random_id() -> Id {
    let mut id = [0u8; ID_SIZE];
    OsRng.fill_bytes(&mut id);
    Id(id)
}

// ReadAt wrapper that counts issued reads, to pin the round-trip budget.
struct CountingReader<'a> {
    data: &'a [u8],
    reads: AtomicUsize,
}

impl<'a> CountingReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, reads: AtomicUsize::new(0) }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl ReadAt for CountingReader<'_> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.data.read_at(offset, buf)
    }
}

#[test]
fn three_blob_roundtrip_with_known_offsets() {
    let key = crypto::Key::random().unwrap();
    let packer = Packer::new(key.clone(), Vec::new());

    let plaintexts: [&[u8]; 3] = [&[0xaa; 42], &[0xbb; 1], &[0xcc; 8192]];
    let mut ids = Vec::new();
    let mut ct_buf = Vec::new();
    for (i, plaintext) in plaintexts.iter().enumerate() {
        let ciphertext = key.encrypt(&mut ct_buf, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + crypto::EXTENSION);
        let id = random_id();
        let tpe = if i == 1 { BlobType::Tree } else { BlobType::Data };
        packer.add(tpe, id, ciphertext, None).unwrap();
        ids.push((tpe, id));
    }

    let total = packer.finalize().unwrap();
    let bytes = packer.into_inner().unwrap();
    assert_eq!(bytes.len() as u64, total);

    let (blobs, header_size) = list(&key, &bytes.as_slice(), bytes.len() as u64).unwrap();
    assert_eq!(blobs.len(), 3);
    assert_eq!(
        header_size as usize,
        3 * ENTRY_SIZE + crypto::EXTENSION + HEADER_LENGTH_SIZE
    );

    let expected = [(0u64, 74u32), (74, 33), (107, 8224)];
    for (i, blob) in blobs.iter().enumerate() {
        assert_eq!((blob.handle.tpe, blob.handle.id), ids[i], "blob {i} identity");
        assert_eq!(blob.offset, expected[i].0, "blob {i} offset");
        assert_eq!(blob.length, expected[i].1, "blob {i} length");
        assert!(blob.uncompressed_length.is_none());
    }

    // Offsets plus lengths tile the pre-header portion of the file.
    let body: u64 = blobs.iter().map(|b| u64::from(b.length)).sum();
    assert_eq!(body + u64::from(header_size), bytes.len() as u64);

    // Each body slice decrypts back to its plaintext.
    let mut pt_buf = Vec::new();
    for (i, blob) in blobs.iter().enumerate() {
        let start = blob.offset as usize;
        let slice = &bytes[start..start + blob.length as usize];
        assert_eq!(key.decrypt(&mut pt_buf, slice).unwrap(), plaintexts[i]);
    }
}

#[test]
fn compressed_entries_preserve_uncompressed_length() {
    let key = crypto::Key::random().unwrap();
    let packer = Packer::new(key.clone(), Vec::new());

    let mut ct_buf = Vec::new();
    let ciphertext = key.encrypt(&mut ct_buf, &[0x5a; 300]).unwrap();
    let id = random_id();
    packer.add(BlobType::Data, id, ciphertext, std::num::NonZeroU32::new(4096)).unwrap();
    packer.finalize().unwrap();
    let bytes = packer.into_inner().unwrap();

    let (blobs, _) = list(&key, &bytes.as_slice(), bytes.len() as u64).unwrap();
    assert_eq!(blobs[0].uncompressed_length.map(|u| u.get()), Some(4096));
    assert!(blobs[0].is_compressed());
}

fn build_pack(key: &crypto::Key, blob_count: usize) -> Vec<u8> {
    let packer = Packer::new(key.clone(), Vec::new());
    let mut ct_buf = Vec::new();
    for _ in 0..blob_count {
        let ciphertext = key.encrypt(&mut ct_buf, &[7u8; 64]).unwrap();
        packer.add(BlobType::Data, random_id(), ciphertext, None).unwrap();
    }
    packer.finalize().unwrap();
    packer.into_inner().unwrap()
}

#[test]
fn small_header_costs_one_read() {
    let key = crypto::Key::random().unwrap();
    let bytes = build_pack(&key, 3);
    let reader = CountingReader::new(&bytes);
    let (blobs, _) = list(&key, &reader, bytes.len() as u64).unwrap();
    assert_eq!(blobs.len(), 3);
    assert_eq!(reader.reads(), 1);
}

#[test]
fn eager_budget_boundary_costs_one_read() {
    // Exactly the eager budget: 15 uncompressed entries.
    let key = crypto::Key::random().unwrap();
    let bytes = build_pack(&key, 15);
    let reader = CountingReader::new(&bytes);
    let (blobs, _) = list(&key, &reader, bytes.len() as u64).unwrap();
    assert_eq!(blobs.len(), 15);
    assert_eq!(reader.reads(), 1);
}

#[test]
fn large_header_costs_two_reads() {
    let key = crypto::Key::random().unwrap();
    let bytes = build_pack(&key, 40);
    let reader = CountingReader::new(&bytes);
    let (blobs, _) = list(&key, &reader, bytes.len() as u64).unwrap();
    assert_eq!(blobs.len(), 40);
    assert_eq!(reader.reads(), 2);
}

#[test]
fn header_length_corruption_is_detected() {
    let key = crypto::Key::random().unwrap();
    let mut bytes = build_pack(&key, 2);
    let len = bytes.len();

    let invalid_file_message = |bytes: &[u8]| match list(&key, &bytes, len as u64) {
        Err(PackError::InvalidFile(msg)) => msg,
        other => panic!("expected InvalidFile, got {other:?}"),
    };

    // Zero header length: smaller than the crypto extension.
    bytes[len - 4..].copy_from_slice(&0u32.to_le_bytes());
    assert_eq!(invalid_file_message(&bytes), "header too small");

    // Below the crypto extension.
    bytes[len - 4..].copy_from_slice(&31u32.to_le_bytes());
    assert_eq!(invalid_file_message(&bytes), "header too small");

    // Larger than the file.
    bytes[len - 4..].copy_from_slice(&(len as u32).to_le_bytes());
    assert_eq!(invalid_file_message(&bytes), "header larger than file");

    // Larger than the maximum header size (and than this file).
    bytes[len - 4..].copy_from_slice(&(64 * 1024 * 1024u32).to_le_bytes());
    assert_eq!(invalid_file_message(&bytes), "header larger than file");
}

#[test]
fn tampered_header_is_unauthenticated() {
    let key = crypto::Key::random().unwrap();
    let mut bytes = build_pack(&key, 2);
    let len = bytes.len();
    // Flip a byte inside the encrypted header.
    bytes[len - 12] ^= 1;
    assert!(matches!(
        list(&key, &bytes.as_slice(), len as u64),
        Err(PackError::Crypto(crypto::CryptoError::Unauthenticated))
    ));
}

#[test]
fn truncated_file_is_invalid() {
    let key = crypto::Key::random().unwrap();
    assert!(matches!(
        list(&key, &[0u8; 10].as_slice(), 10),
        Err(PackError::InvalidFile(_))
    ));
}
