//! Content-defined chunking with a rolling Rabin fingerprint.
//!
//! A [`Chunker`] reads a byte stream and emits chunk boundaries where the
//! Rabin fingerprint of a 64-byte sliding window, taken modulo an irreducible
//! polynomial, has its low `average_bits` bits clear. Boundaries are clamped
//! to `[min_size, max_size]`; only the final chunk of a stream may be
//! shorter. Identical content therefore produces identical chunks regardless
//! of where edits moved surrounding bytes.
//!
//! Fingerprinting uses two 256-entry tables derived from the polynomial: one
//! removes the contribution of the byte leaving the window, the other reduces
//! the digest modulo the polynomial after each shift-in. Tables are computed
//! once per polynomial and shared process-wide.
//!
//! A chunker can optionally maintain a SHA-256 over the chunk bytes in the
//! same pass, so callers addressing chunks by content hash avoid a second
//! sweep over the data.

#![deny(unsafe_code)]

use gf2poly::Pol;
use sha2::digest::FixedOutputReset;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;

/// Width of the rolling hash window in bytes.
pub const WINDOW_SIZE: usize = 64;

/// Default hard lower bound on chunk length (512 KiB).
pub const MIN_SIZE: u64 = 512 * 1024;

/// Default hard upper bound on chunk length (8 MiB).
pub const MAX_SIZE: u64 = 8 * 1024 * 1024;

/// Default log2 of the target average chunk size (~1 MiB).
pub const AVERAGE_BITS: u32 = 20;

/// Default internal read buffer size.
pub const BUF_SIZE: usize = 512 * 1024;

// Valid domain for average_bits; below this the mask degenerates, above it
// the target average exceeds any sane max_size.
const MIN_AVERAGE_BITS: u32 = 7;
const MAX_AVERAGE_BITS: u32 = 28;

/// Errors from chunker construction and chunk production.
#[derive(Debug, Error)]
pub enum ChunkerError {
    /// The supplied polynomial is reducible or has an unusable degree.
    #[error("invalid polynomial {0}")]
    InvalidPolynomial(Pol),
    /// Read failure on the underlying stream.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// The stream is exhausted; no further chunks exist.
    #[error("end of stream")]
    Eof,
    /// A parameter is outside its documented domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An earlier read failed mid-chunk; the chunker must be reset.
    #[error("chunker state invalidated by earlier read error, reset required")]
    Poisoned,
}

/// Chunking parameters. `Default` matches the 512 KiB / 8 MiB / ~1 MiB
/// regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Hard lower bound on chunk length.
    pub min_size: u64,
    /// Hard upper bound on chunk length.
    pub max_size: u64,
    /// log2 of the target average chunk size.
    pub average_bits: u32,
    /// Internal read buffer size.
    pub buf_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: MIN_SIZE,
            max_size: MAX_SIZE,
            average_bits: AVERAGE_BITS,
            buf_size: BUF_SIZE,
        }
    }
}

impl ChunkerConfig {
    fn validate(&self) -> Result<(), ChunkerError> {
        if self.min_size <= WINDOW_SIZE as u64 {
            return Err(ChunkerError::InvalidArgument(format!(
                "min_size {} must exceed the window size {WINDOW_SIZE}",
                self.min_size
            )));
        }
        if self.max_size < self.min_size {
            return Err(ChunkerError::InvalidArgument(format!(
                "max_size {} below min_size {}",
                self.max_size, self.min_size
            )));
        }
        if self.buf_size == 0 {
            return Err(ChunkerError::InvalidArgument("buf_size must be nonzero".into()));
        }
        validate_average_bits(self.average_bits)
    }
}

fn validate_average_bits(bits: u32) -> Result<(), ChunkerError> {
    if !(MIN_AVERAGE_BITS..=MAX_AVERAGE_BITS).contains(&bits) {
        return Err(ChunkerError::InvalidArgument(format!(
            "average_bits {bits} outside [{MIN_AVERAGE_BITS}, {MAX_AVERAGE_BITS}]"
        )));
    }
    Ok(())
}

/// A chunk boundary emitted by [`Chunker::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of the chunk within the stream.
    pub start: u64,
    /// Chunk length in bytes.
    pub length: u64,
    /// Fingerprint value at the cut point.
    pub cut: u64,
    /// SHA-256 of the chunk bytes, when the chunker carries a hasher.
    pub digest: Option<[u8; 32]>,
}

// Precomputed per-polynomial fingerprint tables. Immutable once built.
#[derive(Debug)]
struct Tables {
    // out[b] is the Rabin hash of b followed by WINDOW_SIZE-1 zero bytes;
    // XORing it removes b's contribution when b leaves the window.
    out: [u64; 256],
    // mod_table[i] reduces the digest modulo the polynomial after a
    // shift-in, indexed by the top 8 bits above the polynomial degree.
    mod_table: [u64; 256],
}

impl Tables {
    fn build(pol: Pol) -> Result<Self, ChunkerError> {
        let to_chunker_err = |_| ChunkerError::InvalidPolynomial(pol);
        let k = pol.deg() as u32;
        let mut out = [0u64; 256];
        for (b, slot) in out.iter_mut().enumerate() {
            let mut h = Pol::new(b as u64).rem(pol).map_err(to_chunker_err)?;
            for _ in 0..WINDOW_SIZE - 1 {
                h = Pol::new(h.bits() << 8).rem(pol).map_err(to_chunker_err)?;
            }
            *slot = h.bits();
        }
        let mut mod_table = [0u64; 256];
        for (b, slot) in mod_table.iter_mut().enumerate() {
            let shifted = (b as u64) << k;
            let rem = Pol::new(shifted).rem(pol).map_err(to_chunker_err)?;
            *slot = rem.bits() | shifted;
        }
        Ok(Self { out, mod_table })
    }
}

// Process-wide polynomial -> tables memoization. Entries are never mutated
// after insertion, so readers share plain Arcs.
static TABLE_CACHE: OnceLock<Mutex<HashMap<u64, Arc<Tables>>>> = OnceLock::new();

fn tables_for(pol: Pol) -> Result<Arc<Tables>, ChunkerError> {
    let cache = TABLE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tables) = guard.get(&pol.bits()) {
        return Ok(Arc::clone(tables));
    }
    let tables = Arc::new(Tables::build(pol)?);
    guard.insert(pol.bits(), Arc::clone(&tables));
    Ok(tables)
}

fn validate_polynomial(pol: Pol) -> Result<(), ChunkerError> {
    // The digest update indexes the mod table with the 8 bits above the
    // degree, and the table build shifts bytes up by the degree; both need
    // the degree within [8, 56]. The default key regime produces degree 53.
    if !(8..=56).contains(&pol.deg()) || !pol.irreducible() {
        return Err(ChunkerError::InvalidPolynomial(pol));
    }
    Ok(())
}

/// Content-defined chunker over a [`Read`] stream.
#[derive(Debug)]
pub struct Chunker<R> {
    rd: R,
    pol: Pol,
    pol_shift: u32,
    tables: Arc<Tables>,

    min_size: u64,
    max_size: u64,
    split_mask: u64,

    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,

    buf: Vec<u8>,
    bpos: usize,
    bmax: usize,

    // Stream position, chunk start, bytes in the current chunk, and the
    // count of bytes still exempt from fingerprinting at the chunk head.
    pos: u64,
    start: u64,
    count: u64,
    pre: u64,

    hasher: Option<Sha256>,
    poisoned: bool,
}

impl<R: Read> Chunker<R> {
    /// Create a chunker with default parameters. Fails with
    /// [`ChunkerError::InvalidPolynomial`] when `pol` is not irreducible.
    pub fn new(rd: R, pol: Pol) -> Result<Self, ChunkerError> {
        Self::with_config(rd, pol, ChunkerConfig::default())
    }

    /// Create a chunker with explicit parameters.
    pub fn with_config(rd: R, pol: Pol, config: ChunkerConfig) -> Result<Self, ChunkerError> {
        config.validate()?;
        validate_polynomial(pol)?;
        let tables = tables_for(pol)?;
        let mut chunker = Self {
            rd,
            pol,
            pol_shift: pol.deg() as u32 - 8,
            tables,
            min_size: config.min_size,
            max_size: config.max_size,
            split_mask: (1 << config.average_bits) - 1,
            window: [0; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            buf: vec![0; config.buf_size],
            bpos: 0,
            bmax: 0,
            pos: 0,
            start: 0,
            count: 0,
            pre: 0,
            hasher: None,
            poisoned: false,
        };
        chunker.start_chunk();
        Ok(chunker)
    }

    /// Compute a SHA-256 over each chunk's bytes in the same pass; the result
    /// lands in [`Chunk::digest`].
    #[must_use]
    pub fn with_digest(mut self) -> Self {
        self.hasher = Some(Sha256::new());
        self
    }

    /// Reuse this chunker's allocations for a new stream. Clears all rolling
    /// state, re-validates the polynomial, and rebuilds tables only when the
    /// polynomial changed.
    pub fn reset(&mut self, rd: R, pol: Pol) -> Result<(), ChunkerError> {
        validate_polynomial(pol)?;
        if pol != self.pol {
            self.tables = tables_for(pol)?;
            self.pol = pol;
            self.pol_shift = pol.deg() as u32 - 8;
        }
        self.rd = rd;
        self.bpos = 0;
        self.bmax = 0;
        self.pos = 0;
        self.poisoned = false;
        if let Some(hasher) = self.hasher.as_mut() {
            sha2::digest::Reset::reset(hasher);
        }
        self.start_chunk();
        Ok(())
    }

    /// Change the split mask between chunks. The new mask applies from the
    /// next chunk on; calling this mid-chunk is not possible because `next`
    /// always leaves the chunker at a chunk boundary.
    pub fn set_average_bits(&mut self, bits: u32) -> Result<(), ChunkerError> {
        validate_average_bits(bits)?;
        self.split_mask = (1 << bits) - 1;
        Ok(())
    }

    /// Polynomial this chunker fingerprints with.
    pub fn polynomial(&self) -> Pol {
        self.pol
    }

    /// Produce the next chunk, copying its bytes into `data` (cleared
    /// first). Returns [`ChunkerError::Eof`] once the stream is exhausted.
    pub fn next(&mut self, data: &mut Vec<u8>) -> Result<Chunk, ChunkerError> {
        self.produce(Some(data))
    }

    /// Produce the next chunk boundary without retaining the chunk bytes.
    /// Callers holding random access to the stream can re-read the body via
    /// [`Chunk::start`] and [`Chunk::length`].
    pub fn next_boundary(&mut self) -> Result<Chunk, ChunkerError> {
        self.produce(None)
    }

    fn produce(&mut self, mut data: Option<&mut Vec<u8>>) -> Result<Chunk, ChunkerError> {
        if self.poisoned {
            return Err(ChunkerError::Poisoned);
        }
        if let Some(data) = data.as_mut() {
            data.clear();
        }

        loop {
            if self.bpos >= self.bmax {
                let n = match self.fill_buffer() {
                    Ok(n) => n,
                    Err(e) => {
                        self.poisoned = true;
                        return Err(ChunkerError::Io(e));
                    }
                };
                if n == 0 {
                    if self.count == 0 {
                        return Err(ChunkerError::Eof);
                    }
                    // Trailing partial chunk: emit whatever accumulated with
                    // the digest as it stands.
                    return Ok(self.emit(self.digest));
                }
            }

            // Dismiss bytes at the chunk head: the fingerprint cannot cut
            // before min_size, so the first min_size - WINDOW_SIZE bytes
            // bypass the rolling hash entirely.
            if self.pre > 0 {
                let avail = self.bmax - self.bpos;
                let take = usize::try_from(self.pre).map_or(avail, |p| p.min(avail));
                self.consume(take, &mut data);
                self.pre -= take as u64;
                if self.bpos >= self.bmax {
                    continue;
                }
            }

            match self.scan() {
                Some((consumed, cut)) => {
                    self.consume(consumed, &mut data);
                    return Ok(self.emit(cut));
                }
                None => {
                    let rest = self.bmax - self.bpos;
                    self.consume(rest, &mut data);
                }
            }
        }
    }

    // Roll the fingerprint across the buffered bytes; returns the consumed
    // count and cut fingerprint when a boundary fires. Window, digest and
    // ring position live in locals so the hot loop runs on registers and the
    // slice bounds are hoisted.
    fn scan(&mut self) -> Option<(usize, u64)> {
        let tab_out = &self.tables.out;
        let tab_mod = &self.tables.mod_table;
        let pol_shift = self.pol_shift;
        let min_size = self.min_size;
        let max_size = self.max_size;
        let split_mask = self.split_mask;

        let mut window = self.window;
        let mut wpos = self.wpos;
        let mut digest = self.digest;
        let mut add = self.count;

        let buf = &self.buf[self.bpos..self.bmax];
        for (i, &b) in buf.iter().enumerate() {
            let out = window[wpos] as usize;
            window[wpos] = b;
            digest ^= tab_out[out];
            wpos += 1;
            if wpos >= WINDOW_SIZE {
                wpos = 0;
            }
            let index = ((digest >> pol_shift) & 0xff) as usize;
            digest <<= 8;
            digest |= u64::from(b);
            digest ^= tab_mod[index];

            add += 1;
            if add < min_size {
                continue;
            }
            if digest & split_mask == 0 || add >= max_size {
                return Some((i + 1, digest));
            }
        }

        self.window = window;
        self.wpos = wpos;
        self.digest = digest;
        None
    }

    // Account for `take` buffered bytes joining the current chunk.
    fn consume(&mut self, take: usize, data: &mut Option<&mut Vec<u8>>) {
        let slice = &self.buf[self.bpos..self.bpos + take];
        if let Some(data) = data.as_mut() {
            data.extend_from_slice(slice);
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(slice);
        }
        self.bpos += take;
        self.pos += take as u64;
        self.count += take as u64;
    }

    // Build the chunk descriptor for the bytes accumulated so far and prime
    // the rolling state for the next chunk.
    fn emit(&mut self, cut: u64) -> Chunk {
        let digest = self.hasher.as_mut().map(|hasher| {
            let mut out = [0u8; 32];
            out.copy_from_slice(&hasher.finalize_fixed_reset());
            out
        });
        let chunk = Chunk { start: self.start, length: self.count, cut, digest };
        self.start_chunk();
        chunk
    }

    // Reset per-chunk state: zero the window, then slide in a single one
    // byte so the digest never starts from the all-zero fixed point.
    fn start_chunk(&mut self) {
        self.window = [0; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
        self.slide(1);
        self.start = self.pos;
        self.count = 0;
        self.pre = self.min_size - WINDOW_SIZE as u64;
    }

    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos] as usize;
        self.window[self.wpos] = b;
        self.digest ^= self.tables.out[out];
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;

        let index = ((self.digest >> self.pol_shift) & 0xff) as usize;
        self.digest <<= 8;
        self.digest |= u64::from(b);
        self.digest ^= self.tables.mod_table[index];
    }

    fn fill_buffer(&mut self) -> io::Result<usize> {
        self.bpos = 0;
        self.bmax = 0;
        let mut total = 0;
        while total < self.buf.len() {
            match self.rd.read(&mut self.buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.bmax = total;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const POLY: Pol = Pol::new(0x3DA3358B4DC173);

    fn config(min: u64, max: u64, bits: u32) -> ChunkerConfig {
        ChunkerConfig { min_size: min, max_size: max, average_bits: bits, buf_size: BUF_SIZE }
    }

    #[test]
    fn rejects_reducible_polynomial() {
        let err = Chunker::new(Cursor::new(vec![]), Pol::new(0x3da3358b4dc171)).unwrap_err();
        assert!(matches!(err, ChunkerError::InvalidPolynomial(_)));
    }

    #[test]
    fn rejects_degenerate_degree() {
        // x^3 + x + 1 is irreducible but far below the usable degree range.
        let err = Chunker::new(Cursor::new(vec![]), Pol::new(0xb)).unwrap_err();
        assert!(matches!(err, ChunkerError::InvalidPolynomial(_)));
    }

    #[test]
    fn empty_stream_is_eof() {
        let mut chunker = Chunker::new(Cursor::new(vec![]), POLY).unwrap();
        let mut buf = Vec::new();
        assert!(matches!(chunker.next(&mut buf), Err(ChunkerError::Eof)));
        assert!(matches!(chunker.next(&mut buf), Err(ChunkerError::Eof)));
    }

    #[test]
    fn short_stream_is_one_chunk() {
        let data = vec![0xA5u8; 1024];
        let mut chunker =
            Chunker::with_config(Cursor::new(data.clone()), POLY, ChunkerConfig::default())
                .unwrap()
                .with_digest();
        let mut buf = Vec::new();
        let chunk = chunker.next(&mut buf).unwrap();
        assert_eq!(chunk.start, 0);
        assert_eq!(chunk.length, 1024);
        assert_eq!(buf, data);
        assert!(chunk.digest.is_some());
        assert!(matches!(chunker.next(&mut buf), Err(ChunkerError::Eof)));
    }

    #[test]
    fn zero_run_cuts_at_min_size() {
        let min = 1 << 19;
        let data = vec![0u8; 4 * min as usize];
        let mut chunker =
            Chunker::with_config(Cursor::new(data), POLY, config(min, 1 << 23, 20))
                .unwrap()
                .with_digest();
        let mut buf = Vec::new();
        let expected =
            "07854d2fef297a06ba81685e660c332de36d5d18d546927d30daad6d7fda1541";
        for i in 0..4 {
            let chunk = chunker.next(&mut buf).unwrap();
            assert_eq!(chunk.start, i * min);
            assert_eq!(chunk.length, min);
            assert_eq!(chunk.cut, 0);
            assert_eq!(hex::encode(chunk.digest.unwrap()), expected);
        }
        assert!(matches!(chunker.next(&mut buf), Err(ChunkerError::Eof)));
    }

    #[test]
    fn average_bits_domain_is_enforced() {
        let mut chunker = Chunker::new(Cursor::new(vec![]), POLY).unwrap();
        assert!(chunker.set_average_bits(19).is_ok());
        assert!(matches!(
            chunker.set_average_bits(6),
            Err(ChunkerError::InvalidArgument(_))
        ));
        assert!(matches!(
            chunker.set_average_bits(29),
            Err(ChunkerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn max_size_bounds_incompressible_runs() {
        // With a 28-bit mask over uniform bytes, cuts are overwhelmingly
        // forced by max_size.
        let mut state = 0x1234_5678_9abc_def0u64;
        let mut data = vec![0u8; 4 * 1024 * 1024];
        for b in &mut data {
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            *b = (state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 56) as u8;
        }
        let total = data.len() as u64;
        let (min, max) = (1 << 16, 1 << 18);
        let mut chunker =
            Chunker::with_config(Cursor::new(data), POLY, config(min, max, 28)).unwrap();
        let mut buf = Vec::new();
        let mut seen = 0;
        loop {
            match chunker.next(&mut buf) {
                Ok(chunk) => {
                    seen += chunk.length;
                    if seen < total {
                        assert!(chunk.length >= min);
                    }
                    assert!(chunk.length <= max);
                }
                Err(ChunkerError::Eof) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(seen, total);
    }

    #[test]
    fn read_error_poisons_until_reset() {
        struct FailingReader {
            fed: usize,
            then_error: bool,
        }
        impl Read for FailingReader {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.fed == 0 {
                    if self.then_error {
                        return Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone"));
                    }
                    return Ok(0);
                }
                let n = buf.len().min(self.fed);
                buf[..n].fill(7);
                self.fed -= n;
                Ok(n)
            }
        }

        let mut chunker = Chunker::with_config(
            FailingReader { fed: 256 * 1024, then_error: true },
            POLY,
            config(1 << 16, 1 << 18, 18),
        )
        .unwrap();
        let mut buf = Vec::new();
        // Drain until the reader dies mid-stream.
        let err = loop {
            match chunker.next(&mut buf) {
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ChunkerError::Io(_)));
        assert!(matches!(chunker.next(&mut buf), Err(ChunkerError::Poisoned)));

        chunker.reset(FailingReader { fed: 0, then_error: false }, POLY).unwrap();
        assert!(matches!(chunker.next(&mut buf), Err(ChunkerError::Eof)));
    }

    #[test]
    fn table_cache_returns_shared_tables() {
        let a = tables_for(POLY).unwrap();
        let b = tables_for(POLY).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
