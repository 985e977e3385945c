//! Process-wide buffer pools for ciphertext staging.
//!
//! Two pools with fixed element capacities: a small one sized for typical
//! one-shot ciphertexts and a large one for the streaming paths. A borrowed
//! buffer rides inside a [`PooledBuf`] guard that hands it back on drop, so
//! every exit path, including early error returns, returns its buffer.

use std::sync::{Mutex, PoisonError};

/// Element capacity of the small pool.
pub const SMALL_BUF_SIZE: usize = 2 * 1024;

/// Element capacity of the streaming pool.
pub const STREAM_BUF_SIZE: usize = 512 * 1024;

// Buffers retained per pool; excess returns are dropped instead of growing
// the pool without bound.
const POOL_DEPTH: usize = 32;

pub(crate) struct Pool {
    bufs: Mutex<Vec<Vec<u8>>>,
    buf_capacity: usize,
}

pub(crate) static SMALL_POOL: Pool =
    Pool { bufs: Mutex::new(Vec::new()), buf_capacity: SMALL_BUF_SIZE };

pub(crate) static STREAM_POOL: Pool =
    Pool { bufs: Mutex::new(Vec::new()), buf_capacity: STREAM_BUF_SIZE };

impl Pool {
    pub(crate) fn get(&'static self) -> PooledBuf {
        let mut guard = self.bufs.lock().unwrap_or_else(PoisonError::into_inner);
        let buf = guard.pop().unwrap_or_else(|| Vec::with_capacity(self.buf_capacity));
        PooledBuf { buf, pool: self }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut guard = self.bufs.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() < POOL_DEPTH {
            guard.push(buf);
        }
    }
}

/// Borrow a pooled buffer sized for small one-shot ciphertexts.
pub fn small_buffer() -> PooledBuf {
    SMALL_POOL.get()
}

/// Borrow a pooled buffer sized for streaming payloads.
pub fn stream_buffer() -> PooledBuf {
    STREAM_POOL.get()
}

/// A buffer borrowed from a pool, returned on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: &'static Pool,
}

impl PooledBuf {
    /// The buffer as a growable vector, for use as an encryption target.
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returned_buffers_come_back_empty() {
        let mut a = SMALL_POOL.get();
        a.as_mut_vec().extend_from_slice(b"scratch");
        drop(a);

        // Every buffer handed out afterwards must be cleared, regardless of
        // which pooled allocation it is.
        for _ in 0..4 {
            assert!(SMALL_POOL.get().is_empty());
        }
    }
}
