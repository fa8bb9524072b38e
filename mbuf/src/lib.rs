//! Packet buffer arena for the usernet stack.
//!
//! Every in-flight packet lives in exactly one [`Mbuf`] owned by an
//! [`MbufPool`]. Callers hold [`MbufId`] handles; a handle becomes stale the
//! moment its buffer is freed, so a packet can never be reached through two
//! owners. Interior positions are expressed as [`Cursor`]s (handle plus byte
//! offset) instead of pointers, which keeps them valid across growth.

mod error;
mod pool;

pub use error::MbufError;
pub use pool::{Cursor, MbufId, MbufPool};

/// Size of the backing store of a fresh buffer: one maximum Ethernet payload
/// plus room for link and IP headers.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Bytes reserved in front of the data so lower layers can prepend headers
/// without moving the payload.
pub const HEADROOM: usize = 64;

/// One packet buffer.
///
/// The valid bytes are `buf[off..off + len]`. A buffer that had to grow past
/// [`DEFAULT_CAPACITY`] is "extended"; freeing it drops the extension.
#[derive(Debug)]
pub struct Mbuf {
    buf: Vec<u8>,
    off: usize,
    len: usize,
    extended: bool,
    release_on_free: bool,
}

impl Mbuf {
    fn new() -> Self {
        Self {
            buf: vec![0u8; DEFAULT_CAPACITY],
            off: HEADROOM,
            len: 0,
            extended: false,
            release_on_free: false,
        }
    }

    /// Return the buffer to its pristine state before recycling.
    fn reset(&mut self) {
        if self.extended {
            self.buf.truncate(DEFAULT_CAPACITY);
            self.buf.shrink_to_fit();
            self.extended = false;
        }
        self.off = HEADROOM;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total size of the backing store.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn headroom(&self) -> usize {
        self.off
    }

    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.off - self.len
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.off..self.off + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.off..self.off + self.len]
    }

    /// Make sure the valid region can hold `size` bytes without another
    /// reallocation. Bytes and read offset are preserved; a buffer that is
    /// already large enough is left untouched.
    pub fn grow(&mut self, size: usize) {
        if self.buf.len() - self.off >= size {
            return;
        }
        let new_len = self.off + size;
        tracing::trace!(from = self.buf.len(), to = new_len, "mbuf grow");
        self.buf.resize(new_len, 0);
        self.extended = true;
    }

    /// Append bytes to the tail, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.grow(self.len + bytes.len());
        let end = self.off + self.len;
        self.buf[end..end + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    /// Open `n` bytes in front of the data and return them for the caller to
    /// fill. Uses the headroom when possible, otherwise shifts the payload.
    pub fn prepend(&mut self, n: usize) -> &mut [u8] {
        if self.off < n {
            let shift = n - self.off + HEADROOM;
            self.grow(self.len + shift);
            let start = self.off;
            self.buf
                .copy_within(start..start + self.len, start + shift);
            self.off += shift;
        }
        self.off -= n;
        self.len += n;
        &mut self.buf[self.off..self.off + n]
    }

    /// Drop `n` bytes from the head when `n >= 0`, or `-n` bytes from the
    /// tail when `n < 0`. Never reallocates; trimming more than the length
    /// empties the buffer.
    pub fn trim(&mut self, n: isize) {
        let amount = n.unsigned_abs().min(self.len);
        if n >= 0 {
            self.off += amount;
        }
        self.len -= amount;
    }

    /// Shorten the valid region to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }
}
