//! Bounded byte ring used for both directions of a TCP flow.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

#[derive(Debug)]
pub struct SBuf {
    data: VecDeque<u8>,
    capacity: usize,
}

impl SBuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Change the capacity. Never drops buffered bytes.
    pub fn reserve(&mut self, capacity: usize) {
        self.capacity = capacity.max(self.data.len());
    }

    /// Append as much of `bytes` as fits; returns how much was taken.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        self.data.extend(&bytes[..n]);
        n
    }

    /// Append all of `bytes`, even past capacity. Rewritten payloads may
    /// come out longer than the window that admitted them.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend(bytes);
    }

    /// Copy `len` bytes starting `off` bytes into the ring, without
    /// consuming them.
    pub fn copy_out(&self, off: usize, len: usize, out: &mut Vec<u8>) {
        out.extend(self.data.range(off..off + len));
    }

    /// Discard `n` bytes from the front.
    pub fn drop_front(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Fill free space from `src`. `Ok(0)` means end of stream.
    pub fn read_from(&mut self, src: &mut impl Read) -> io::Result<usize> {
        let space = self.space();
        if space == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let len = self.data.len();
        self.data.resize(len + space, 0);
        let result = fill_tail(&mut self.data, len, src);
        let filled = *result.as_ref().unwrap_or(&0);
        self.data.truncate(len + filled);
        result
    }

    /// Write buffered bytes to `dst`, consuming what was written.
    pub fn write_to(&mut self, dst: &mut impl Write) -> io::Result<usize> {
        let (front, back) = self.data.as_slices();
        let mut written = dst.write(front)?;
        if written == front.len() && !back.is_empty() {
            match dst.write(back) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        self.data.drain(..written);
        Ok(written)
    }
}

/// Read into the ring past `from`, continuing across the wrap once the
/// first stretch fills.
fn fill_tail(ring: &mut VecDeque<u8>, from: usize, src: &mut impl Read) -> io::Result<usize> {
    let (front, back) = ring.as_mut_slices();
    let (first, second) = if from >= front.len() {
        (&mut back[from - front.len()..], <&mut [u8]>::default())
    } else {
        (&mut front[from..], back)
    };
    let mut n = src.read(first)?;
    if n == first.len() && !second.is_empty() {
        // An error here shows up again on the next read.
        if let Ok(more) = src.read(second) {
            n += more;
        }
    }
    Ok(n)
}
