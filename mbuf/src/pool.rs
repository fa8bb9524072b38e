use crate::{Mbuf, MbufError};

/// Handle to a live buffer. Generational: a handle to a freed slot never
/// resolves again, even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MbufId {
    index: u32,
    generation: u32,
}

/// A position inside a buffer's valid data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub id: MbufId,
    pub offset: usize,
}

impl Cursor {
    pub fn new(id: MbufId, offset: usize) -> Self {
        Self { id, offset }
    }

    pub fn advance(self, n: usize) -> Self {
        Self {
            id: self.id,
            offset: self.offset + n,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    mbuf: Option<Mbuf>,
}

/// Pool of packet buffers with a recycling free list.
///
/// Buffers created while more than `high_water` exist are tagged to be
/// released on free instead of recycled, so bursts do not pin memory.
/// `limit` caps the number of buffers in existence.
#[derive(Debug)]
pub struct MbufPool {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    free_list: Vec<Mbuf>,
    allocated: usize,
    live: usize,
    high_water: usize,
    limit: usize,
}

impl MbufPool {
    pub fn new(high_water: usize, limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            free_list: Vec::new(),
            allocated: 0,
            live: 0,
            high_water,
            limit: limit.max(1),
        }
    }

    /// Get a zero-length buffer, recycled when possible.
    pub fn allocate(&mut self) -> Result<MbufId, MbufError> {
        let mbuf = match self.free_list.pop() {
            Some(m) => m,
            None => {
                if self.allocated >= self.limit {
                    tracing::debug!(limit = self.limit, "mbuf pool exhausted");
                    return Err(MbufError::Exhausted { limit: self.limit });
                }
                self.allocated += 1;
                let mut m = Mbuf::new();
                m.release_on_free = self.allocated > self.high_water;
                m
            }
        };
        self.live += 1;
        Ok(self.insert(mbuf))
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn allocate_from(&mut self, bytes: &[u8]) -> Result<MbufId, MbufError> {
        let id = self.allocate()?;
        if let Some(m) = self.get_mut(id) {
            m.append(bytes);
        }
        Ok(id)
    }

    fn insert(&mut self, mbuf: Mbuf) -> MbufId {
        match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.mbuf = Some(mbuf);
                MbufId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    mbuf: Some(mbuf),
                });
                MbufId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn take(&mut self, id: MbufId) -> Result<Mbuf, MbufError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .ok_or(MbufError::Stale)?;
        let mbuf = slot.mbuf.take().ok_or(MbufError::Stale)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        self.live -= 1;
        Ok(mbuf)
    }

    /// Release a buffer: its extension is dropped, then it is either put back
    /// on the free list or released for good, depending on its tag.
    pub fn free(&mut self, id: MbufId) -> Result<(), MbufError> {
        let mut mbuf = self.take(id)?;
        if mbuf.release_on_free {
            self.allocated -= 1;
            return Ok(());
        }
        mbuf.reset();
        self.free_list.push(mbuf);
        Ok(())
    }

    pub fn get(&self, id: MbufId) -> Option<&Mbuf> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.mbuf.as_ref())
    }

    pub fn get_mut(&mut self, id: MbufId) -> Option<&mut Mbuf> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.mbuf.as_mut())
    }

    pub fn data(&self, id: MbufId) -> &[u8] {
        self.get(id).map(Mbuf::data).unwrap_or(&[])
    }

    /// Grow the valid-region capacity of `id` to at least `size` bytes.
    pub fn grow(&mut self, id: MbufId, size: usize) -> Result<(), MbufError> {
        self.get_mut(id).ok_or(MbufError::Stale)?.grow(size);
        Ok(())
    }

    /// Append the bytes of `src` to `dst`. `src` is consumed even when `dst`
    /// turns out to be stale.
    pub fn concatenate(&mut self, dst: MbufId, src: MbufId) -> Result<(), MbufError> {
        if dst == src {
            return Err(MbufError::SelfConcatenate);
        }
        let src_buf = self.take(src)?;
        let result = match self.get_mut(dst) {
            Some(d) => {
                d.append(src_buf.data());
                Ok(())
            }
            None => Err(MbufError::Stale),
        };
        self.recycle(src_buf);
        result
    }

    fn recycle(&mut self, mut mbuf: Mbuf) {
        if mbuf.release_on_free {
            self.allocated -= 1;
        } else {
            mbuf.reset();
            self.free_list.push(mbuf);
        }
    }

    pub fn trim(&mut self, id: MbufId, n: isize) -> Result<(), MbufError> {
        self.get_mut(id).ok_or(MbufError::Stale)?.trim(n);
        Ok(())
    }

    /// Recover the buffer that owns an interior position. Stale handles and
    /// offsets outside the valid data resolve to `None`.
    pub fn locate_owner(&self, cursor: Cursor) -> Option<MbufId> {
        let m = self.get(cursor.id)?;
        (cursor.offset <= m.len()).then_some(cursor.id)
    }

    /// Buffers currently handed out.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Buffers waiting on the free list.
    pub fn recycled(&self) -> usize {
        self.free_list.len()
    }

    /// Buffers in existence, live or recycled.
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl Default for MbufPool {
    fn default() -> Self {
        Self::new(256, 4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_recycles() {
        let mut pool = MbufPool::new(4, 8);
        let a = pool.allocate().unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.recycled(), 1);
        let b = pool.allocate().unwrap();
        assert_eq!(pool.recycled(), 0);
        assert_eq!(pool.allocated(), 1);
        assert!(pool.get(b).unwrap().is_empty());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut pool = MbufPool::new(4, 8);
        let a = pool.allocate_from(b"hello").unwrap();
        pool.free(a).unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.get(a).is_none());
        assert_eq!(pool.free(a), Err(MbufError::Stale));
        assert!(pool.get(b).is_some());
    }

    #[test]
    fn test_high_water_releases_instead_of_recycling() {
        let mut pool = MbufPool::new(2, 8);
        let ids: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.allocated(), 4);
        for id in ids {
            pool.free(id).unwrap();
        }
        assert_eq!(pool.recycled(), 2);
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_limit_exhausts() {
        let mut pool = MbufPool::new(1, 2);
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert_eq!(pool.allocate(), Err(MbufError::Exhausted { limit: 2 }));
    }

    #[test]
    fn test_concatenate_consumes_source() {
        let mut pool = MbufPool::new(8, 8);
        let a = pool.allocate_from(b"abc").unwrap();
        let b = pool.allocate_from(b"def").unwrap();
        pool.concatenate(a, b).unwrap();
        assert_eq!(pool.data(a), b"abcdef");
        assert!(pool.get(b).is_none());
        assert_eq!(pool.live(), 1);
        assert_eq!(pool.concatenate(a, a), Err(MbufError::SelfConcatenate));
    }

    #[test]
    fn test_concatenate_grows_destination() {
        let mut pool = MbufPool::new(8, 8);
        let a = pool.allocate_from(&vec![1u8; 1500]).unwrap();
        let b = pool.allocate_from(&vec![2u8; 1500]).unwrap();
        pool.concatenate(a, b).unwrap();
        let m = pool.get(a).unwrap();
        assert_eq!(m.len(), 3000);
        assert!(m.is_extended());
        pool.free(a).unwrap();
        assert_eq!(pool.recycled(), 2);
    }

    #[test]
    fn test_locate_owner() {
        let mut pool = MbufPool::new(8, 8);
        let a = pool.allocate_from(b"0123456789").unwrap();
        assert_eq!(pool.locate_owner(Cursor::new(a, 4)), Some(a));
        assert_eq!(pool.locate_owner(Cursor::new(a, 11)), None);
        pool.grow(a, 4096).unwrap();
        assert_eq!(pool.locate_owner(Cursor::new(a, 4).advance(2)), Some(a));
        pool.free(a).unwrap();
        assert_eq!(pool.locate_owner(Cursor::new(a, 0)), None);
    }
}
