//! IP fragment reassembly.

use crate::wire::{IP_MAXPACKET, Ipv4Header, patch_ip_header};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use usernet_mbuf::{Cursor, MbufId, MbufPool};

/// Slow ticks a partial datagram may wait for its missing fragments.
pub const FRAG_TTL: u8 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragKey {
    pub id: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
}

impl FragKey {
    pub fn of(ip: &Ipv4Header) -> Self {
        Self {
            id: ip.id,
            src: ip.src,
            dst: ip.dst,
            proto: ip.proto,
        }
    }
}

/// One queued fragment. `data` points at its first payload byte.
#[derive(Debug, Clone, Copy)]
struct Fragment {
    offset: usize,
    len: usize,
    more: bool,
    data: Cursor,
}

impl Fragment {
    fn end(&self) -> usize {
        self.offset + self.len
    }
}

#[derive(Debug)]
struct FragQueue {
    ttl: u8,
    /// Ordered by offset, never overlapping.
    fragments: Vec<Fragment>,
}

#[derive(Debug)]
pub struct Reassembly {
    queues: HashMap<FragKey, FragQueue>,
    max_queues: usize,
}

impl Reassembly {
    pub fn new(max_queues: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_queues,
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queue the fragment held in `m` (header included). Returns the whole
    /// datagram, with a rebuilt header, once the last hole is filled.
    pub fn insert(&mut self, pool: &mut MbufPool, m: MbufId, ip: &Ipv4Header) -> Option<MbufId> {
        let mut frag = Fragment {
            offset: ip.frag_offset(),
            len: ip.payload_len(),
            more: ip.more_fragments(),
            data: Cursor::new(m, ip.header_len),
        };
        if ip.header_len + frag.end() > IP_MAXPACKET {
            tracing::trace!(id = ip.id, "oversized fragment");
            let _ = pool.free(m);
            return None;
        }

        let key = FragKey::of(ip);
        if !self.queues.contains_key(&key) && self.queues.len() >= self.max_queues {
            tracing::debug!(id = ip.id, src = %ip.src, "reassembly table full");
            let _ = pool.free(m);
            return None;
        }
        let q = self.queues.entry(key).or_insert_with(|| FragQueue {
            ttl: FRAG_TTL,
            fragments: Vec::new(),
        });

        let pos = q
            .fragments
            .iter()
            .position(|f| f.offset > frag.offset)
            .unwrap_or(q.fragments.len());

        if pos > 0 {
            let prev = q.fragments[pos - 1];
            if prev.end() > frag.offset {
                let overlap = prev.end() - frag.offset;
                if overlap >= frag.len {
                    let _ = pool.free(m);
                    return None;
                }
                frag.offset += overlap;
                frag.len -= overlap;
                frag.data = frag.data.advance(overlap);
            }
        }

        while pos < q.fragments.len() {
            let next = &mut q.fragments[pos];
            if frag.end() <= next.offset {
                break;
            }
            let overlap = frag.end() - next.offset;
            if overlap < next.len {
                next.offset += overlap;
                next.len -= overlap;
                next.data = next.data.advance(overlap);
                break;
            }
            let covered = q.fragments.remove(pos);
            let _ = pool.free(covered.data.id);
        }
        q.fragments.insert(pos, frag);

        if !Self::complete(&q.fragments) {
            return None;
        }
        let q = self.queues.remove(&key)?;
        Self::join(pool, q.fragments)
    }

    fn complete(fragments: &[Fragment]) -> bool {
        let mut next = 0;
        for f in fragments {
            if f.offset != next {
                return false;
            }
            next = f.end();
        }
        fragments.last().is_some_and(|f| !f.more)
    }

    fn join(pool: &mut MbufPool, fragments: Vec<Fragment>) -> Option<MbufId> {
        let mut iter = fragments.into_iter();
        let first = iter.next()?;
        let head = pool.locate_owner(first.data)?;
        let hlen = first.data.offset;
        pool.get_mut(head)?.truncate(hlen + first.len);
        let mut total = hlen + first.len;
        for f in iter {
            let Some(id) = pool.locate_owner(f.data) else {
                continue;
            };
            if let Some(mbuf) = pool.get_mut(id) {
                mbuf.trim(f.data.offset as isize);
                mbuf.truncate(f.len);
            }
            if pool.concatenate(head, id).is_err() {
                let _ = pool.free(head);
                return None;
            }
            total += f.len;
        }
        let mbuf = pool.get_mut(head)?;
        patch_ip_header(&mut mbuf.data_mut()[..hlen], total, 0);
        tracing::trace!(len = total, "datagram reassembled");
        Some(head)
    }

    /// One slow tick: age every queue and free the ones that ran out.
    pub fn slowtimo(&mut self, pool: &mut MbufPool) {
        self.queues.retain(|key, q| {
            q.ttl = q.ttl.saturating_sub(1);
            if q.ttl > 0 {
                return true;
            }
            tracing::debug!(id = key.id, src = %key.src, "reassembly timed out");
            for f in q.fragments.drain(..) {
                let _ = pool.free(f.data.id);
            }
            false
        });
    }

    /// Free every queued fragment.
    pub fn clear(&mut self, pool: &mut MbufPool) {
        for (_, q) in self.queues.drain() {
            for f in q.fragments {
                let _ = pool.free(f.data.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{IP_HLEN, IP_MF, IP_PROTO_UDP};

    fn payload() -> Vec<u8> {
        (0..48u8).collect()
    }

    fn fragment(pool: &mut MbufPool, offset: usize, len: usize, more: bool) -> (MbufId, Ipv4Header) {
        let data = payload();
        let ip = Ipv4Header {
            header_len: IP_HLEN,
            tos: 0,
            total_len: IP_HLEN + len,
            id: 77,
            frag: (offset / 8) as u16 | if more { IP_MF } else { 0 },
            ttl: 64,
            proto: IP_PROTO_UDP,
            src: Ipv4Addr::new(10, 0, 2, 15),
            dst: Ipv4Addr::new(10, 0, 2, 2),
        };
        let mut bytes = vec![0u8; IP_HLEN];
        ip.emit(&mut bytes);
        bytes.extend_from_slice(&data[offset..offset + len]);
        (pool.allocate_from(&bytes).unwrap(), ip)
    }

    fn run(order: &[usize]) -> Vec<u8> {
        let pieces = [(0, 16, true), (16, 16, true), (32, 16, false)];
        let mut pool = MbufPool::default();
        let mut reass = Reassembly::new(4);
        let mut done = None;
        for (i, &idx) in order.iter().enumerate() {
            let (off, len, more) = pieces[idx];
            let (m, ip) = fragment(&mut pool, off, len, more);
            let out = reass.insert(&mut pool, m, &ip);
            if i + 1 < order.len() {
                assert!(out.is_none(), "delivered before the last fragment");
            } else {
                done = out;
            }
        }
        let id = done.expect("datagram not reassembled");
        let bytes = pool.data(id).to_vec();
        pool.free(id).unwrap();
        assert_eq!(pool.live(), 0);
        assert!(reass.is_empty());
        bytes
    }

    #[test]
    fn test_every_order_yields_same_datagram() {
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        let reference = run(&orders[0]);
        assert_eq!(&reference[IP_HLEN..], &payload()[..]);
        let ip = Ipv4Header::parse(&reference).unwrap();
        assert_eq!(ip.total_len, IP_HLEN + 48);
        assert!(!ip.is_fragment());
        assert_eq!(crate::wire::checksum(&reference[..IP_HLEN]), 0);
        for order in &orders[1..] {
            assert_eq!(run(order), reference);
        }
    }

    #[test]
    fn test_overlap_trims_new_fragment() {
        let mut pool = MbufPool::default();
        let mut reass = Reassembly::new(4);
        let (m, ip) = fragment(&mut pool, 0, 24, true);
        assert!(reass.insert(&mut pool, m, &ip).is_none());
        let (m, ip) = fragment(&mut pool, 16, 32, false);
        let id = reass.insert(&mut pool, m, &ip).unwrap();
        assert_eq!(&pool.data(id)[IP_HLEN..], &payload()[..]);
    }

    #[test]
    fn test_covered_successor_freed() {
        let mut pool = MbufPool::default();
        let mut reass = Reassembly::new(4);
        let (m, ip) = fragment(&mut pool, 16, 8, true);
        reass.insert(&mut pool, m, &ip);
        let (m, ip) = fragment(&mut pool, 8, 24, true);
        reass.insert(&mut pool, m, &ip);
        assert_eq!(pool.live(), 1);
        let (m, ip) = fragment(&mut pool, 0, 8, true);
        reass.insert(&mut pool, m, &ip);
        let (m, ip) = fragment(&mut pool, 32, 16, false);
        let id = reass.insert(&mut pool, m, &ip).unwrap();
        assert_eq!(&pool.data(id)[IP_HLEN..], &payload()[..]);
    }

    #[test]
    fn test_expiry_frees_everything() {
        let mut pool = MbufPool::default();
        let mut reass = Reassembly::new(4);
        let (m, ip) = fragment(&mut pool, 0, 16, true);
        reass.insert(&mut pool, m, &ip);
        let (m, ip) = fragment(&mut pool, 32, 16, false);
        reass.insert(&mut pool, m, &ip);
        for _ in 0..FRAG_TTL {
            reass.slowtimo(&mut pool);
        }
        assert!(reass.is_empty());
        assert_eq!(pool.live(), 0);

        // The missing piece arriving late starts a fresh, incomplete queue.
        let (m, ip) = fragment(&mut pool, 16, 16, true);
        assert!(reass.insert(&mut pool, m, &ip).is_none());
    }

    #[test]
    fn test_queue_limit() {
        let mut pool = MbufPool::default();
        let mut reass = Reassembly::new(1);
        let (m, ip) = fragment(&mut pool, 0, 16, true);
        reass.insert(&mut pool, m, &ip);
        let (m, mut ip) = fragment(&mut pool, 0, 16, true);
        ip.id = 78;
        assert!(reass.insert(&mut pool, m, &ip).is_none());
        assert_eq!(reass.len(), 1);
        assert_eq!(pool.live(), 1);
    }
}
