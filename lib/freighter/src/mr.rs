//! Memory-registration helpers: key allocation and the small conveniences
//! for registering buffers and I/O vectors.

use crate::buffer::Buf;
use crate::fabric::{Domain, LocalIov, MemoryRegion};
use crate::support::TransferResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Keys below this value are never handed out; leaves room for providers
/// that reserve a low range.
const KEY_POOL_BASE: u64 = 512;

/// How many keys a key source draws from the global pool at a time.
const KEY_WINDOW: u64 = 256;

static NEXT_KEY_POOL: AtomicU64 = AtomicU64::new(KEY_POOL_BASE);

/// Allocates registration keys. Each source draws 256-key windows from a
/// process-global monotonic pool, so keys never collide across sessions or
/// workers.
pub struct KeySource {
    next_key: u64,
}

impl KeySource {
    pub fn new() -> KeySource {
        KeySource { next_key: 0 }
    }

    pub fn next(&mut self) -> u64 {
        if self.next_key % KEY_WINDOW == 0 {
            self.next_key = NEXT_KEY_POOL.fetch_add(KEY_WINDOW, Ordering::Relaxed);
        }

        let key = self.next_key;
        self.next_key += 1;
        key
    }
}

/// Registers a buffer's storage and stores the handle on its header.
pub fn buf_mr_reg(
    domain: &Domain,
    access: u64,
    key: u64,
    buf: &mut Buf,
) -> TransferResult<()> {
    let seg = buf.segment().clone();
    let mr = domain.mr_reg(&seg, access, key)?;

    buf.hdr_mut().mr = Some(mr);
    Ok(())
}

/// Drops a buffer's registration.
pub fn buf_mr_dereg(buf: &mut Buf) {
    buf.hdr_mut().mr = None;
}

/// Registers the I/O vector `iovs` in chunks of at most `maxsegs` segments.
/// Segments within one chunk share a registration handle and key; the
/// returned remote-address offsets accumulate from the start of each chunk.
pub fn mr_regv_all(
    domain: &Domain,
    iovs: &[LocalIov],
    maxsegs: usize,
    access: u64,
    keys: &mut KeySource,
) -> TransferResult<(Vec<Arc<MemoryRegion>>, Vec<u64>)> {
    let mut mrs = Vec::with_capacity(iovs.len());
    let mut raddrs = Vec::with_capacity(iovs.len());

    for chunk in iovs.chunks(maxsegs) {
        let mr = Arc::new(domain.mr_reg(&chunk[0].seg, access, keys.next())?);
        let mut raddr = 0u64;

        for iov in chunk {
            mrs.push(mr.clone());
            raddrs.push(raddr);
            raddr += iov.len as u64;
        }
    }

    Ok((mrs, raddrs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buf, ByteBuf};
    use crate::fabric::{Segment, ACCESS_RECV, ACCESS_REMOTE_WRITE};

    #[test]
    fn test_keysource_draws_disjoint_windows() {
        let mut a = KeySource::new();
        let mut b = KeySource::new();

        let first_a = a.next();
        let first_b = b.next();

        assert!(first_a >= KEY_POOL_BASE);
        assert!(first_b >= KEY_POOL_BASE);
        assert_ne!(first_a, first_b);

        // Keys within one source are consecutive inside a window.
        assert_eq!(a.next(), first_a + 1);

        // Exhausting a window moves to a fresh one without collisions.
        let mut seen = std::collections::HashSet::new();
        let mut src = KeySource::new();
        for _ in 0..(KEY_WINDOW * 3) {
            assert!(seen.insert(src.next()));
        }
    }

    #[test]
    fn test_buf_registration_lifecycle() {
        let dom = Domain::new();
        let mut keys = KeySource::new();
        let mut buf = Buf::Byte(ByteBuf::alloc(31));

        buf_mr_reg(&dom, ACCESS_RECV | ACCESS_REMOTE_WRITE, keys.next(), &mut buf).unwrap();
        assert!(buf.hdr().mr.is_some());
        assert_eq!(dom.registrations(), 1);

        buf_mr_dereg(&mut buf);
        assert!(buf.hdr().mr.is_none());
        assert_eq!(dom.registrations(), 0);
    }

    #[test]
    fn test_regv_all_chunks_share_handles() {
        let dom = Domain::new();
        let mut keys = KeySource::new();
        let seg = Segment::new(64);

        let iovs: Vec<LocalIov> = [10usize, 20, 30, 4, 16]
            .iter()
            .map(|&len| LocalIov {
                seg: seg.clone(),
                offset: 0,
                len,
            })
            .collect();

        let (mrs, raddrs) = mr_regv_all(&dom, &iovs, 2, ACCESS_RECV, &mut keys).unwrap();

        assert_eq!(mrs.len(), 5);
        assert_eq!(raddrs, vec![0, 10, 0, 30, 0]);

        // ceil(5/2) == 3 registrations; chunk members share one handle.
        assert_eq!(dom.registrations(), 3);
        assert_eq!(mrs[0].key(), mrs[1].key());
        assert_eq!(mrs[2].key(), mrs[3].key());
        assert_ne!(mrs[1].key(), mrs[2].key());

        drop(mrs);
        assert_eq!(dom.registrations(), 0);
    }
}
