//! Buffers that travel between the terminals, the connection state
//! machines and the fabric. Every buffer embeds a transfer context that
//! records what kind of operation it is riding on, who currently owns it
//! (the program or the NIC), and its place within a scatter-gather batch.

use crate::fabric::{MemoryRegion, Segment};
use crate::msg::{ProgressMsg, VectorMsg, PROGRESS_MSGLEN, VECTOR_MSGLEN_MAX};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

pub const PLACE_FIRST: u8 = 0x1;
pub const PLACE_LAST: u8 = 0x2;

/// Operation discriminator, recoverable from a completion's context id.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum XferKind {
    Ack,
    Fragment,
    Initial,
    Progress,
    RdmaWrite,
    Vector,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum XferOwner {
    Program,
    Nic,
}

static NEXT_XID: AtomicU64 = AtomicU64::new(1);

const XID_KIND_SHIFT: u32 = 56;

fn kind_tag(kind: XferKind) -> u64 {
    let tag = match kind {
        XferKind::Ack => 1u64,
        XferKind::Fragment => 2,
        XferKind::Initial => 3,
        XferKind::Progress => 4,
        XferKind::RdmaWrite => 5,
        XferKind::Vector => 6,
    };
    tag << XID_KIND_SHIFT
}

/// Recovers the operation kind a completion belongs to from its context id.
pub fn kind_of_xid(xid: u64) -> Option<XferKind> {
    match xid >> XID_KIND_SHIFT {
        1 => Some(XferKind::Ack),
        2 => Some(XferKind::Fragment),
        3 => Some(XferKind::Initial),
        4 => Some(XferKind::Progress),
        5 => Some(XferKind::RdmaWrite),
        6 => Some(XferKind::Vector),
        _ => None,
    }
}

/// The tag attached to every buffer handed to the NIC. The child counter is
/// shared so a fragment can decrement its parent after the parent has moved
/// to a different queue.
#[derive(Debug)]
pub struct XferContext {
    pub xid: u64,
    pub kind: XferKind,
    pub owner: XferOwner,
    pub place: u8,
    pub nchildren: Arc<AtomicU8>,
    pub cancelled: bool,
}

impl XferContext {
    pub fn new(kind: XferKind) -> XferContext {
        XferContext {
            xid: kind_tag(kind) | NEXT_XID.fetch_add(1, Ordering::Relaxed),
            kind,
            owner: XferOwner::Program,
            place: 0,
            nchildren: Arc::new(AtomicU8::new(0)),
            cancelled: false,
        }
    }
}

/// Fields common to every buffer. `raddr` is a byte offset: into the remote
/// target for RDMA targets, into the parent buffer for fragments.
#[derive(Debug)]
pub struct BufHdr {
    pub raddr: u64,
    pub nused: usize,
    pub nallocated: usize,
    pub mr: Option<MemoryRegion>,
    pub xfc: XferContext,
}

impl BufHdr {
    fn new(kind: XferKind, nallocated: usize) -> BufHdr {
        BufHdr {
            raddr: 0,
            nused: 0,
            nallocated,
            mr: None,
            xfc: XferContext::new(kind),
        }
    }
}

/// Arbitrary payload bytes; the unit of RDMA transfer.
#[derive(Debug)]
pub struct ByteBuf {
    pub hdr: BufHdr,
    pub payload: Arc<Segment>,
}

/// Carrier for one progress message.
#[derive(Debug)]
pub struct ProgBuf {
    pub hdr: BufHdr,
    pub payload: Arc<Segment>,
    pub msg: ProgressMsg,
}

/// Carrier for one vector message.
#[derive(Debug)]
pub struct VecBuf {
    pub hdr: BufHdr,
    pub payload: Arc<Segment>,
    pub msg: VectorMsg,
}

/// A borrowed sub-range of a parent payload buffer, used when the parent is
/// larger than the writable remote capacity of the current batch. Carries
/// no storage of its own (`nallocated == 0`).
#[derive(Debug)]
pub struct Fragment {
    pub hdr: BufHdr,
    pub parent_payload: Option<Arc<Segment>>,
    pub parent_children: Option<Arc<AtomicU8>>,
}

#[derive(Debug)]
pub enum Buf {
    Byte(ByteBuf),
    Prog(ProgBuf),
    Vec(VecBuf),
    Fragment(Fragment),
}

impl Buf {
    #[inline]
    pub fn hdr(&self) -> &BufHdr {
        match self {
            Buf::Byte(b) => &b.hdr,
            Buf::Prog(b) => &b.hdr,
            Buf::Vec(b) => &b.hdr,
            Buf::Fragment(b) => &b.hdr,
        }
    }

    #[inline]
    pub fn hdr_mut(&mut self) -> &mut BufHdr {
        match self {
            Buf::Byte(b) => &mut b.hdr,
            Buf::Prog(b) => &mut b.hdr,
            Buf::Vec(b) => &mut b.hdr,
            Buf::Fragment(b) => &mut b.hdr,
        }
    }

    /// The storage this buffer transfers through: its own payload, or the
    /// parent's for a fragment.
    #[inline]
    pub fn segment(&self) -> &Arc<Segment> {
        match self {
            Buf::Byte(b) => &b.payload,
            Buf::Prog(b) => &b.payload,
            Buf::Vec(b) => &b.payload,
            Buf::Fragment(f) => f
                .parent_payload
                .as_ref()
                .expect("fragment must be linked to a parent"),
        }
    }

    #[inline]
    pub fn xid(&self) -> u64 {
        self.hdr().xfc.xid
    }

    #[inline]
    pub fn kind(&self) -> XferKind {
        self.hdr().xfc.kind
    }
}

impl ByteBuf {
    /// Allocates a payload buffer of `paylen` bytes, unregistered.
    pub fn alloc(paylen: usize) -> ByteBuf {
        ByteBuf {
            hdr: BufHdr::new(XferKind::RdmaWrite, paylen),
            payload: Segment::new(paylen),
        }
    }
}

impl ProgBuf {
    pub fn alloc() -> ProgBuf {
        ProgBuf {
            hdr: BufHdr::new(XferKind::Progress, PROGRESS_MSGLEN),
            payload: Segment::new(PROGRESS_MSGLEN),
            msg: ProgressMsg::default(),
        }
    }
}

impl VecBuf {
    pub fn alloc() -> VecBuf {
        VecBuf {
            hdr: BufHdr::new(XferKind::Vector, VECTOR_MSGLEN_MAX),
            payload: Segment::new(VECTOR_MSGLEN_MAX),
            msg: VectorMsg::default(),
        }
    }
}

impl Fragment {
    pub fn alloc() -> Fragment {
        Fragment {
            hdr: BufHdr::new(XferKind::Fragment, 0),
            parent_payload: None,
            parent_children: None,
        }
    }

    /// Unlinks the fragment from its parent so the header can go back to
    /// the pool.
    pub fn unlink(&mut self) {
        self.parent_payload = None;
        self.parent_children = None;
        self.hdr.raddr = 0;
        self.hdr.nused = 0;
    }
}

/// Array-backed LIFO pool of unused buffers.
pub struct BufList {
    bufs: Vec<Buf>,
    nallocated: usize,
}

impl BufList {
    pub fn create(n: usize) -> BufList {
        BufList {
            bufs: Vec::with_capacity(n),
            nallocated: n,
        }
    }

    #[inline]
    pub fn get(&mut self) -> Option<Buf> {
        self.bufs.pop()
    }

    #[inline]
    pub fn put(&mut self, buf: Buf) -> Result<(), Buf> {
        if self.bufs.len() == self.nallocated {
            return Err(buf);
        }

        self.bufs.push(buf);
        Ok(())
    }

    #[inline]
    pub fn nfull(&self) -> usize {
        self.bufs.len()
    }

    #[inline]
    pub fn nallocated(&self) -> usize {
        self.nallocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_carries_kind() {
        let xfc = XferContext::new(XferKind::Progress);
        assert_eq!(kind_of_xid(xfc.xid), Some(XferKind::Progress));

        let xfc = XferContext::new(XferKind::RdmaWrite);
        assert_eq!(kind_of_xid(xfc.xid), Some(XferKind::RdmaWrite));

        assert_eq!(kind_of_xid(0), None);
    }

    #[test]
    fn test_xids_are_unique() {
        let a = XferContext::new(XferKind::Vector);
        let b = XferContext::new(XferKind::Vector);
        assert_ne!(a.xid, b.xid);
    }

    #[test]
    fn test_buflist_is_lifo_and_bounded() {
        let mut bl = BufList::create(2);

        bl.put(Buf::Byte(ByteBuf::alloc(8))).unwrap();
        bl.put(Buf::Byte(ByteBuf::alloc(16))).unwrap();
        assert!(bl.put(Buf::Byte(ByteBuf::alloc(24))).is_err());

        assert_eq!(bl.get().unwrap().hdr().nallocated, 16);
        assert_eq!(bl.get().unwrap().hdr().nallocated, 8);
        assert!(bl.get().is_none());
    }

    #[test]
    fn test_fragment_shares_parent_storage() {
        let parent = ByteBuf::alloc(32);
        parent.payload.fill(0, b"0123456789");

        let mut frag = Fragment::alloc();
        frag.parent_payload = Some(parent.payload.clone());
        frag.parent_children = Some(parent.hdr.xfc.nchildren.clone());
        frag.hdr.raddr = 4;
        frag.hdr.nused = 3;
        parent.hdr.xfc.nchildren.fetch_add(1, Ordering::Relaxed);

        let buf = Buf::Fragment(frag);
        assert_eq!(buf.segment().copy_out(4, 3), b"456".to_vec());
        assert_eq!(buf.hdr().nallocated, 0);
        assert_eq!(parent.hdr.xfc.nchildren.load(Ordering::Relaxed), 1);
    }
}
