//! Transmitter side of a session: opens with the initial message, turns
//! received vector advertisements into one-sided writes, fragments payload
//! buffers that straddle the advertised capacity, and reports progress
//! until both sides have seen EOF.

use crate::buffer::{
    kind_of_xid, Buf, BufList, Fragment, ProgBuf, VecBuf, XferContext, XferKind, XferOwner,
    PLACE_FIRST, PLACE_LAST,
};
use crate::ctl::{fifo_cancel, RxCtl, TxCtl};
use crate::fabric::{
    AddressVector, AvIndex, Completion, CompletionQueue, Domain, Endpoint, LocalIov, MemoryRegion,
    RemoteIov, Segment, ACCESS_RECV, ACCESS_SEND, DESIRED_RX_FLAGS,
};
use crate::fifo::Fifo;
use crate::logging::{self, Logger};
use crate::mr::buf_mr_reg;
use crate::msg::{AckMsg, InitialMsg, ProgressMsg, VectorMsg, ACK_MSGLEN, INITIAL_MSGLEN,
    PROGRESS_MSGLEN, VECTOR_IOVS_MAX};
use crate::session::{Cxn, CxnCore, SessionQueues};
use crate::support::{ErrorType, LoopCtl, TransferError, TransferResult};
use crate::worker::WorkerCtx;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const PROG_POOL_SIZE: usize = 16;
const FRAGMENT_POOL_SIZE: usize = 64;
const CTL_FIFO_SIZE: usize = 64;

pub struct Xmtr {
    core: CxnCore,
    domain: Domain,
    /// Posted RDMA writes, in order of issuance.
    wrposted: Fifo<Buf>,
    /// Bytes written and completed since the last progress message.
    bytes_progress: usize,
    vec: RxCtl,
    progress: TxCtl,
    initial_seg: Arc<Segment>,
    _initial_mr: MemoryRegion,
    initial_xfc: XferContext,
    ack_seg: Arc<Segment>,
    _ack_mr: MemoryRegion,
    ack_xfc: XferContext,
    /// Two remote-IOV accumulators; `phase` selects the active one so a
    /// new batch can be composed while the previous write drains.
    riovs: [Vec<RemoteIov>; 2],
    next_riov: usize,
    phase: bool,
    frag_pool: BufList,
    frag_offset: usize,
    rcvd_ack: bool,
}

impl Xmtr {
    /// Builds a transmitter on an enabled endpoint addressed at the
    /// getter's listening endpoint. Posts the receive for the
    /// acknowledgement before anything is sent.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        domain: &Domain,
        ep: Endpoint,
        av: Arc<AddressVector>,
        peer: AvIndex,
        nsources: u32,
        id: u32,
        log: L,
    ) -> TransferResult<Xmtr> {
        let xmtr_log = match log.into() {
            Some(log) => log.new(logging::o!("cxn" => "xmtr", "id" => id)),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        let mut core = CxnCore::new(ep, av, peer, xmtr_log);

        let initial_seg = Segment::new(INITIAL_MSGLEN);
        InitialMsg {
            nonce: rand::random(),
            nsources,
            id,
            addr: core.ep.addr().to_vec(),
        }
        .encode(&initial_seg);

        let initial_mr = domain.mr_reg(&initial_seg, ACCESS_SEND, core.keys.next())?;

        let ack_seg = Segment::new(ACK_MSGLEN);
        let ack_mr = domain.mr_reg(&ack_seg, ACCESS_RECV, core.keys.next())?;
        let ack_xfc = XferContext::new(XferKind::Ack);

        core.ep.post_recv(ack_xfc.xid, &ack_seg, ACK_MSGLEN)?;

        let mut progress = TxCtl::new(CTL_FIFO_SIZE, PROG_POOL_SIZE);

        for _ in 0..PROG_POOL_SIZE {
            let mut pb = Buf::Prog(ProgBuf::alloc());

            buf_mr_reg(domain, ACCESS_SEND, core.keys.next(), &mut pb)?;

            progress
                .pool
                .put(pb)
                .map_err(|_| TransferError::Fatal(ErrorType::PoolExhausted))?;
        }

        let mut frag_pool = BufList::create(FRAGMENT_POOL_SIZE);

        for _ in 0..FRAGMENT_POOL_SIZE {
            frag_pool
                .put(Buf::Fragment(Fragment::alloc()))
                .map_err(|_| TransferError::Fatal(ErrorType::PoolExhausted))?;
        }

        Ok(Xmtr {
            core,
            domain: domain.clone(),
            wrposted: Fifo::new(CTL_FIFO_SIZE),
            bytes_progress: 0,
            vec: RxCtl::new(CTL_FIFO_SIZE),
            progress,
            initial_seg,
            _initial_mr: initial_mr,
            initial_xfc: XferContext::new(XferKind::Initial),
            ack_seg,
            _ack_mr: ack_mr,
            ack_xfc,
            riovs: [Vec::new(), Vec::new()],
            next_riov: 0,
            phase: false,
            frag_pool,
            frag_offset: 0,
            rcvd_ack: false,
        })
    }

    fn initial_send(&mut self) -> LoopCtl {
        self.initial_xfc.owner = XferOwner::Nic;
        self.initial_xfc.place = PLACE_FIRST | PLACE_LAST;
        self.initial_xfc.cancelled = false;

        match self.core.ep.send(
            &self.core.av,
            self.core.peer,
            &self.initial_seg,
            INITIAL_MSGLEN,
            self.initial_xfc.xid,
        ) {
            Ok(()) => {
                logging::debug!(self.core.log, "initial message sent"; "context" => "initial");
                self.core.sent_first = true;
                LoopCtl::Continue
            }
            Err(TransferError::Wait) => {
                logging::trace!(self.core.log, "deferred transmission"; "context" => "initial");
                LoopCtl::Continue
            }
            Err(_) => LoopCtl::Error,
        }
    }

    /// First started turn: hand the source a full ring of empty payload
    /// buffers to fill.
    fn start(&mut self, w: &mut WorkerCtx, q: &mut SessionQueues) -> LoopCtl {
        self.core.started = true;

        while !q.ready_for_terminal.full() {
            let mut b = match w.payload_txbuf_get() {
                Some(b) => b,
                None => {
                    logging::error!(self.core.log, "could not get a buffer"; "context" => "start");
                    return LoopCtl::Error;
                }
            };

            b.hdr_mut().nused = 0;

            if q.ready_for_terminal.put(b).is_err() {
                return LoopCtl::Error;
            }
        }

        LoopCtl::Continue
    }

    /// The acknowledgement names the getter's active endpoint: switch the
    /// peer address over to it and arm the vector-message receive ring.
    fn ack_rx_process(&mut self, cmpl: &Completion) -> TransferResult<()> {
        if cmpl.flags & DESIRED_RX_FLAGS != DESIRED_RX_FLAGS {
            return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion));
        }

        if cmpl.len != ACK_MSGLEN {
            return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion));
        }

        let ack = self
            .ack_seg
            .with(|mem| AckMsg::decode(&mem[..ACK_MSGLEN]))?;

        self.core.peer = self.core.av.insert(&ack.addr);

        logging::debug!(self.core.log, "acknowledged"; "context" => "ack");

        while !self.vec.posted.full() {
            let mut vb = Buf::Vec(VecBuf::alloc());

            buf_mr_reg(&self.domain, ACCESS_RECV, self.core.keys.next(), &mut vb)?;
            self.vec.post(&self.core.ep, vb)?;
        }

        self.rcvd_ack = true;

        Ok(())
    }

    fn vector_rx_process(&mut self, cmpl: &Completion) -> TransferResult<()> {
        let mut vb = self.vec.complete(cmpl)?;

        if vb.hdr().xfc.cancelled {
            return Ok(());
        }

        let msg = vb
            .segment()
            .with(|mem| VectorMsg::decode(&mem[..vb.hdr().nused]))?;

        if let Buf::Vec(v) = &mut vb {
            v.msg = msg;
        }

        self.vec
            .rcvd
            .put(vb)
            .map_err(|_| TransferError::Fatal(ErrorType::PoolExhausted))?;

        Ok(())
    }

    /// Copies entries from the vector at the head of `vec.rcvd` into the
    /// active remote-IOV accumulator and reposts the buffer once drained.
    /// An empty vector is the peer's EOF.
    fn vecbuf_unload(&mut self) -> TransferResult<()> {
        let active = self.phase as usize;

        let msg = match self.vec.rcvd.peek() {
            Some(Buf::Vec(v)) => v.msg.clone(),
            Some(_) => return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion)),
            None => return Ok(()),
        };

        if !self.core.eof_remote && msg.iovs.is_empty() {
            logging::debug!(self.core.log, "received remote EOF"; "context" => "vector");
            self.core.eof_remote = true;
        }

        let mut i = self.next_riov;

        while i < msg.iovs.len() && self.riovs[active].len() < VECTOR_IOVS_MAX {
            logging::trace!(self.core.log, "received vector entry";
                            "context" => "vector",
                            "addr" => msg.iovs[i].addr,
                            "len" => msg.iovs[i].len,
                            "key" => msg.iovs[i].key);

            self.riovs[active].push(msg.iovs[i]);
            i += 1;
        }

        if i == msg.iovs.len() {
            let vb = self.vec.rcvd.get().unwrap();
            self.vec.post(&self.core.ep, vb)?;
            self.next_riov = 0;
        } else {
            self.next_riov = i;
        }

        Ok(())
    }

    /// Takes payload buffers off the session queue while their cumulative
    /// length fits the remote capacity selected for one scatter-gather
    /// write. A head buffer larger than the remaining capacity is
    /// fragmented, but only when no further remote vectors are expected,
    /// so a fragmented buffer never straddles two vector deliveries.
    fn targets_write(&mut self, q: &mut SessionQueues, w: &mut WorkerCtx) -> LoopCtl {
        let active = self.phase as usize;
        let rma_maxsegs = w.params.rma_maxsegs();
        let maxriovs = rma_maxsegs.min(self.riovs[active].len());
        let maxbytes: usize = self.riovs[active][..maxriovs]
            .iter()
            .map(|r| r.len as usize)
            .sum();
        let riovs_maxed_out = self.riovs[active].len() >= rma_maxsegs;

        let mut batch: Vec<Buf> = Vec::new();
        let mut iovs: Vec<LocalIov> = Vec::new();
        let mut total = 0usize;

        for _ in 0..maxriovs {
            if total >= maxbytes || self.wrposted.len() + batch.len() >= self.wrposted.capacity()
            {
                break;
            }

            let (head_nused, head_seg, head_children) = match q.ready_for_cxn.peek() {
                Some(h) => (
                    h.hdr().nused,
                    h.segment().clone(),
                    h.hdr().xfc.nchildren.clone(),
                ),
                None => break,
            };

            let oversize = head_nused - self.frag_offset > maxbytes - total;

            // Fragment oversize loads only once the remote vector array is
            // provably complete.
            if oversize && !riovs_maxed_out {
                break;
            }

            let len = if oversize {
                maxbytes - total
            } else {
                head_nused - self.frag_offset
            };

            if self.frag_offset == 0 {
                head_children.store(0, Ordering::Relaxed);

                if w.params.reregister {
                    let head = q.ready_for_cxn.peek_mut().unwrap();
                    if buf_mr_reg(&w.domain, ACCESS_SEND, self.core.keys.next(), head).is_err() {
                        return LoopCtl::Error;
                    }
                }
            }

            let mut h = if oversize {
                let mut fh = match self.frag_pool.get() {
                    Some(fh) => fh,
                    None => {
                        logging::error!(self.core.log, "out of fragment headers";
                                        "context" => "write");
                        return LoopCtl::Error;
                    }
                };

                if let Buf::Fragment(f) = &mut fh {
                    f.hdr.raddr = self.frag_offset as u64;
                    f.hdr.nused = len;
                    f.hdr.nallocated = 0;
                    f.parent_payload = Some(head_seg.clone());
                    f.parent_children = Some(head_children.clone());
                }

                head_children.fetch_add(1, Ordering::Relaxed);
                fh
            } else {
                q.ready_for_cxn.get().unwrap()
            };

            iovs.push(LocalIov {
                seg: head_seg,
                offset: self.frag_offset,
                len,
            });

            h.hdr_mut().xfc.owner = XferOwner::Program;
            h.hdr_mut().xfc.place = 0;
            batch.push(h);

            if oversize {
                self.frag_offset += len;
            } else {
                self.frag_offset = 0;
            }

            total += len;
        }

        if batch.is_empty() {
            return LoopCtl::Continue;
        }

        {
            let first = batch.first_mut().unwrap();
            first.hdr_mut().xfc.owner = XferOwner::Nic;
            first.hdr_mut().xfc.place = PLACE_FIRST;
        }
        batch.last_mut().unwrap().hdr_mut().xfc.place |= PLACE_LAST;

        let first_xid = batch[0].xid();

        logging::trace!(self.core.log, "issuing write";
                        "context" => "write",
                        "nbufs" => batch.len(),
                        "total" => total,
                        "nriovs" => self.riovs[active].len());

        for h in batch {
            let _ = self.wrposted.put(h);
        }

        match write_fully(
            &self.core.ep,
            &self.core.av,
            self.core.peer,
            &iovs,
            &self.riovs[active],
            total,
            maxriovs,
            first_xid,
        ) {
            Ok((nwritten, niovs_left, riovs_left)) => {
                if nwritten != total || niovs_left != 0 {
                    logging::error!(self.core.log, "local I/O vectors were partially written";
                                    "context" => "write",
                                    "nwritten" => nwritten,
                                    "total" => total);
                    return LoopCtl::Error;
                }

                self.riovs[active].clear();
                self.riovs[1 - active] = riovs_left;
                self.phase = !self.phase;
            }
            Err(_) => return LoopCtl::Error,
        }

        LoopCtl::Continue
    }

    /// Reconciles an RDMA-write completion: the head of `wrposted` must be
    /// the buffer that carried the batch context. Completed fragments
    /// release their parents; completed whole buffers with no outstanding
    /// children go back to the terminal.
    fn write_completion(
        &mut self,
        cmpl: &Completion,
        q: &mut SessionQueues,
        w: &WorkerCtx,
    ) -> TransferResult<()> {
        {
            let head = self
                .wrposted
                .peek_mut()
                .ok_or(TransferError::Fatal(ErrorType::MissingPost))?;

            if head.hdr().xfc.place & PLACE_FIRST == 0 {
                return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion));
            }

            if head.xid() != cmpl.xid {
                return Err(TransferError::Fatal(ErrorType::ContextMismatch));
            }

            head.hdr_mut().xfc.owner = XferOwner::Program;
        }

        loop {
            let consume_fragment = match self.wrposted.peek() {
                Some(h) => {
                    h.hdr().xfc.owner == XferOwner::Program && h.kind() == XferKind::Fragment
                }
                None => break,
            };

            if consume_fragment {
                let mut h = self.wrposted.get().unwrap();

                if let Buf::Fragment(f) = &mut h {
                    let children = f
                        .parent_children
                        .as_ref()
                        .expect("completed fragment must be linked");

                    debug_assert!(children.load(Ordering::Relaxed) > 0);
                    children.fetch_sub(1, Ordering::Relaxed);
                    f.unlink();
                }

                let _ = self.frag_pool.put(h);
                continue;
            }

            let consume_whole = match self.wrposted.peek() {
                Some(h) => {
                    h.hdr().xfc.owner == XferOwner::Program
                        && h.kind() == XferKind::RdmaWrite
                        && h.hdr().xfc.nchildren.load(Ordering::Relaxed) == 0
                        && !q.ready_for_terminal.full()
                }
                None => break,
            };

            if !consume_whole {
                break;
            }

            let mut h = self.wrposted.get().unwrap();

            if w.params.reregister {
                h.hdr_mut().mr = None;
            }

            self.bytes_progress += h.hdr().nused;
            let _ = q.ready_for_terminal.alt_put(h);
        }

        Ok(())
    }

    /// Queues a progress message whenever bytes completed since the last
    /// one, or the stream just reached EOF with all writes drained. The
    /// EOF message carries `nleftover == 0` and is sent exactly once.
    fn progress_update(&mut self, q: &SessionQueues) {
        let reached_eof =
            q.ready_for_cxn.eoget() && self.wrposted.empty() && !self.core.eof_local;

        if self.bytes_progress == 0 && !reached_eof {
            return;
        }

        if self.progress.ready.full() {
            return;
        }

        let mut pb = match self.progress.pool.get() {
            Some(pb) => pb,
            None => return,
        };

        let msg = ProgressMsg {
            nfilled: self.bytes_progress as u64,
            nleftover: if reached_eof { 0 } else { 1 },
        };

        if let Buf::Prog(p) = &mut pb {
            p.msg = msg;
            msg.encode(&p.payload);
        }

        pb.hdr_mut().xfc.owner = XferOwner::Nic;
        pb.hdr_mut().nused = PROGRESS_MSGLEN;

        logging::trace!(self.core.log, "sending progress message";
                        "context" => "progress",
                        "nfilled" => msg.nfilled,
                        "nleftover" => msg.nleftover);

        self.bytes_progress = 0;
        let _ = self.progress.ready.put(pb);

        if reached_eof {
            logging::debug!(self.core.log, "enqueued local EOF"; "context" => "progress");
            self.core.eof_local = true;
        }
    }

    fn cq_process(&mut self, q: &mut SessionQueues, w: &WorkerCtx) -> TransferResult<()> {
        let cmpl = match self.core.ep.cq().read() {
            Some(cmpl) => cmpl,
            None => return Ok(()),
        };

        match kind_of_xid(cmpl.xid) {
            Some(XferKind::Vector) => self.vector_rx_process(&cmpl),
            Some(XferKind::Fragment) | Some(XferKind::RdmaWrite) => {
                self.write_completion(&cmpl, q, w)
            }
            Some(XferKind::Progress) => self.progress.complete(&cmpl),
            Some(XferKind::Ack) => self.ack_rx_process(&cmpl),
            Some(XferKind::Initial) => Ok(()),
            _ => Err(TransferError::Fatal(ErrorType::UnexpectedCompletion)),
        }
    }
}

impl Cxn for Xmtr {
    fn run(&mut self, w: &mut WorkerCtx, q: &mut SessionQueues) -> LoopCtl {
        if self.cq_process(q, w).is_err() {
            return LoopCtl::Error;
        }

        if self.core.cancelled {
            if self.progress.posted.empty() && self.vec.posted.empty() && self.wrposted.empty() {
                self.core.ep.close();
                logging::debug!(self.core.log, "closed"; "context" => "cancel");
                return LoopCtl::Canceled;
            }
            return LoopCtl::Continue;
        } else if w.params.cancel.is_cancelled() {
            self.progress.cancel(&self.core.ep);
            self.vec.cancel(&self.core.ep);
            fifo_cancel(&self.core.ep, &mut self.wrposted);
            self.core.cancelled = true;
            return LoopCtl::Continue;
        }

        if !self.core.sent_first {
            return self.initial_send();
        }

        if !self.core.started {
            return self.start(w, q);
        }

        if !self.rcvd_ack {
            return LoopCtl::Continue;
        }

        if self.vecbuf_unload().is_err() {
            return LoopCtl::Error;
        }

        if self.targets_write(q, w) == LoopCtl::Error {
            return LoopCtl::Error;
        }

        self.progress_update(q);

        if self
            .progress
            .transmit(&self.core.ep, &self.core.av, self.core.peer, &self.core.log)
            .is_err()
        {
            return LoopCtl::Error;
        }

        if !(q.ready_for_cxn.eoget()
            && self.wrposted.empty()
            && self.bytes_progress == 0
            && self.core.eof_local)
        {
            return LoopCtl::Continue;
        }

        // Hunt for the remote EOF among any leftover received vectors.
        while !self.core.eof_remote {
            match self.vec.rcvd.get() {
                Some(vb) => {
                    if let Buf::Vec(v) = &vb {
                        if v.msg.iovs.is_empty() {
                            self.core.eof_remote = true;
                        }
                    }
                }
                None => break,
            }
        }

        if self.core.eof_remote && self.progress.posted.empty() {
            return LoopCtl::End;
        }

        LoopCtl::Continue
    }

    fn cq(&self) -> CompletionQueue {
        self.core.ep.cq()
    }

    fn sent_first(&self) -> bool {
        self.core.sent_first
    }

    fn close(&mut self) {
        self.core.ep.close();
    }
}

/// Issues one scatter-gather write covering as much of the local and
/// remote vectors as `maxsegs` and the byte budget allow. Returns the
/// bytes written, the count of local segments left unconsumed (always
/// expected to be zero by the caller), and the unused remote tail with the
/// partially-consumed head segment adjusted.
#[allow(clippy::too_many_arguments)]
fn write_fully(
    ep: &Endpoint,
    av: &AddressVector,
    peer: AvIndex,
    iov_in: &[LocalIov],
    riov_in: &[RemoteIov],
    len_limit: usize,
    maxsegs: usize,
    xid: u64,
) -> TransferResult<(usize, usize, Vec<RemoteIov>)> {
    let maxsegs_local = maxsegs.min(iov_in.len());
    let maxsegs_remote = maxsegs.min(riov_in.len());

    let sumlen_local: usize = iov_in[..maxsegs_local].iter().map(|i| i.len).sum();
    let sumlen_remote: usize = riov_in[..maxsegs_remote]
        .iter()
        .map(|r| r.len as usize)
        .sum();

    let len = sumlen_local.min(sumlen_remote).min(len_limit);

    let mut iov_out = Vec::with_capacity(maxsegs_local);
    let mut nremaining = len;

    for iov in &iov_in[..maxsegs_local] {
        if nremaining == 0 {
            break;
        }

        let mut out = iov.clone();

        if out.len > nremaining {
            out.len = nremaining;
            nremaining = 0;
        } else {
            nremaining -= out.len;
        }

        iov_out.push(out);
    }

    let mut riov_out = Vec::with_capacity(maxsegs_remote);
    let mut nremaining = len;

    for riov in &riov_in[..maxsegs_remote] {
        if nremaining == 0 {
            break;
        }

        let mut out = *riov;

        if out.len as usize > nremaining {
            out.len = nremaining as u64;
            nremaining = 0;
        } else {
            nremaining -= out.len as usize;
        }

        riov_out.push(out);
    }

    ep.write(av, peer, &iov_out, &riov_out, xid)?;

    let mut niovs_left = 0;
    let mut nremaining = len;

    for iov in iov_in {
        if nremaining >= iov.len {
            nremaining -= iov.len;
            continue;
        }

        niovs_left += 1;
        nremaining = 0;
    }

    let mut riovs_left = Vec::new();
    let mut nremaining = len;

    for riov in riov_in {
        if nremaining >= riov.len as usize {
            nremaining -= riov.len as usize;
            continue;
        }

        let mut out = *riov;

        if nremaining > 0 {
            out.len -= nremaining as u64;
            out.addr += nremaining as u64;
            nremaining = 0;
        }

        riovs_left.push(out);
    }

    Ok((len, niovs_left, riovs_left))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::ACCESS_REMOTE_WRITE;

    fn write_setup(tag: &str) -> (Domain, Endpoint, Endpoint, AddressVector) {
        let dom = Domain::new();
        let a = dom
            .endpoint(format!("xmtr-test-{}-a", tag).as_bytes())
            .unwrap();
        let b = dom
            .endpoint(format!("xmtr-test-{}-b", tag).as_bytes())
            .unwrap();
        let av = AddressVector::new();

        (dom, a, b, av)
    }

    fn local(seg: &Arc<Segment>, offset: usize, len: usize) -> LocalIov {
        LocalIov {
            seg: seg.clone(),
            offset,
            len,
        }
    }

    #[test]
    fn test_write_fully_consumes_locals_and_returns_remote_tail() {
        let (dom, a, b, av) = write_setup("tail");
        let to_b = av.insert(b.addr());

        let t1 = Segment::new(10);
        let t2 = Segment::new(10);
        let _m1 = dom.mr_reg(&t1, ACCESS_REMOTE_WRITE, 900).unwrap();
        let _m2 = dom.mr_reg(&t2, ACCESS_REMOTE_WRITE, 901).unwrap();

        let src = Segment::new(16);
        src.fill(0, b"abcdefghijklmnop");

        let iovs = [local(&src, 0, 6), local(&src, 6, 7)];
        let riovs = [
            RemoteIov {
                addr: 0,
                len: 10,
                key: 900,
            },
            RemoteIov {
                addr: 0,
                len: 10,
                key: 901,
            },
        ];

        let (len, niovs_left, riovs_left) =
            write_fully(&a, &av, to_b, &iovs, &riovs, 13, 12, 1).unwrap();

        assert_eq!(len, 13);
        assert_eq!(niovs_left, 0);

        // 13 of 20 remote bytes used: the tail is the second region,
        // advanced past the three bytes the write put there.
        assert_eq!(riovs_left.len(), 1);
        assert_eq!(
            riovs_left[0],
            RemoteIov {
                addr: 3,
                len: 7,
                key: 901,
            }
        );

        assert_eq!(t1.copy_out(0, 10), b"abcdefghij".to_vec());
        assert_eq!(t2.copy_out(0, 3), b"klm".to_vec());
    }

    #[test]
    fn test_write_fully_respects_remote_capacity() {
        let (dom, a, b, av) = write_setup("cap");
        let to_b = av.insert(b.addr());

        let t1 = Segment::new(4);
        let _m1 = dom.mr_reg(&t1, ACCESS_REMOTE_WRITE, 902).unwrap();

        let src = Segment::new(16);
        src.fill(0, b"abcdefghijklmnop");

        let iovs = [local(&src, 0, 16)];
        let riovs = [RemoteIov {
            addr: 0,
            len: 4,
            key: 902,
        }];

        let (len, niovs_left, riovs_left) =
            write_fully(&a, &av, to_b, &iovs, &riovs, 16, 12, 1).unwrap();

        // Only four bytes fit; the local vector is partially consumed and
        // the remote tail is exhausted.
        assert_eq!(len, 4);
        assert_eq!(niovs_left, 1);
        assert!(riovs_left.is_empty());
        assert_eq!(t1.copy_out(0, 4), b"abcd".to_vec());
    }

    #[test]
    fn test_fragmentation_splits_and_reassembles() {
        use crate::buffer::ByteBuf;
        use crate::config::Params;
        use crate::session::SessionQueues;
        use crate::worker::WorkerCtx;

        let domain = Domain::new();
        let a = domain.endpoint(b"xmtr-test-frag-a").unwrap();
        let b = domain.endpoint(b"xmtr-test-frag-b").unwrap();
        let av = Arc::new(AddressVector::new());
        let peer = av.insert(b.addr());

        let mut xmtr = Xmtr::new(&domain, a, av, peer, 1, 0, None).unwrap();
        xmtr.core.sent_first = true;
        xmtr.core.started = true;
        xmtr.rcvd_ack = true;

        // Contiguous mode: one remote segment per write, so the remote
        // vector array is provably complete with a single entry and an
        // oversize head buffer must fragment.
        let mut params = Params::new();
        params.contiguous = true;
        let mut ctx = WorkerCtx::new(domain.clone(), Arc::new(params), None);

        let mut q = SessionQueues {
            ready_for_cxn: crate::fifo::Fifo::new(64),
            ready_for_terminal: crate::fifo::Fifo::new(64),
        };

        let data: Vec<u8> = (0..37u8).collect();
        let mut head = ByteBuf::alloc(37);
        head.payload.fill(0, &data);
        head.hdr.nused = 37;
        q.ready_for_cxn.put(Buf::Byte(head)).unwrap();

        let t1 = Segment::new(23);
        let _m1 = domain.mr_reg(&t1, crate::fabric::ACCESS_REMOTE_WRITE, 700).unwrap();
        let active = xmtr.phase as usize;
        xmtr.riovs[active].push(RemoteIov {
            addr: 0,
            len: 23,
            key: 700,
        });

        // First batch: a 23-byte fragment of the 37-byte head.
        assert_eq!(xmtr.targets_write(&mut q, &mut ctx), LoopCtl::Continue);
        assert_eq!(xmtr.frag_offset, 23);
        assert_eq!(xmtr.wrposted.len(), 1);
        assert_eq!(t1.copy_out(0, 23), data[..23].to_vec());

        // The parent stays on the session queue with one child charged.
        let parent_children = q
            .ready_for_cxn
            .peek()
            .unwrap()
            .hdr()
            .xfc
            .nchildren
            .load(Ordering::Relaxed);
        assert_eq!(parent_children, 1);

        // The fragment's completion releases the parent's child count and
        // returns the header to the pool.
        xmtr.cq_process(&mut q, &ctx).unwrap();
        assert!(xmtr.wrposted.empty());
        assert_eq!(
            q.ready_for_cxn
                .peek()
                .unwrap()
                .hdr()
                .xfc
                .nchildren
                .load(Ordering::Relaxed),
            0
        );

        // Second batch: the 14-byte remainder fits the next region whole.
        let t2 = Segment::new(29);
        let _m2 = domain.mr_reg(&t2, crate::fabric::ACCESS_REMOTE_WRITE, 701).unwrap();
        let active = xmtr.phase as usize;
        xmtr.riovs[active].push(RemoteIov {
            addr: 0,
            len: 29,
            key: 701,
        });

        assert_eq!(xmtr.targets_write(&mut q, &mut ctx), LoopCtl::Continue);
        assert_eq!(xmtr.frag_offset, 0);
        assert!(q.ready_for_cxn.empty());
        assert_eq!(t2.copy_out(0, 14), data[23..].to_vec());

        // The parent's completion credits the full buffer length.
        xmtr.cq_process(&mut q, &ctx).unwrap();
        assert!(xmtr.wrposted.empty());
        assert_eq!(xmtr.bytes_progress, 37);
        assert_eq!(q.ready_for_terminal.len(), 1);
    }

    #[test]
    fn test_write_fully_honors_maxsegs() {
        let (dom, a, b, av) = write_setup("maxsegs");
        let to_b = av.insert(b.addr());

        let t1 = Segment::new(8);
        let t2 = Segment::new(8);
        let _m1 = dom.mr_reg(&t1, ACCESS_REMOTE_WRITE, 903).unwrap();
        let _m2 = dom.mr_reg(&t2, ACCESS_REMOTE_WRITE, 904).unwrap();

        let src = Segment::new(16);
        src.fill(0, b"abcdefghijklmnop");

        let iovs = [local(&src, 0, 16)];
        let riovs = [
            RemoteIov {
                addr: 0,
                len: 8,
                key: 903,
            },
            RemoteIov {
                addr: 0,
                len: 8,
                key: 904,
            },
        ];

        // Contiguous mode: one remote segment per write.
        let (len, _niovs_left, riovs_left) =
            write_fully(&a, &av, to_b, &iovs, &riovs, 16, 1, 1).unwrap();

        assert_eq!(len, 8);
        assert_eq!(riovs_left, vec![riovs[1]]);
        assert_eq!(t1.copy_out(0, 8), b"abcdefgh".to_vec());
        assert_eq!(t2.copy_out(0, 1), vec![0u8]);
    }
}
