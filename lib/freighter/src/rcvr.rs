//! Receiver side of a session: acknowledges the handshake, advertises
//! RDMA-target buffers through vector messages, accounts arriving bytes
//! against progress messages, and hands filled buffers to the sink.

use crate::buffer::{
    kind_of_xid, Buf, ProgBuf, VecBuf, XferContext, XferKind, XferOwner, PLACE_FIRST, PLACE_LAST,
};
use crate::ctl::{RxCtl, TxCtl};
use crate::fabric::{
    AddressVector, AvIndex, CompletionQueue, Completion, Domain, Endpoint, LocalIov, MemoryRegion,
    RemoteIov, Segment, ACCESS_RECV, ACCESS_REMOTE_WRITE, ACCESS_SEND,
};
use crate::fifo::Fifo;
use crate::logging::{self, Logger};
use crate::mr::{buf_mr_reg, mr_regv_all};
use crate::msg::{AckMsg, ProgressMsg, VectorMsg, ACK_MSGLEN, VECTOR_IOVS_MAX};
use crate::session::{Cxn, CxnCore, SessionQueues};
use crate::support::{ErrorType, LoopCtl, TransferError, TransferResult};
use crate::terminal::REF_TEXT;
use crate::worker::WorkerCtx;
use std::sync::Arc;

const VEC_POOL_SIZE: usize = 16;
const CTL_FIFO_SIZE: usize = 64;

pub struct Rcvr {
    core: CxnCore,
    /// Bytes reported written by the peer but not yet credited to target
    /// buffers.
    nfull: u64,
    /// Posted RDMA target buffers, in order of issuance.
    tgtposted: Fifo<Buf>,
    vec: TxCtl,
    progress: RxCtl,
    ack_seg: Arc<Segment>,
    _ack_mrs: Vec<Arc<MemoryRegion>>,
    ack_xfc: XferContext,
    ack_len: usize,
}

impl Rcvr {
    /// Builds a receiver on an already-enabled endpoint whose address the
    /// ack will advertise. The vector-message pool is registered up front.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        domain: &Domain,
        ep: Endpoint,
        av: Arc<AddressVector>,
        peer: AvIndex,
        log: L,
    ) -> TransferResult<Rcvr> {
        let rcvr_log = match log.into() {
            Some(log) => log.new(logging::o!("cxn" => "rcvr")),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        let mut core = CxnCore::new(ep, av, peer, rcvr_log);

        let ack_seg = Segment::new(ACK_MSGLEN);
        let ack_len = AckMsg {
            addr: core.ep.addr().to_vec(),
        }
        .encode(&ack_seg);

        let (ack_mrs, _raddrs) = mr_regv_all(
            domain,
            &[LocalIov {
                seg: ack_seg.clone(),
                offset: 0,
                len: ack_len,
            }],
            1,
            ACCESS_SEND,
            &mut core.keys,
        )?;

        let mut vec = TxCtl::new(CTL_FIFO_SIZE, VEC_POOL_SIZE);

        for _ in 0..VEC_POOL_SIZE {
            let mut vb = Buf::Vec(VecBuf::alloc());

            buf_mr_reg(domain, ACCESS_SEND, core.keys.next(), &mut vb)?;

            vec.pool
                .put(vb)
                .map_err(|_| TransferError::Fatal(ErrorType::PoolExhausted))?;
        }

        Ok(Rcvr {
            core,
            nfull: 0,
            tgtposted: Fifo::new(CTL_FIFO_SIZE),
            vec,
            progress: RxCtl::new(CTL_FIFO_SIZE),
            ack_seg,
            _ack_mrs: ack_mrs,
            ack_xfc: XferContext::new(XferKind::Ack),
            ack_len,
        })
    }

    /// Sends the handshake acknowledgement once. `End` means the send went
    /// out; `Continue` means the fabric deferred it.
    fn ack_send(&mut self) -> LoopCtl {
        self.ack_xfc.owner = XferOwner::Nic;
        self.ack_xfc.place = PLACE_FIRST | PLACE_LAST;
        self.ack_xfc.cancelled = false;

        match self.core.ep.send(
            &self.core.av,
            self.core.peer,
            &self.ack_seg,
            self.ack_len,
            self.ack_xfc.xid,
        ) {
            Ok(()) => {
                logging::debug!(self.core.log, "acknowledgement sent"; "context" => "ack_send");
                self.core.sent_first = true;
                LoopCtl::End
            }
            Err(TransferError::Wait) => {
                logging::trace!(self.core.log, "deferred transmission"; "context" => "ack_send");
                LoopCtl::Continue
            }
            Err(_) => LoopCtl::Error,
        }
    }

    /// First started turn: arm the progress-message receive ring and seed
    /// the terminal-facing FIFO with target buffers covering one copy of
    /// the reference text. The sink recycles them from there on.
    fn start(&mut self, w: &mut WorkerCtx, q: &mut SessionQueues) -> LoopCtl {
        self.core.started = true;

        while !self.progress.posted.full() {
            let pb = Buf::Prog(ProgBuf::alloc());

            if self.progress.post(&self.core.ep, pb).is_err() {
                return LoopCtl::Error;
            }
        }

        let mut nleftover = REF_TEXT.len();

        while nleftover > 0 {
            let mut b = match w.payload_rxbuf_get() {
                Some(b) => b,
                None => {
                    logging::error!(self.core.log, "could not get a buffer"; "context" => "start");
                    return LoopCtl::Error;
                }
            };

            let n = nleftover.min(b.hdr().nallocated);
            b.hdr_mut().nused = n;
            nleftover -= n;

            if q.ready_for_cxn.put(b).is_err() {
                logging::error!(self.core.log, "could not enqueue target buffer";
                                "context" => "start");
                return LoopCtl::Error;
            }
        }

        LoopCtl::Continue
    }

    fn progress_rx_process(&mut self, cmpl: &Completion) -> TransferResult<()> {
        let buf = self.progress.complete(cmpl)?;

        if buf.hdr().xfc.cancelled {
            return Ok(());
        }

        let msg = buf
            .segment()
            .with(|mem| ProgressMsg::decode(&mem[..buf.hdr().nused]))?;

        logging::trace!(self.core.log, "received progress message";
                        "context" => "progress",
                        "nfilled" => msg.nfilled,
                        "nleftover" => msg.nleftover);

        self.nfull += msg.nfilled;

        if msg.nleftover == 0 {
            logging::debug!(self.core.log, "received remote EOF"; "context" => "progress");
            self.core.eof_remote = true;
        }

        self.progress.post(&self.core.ep, buf)
    }

    /// Drains one completion, dispatched by the context's operation kind.
    fn cq_process(&mut self) -> TransferResult<()> {
        let cmpl = match self.core.ep.cq().read() {
            Some(cmpl) => cmpl,
            None => return Ok(()),
        };

        match kind_of_xid(cmpl.xid) {
            Some(XferKind::Progress) => self.progress_rx_process(&cmpl),
            Some(XferKind::Vector) => self.vec.complete(&cmpl),
            Some(XferKind::Ack) => Ok(()),
            _ => Err(TransferError::Fatal(ErrorType::UnexpectedCompletion)),
        }
    }

    /// Builds vector messages out of recycled target buffers, and emits
    /// the single empty vector that mirrors the peer's EOF.
    fn vector_update(&mut self, w: &mut WorkerCtx, q: &mut SessionQueues) -> TransferResult<()> {
        if self.core.eof_remote {
            if !self.core.eof_local && !self.vec.ready.full() {
                if let Some(mut vb) = self.vec.pool.get() {
                    let len = match &mut vb {
                        Buf::Vec(v) => {
                            v.msg = VectorMsg::default();
                            v.msg.encode(&v.payload)
                        }
                        _ => return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion)),
                    };

                    vb.hdr_mut().nused = len;
                    let _ = self.vec.ready.put(vb);
                    self.core.eof_local = true;
                    logging::debug!(self.core.log, "enqueued local EOF"; "context" => "vector");
                }
            }

            // No non-empty vectors after the remote has finished writing.
            return Ok(());
        }

        while !self.vec.ready.full() && !q.ready_for_cxn.empty() {
            let mut vb = match self.vec.pool.get() {
                Some(vb) => vb,
                None => break,
            };

            let mut iovs = Vec::with_capacity(VECTOR_IOVS_MAX);

            for _ in 0..VECTOR_IOVS_MAX {
                let mut h = match q.ready_for_cxn.get() {
                    Some(h) => h,
                    None => break,
                };

                h.hdr_mut().nused = 0;

                if w.params.reregister {
                    buf_mr_reg(
                        &w.domain,
                        ACCESS_RECV | ACCESS_REMOTE_WRITE,
                        self.core.keys.next(),
                        &mut h,
                    )?;
                }

                let key = h
                    .hdr()
                    .mr
                    .as_ref()
                    .ok_or(TransferError::Fatal(ErrorType::UnknownKey))?
                    .key();

                iovs.push(RemoteIov {
                    addr: 0,
                    len: h.hdr().nallocated as u64,
                    key,
                });

                let _ = self.tgtposted.put(h);
            }

            let len = match &mut vb {
                Buf::Vec(v) => {
                    v.msg = VectorMsg { iovs };
                    v.msg.encode(&v.payload)
                }
                _ => return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion)),
            };

            vb.hdr_mut().nused = len;
            let _ = self.vec.ready.put(vb);

            logging::trace!(self.core.log, "enqueued vector"; "context" => "vector");
        }

        Ok(())
    }

    /// Credits reported bytes to the target buffers at the head of
    /// `tgtposted`, releasing each one to the terminal as it fills. On
    /// remote EOF a partially-filled head buffer is flushed too, since the
    /// peer does not end on a buffer boundary.
    fn targets_read(&mut self, w: &WorkerCtx, q: &mut SessionQueues) {
        while self.nfull > 0 && !q.ready_for_terminal.alt_full() {
            let (nused, nallocated) = match self.tgtposted.peek() {
                Some(h) => (h.hdr().nused, h.hdr().nallocated),
                None => break,
            };

            if nused + (self.nfull as usize) < nallocated {
                self.tgtposted.peek_mut().unwrap().hdr_mut().nused += self.nfull as usize;
                self.nfull = 0;
            } else {
                self.nfull -= (nallocated - nused) as u64;

                let mut h = self.tgtposted.get().unwrap();
                h.hdr_mut().nused = nallocated;

                if w.params.reregister {
                    h.hdr_mut().mr = None;
                }

                let _ = q.ready_for_terminal.alt_put(h);
            }
        }

        if self.core.eof_remote {
            let partial = self
                .tgtposted
                .peek()
                .map(|h| h.hdr().nused != 0)
                .unwrap_or(false);

            if partial && !q.ready_for_terminal.alt_full() {
                let mut h = self.tgtposted.get().unwrap();

                if w.params.reregister {
                    h.hdr_mut().mr = None;
                }

                let _ = q.ready_for_terminal.alt_put(h);
            }
        }
    }
}

impl Cxn for Rcvr {
    fn run(&mut self, w: &mut WorkerCtx, q: &mut SessionQueues) -> LoopCtl {
        if !self.core.sent_first {
            match self.ack_send() {
                LoopCtl::End => {}
                LoopCtl::Continue => {
                    if self.cq_process().is_err() {
                        return LoopCtl::Error;
                    }
                    return LoopCtl::Continue;
                }
                _ => return LoopCtl::Error,
            }
        }

        if !self.core.started {
            return self.start(w, q);
        }

        if self.cq_process().is_err() {
            return LoopCtl::Error;
        }

        if self.core.cancelled {
            if self.progress.posted.empty() && self.vec.posted.empty() {
                self.core.ep.close();
                logging::debug!(self.core.log, "closed"; "context" => "cancel");
                return LoopCtl::Canceled;
            }
            return LoopCtl::Continue;
        } else if w.params.cancel.is_cancelled() {
            self.progress.cancel(&self.core.ep);
            self.vec.cancel(&self.core.ep);
            self.core.cancelled = true;
            return LoopCtl::Continue;
        }

        if self.vector_update(w, q).is_err() {
            return LoopCtl::Error;
        }

        if self
            .vec
            .transmit(&self.core.ep, &self.core.av, self.core.peer, &self.core.log)
            .is_err()
        {
            return LoopCtl::Error;
        }

        self.targets_read(w, q);

        if q.ready_for_terminal.eoget()
            && self.core.eof_remote
            && self.core.eof_local
            && self.vec.posted.empty()
        {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::fifo::Fifo;
    use crate::session::SessionQueues;
    use std::sync::Arc;

    fn queues() -> SessionQueues {
        SessionQueues {
            ready_for_cxn: Fifo::new(64),
            ready_for_terminal: Fifo::new(64),
        }
    }

    fn setup(tag: &str) -> (Domain, Rcvr, Endpoint, WorkerCtx) {
        let domain = Domain::new();
        let peer_ep = domain
            .endpoint(format!("rcvr-test-{}-peer", tag).as_bytes())
            .unwrap();
        let ep = domain
            .endpoint(format!("rcvr-test-{}-rcvr", tag).as_bytes())
            .unwrap();

        let av = Arc::new(AddressVector::new());
        let peer = av.insert(peer_ep.addr());

        let rcvr = Rcvr::new(&domain, ep, av, peer, None).unwrap();
        let ctx = WorkerCtx::new(domain.clone(), Arc::new(Params::new()), None);

        (domain, rcvr, peer_ep, ctx)
    }

    #[test]
    fn test_first_turn_acks_and_preloads() {
        let (_domain, mut rcvr, peer_ep, mut ctx) = setup("first");
        let mut q = queues();

        let ack_rx = Segment::new(ACK_MSGLEN);
        peer_ep.post_recv(1, &ack_rx, ACK_MSGLEN).unwrap();

        assert_eq!(rcvr.run(&mut ctx, &mut q), LoopCtl::Continue);

        // The ack went out and carries this receiver's address.
        let cmpl = peer_ep.cq().read().unwrap();
        assert_eq!(cmpl.len, ACK_MSGLEN);
        let ack = AckMsg::decode(&ack_rx.copy_out(0, ACK_MSGLEN)).unwrap();
        assert!(String::from_utf8_lossy(&ack.addr).contains("rcvr-test-first-rcvr"));

        // Progress receives are armed; target buffers cover one text copy.
        assert!(rcvr.progress.posted.full());
        let preloaded: usize = {
            let mut total = 0;
            while let Some(b) = q.ready_for_cxn.get() {
                total += b.hdr().nused;
            }
            total
        };
        assert_eq!(preloaded, REF_TEXT.len());
    }

    #[test]
    fn test_vector_update_advertises_and_posts_targets() {
        let (_domain, mut rcvr, _peer_ep, mut ctx) = setup("vec");
        let mut q = queues();

        for _ in 0..3 {
            let b = ctx.payload_rxbuf_get().unwrap();
            q.ready_for_cxn.put(b).unwrap();
        }

        rcvr.vector_update(&mut ctx, &mut q).unwrap();

        assert!(q.ready_for_cxn.empty());
        assert_eq!(rcvr.tgtposted.len(), 3);
        assert_eq!(rcvr.vec.ready.len(), 1);

        let vb = rcvr.vec.ready.peek().unwrap();
        match vb {
            Buf::Vec(v) => {
                assert_eq!(v.msg.iovs.len(), 3);
                assert!(v.msg.iovs.iter().all(|iov| iov.addr == 0 && iov.len > 0));
            }
            _ => panic!("expected a vector buffer at the head"),
        }
    }

    #[test]
    fn test_remote_eof_emits_one_empty_vector() {
        let (_domain, mut rcvr, _peer_ep, mut ctx) = setup("eof");
        let mut q = queues();

        rcvr.core.eof_remote = true;

        rcvr.vector_update(&mut ctx, &mut q).unwrap();
        assert!(rcvr.core.eof_local);
        assert_eq!(rcvr.vec.ready.len(), 1);
        match rcvr.vec.ready.peek().unwrap() {
            Buf::Vec(v) => assert!(v.msg.iovs.is_empty()),
            _ => panic!("expected a vector buffer"),
        }

        // A second pass must not emit another EOF vector.
        rcvr.vector_update(&mut ctx, &mut q).unwrap();
        assert_eq!(rcvr.vec.ready.len(), 1);
    }

    #[test]
    fn test_targets_read_credits_in_order_and_flushes_partial() {
        let (_domain, mut rcvr, _peer_ep, mut ctx) = setup("credit");
        let mut q = queues();

        for _ in 0..2 {
            let b = ctx.payload_rxbuf_get().unwrap();
            q.ready_for_cxn.put(b).unwrap();
        }
        rcvr.vector_update(&mut ctx, &mut q).unwrap();

        let first_len = rcvr.tgtposted.peek().unwrap().hdr().nallocated;

        // Credit the whole first buffer plus a sliver of the second.
        rcvr.nfull = first_len as u64 + 5;
        rcvr.targets_read(&ctx, &mut q);

        assert_eq!(q.ready_for_terminal.len(), 1);
        assert_eq!(
            q.ready_for_terminal.peek().unwrap().hdr().nused,
            first_len
        );
        assert_eq!(rcvr.tgtposted.peek().unwrap().hdr().nused, 5);
        assert_eq!(rcvr.nfull, 0);

        // Remote EOF flushes the partially-filled head.
        rcvr.core.eof_remote = true;
        rcvr.targets_read(&ctx, &mut q);
        assert_eq!(q.ready_for_terminal.len(), 2);
        assert!(rcvr.tgtposted.empty());
    }
}
