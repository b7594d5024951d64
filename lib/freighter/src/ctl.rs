//! Control blocks that pair posted fabric operations with the buffers that
//! ride on them. Completions are matched strictly against the head of the
//! posted queue; anything else is a protocol violation.

use crate::buffer::{Buf, BufList};
use crate::fabric::{
    AddressVector, AvIndex, Completion, Endpoint, DESIRED_RX_FLAGS, DESIRED_TX_FLAGS,
};
use crate::fifo::Fifo;
use crate::logging::{self, Logger};
use crate::support::{ErrorType, TransferError, TransferResult};

/// Marks every in-flight buffer on `posted` cancelled and asks the fabric
/// to cancel the operation; the cancellations are reconciled when their
/// completions arrive.
pub fn fifo_cancel(ep: &Endpoint, posted: &mut Fifo<Buf>) {
    for buf in posted.iter_mut() {
        buf.hdr_mut().xfc.cancelled = true;
        ep.cancel(buf.xid());
    }
}

/// Receive side: buffers handed to the NIC for reception, and buffers
/// holding received messages that the state machine has not consumed yet.
pub struct RxCtl {
    pub posted: Fifo<Buf>,
    pub rcvd: Fifo<Buf>,
}

impl RxCtl {
    pub fn new(size: usize) -> RxCtl {
        RxCtl {
            posted: Fifo::new(size),
            rcvd: Fifo::new(size),
        }
    }

    /// Posts `buf` for receive and parks it on the posted queue.
    pub fn post(&mut self, ep: &Endpoint, mut buf: Buf) -> TransferResult<()> {
        buf.hdr_mut().xfc.cancelled = false;

        let seg = buf.segment().clone();
        ep.post_recv(buf.xid(), &seg, buf.hdr().nallocated)?;

        self.posted
            .put(buf)
            .map_err(|_| TransferError::Fatal(ErrorType::PoolExhausted))
    }

    /// Reconciles a receive completion: pops the posted head, verifies the
    /// context matches, and returns the buffer with `nused` recorded.
    pub fn complete(&mut self, cmpl: &Completion) -> TransferResult<Buf> {
        let mut buf = self
            .posted
            .get()
            .ok_or(TransferError::Fatal(ErrorType::MissingPost))?;

        if cmpl.flags & DESIRED_RX_FLAGS != DESIRED_RX_FLAGS && !cmpl.cancelled {
            return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion));
        }

        if cmpl.xid != buf.xid() {
            return Err(TransferError::Fatal(ErrorType::ContextMismatch));
        }

        buf.hdr_mut().nused = cmpl.len;

        if cmpl.cancelled {
            buf.hdr_mut().xfc.cancelled = true;
        }

        Ok(buf)
    }

    pub fn cancel(&mut self, ep: &Endpoint) {
        fifo_cancel(ep, &mut self.posted);
    }
}

/// Transmit side: filled buffers not yet handed to the NIC, buffers the
/// NIC currently owns, and the pool completed buffers return to.
pub struct TxCtl {
    pub ready: Fifo<Buf>,
    pub posted: Fifo<Buf>,
    pub pool: BufList,
}

impl TxCtl {
    pub fn new(size: usize, pool_size: usize) -> TxCtl {
        TxCtl {
            ready: Fifo::new(size),
            posted: Fifo::new(size),
            pool: BufList::create(pool_size),
        }
    }

    /// Drains `ready` into the endpoint while `posted` has capacity and
    /// the fabric accepts more.
    pub fn transmit(
        &mut self,
        ep: &Endpoint,
        av: &AddressVector,
        peer: AvIndex,
        log: &Logger,
    ) -> TransferResult<()> {
        while let Some(buf) = self.ready.peek() {
            if self.posted.full() {
                break;
            }

            let seg = buf.segment().clone();
            let (len, xid) = (buf.hdr().nused, buf.xid());

            match ep.send(av, peer, &seg, len, xid) {
                Ok(()) => {
                    let buf = self.ready.get().unwrap();
                    let _ = self.posted.put(buf);
                }
                Err(TransferError::Wait) => {
                    logging::trace!(log, "deferred transmission"; "context" => "transmit");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Reconciles a transmit completion; the buffer goes back to the pool.
    pub fn complete(&mut self, cmpl: &Completion) -> TransferResult<()> {
        if cmpl.flags & DESIRED_TX_FLAGS != DESIRED_TX_FLAGS && !cmpl.cancelled {
            return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion));
        }

        let buf = self
            .posted
            .get()
            .ok_or(TransferError::Fatal(ErrorType::MissingPost))?;

        if cmpl.xid != buf.xid() {
            return Err(TransferError::Fatal(ErrorType::ContextMismatch));
        }

        self.pool
            .put(buf)
            .map_err(|_| TransferError::Fatal(ErrorType::PoolExhausted))?;

        Ok(())
    }

    pub fn cancel(&mut self, ep: &Endpoint) {
        fifo_cancel(ep, &mut self.posted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ProgBuf, XferKind};
    use crate::fabric::{Domain, Segment};
    use crate::logging::{o, Discard, Logger};
    use crate::msg::PROGRESS_MSGLEN;

    fn quiet() -> Logger {
        Logger::root(Discard, o!())
    }

    fn endpoints(tag: &str) -> (Endpoint, Endpoint, AddressVector) {
        let dom = Domain::new();
        let a = dom.endpoint(format!("ctl-test-{}-a", tag).as_bytes()).unwrap();
        let b = dom.endpoint(format!("ctl-test-{}-b", tag).as_bytes()).unwrap();
        let av = AddressVector::new();

        (a, b, av)
    }

    #[test]
    fn test_rxctl_matches_completions_in_post_order() {
        let (a, b, av) = endpoints("order");
        let to_b = av.insert(b.addr());

        let mut rx = RxCtl::new(8);
        let first = Buf::Prog(ProgBuf::alloc());
        let second = Buf::Prog(ProgBuf::alloc());
        let (xid1, xid2) = (first.xid(), second.xid());

        rx.post(&b, first).unwrap();
        rx.post(&b, second).unwrap();

        let tx = Segment::new(PROGRESS_MSGLEN);
        a.send(&av, to_b, &tx, PROGRESS_MSGLEN, 1).unwrap();
        a.send(&av, to_b, &tx, PROGRESS_MSGLEN, 2).unwrap();

        let cmpl = b.cq().read().unwrap();
        assert_eq!(cmpl.xid, xid1);
        let buf = rx.complete(&cmpl).unwrap();
        assert_eq!(buf.xid(), xid1);
        assert_eq!(buf.hdr().nused, PROGRESS_MSGLEN);

        let cmpl = b.cq().read().unwrap();
        let buf = rx.complete(&cmpl).unwrap();
        assert_eq!(buf.xid(), xid2);
    }

    #[test]
    fn test_rxctl_complete_without_post_fails() {
        let (_a, _b, _av) = endpoints("nopost");
        let mut rx = RxCtl::new(8);

        let cmpl = Completion {
            xid: 1,
            len: 0,
            flags: DESIRED_RX_FLAGS,
            cancelled: false,
        };

        assert_eq!(
            rx.complete(&cmpl).err(),
            Some(TransferError::Fatal(ErrorType::MissingPost))
        );
    }

    #[test]
    fn test_rxctl_cancel_reconciles() {
        let (_a, b, _av) = endpoints("cancel");
        let mut rx = RxCtl::new(8);

        rx.post(&b, Buf::Prog(ProgBuf::alloc())).unwrap();
        rx.cancel(&b);

        let cmpl = b.cq().read().unwrap();
        assert!(cmpl.cancelled);

        let buf = rx.complete(&cmpl).unwrap();
        assert!(buf.hdr().xfc.cancelled);
        assert!(rx.posted.empty());
    }

    #[test]
    fn test_txctl_transmit_and_complete() {
        let (a, b, av) = endpoints("tx");
        let to_b = av.insert(b.addr());
        let log = quiet();

        let mut tx = TxCtl::new(8, 4);
        let mut buf = Buf::Prog(ProgBuf::alloc());
        buf.hdr_mut().nused = PROGRESS_MSGLEN;
        let xid = buf.xid();
        tx.ready.put(buf).unwrap();

        tx.transmit(&a, &av, to_b, &log).unwrap();
        assert!(tx.ready.empty());
        assert_eq!(tx.posted.len(), 1);

        let cmpl = a.cq().read().unwrap();
        assert_eq!(cmpl.xid, xid);
        assert_eq!(kind_of_completion(&cmpl), Some(XferKind::Progress));

        tx.complete(&cmpl).unwrap();
        assert!(tx.posted.empty());
        assert_eq!(tx.pool.nfull(), 1);
    }

    fn kind_of_completion(cmpl: &Completion) -> Option<XferKind> {
        crate::buffer::kind_of_xid(cmpl.xid)
    }
}
