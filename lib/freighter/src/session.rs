//! A session pairs one connection state machine with one terminal and the
//! two FIFOs they trade buffers through.

use crate::buffer::Buf;
use crate::fabric::{AddressVector, AvIndex, CompletionQueue, Endpoint};
use crate::fifo::Fifo;
use crate::logging::Logger;
use crate::mr::KeySource;
use crate::support::LoopCtl;
use crate::terminal::Terminal;
use crate::worker::WorkerCtx;
use std::sync::Arc;

/// Capacity of the two per-session FIFOs.
pub const SESSION_FIFO_SIZE: usize = 64;

/// Connection fields shared by the receiver and the transmitter.
pub struct CxnCore {
    pub ep: Endpoint,
    pub av: Arc<AddressVector>,
    pub peer: AvIndex,
    pub sent_first: bool,
    pub started: bool,
    pub cancelled: bool,
    pub eof_local: bool,
    pub eof_remote: bool,
    pub keys: KeySource,
    pub log: Logger,
}

impl CxnCore {
    pub fn new(ep: Endpoint, av: Arc<AddressVector>, peer: AvIndex, log: Logger) -> CxnCore {
        CxnCore {
            ep,
            av,
            peer,
            sent_first: false,
            started: false,
            cancelled: false,
            eof_local: false,
            eof_remote: false,
            keys: KeySource::new(),
            log,
        }
    }
}

/// One turn's view of the session FIFOs, as seen by the connection.
pub struct SessionQueues {
    pub ready_for_cxn: Fifo<Buf>,
    pub ready_for_terminal: Fifo<Buf>,
}

pub trait Cxn: Send {
    /// One turn of the connection state machine.
    fn run(&mut self, w: &mut WorkerCtx, q: &mut SessionQueues) -> LoopCtl;

    /// The completion queue a worker watches for this connection.
    fn cq(&self) -> CompletionQueue;

    /// Whether the first protocol message has gone out; sessions that have
    /// not sent it yet are always considered ready to run.
    fn sent_first(&self) -> bool;

    /// Closes the fabric endpoint.
    fn close(&mut self);
}

pub struct Session {
    pub cxn: Box<dyn Cxn>,
    pub terminal: Box<dyn Terminal>,
    pub q: SessionQueues,
    /// Stable identity used as the poll-set and waker token.
    pub token: usize,
}

impl Session {
    pub fn new(cxn: Box<dyn Cxn>, terminal: Box<dyn Terminal>, token: usize) -> Session {
        Session {
            cxn,
            terminal,
            q: SessionQueues {
                ready_for_cxn: Fifo::new(SESSION_FIFO_SIZE),
                ready_for_terminal: Fifo::new(SESSION_FIFO_SIZE),
            },
            token,
        }
    }

    /// One turn: the terminal trades first, then the connection runs. The
    /// endpoint is closed on the way out of a finished or failed session.
    pub fn run(&mut self, w: &mut WorkerCtx) -> LoopCtl {
        if self
            .terminal
            .trade(&mut self.q.ready_for_terminal, &mut self.q.ready_for_cxn)
            == LoopCtl::Error
        {
            return LoopCtl::Error;
        }

        let ctl = self.cxn.run(w, &mut self.q);

        if ctl == LoopCtl::End || ctl == LoopCtl::Error {
            self.cxn.close();
        }

        ctl
    }
}
