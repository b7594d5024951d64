//! The ends of the pipe: a source that produces the payload stream and a
//! sink that verifies it. Both trade buffers with the connection through
//! the session's two FIFOs — the source swaps filled buffers for empty
//! ones, the sink swaps verified buffers back as fresh targets.

use crate::buffer::Buf;
use crate::fifo::Fifo;
use crate::support::LoopCtl;

/// The reference text the payload stream cycles through.
pub const REF_TEXT: &[u8] =
    b"Precisely one copy of this sentence must arrive for every copy sent, \
      and nothing else besides.";

/// Payload rounds in a full-length run: the stream is `REF_TEXT` repeated
/// this many times.
pub const DEFAULT_ROUNDS: usize = 100_000;

pub trait Terminal: Send {
    /// Trades buffers between `ready` (incoming from the connection) and
    /// `completed` (outgoing back to it). Returns `End` once the terminal
    /// is done with the whole stream.
    fn trade(&mut self, ready: &mut Fifo<Buf>, completed: &mut Fifo<Buf>) -> LoopCtl;
}

/// Produces `entirelen` bytes of the cyclic reference text.
pub struct Source {
    idx: usize,
    txbuflen: usize,
    entirelen: usize,
}

impl Source {
    pub fn new(rounds: usize) -> Source {
        Source {
            idx: 0,
            txbuflen: REF_TEXT.len(),
            entirelen: REF_TEXT.len() * rounds,
        }
    }
}

impl Terminal for Source {
    fn trade(&mut self, ready: &mut Fifo<Buf>, completed: &mut Fifo<Buf>) -> LoopCtl {
        if completed.eoput() {
            return LoopCtl::End;
        }

        while !completed.full() {
            let h = match ready.peek_mut() {
                Some(h) => h,
                None => break,
            };

            if self.idx == self.entirelen {
                completed.put_close();
                break;
            }

            let nused = (self.entirelen - self.idx).min(h.hdr().nallocated);
            h.hdr_mut().nused = nused;

            let idx = self.idx;
            let txbuflen = self.txbuflen;

            h.segment().with_mut(|mem| {
                let mut ofs = 0;
                while ofs < nused {
                    let text_ofs = (idx + ofs) % txbuflen;
                    let len = (nused - ofs).min(txbuflen - text_ofs);
                    mem[ofs..ofs + len].copy_from_slice(&REF_TEXT[text_ofs..text_ofs + len]);
                    ofs += len;
                }
            });

            let h = ready.get().unwrap();
            let _ = completed.alt_put(h);

            self.idx += nused;
        }

        if self.idx != self.entirelen {
            return LoopCtl::Continue;
        }

        LoopCtl::End
    }
}

/// Accepts `entirelen` bytes and verifies each against the cyclic
/// reference text at the expected offset. Overruns and content mismatches
/// fail the session.
pub struct Sink {
    idx: usize,
    txbuflen: usize,
    entirelen: usize,
}

impl Sink {
    pub fn new(rounds: usize) -> Sink {
        Sink {
            idx: 0,
            txbuflen: REF_TEXT.len(),
            entirelen: REF_TEXT.len() * rounds,
        }
    }

    /// Bytes accepted and verified so far.
    #[inline]
    pub fn accepted(&self) -> usize {
        self.idx
    }
}

impl Terminal for Sink {
    fn trade(&mut self, ready: &mut Fifo<Buf>, completed: &mut Fifo<Buf>) -> LoopCtl {
        if ready.eoget() {
            if !ready.alt_empty() {
                return LoopCtl::Error;
            }
            return LoopCtl::End;
        }

        while !completed.full() {
            let h = match ready.peek() {
                Some(h) => h,
                None => break,
            };

            let nused = h.hdr().nused;

            if nused + self.idx > self.entirelen {
                return LoopCtl::Error;
            }

            let idx = self.idx;
            let txbuflen = self.txbuflen;

            let matches = h.segment().with(|mem| {
                let mut ofs = 0;
                while ofs < nused {
                    let text_ofs = (idx + ofs) % txbuflen;
                    let len = (nused - ofs).min(txbuflen - text_ofs);
                    if mem[ofs..ofs + len] != REF_TEXT[text_ofs..text_ofs + len] {
                        return false;
                    }
                    ofs += len;
                }
                true
            });

            if !matches {
                return LoopCtl::Error;
            }

            let h = ready.get().unwrap();
            let _ = completed.put(h);
            self.idx += nused;
        }

        if self.idx != self.entirelen {
            return LoopCtl::Continue;
        }

        ready.get_close();
        LoopCtl::End
    }
}
