//! The worker pool. Each worker is one polling thread owning two
//! half-pools of session slots behind separate locks. The dispatcher
//! places sessions into slots; workers swap I/O-ready and otherwise-ready
//! sessions to the front of each half, run them cooperatively, and retire
//! when both halves drain.

use crate::buffer::{Buf, BufList, ByteBuf};
use crate::config::Params;
use crate::fabric::{Domain, PollSet, ACCESS_RECV, ACCESS_REMOTE_WRITE, ACCESS_SEND};
use crate::logging::{self, Logger};
use crate::mr::{buf_mr_reg, KeySource};
use crate::session::Session;
use crate::support::{ErrorType, LoopCtl, TransferError, TransferResult};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

pub const WORKER_SESSIONS_MAX: usize = 8;
pub const WORKERS_MAX: usize = 128;
pub const SESSIONS_MAX: usize = WORKER_SESSIONS_MAX * WORKERS_MAX;

const SESSIONS_PER_HALF: usize = WORKER_SESSIONS_MAX / 2;

/// Payload buffer reservoirs hold this many buffers and refill to half.
const PAYBUF_RESERVOIR: usize = 16;

/// Token reserved for the dispatcher's nudge waker.
const WAKE_TOKEN: mio::Token = mio::Token(usize::max_value() - 1);

/// Worker loops between load-average marks.
const LOAD_MARK_LOOPS: u32 = 65_535;

/// Per-thread context the connection state machines draw on: the resource
/// domain, the run parameters, a key source, and the free payload-buffer
/// reservoirs.
pub struct WorkerCtx {
    pub domain: Domain,
    pub params: Arc<Params>,
    pub log: Logger,
    keys: KeySource,
    rx_bufs: BufList,
    tx_bufs: BufList,
}

impl WorkerCtx {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        domain: Domain,
        params: Arc<Params>,
        log: L,
    ) -> WorkerCtx {
        let ctx_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        let mut ctx = WorkerCtx {
            domain,
            params,
            log: ctx_log,
            keys: KeySource::new(),
            rx_bufs: BufList::create(PAYBUF_RESERVOIR),
            tx_bufs: BufList::create(PAYBUF_RESERVOIR),
        };

        ctx.replenish(ACCESS_RECV | ACCESS_REMOTE_WRITE, true);
        ctx.replenish(ACCESS_SEND, false);
        ctx
    }

    /// Tops a reservoir back up to half capacity with freshly allocated
    /// payload buffers, cycling through the usual lengths. Buffers are
    /// registered here unless late registration is in effect.
    fn replenish(&mut self, access: u64, rx: bool) -> bool {
        let (bl, domain, params, keys, log) = if rx {
            (
                &mut self.rx_bufs,
                &self.domain,
                &self.params,
                &mut self.keys,
                &self.log,
            )
        } else {
            (
                &mut self.tx_bufs,
                &self.domain,
                &self.params,
                &mut self.keys,
                &self.log,
            )
        };

        if bl.nfull() >= bl.nallocated() / 2 {
            return true;
        }

        // paylen cycle: 23 -> 29 -> 31 -> 37 -> 23
        let mut cycle = [23usize, 29, 31, 37].iter().cycle();

        while bl.nfull() < bl.nallocated() / 2 {
            let paylen = *cycle.next().unwrap();
            let mut buf = Buf::Byte(ByteBuf::alloc(paylen));

            if !params.reregister {
                if buf_mr_reg(domain, access, keys.next(), &mut buf).is_err() {
                    logging::warn!(log, "payload registration failed";
                                   "context" => "replenish");
                    break;
                }
            }

            logging::trace!(log, "pushing payload buffer";
                            "context" => "replenish", "paylen" => paylen);

            if bl.put(buf).is_err() {
                break;
            }
        }

        bl.nfull() > 0
    }

    /// An empty payload buffer suitable as an RDMA target.
    pub fn payload_rxbuf_get(&mut self) -> Option<Buf> {
        loop {
            if let Some(b) = self.rx_bufs.get() {
                return Some(b);
            }
            if !self.replenish(ACCESS_RECV | ACCESS_REMOTE_WRITE, true) {
                return None;
            }
        }
    }

    /// An empty payload buffer suitable as an RDMA source.
    pub fn payload_txbuf_get(&mut self) -> Option<Buf> {
        loop {
            if let Some(b) = self.tx_bufs.get() {
                return Some(b);
            }
            if !self.replenish(ACCESS_SEND, false) {
                return None;
            }
        }
    }
}

/// Adaptive load signal: a fixed-point moving average (8 fractional bits)
/// of completion contexts serviced per loop, folded at every mark.
struct Load {
    loops_since_mark: u32,
    ctxs_serviced_since_mark: u32,
    max_loop_contexts: usize,
    min_loop_contexts: usize,
}

impl Load {
    fn new() -> Load {
        Load {
            loops_since_mark: 0,
            ctxs_serviced_since_mark: 0,
            max_loop_contexts: 0,
            min_loop_contexts: usize::max_value(),
        }
    }

    fn update(&mut self, average: &AtomicU64, nready: usize, log: &Logger) {
        if nready > self.max_loop_contexts {
            self.max_loop_contexts = nready;
        }
        if nready < self.min_loop_contexts {
            self.min_loop_contexts = nready;
        }

        self.ctxs_serviced_since_mark += nready as u32;

        if self.loops_since_mark < LOAD_MARK_LOOPS {
            self.loops_since_mark += 1;
            return;
        }

        let folded = fold_average(
            average.load(Ordering::Relaxed),
            self.ctxs_serviced_since_mark,
        );
        average.store(folded, Ordering::Relaxed);

        logging::debug!(log, "load average updated";
                        "context" => "load",
                        "whole" => folded / 256,
                        "fraction" => folded % 256,
                        "contexts" => self.ctxs_serviced_since_mark,
                        "min" => self.min_loop_contexts,
                        "max" => self.max_loop_contexts);

        self.loops_since_mark = 0;
        self.ctxs_serviced_since_mark = 0;
        self.max_loop_contexts = 0;
        self.min_loop_contexts = usize::max_value();
    }
}

#[inline]
fn fold_average(average: u64, ctxs_serviced: u32) -> u64 {
    (average + 256 * ctxs_serviced as u64 / (LOAD_MARK_LOOPS as u64 + 1)) / 2
}

#[derive(Default)]
struct Stats {
    no_io_ready: u64,
    no_session_ready: u64,
    total: u64,
}

struct WorkerHalf {
    slots: Vec<Option<Session>>,
    pollset: PollSet,
}

impl WorkerHalf {
    fn new() -> WorkerHalf {
        let mut slots = Vec::with_capacity(SESSIONS_PER_HALF);
        slots.resize_with(SESSIONS_PER_HALF, || None);

        WorkerHalf {
            slots,
            pollset: PollSet::new(),
        }
    }

    fn slot_of(&self, token: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(|s| s.token) == Some(token))
    }
}

pub struct Worker {
    idx: usize,
    halves: [Mutex<WorkerHalf>; 2],
    nsessions: [AtomicUsize; 2],
    /// Paired with the pool mutex; the dispatcher signals it on wake-up
    /// and shutdown.
    sleep: Condvar,
    shutting_down: AtomicBool,
    canceled: AtomicBool,
    failed: AtomicBool,
    average: AtomicU64,
    poll: Mutex<Option<mio::Poll>>,
    /// One wait waker per worker; assigned session queues share it, and
    /// the dispatcher uses it to nudge a busy poller.
    waker: Option<Arc<mio::Waker>>,
}

impl Worker {
    fn new(idx: usize, waitfd: bool) -> Worker {
        let (poll, waker) = if waitfd {
            let poll = mio::Poll::new().expect("wait multiplexer creation failed");
            let waker = Arc::new(
                mio::Waker::new(poll.registry(), WAKE_TOKEN).expect("wait waker creation failed"),
            );

            (Some(poll), Some(waker))
        } else {
            (None, None)
        };

        Worker {
            idx,
            halves: [Mutex::new(WorkerHalf::new()), Mutex::new(WorkerHalf::new())],
            nsessions: [AtomicUsize::new(0), AtomicUsize::new(0)],
            sleep: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            average: AtomicU64::new(0),
            poll: Mutex::new(poll),
            waker,
        }
    }

    /// The load average, read by the assignment scan to order running
    /// workers and reported in the mark logs.
    #[inline]
    pub fn load_average(&self) -> u64 {
        self.average.load(Ordering::Relaxed)
    }

    /// Tries to place `s` into an empty slot in either half; on success
    /// the session's queue joins that half's poll set (and gets a wait
    /// waker in wait-fd mode). Hands the session back if both halves are
    /// busy or full.
    fn try_take(&self, s: Session) -> Result<(), Session> {
        for half in 0..2 {
            let mut guard = match self.halves[half].try_lock() {
                Ok(guard) => guard,
                Err(_) => continue,
            };

            for slot in 0..SESSIONS_PER_HALF {
                if guard.slots[slot].is_some() {
                    continue;
                }

                guard.pollset.add(s.token, &s.cxn.cq());

                if let Some(waker) = &self.waker {
                    s.cxn.cq().set_waker(waker.clone());
                }

                self.nsessions[half].fetch_add(1, Ordering::Relaxed);
                guard.slots[slot] = Some(s);
                return Ok(());
            }
        }

        // Nudge the poller so a busy worker revisits its slots promptly.
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }

        Err(s)
    }

    fn idle_loop(&self, pool: &WorkerPool) {
        let mut core = pool.mtx.lock().unwrap();

        while core.nrunning <= self.idx && !self.shutting_down.load(Ordering::Acquire) {
            core = self.sleep.wait(core).unwrap();
        }
    }

    /// A worker retires when it holds no sessions and it is the
    /// highest-indexed running worker; retirement is what `join_all`
    /// waits on.
    fn is_idle(&self, pool: &WorkerPool) -> bool {
        if self.nsessions[0].load(Ordering::Relaxed) != 0
            || self.nsessions[1].load(Ordering::Relaxed) != 0
        {
            return false;
        }

        let mut core = match pool.mtx.try_lock() {
            Ok(core) => core,
            Err(_) => return false,
        };

        let g0 = match self.halves[0].try_lock() {
            Ok(g) => g,
            Err(_) => return false,
        };
        let g1 = match self.halves[1].try_lock() {
            Ok(g) => g,
            Err(_) => return false,
        };

        let idle = self.nsessions[0].load(Ordering::Relaxed) == 0
            && self.nsessions[1].load(Ordering::Relaxed) == 0
            && self.idx + 1 == core.nrunning;

        if idle {
            core.nrunning -= 1;
            pool.cond.notify_all();
        }

        drop(g0);
        drop(g1);

        idle
    }

    fn run_loop(
        &self,
        ctx: &mut WorkerCtx,
        load: &mut Load,
        stats: &mut Stats,
        poll: Option<&mut mio::Poll>,
        events: &mut mio::Events,
    ) {
        // Drain the wait multiplexer once per loop so wake-ups do not
        // accumulate; readiness itself is always re-derived from the poll
        // sets, so a consumed wake can never hide a queue that still holds
        // completions.
        if let Some(poll) = poll {
            let _ = poll.poll(events, Some(Duration::from_millis(0)));
        }

        for half in 0..2 {
            let mut guard = match self.halves[half].try_lock() {
                Ok(guard) => guard,
                Err(_) => continue,
            };

            let mut ready_tokens: Vec<usize> = Vec::new();
            guard.pollset.poll(&mut ready_tokens, SESSIONS_PER_HALF);

            load.update(&self.average, ready_tokens.len(), &ctx.log);

            // Swap I/O-ready sessions into the low slots.
            let mut io_ready_up_to = 0;

            for &token in &ready_tokens {
                if let Some(pos) = guard.slot_of(token) {
                    if pos >= io_ready_up_to {
                        guard.slots.swap(pos, io_ready_up_to);
                        io_ready_up_to += 1;
                    }
                }
            }

            // Then sessions that are ready for other reasons: first
            // message unsent, terminal-bound buffers pending, or
            // cancellation in progress.
            let mut ready_up_to = io_ready_up_to;

            for i in ready_up_to..SESSIONS_PER_HALF {
                let extra = match &guard.slots[i] {
                    Some(s) => {
                        !s.cxn.sent_first()
                            || !s.q.ready_for_terminal.empty()
                            || ctx.params.cancel.is_cancelled()
                    }
                    None => false,
                };

                if extra {
                    guard.slots.swap(i, ready_up_to);
                    ready_up_to += 1;
                }
            }

            // Compact occupied slots so the empties form a suffix.
            let mut active_up_to = ready_up_to;

            for i in active_up_to..SESSIONS_PER_HALF {
                if guard.slots[i].is_some() {
                    guard.slots.swap(i, active_up_to);
                    active_up_to += 1;
                }
            }

            stats.total += 1;
            if io_ready_up_to == 0 {
                stats.no_io_ready += 1;
            }
            if ready_up_to == io_ready_up_to {
                stats.no_session_ready += 1;
            }

            for i in 0..ready_up_to {
                let ctl = guard.slots[i]
                    .as_mut()
                    .expect("ready slots must be occupied")
                    .run(ctx);

                match ctl {
                    LoopCtl::Continue => continue,
                    LoopCtl::End => {}
                    LoopCtl::Canceled => self.canceled.store(true, Ordering::Relaxed),
                    LoopCtl::Error => self.failed.store(true, Ordering::Relaxed),
                }

                let s = guard.slots[i].take().unwrap();
                guard.pollset.del(s.token);
                s.cxn.cq().clear_waker();
                self.nsessions[half].fetch_sub(1, Ordering::Relaxed);

                logging::debug!(ctx.log, "session retired";
                                "context" => "session_loop",
                                "token" => s.token,
                                "outcome" => ?ctl);
            }
        }
    }
}

fn worker_main(pool: Arc<WorkerPool>, me: Arc<Worker>) {
    let log = pool.log.new(logging::o!("worker" => me.idx));
    let mut ctx = WorkerCtx::new(pool.domain.clone(), pool.params.clone(), &log);
    let mut load = Load::new();
    let mut stats = Stats::default();
    let mut poll = me.poll.lock().unwrap().take();
    let mut events = mio::Events::with_capacity(WORKER_SESSIONS_MAX + 1);

    while !me.shutting_down.load(Ordering::Acquire) {
        me.idle_loop(&pool);

        loop {
            me.run_loop(&mut ctx, &mut load, &mut stats, poll.as_mut(), &mut events);

            if me.is_idle(&pool) || me.shutting_down.load(Ordering::Acquire) {
                break;
            }
        }
    }

    logging::debug!(log, "worker exiting";
                    "context" => "worker_stats",
                    "loops_total" => stats.total,
                    "loops_no_io_ready" => stats.no_io_ready,
                    "loops_no_session_ready" => stats.no_session_ready);
}

struct PoolCore {
    nrunning: usize,
    nallocated: usize,
    suspended: bool,
    workers: Vec<Arc<Worker>>,
    handles: Vec<thread::JoinHandle<()>>,
}

/// Owns the worker threads and places sessions onto them.
pub struct WorkerPool {
    mtx: Mutex<PoolCore>,
    cond: Condvar,
    domain: Domain,
    params: Arc<Params>,
    log: Logger,
    next_token: AtomicUsize,
}

impl WorkerPool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        domain: Domain,
        params: Arc<Params>,
        log: L,
    ) -> Arc<WorkerPool> {
        let pool_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        Arc::new(WorkerPool {
            mtx: Mutex::new(PoolCore {
                nrunning: 0,
                nallocated: 0,
                suspended: false,
                workers: Vec::new(),
                handles: Vec::new(),
            }),
            cond: Condvar::new(),
            domain,
            params,
            log: pool_log,
            next_token: AtomicUsize::new(1),
        })
    }

    /// A fresh stable token for a session about to be assigned.
    pub fn session_token(&self) -> usize {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Places a session: running workers from most-loaded to least-loaded,
    /// then the next idle pre-allocated worker (waking it), then a freshly
    /// created worker. Fails once the worker table is exhausted or
    /// assignment has been suspended for shutdown.
    pub fn assign(self: &Arc<WorkerPool>, mut s: Session) -> TransferResult<()> {
        loop {
            {
                let mut core = self.mtx.lock().unwrap();

                if core.suspended {
                    return Err(TransferError::Fatal(ErrorType::Interrupted));
                }

                let mut running: Vec<Arc<Worker>> = core.workers[..core.nrunning].to_vec();
                running.sort_by(|a, b| b.load_average().cmp(&a.load_average()));

                for w in running {
                    match w.try_take(s) {
                        Ok(()) => return Ok(()),
                        Err(back) => s = back,
                    }
                }

                if core.nrunning < core.nallocated {
                    let w = core.workers[core.nrunning].clone();

                    match w.try_take(s) {
                        Ok(()) => {
                            core.nrunning += 1;
                            w.sleep.notify_all();
                            return Ok(());
                        }
                        Err(back) => s = back,
                    }
                }

                if core.nallocated == WORKERS_MAX {
                    return Err(TransferError::Fatal(ErrorType::PoolExhausted));
                }

                let idx = core.nallocated;
                let w = Arc::new(Worker::new(idx, self.params.waitfd));

                core.workers.push(w.clone());
                core.nallocated += 1;

                logging::debug!(self.log, "launching worker"; "context" => "assign", "idx" => idx);

                let pool = self.clone();
                let handle = thread::Builder::new()
                    .name(format!("worker-{}", idx))
                    .spawn(move || worker_main(pool, w))
                    .expect("worker thread creation failed");

                core.handles.push(handle);
            }
            // Retry with the new worker in the table.
        }
    }

    /// Suspends assignment, waits for every running worker to go idle,
    /// shuts the threads down, and reports whether the run succeeded:
    /// no worker failed and cancellation matched expectations.
    pub fn join_all(&self) -> bool {
        let mut core = self.mtx.lock().unwrap();

        core.suspended = true;

        while core.nrunning > 0 {
            core = self.cond.wait(core).unwrap();
        }

        for w in &core.workers {
            w.shutting_down.store(true, Ordering::Release);
            w.sleep.notify_all();
        }

        let handles: Vec<_> = core.handles.drain(..).collect();
        let workers = core.workers.clone();

        drop(core);

        for handle in handles {
            handle.join().expect("worker thread panicked");
        }

        let mut ok = true;

        for w in &workers {
            if w.failed.load(Ordering::Relaxed) {
                ok = false;
            }
            if w.canceled.load(Ordering::Relaxed) != self.params.expect_cancellation {
                ok = false;
            }
        }

        logging::debug!(self.log, "workers joined";
                        "context" => "join",
                        "nworkers" => workers.len(),
                        "ok" => ok);

        ok
    }
}
