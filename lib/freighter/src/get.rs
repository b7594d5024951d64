//! The getter: listens for initial messages, builds a receiver session per
//! peer, hands the sessions to the worker pool, and waits for the pool to
//! drain.

use crate::buffer::{XferContext, XferKind};
use crate::config::Params;
use crate::fabric::{AddressVector, Domain, LocalIov, Segment, ACCESS_RECV, DESIRED_RX_FLAGS};
use crate::logging::{self, Logger};
use crate::mr::{mr_regv_all, KeySource};
use crate::msg::{InitialMsg, INITIAL_MSGLEN};
use crate::rcvr::Rcvr;
use crate::session::Session;
use crate::support::{ErrorType, TransferError, TransferResult};
use crate::terminal::Sink;
use crate::worker::WorkerPool;
use hashbrown::HashMap;
use std::sync::Arc;

/// Runs the getter personality bound to `bind_addr`. Returns whether the
/// run succeeded once every session has drained.
pub fn run<'a, L: Into<Option<&'a Logger>>>(
    domain: &Domain,
    bind_addr: &str,
    params: &Arc<Params>,
    log: L,
) -> TransferResult<bool> {
    let get_log = match log.into() {
        Some(log) => log.new(logging::o!("personality" => "fget")),
        _ => Logger::root(logging::Discard, logging::o!()),
    };

    let av = Arc::new(AddressVector::new());
    let listen_ep = domain.endpoint(bind_addr.as_bytes())?;
    let listen_cq = listen_ep.cq();
    let mut keys = KeySource::new();

    logging::info!(get_log, "listening";
                   "context" => "listen",
                   "addr" => bind_addr,
                   "nsessions" => params.nsessions,
                   "processors" => ?params.processors);

    // One pre-posted initial receive per expected session; registrations
    // are held for the life of the accept loop.
    let mut pending: HashMap<u64, Arc<Segment>> = HashMap::new();
    let mut regs = Vec::new();

    for _ in 0..params.nsessions {
        let seg = Segment::new(INITIAL_MSGLEN);
        let xfc = XferContext::new(XferKind::Initial);

        let (mrs, _raddrs) = mr_regv_all(
            domain,
            &[LocalIov {
                seg: seg.clone(),
                offset: 0,
                len: INITIAL_MSGLEN,
            }],
            params.rx_maxsegs(),
            ACCESS_RECV,
            &mut keys,
        )?;
        regs.push(mrs);

        listen_ep.post_recv(xfc.xid, &seg, INITIAL_MSGLEN)?;
        pending.insert(xfc.xid, seg);
    }

    // Accept: the only blocking wait in the getter.
    let mut sessions = Vec::with_capacity(params.nsessions);
    let pool = WorkerPool::new(domain.clone(), params.clone(), &get_log);

    for _ in 0..params.nsessions {
        let cmpl = listen_cq
            .sread(&params.cancel)
            .ok_or(TransferError::Fatal(ErrorType::Interrupted))?;

        if cmpl.flags & DESIRED_RX_FLAGS != DESIRED_RX_FLAGS {
            return Err(TransferError::Fatal(ErrorType::UnexpectedCompletion));
        }

        if cmpl.len != INITIAL_MSGLEN {
            return Err(TransferError::Fatal(ErrorType::InitialMismatch));
        }

        let seg = pending
            .remove(&cmpl.xid)
            .ok_or(TransferError::Fatal(ErrorType::ContextMismatch))?;

        let initial = seg.with(|mem| InitialMsg::decode(&mem[..INITIAL_MSGLEN]))?;

        if initial.nsources as usize != params.nsessions || initial.id as usize > params.nsessions
        {
            logging::error!(get_log, "unexpected initial message";
                            "context" => "accept",
                            "nsources" => initial.nsources,
                            "id" => initial.id);
            return Err(TransferError::Fatal(ErrorType::InitialMismatch));
        }

        let peer = av.insert(&initial.addr);
        let ep = domain.endpoint_anonymous(bind_addr.as_bytes())?;

        logging::debug!(get_log, "accepted session";
                        "context" => "accept",
                        "id" => initial.id,
                        "ep" => %String::from_utf8_lossy(ep.addr()));

        let rcvr = Rcvr::new(domain, ep, av.clone(), peer, &get_log)?;
        let sink = Sink::new(params.rounds);

        sessions.push(Session::new(
            Box::new(rcvr),
            Box::new(sink),
            pool.session_token(),
        ));
    }

    for s in sessions {
        pool.assign(s)?;
    }

    Ok(pool.join_all())
}
