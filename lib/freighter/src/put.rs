//! The putter: opens a transmitter session per configured source towards
//! the getter's listening address, hands them to the worker pool, and
//! waits for the pool to drain.

use crate::config::Params;
use crate::fabric::{AddressVector, Domain};
use crate::logging::{self, Logger};
use crate::session::Session;
use crate::support::TransferResult;
use crate::terminal::Source;
use crate::worker::WorkerPool;
use crate::xmtr::Xmtr;
use std::sync::Arc;

/// Runs the putter personality towards `dest_addr`. Returns whether the
/// run succeeded once every session has drained.
pub fn run<'a, L: Into<Option<&'a Logger>>>(
    domain: &Domain,
    dest_addr: &str,
    params: &Arc<Params>,
    log: L,
) -> TransferResult<bool> {
    let put_log = match log.into() {
        Some(log) => log.new(logging::o!("personality" => "fput")),
        _ => Logger::root(logging::Discard, logging::o!()),
    };

    let av = Arc::new(AddressVector::new());
    let listener = av.insert(dest_addr.as_bytes());

    logging::info!(put_log, "connecting";
                   "context" => "connect",
                   "addr" => dest_addr,
                   "nsessions" => params.nsessions,
                   "processors" => ?params.processors);

    let pool = WorkerPool::new(domain.clone(), params.clone(), &put_log);
    let mut sessions = Vec::with_capacity(params.nsessions);

    for id in 0..params.nsessions {
        let ep = domain.endpoint_anonymous(dest_addr.as_bytes())?;

        logging::debug!(put_log, "opened session endpoint";
                        "context" => "connect",
                        "id" => id,
                        "ep" => %String::from_utf8_lossy(ep.addr()));

        let xmtr = Xmtr::new(
            domain,
            ep,
            av.clone(),
            listener,
            params.nsessions as u32,
            id as u32,
            &put_log,
        )?;
        let source = Source::new(params.rounds);

        sessions.push(Session::new(
            Box::new(xmtr),
            Box::new(source),
            pool.session_token(),
        ));
    }

    for s in sessions {
        pool.assign(s)?;
    }

    Ok(pool.join_all())
}
