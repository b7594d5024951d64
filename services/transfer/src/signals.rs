//! Cancellation signals. The handlers may only touch an atomic, so a tiny
//! watcher thread bridges the flag onto the run's cancellation token.

use freighter::support::CancelToken;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_cancel(_signum: libc::c_int) {
    SIGNALLED.store(true, Ordering::Relaxed);
}

/// Installs SIGHUP/SIGINT/SIGQUIT/SIGTERM handlers that trip `token`.
pub fn install(token: &CancelToken) {
    let signums = [libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM];

    unsafe {
        for signum in &signums {
            libc::signal(*signum, handle_cancel as libc::sighandler_t);
        }
    }

    let token = token.clone();

    thread::Builder::new()
        .name("cancel-watch".to_string())
        .spawn(move || loop {
            if SIGNALLED.load(Ordering::Relaxed) {
                token.cancel();
                return;
            }
            thread::sleep(Duration::from_millis(50));
        })
        .expect("cancel watcher thread creation failed");
}
