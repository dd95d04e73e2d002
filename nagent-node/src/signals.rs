//! Shutdown signal handling.
//!
//! SIGINT and SIGTERM are blocked before any other thread starts, so every
//! thread inherits the mask, and a dedicated thread collects them with
//! `sigwait`. Tasks get an empty mask back in the child before exec.

use nix::sys::signal::{SigSet, Signal};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Block the shutdown signals in the calling thread. Call before spawning
/// any thread.
pub fn block_shutdown_signals() -> nix::Result<SigSet> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()?;
    Ok(set)
}

/// Wait for one of `set` and raise `shutdown`.
pub fn spawn_shutdown_waiter(
    set: SigSet,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || match set.wait() {
            Ok(signal) => {
                info!(%signal, "Shutdown requested");
                shutdown.store(true, Ordering::SeqCst);
            }
            Err(e) => error!(error = %e, "sigwait failed"),
        })
}
