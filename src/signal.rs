//! Process-wide signal registration
//!
//! Handlers only flip flags or run a single async-signal-safe action; the
//! work they trigger lives in the server and terminal modules. Each entry
//! point registers once, at startup.

use crate::terminal;
use anyhow::Result;
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGWINCH};
use signal_hook::SigId;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flags set by the daemon's signal handlers
#[derive(Clone, Default)]
pub struct DaemonSignals {
    shutdown: Arc<AtomicBool>,
    child_exited: Arc<AtomicBool>,
}

impl DaemonSignals {
    /// Flags with no handlers attached, for driving a server by hand
    pub fn new() -> Self {
        Self::default()
    }

    /// Install handlers for SIGCHLD, SIGINT, SIGTERM and SIGHUP
    pub fn register() -> Result<Self> {
        let signals = Self::new();
        signal_hook::flag::register(SIGCHLD, Arc::clone(&signals.child_exited))?;
        for sig in [SIGINT, SIGTERM, SIGHUP] {
            signal_hook::flag::register(sig, Arc::clone(&signals.shutdown))?;
        }
        Ok(signals)
    }

    /// Check if shutdown was requested
    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Consume a pending child-exit notification
    pub fn take_child_exited(&self) -> bool {
        self.child_exited.swap(false, Ordering::SeqCst)
    }

    pub fn notify_child_exited(&self) {
        self.child_exited.store(true, Ordering::SeqCst);
    }
}

/// Forward local window changes to the remote terminal on SIGWINCH
///
/// The resize runs inside the handler and is best effort: errors are dropped
/// so a failed resize never ends the session. The caller unregisters the
/// returned id before either descriptor is closed.
pub fn on_window_change(local: RawFd, remote: RawFd) -> io::Result<SigId> {
    // SAFETY: the action only issues two ioctls, which are async-signal-safe.
    unsafe {
        signal_hook::low_level::register(SIGWINCH, move || {
            let _ = terminal::copy_window_size(local, remote);
        })
    }
}
