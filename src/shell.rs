//! The shell entry point a worker runs
//!
//! The daemon treats the shell as an opaque collaborator: it is called once
//! inside the already-forked worker, after the worker adopted the request's
//! environment and working directory, and blocks until the session is over.

use crate::daemon::protocol::SessionRequest;
use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{self, SigHandler, Signal};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::Command;

/// Shell entry point invoked once per session
pub trait Shell {
    /// Run the session to completion and return its exit code
    fn run(&self, request: &SessionRequest) -> Result<i32>;
}

impl<F> Shell for F
where
    F: Fn(&SessionRequest) -> Result<i32>,
{
    fn run(&self, request: &SessionRequest) -> Result<i32> {
        self(request)
    }
}

/// Runs an external shell program with the request's arguments
///
/// `argv[0]` of the request names the client binary and is dropped; the
/// remaining arguments are passed to the program unchanged.
#[derive(Debug, Clone)]
pub struct CommandShell {
    program: PathBuf,
}

impl CommandShell {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl Shell for CommandShell {
    fn run(&self, request: &SessionRequest) -> Result<i32> {
        let mut command = Command::new(&self.program);
        command
            .args(request.argv.iter().skip(1))
            .env_clear()
            .envs(&request.env)
            .current_dir(&request.cwd);

        // The worker ignores keyboard signals while it waits; the shell
        // itself must see them.
        // SAFETY: only async-signal-safe sigaction calls between fork and exec.
        unsafe {
            command.pre_exec(|| {
                for sig in [Signal::SIGINT, Signal::SIGQUIT] {
                    signal::signal(sig, SigHandler::SigDfl)?;
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {}", self.program.display()))?;

        let _guard = IgnoreKeyboardSignals::install();
        let status = child
            .wait()
            .with_context(|| format!("failed to wait for {}", self.program.display()))?;

        status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .ok_or_else(|| anyhow!("{} ended without a status", self.program.display()))
    }
}

/// SIGINT/SIGQUIT ignored for the guard's lifetime, like system(3)
struct IgnoreKeyboardSignals {
    previous: Vec<(Signal, SigHandler)>,
}

impl IgnoreKeyboardSignals {
    fn install() -> Self {
        let previous = [Signal::SIGINT, Signal::SIGQUIT]
            .into_iter()
            .filter_map(|sig| {
                // SAFETY: SIG_IGN installs no handler code.
                unsafe { signal::signal(sig, SigHandler::SigIgn) }
                    .ok()
                    .map(|old| (sig, old))
            })
            .collect();
        Self { previous }
    }
}

impl Drop for IgnoreKeyboardSignals {
    fn drop(&mut self) {
        for (sig, handler) in self.previous.drain(..) {
            // SAFETY: restores the disposition that was active before.
            let _ = unsafe { signal::signal(sig, handler) };
        }
    }
}
