//! Fork-based session workers
//!
//! [`spawn`] duplicates the daemon and wires the child's standard streams to
//! either one pseudo-terminal or three pipes. The child runs the supplied
//! continuation, whose uninhabited [`Infallible`] return type guarantees it
//! never falls back into the daemon's accept loop. The parent gets a [`Worker`] holding the
//! client-facing descriptors.
//!
//! A handoff gate (one pipe) orders the worker's exit-status byte after the
//! descriptor transfer: the worker blocks in [`Handoff::wait`] until the
//! daemon calls [`Worker::release`].

use crate::daemon::protocol::SessionRequest;
use crate::error::SessionError;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, OpenptyResult};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{dup2, fork, pipe2, setsid, ForkResult, Pid};
use std::convert::Infallible;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};

/// Exit status of a worker whose stdio wiring failed after the fork
pub const EXIT_WIRING_FAILED: i32 = 126;

/// How the worker's standard streams are attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// One pseudo-terminal; the client gets the master
    Pty,
    /// Three pipes; the client gets [stdin-write, stdout-read, stderr-read]
    Pipes,
}

impl IoMode {
    pub fn for_request(request: &SessionRequest) -> Self {
        if request.interactive {
            IoMode::Pty
        } else {
            IoMode::Pipes
        }
    }

    /// Number of descriptors handed to the client
    pub fn client_fd_count(self) -> usize {
        match self {
            IoMode::Pty => 1,
            IoMode::Pipes => 3,
        }
    }
}

/// Worker-side and client-side descriptors before the fork
enum IoBundle {
    Pty {
        master: OwnedFd,
        slave: OwnedFd,
    },
    Pipes {
        stdin: (OwnedFd, OwnedFd),
        stdout: (OwnedFd, OwnedFd),
        stderr: (OwnedFd, OwnedFd),
    },
}

impl IoBundle {
    fn allocate(mode: IoMode) -> Result<Self, SessionError> {
        match mode {
            IoMode::Pty => {
                let OpenptyResult { master, slave } = openpty(None, None)
                    .map_err(|e| SessionError::spawn(format!("openpty failed: {e}")))?;
                Ok(IoBundle::Pty { master, slave })
            }
            IoMode::Pipes => Ok(IoBundle::Pipes {
                stdin: cloexec_pipe()?,
                stdout: cloexec_pipe()?,
                stderr: cloexec_pipe()?,
            }),
        }
    }

    /// Parent side: keep only what the client receives
    fn into_client_fds(self) -> Vec<OwnedFd> {
        match self {
            IoBundle::Pty { master, slave } => {
                drop(slave);
                vec![master]
            }
            IoBundle::Pipes {
                stdin: (stdin_read, stdin_write),
                stdout: (stdout_read, stdout_write),
                stderr: (stderr_read, stderr_write),
            } => {
                drop((stdin_read, stdout_write, stderr_write));
                vec![stdin_write, stdout_read, stderr_read]
            }
        }
    }

    /// Child side: install the worker's ends as fds 0, 1 and 2
    fn install_as_stdio(self) -> nix::Result<()> {
        match self {
            IoBundle::Pty { master, slave } => {
                drop(master);
                setsid()?;
                // SAFETY: plain ioctl on a descriptor we own.
                let rc = unsafe { libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) };
                if rc != 0 {
                    return Err(nix::errno::Errno::last());
                }
                for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
                    if slave.as_raw_fd() != target {
                        dup2(slave.as_raw_fd(), target)?;
                    }
                }
                if slave.as_raw_fd() <= libc::STDERR_FILENO {
                    let _ = slave.into_raw_fd();
                }
                Ok(())
            }
            IoBundle::Pipes {
                stdin: (stdin_read, stdin_write),
                stdout: (stdout_read, stdout_write),
                stderr: (stderr_read, stderr_write),
            } => {
                drop((stdin_write, stdout_read, stderr_read));
                install_stdio(stdin_read, libc::STDIN_FILENO)?;
                install_stdio(stdout_write, libc::STDOUT_FILENO)?;
                install_stdio(stderr_write, libc::STDERR_FILENO)?;
                Ok(())
            }
        }
    }
}

/// Parent-side handle of a freshly forked worker
#[derive(Debug)]
pub struct Worker {
    pid: Pid,
    mode: IoMode,
    client_fds: Vec<OwnedFd>,
    gate: File,
}

impl Worker {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    /// Descriptors to transfer to the client, in protocol order
    pub fn client_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.client_fds.iter().map(|fd| fd.as_fd()).collect()
    }

    /// Close the daemon's copies of the client descriptors and let the
    /// worker proceed to its exit-status byte.
    ///
    /// Dropping a `Worker` without releasing it aborts the handoff: the
    /// worker finishes without writing a status.
    pub fn release(self) -> io::Result<Pid> {
        let Worker {
            pid,
            client_fds,
            mut gate,
            ..
        } = self;
        drop(client_fds);
        gate.write_all(&[1])?;
        Ok(pid)
    }
}

/// Child-side end of the handoff gate
#[derive(Debug)]
pub struct Handoff {
    gate: File,
}

impl Handoff {
    /// Block until the daemon released or abandoned this worker.
    ///
    /// Returns `true` once the descriptors reached the client.
    pub fn wait(mut self) -> bool {
        let mut token = [0u8; 1];
        loop {
            match self.gate.read(&mut token) {
                Ok(n) => return n == 1,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Fork a worker with its stdio wired for `mode`.
///
/// Returns only in the parent. In the child, `on_child` runs with the
/// handoff gate and must terminate the process; a `-> !` function in
/// tail position satisfies the bound.
pub fn spawn<F>(mode: IoMode, on_child: F) -> Result<Worker, SessionError>
where
    F: FnOnce(Handoff) -> Infallible,
{
    let bundle = IoBundle::allocate(mode)?;
    let (gate_read, gate_write) = cloexec_pipe()?;

    // SAFETY: the daemon is single threaded, so the child cannot inherit a
    // lock held by another thread.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(gate_read);
            drop(on_child);
            Ok(Worker {
                pid: child,
                mode,
                client_fds: bundle.into_client_fds(),
                gate: File::from(gate_write),
            })
        }
        Ok(ForkResult::Child) => {
            drop(gate_write);
            restore_default_signals();
            if let Err(e) = bundle.install_as_stdio() {
                tracing::error!("worker {}: failed to wire stdio: {}", std::process::id(), e);
                std::process::exit(EXIT_WIRING_FAILED);
            }
            match on_child(Handoff {
                gate: File::from(gate_read),
            }) {}
        }
        Err(e) => Err(SessionError::spawn(format!("fork failed: {e}"))),
    }
}

/// Undo the daemon's process-wide handlers in a fresh worker
fn restore_default_signals() {
    for sig in [Signal::SIGCHLD, Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: installing SIG_DFL has no handler code to race with.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
}

fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), SessionError> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| SessionError::spawn(format!("pipe failed: {e}")))
}

/// Make `fd` the process's descriptor `target`, surviving exec
fn install_stdio(fd: OwnedFd, target: RawFd) -> nix::Result<()> {
    if fd.as_raw_fd() == target {
        fcntl(target, FcntlArg::F_SETFD(FdFlag::empty()))?;
        let _ = fd.into_raw_fd();
    } else {
        dup2(fd.as_raw_fd(), target)?;
    }
    Ok(())
}
