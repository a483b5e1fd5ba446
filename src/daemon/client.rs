//! warmsh daemon client
//!
//! Connects to the daemon, sends the session request, receives the
//! worker's descriptors and turns them into a [`TerminalProxy`].

use crate::daemon::channel;
use crate::daemon::protocol::{self, SessionRequest};
use crate::daemon::proxy::TerminalProxy;
use crate::daemon::spawner::IoMode;
use crate::error::SessionError;
use anyhow::{anyhow, Result};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Client for connecting to the warmsh daemon
pub struct SessionClient {
    socket_path: PathBuf,
    stream: UnixStream,
}

/// Descriptors handed over by a worker
#[derive(Debug)]
pub enum RemoteIo {
    /// Master side of the worker's pseudo-terminal
    Pty(OwnedFd),
    /// Write end of the worker's stdin, read ends of its stdout and stderr
    Pipes([OwnedFd; 3]),
}

impl SessionClient {
    /// Connect to the daemon
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path).map_err(|e| {
            anyhow!(
                "Failed to connect to daemon at {}: {}",
                socket_path.display(),
                e
            )
        })?;
        Ok(Self {
            socket_path,
            stream,
        })
    }

    /// Check if a daemon accepts connections at `socket_path`
    pub fn is_daemon_running(socket_path: impl AsRef<Path>) -> bool {
        let socket_path = socket_path.as_ref();
        socket_path.exists() && UnixStream::connect(socket_path).is_ok()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send the request and wait for the worker's descriptors
    pub fn start(mut self, request: &SessionRequest) -> Result<(RemoteIo, UnixStream), SessionError> {
        protocol::write_request(&mut self.stream, request)?;

        let mode = IoMode::for_request(request);
        let expected = mode.client_fd_count();
        let (_payload, fds) = channel::recv_fds(&self.stream, expected)?;

        let remote = match mode {
            IoMode::Pty => {
                let master = fds
                    .into_iter()
                    .next()
                    .ok_or_else(|| SessionError::protocol("no pty master received"))?;
                RemoteIo::Pty(master)
            }
            IoMode::Pipes => {
                let fds: [OwnedFd; 3] = fds.try_into().map_err(|fds: Vec<OwnedFd>| {
                    SessionError::protocol(format!("expected 3 descriptors, got {}", fds.len()))
                })?;
                RemoteIo::Pipes(fds)
            }
        };
        Ok((remote, self.stream))
    }

    /// Start a session on this process's stdio
    ///
    /// Interactive sessions put the controlling terminal into raw mode and
    /// forward window size changes to the worker's pty.
    pub fn attach(self, request: &SessionRequest) -> Result<TerminalProxy> {
        let (remote, stream) = self.start(request)?;
        let proxy = match remote {
            RemoteIo::Pty(master) => TerminalProxy::interactive(io::stdin(), master, stream)?,
            RemoteIo::Pipes(fds) => TerminalProxy::pipes(fds, stream)?,
        };
        Ok(proxy)
    }
}
