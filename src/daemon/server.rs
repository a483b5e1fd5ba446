use crate::daemon::channel;
use crate::daemon::config::DaemonConfig;
use crate::daemon::protocol::{self, SessionRequest};
use crate::daemon::spawner::{self, Handoff, IoMode};
use crate::error::SessionError;
use crate::shell::Shell;
use crate::signal::DaemonSignals;
use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Exit status reported when the shell fails instead of returning a code
pub const EXIT_SHELL_FAILED: u8 = 1;

/// Session identifier (process ID of worker)
pub type SessionId = i32;

/// Book-keeping for one live worker
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub worker_pid: Pid,
    pub mode: IoMode,
    pub created_at: Instant,
}

/// Reap every terminated child without blocking
///
/// Stops once no zombie is pending. Failures end the sweep and are logged;
/// they are never fatal.
pub fn reap_children() -> Vec<WaitStatus> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => reaped.push(status),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                warn!("waitpid failed: {}", e);
                break;
            }
        }
    }
    reaped
}

/// The session daemon: listening socket, accept loop, live workers
pub struct SessionServer<S: Shell> {
    config: DaemonConfig,
    shell: S,
    listener: Option<UnixListener>,
    sessions: HashMap<SessionId, SessionHandle>,
}

impl<S: Shell> SessionServer<S> {
    pub fn new(config: DaemonConfig, shell: S) -> Self {
        Self {
            config,
            shell,
            listener: None,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Live sessions, keyed by worker pid
    pub fn sessions(&self) -> &HashMap<SessionId, SessionHandle> {
        &self.sessions
    }

    /// Bind the Unix socket and write the pid file
    pub fn bind(&mut self) -> Result<()> {
        self.config.ensure_state_dir()?;
        let socket_path = &self.config.socket_path;

        // Remove stale socket if it exists
        if socket_path.exists() {
            fs::remove_file(socket_path)
                .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;

        // Set socket permissions to 0600 (owner read/write only)
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(socket_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(socket_path, perms)?;
        }

        listener.set_nonblocking(true)?;
        self.listener = Some(listener);
        self.write_pid_file()?;

        info!("listening on {}", socket_path.display());
        Ok(())
    }

    /// Main accept loop
    ///
    /// Runs until a shutdown signal arrives. Per-connection failures are
    /// logged and skipped; an error from the listener itself ends the loop.
    pub fn run(&mut self, signals: &DaemonSignals) -> Result<()> {
        if self.listener.is_none() {
            self.bind()?;
        }
        let timeout = u16::try_from(self.config.poll_interval.as_millis())
            .map(PollTimeout::from)
            .unwrap_or(PollTimeout::MAX);

        while !signals.should_shutdown() {
            if signals.take_child_exited() {
                self.reap();
            }

            let accepted = {
                let listener = self.listener.as_ref().ok_or_else(|| anyhow!("Socket not bound"))?;
                let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, timeout) {
                    Ok(0) | Err(Errno::EINTR) => continue,
                    Ok(_) => {}
                    Err(e) => return Err(anyhow!("poll on listening socket failed: {}", e)),
                }
                listener.accept()
            };

            match accepted {
                Ok((stream, _addr)) => match self.accept_connection(stream) {
                    Ok(_) => {}
                    Err(SessionError::Disconnected) => debug!("peer hung up before a request"),
                    Err(e) => warn!("[{}] connection aborted: {}", e.error_code(), e),
                },
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::ECONNABORTED) => {}
                Err(e) => return Err(anyhow!("accept failed: {}", e)),
            }
        }

        info!(
            "shutting down, {} session(s) still running",
            self.sessions.len()
        );
        Ok(())
    }

    /// Serve one connection: read the request, fork the worker, hand the
    /// worker's descriptors to the client
    pub fn accept_connection(&mut self, stream: UnixStream) -> Result<SessionId, SessionError> {
        // Reset to blocking mode for the connection
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.request_timeout))?;
        let request = protocol::read_request(&mut &stream)?;
        protocol::ensure_drained(&stream)?;
        stream.set_read_timeout(None)?;

        info!(
            "starting session: argv={:?} cwd={} interactive={}",
            request.argv, request.cwd, request.interactive
        );
        debug!("session env: {:?}", request.env);

        let mode = IoMode::for_request(&request);
        let worker_stream = stream.try_clone()?;
        // The worker only talks over its own clone of the connection.
        let daemon_fds: Vec<RawFd> = self
            .listener
            .iter()
            .map(AsRawFd::as_raw_fd)
            .chain([stream.as_raw_fd()])
            .collect();
        let shell = &self.shell;
        let worker = spawner::spawn(mode, move |handoff| {
            for fd in daemon_fds {
                let _ = nix::unistd::close(fd);
            }
            run_worker(shell, worker_stream, request, handoff)
        })?;
        let pid = worker.pid();

        // A failed transfer drops `worker` unreleased, so the worker exits
        // without writing a status.
        channel::send_fds(&stream, &[], &worker.client_fds())?;
        worker.release()?;
        drop(stream);

        let handle = SessionHandle {
            id: pid.as_raw(),
            worker_pid: pid,
            mode,
            created_at: Instant::now(),
        };
        self.sessions.insert(handle.id, handle);
        debug!("worker {} attached", pid);
        Ok(pid.as_raw())
    }

    /// Reap finished workers and drop their session records
    pub fn reap(&mut self) -> usize {
        let reaped = reap_children();
        for status in &reaped {
            let Some(pid) = status.pid() else { continue };
            let elapsed = self
                .sessions
                .remove(&pid.as_raw())
                .map(|handle| handle.created_at.elapsed());

            match status {
                WaitStatus::Exited(_, code) => {
                    info!("worker {} exited with {} after {:?}", pid, code, elapsed)
                }
                WaitStatus::Signaled(_, sig, _) => {
                    info!("worker {} killed by {:?} after {:?}", pid, sig, elapsed)
                }
                other => debug!("worker {} changed state: {:?}", pid, other),
            }
        }
        reaped.len()
    }

    fn write_pid_file(&self) -> Result<()> {
        fs::write(&self.config.pid_path, std::process::id().to_string())
            .with_context(|| format!("failed to write {}", self.config.pid_path.display()))
    }

    fn remove_pid_file(&self) {
        if self.config.pid_path.exists() {
            let _ = fs::remove_file(&self.config.pid_path);
        }
    }
}

impl<S: Shell> Drop for SessionServer<S> {
    fn drop(&mut self) {
        if self.listener.is_none() {
            return;
        }
        self.remove_pid_file();

        // Cleanup socket on drop
        if self.config.socket_path.exists() {
            let _ = fs::remove_file(&self.config.socket_path);
        }
    }
}

/// Worker process body: adopt the request, run the shell, report the status
fn run_worker<S: Shell + ?Sized>(
    shell: &S,
    mut stream: UnixStream,
    request: SessionRequest,
    handoff: Handoff,
) -> ! {
    let status = match adopt_request(&request).and_then(|()| invoke_shell(shell, &request)) {
        Ok(code) => protocol::status_byte(code),
        Err(e) => {
            error!("[{}] worker {}: {}", e.error_code(), std::process::id(), e);
            EXIT_SHELL_FAILED
        }
    };

    if !handoff.wait() {
        warn!("worker {}: client never attached", std::process::id());
        std::process::exit(i32::from(status));
    }
    if let Err(e) = protocol::send_exit_status(&mut stream, status) {
        warn!("worker {}: failed to send exit status: {}", std::process::id(), e);
    }
    std::process::exit(i32::from(status));
}

/// Replace the worker's environment and working directory with the client's
fn adopt_request(request: &SessionRequest) -> Result<(), SessionError> {
    for (key, _) in env::vars_os() {
        env::remove_var(key);
    }
    for (key, value) in &request.env {
        if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
            continue;
        }
        env::set_var(key, value);
    }
    env::set_current_dir(Path::new(&request.cwd)).map_err(|e| {
        SessionError::Collaborator(format!("cannot enter {}: {}", request.cwd, e))
    })
}

/// Call the shell, turning errors and panics into collaborator failures
fn invoke_shell<S: Shell + ?Sized>(shell: &S, request: &SessionRequest) -> Result<i32, SessionError> {
    match panic::catch_unwind(AssertUnwindSafe(|| shell.run(request))) {
        Ok(Ok(code)) => Ok(code),
        Ok(Err(e)) => Err(SessionError::Collaborator(format!("{e:#}"))),
        Err(_) => Err(SessionError::Collaborator("shell panicked".to_string())),
    }
}
