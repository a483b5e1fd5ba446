//! Client-side byte relay between local stdio and the worker's descriptors
//!
//! A [`ProxyMap`] holds descriptor pairs. Each pair joins one local and one
//! remote descriptor and carries bytes in one or both directions. The relay
//! loop polls every live source, forwards what it reads to the paired sink,
//! and drops a whole pair (closing both descriptors) as soon as either side
//! reaches end-of-stream. A one-way pair whose sink hangs up is dropped too,
//! so a quiet local stdin does not outlive the worker. The loop ends when no
//! pair is left or an I/O operation fails.
//!
//! Sinks are non-blocking. Bytes a sink cannot take yet stay pending on their
//! pair; the loop then waits for the sink to become writable and stops reading
//! that direction's source until the backlog is flushed, so a full pipe in one
//! direction never stalls the others.

use crate::daemon::protocol::{self, EXIT_CONNECTION_LOST};
use crate::signal;
use crate::terminal::{self, RawModeGuard};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use signal_hook::SigId;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

/// Bytes moved per read
pub const CHUNK_SIZE: usize = 1024;

/// Which way bytes flow inside a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// local → remote
    Outbound,
    /// remote → local
    Inbound,
    /// both ways (terminal ↔ pty master)
    Both,
}

impl Direction {
    fn writes_to(self, side: Side) -> bool {
        match self {
            Direction::Both => true,
            Direction::Outbound => side == Side::Remote,
            Direction::Inbound => side == Side::Local,
        }
    }
}

/// Side of a pair a read comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

/// Identifier of a pair inside one map
pub type PairId = usize;

/// What a wait reported for one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    /// The source on this side has data or reached end-of-stream
    Readable(PairId, Side),
    /// The sink opposite this side can take more of its pending bytes
    Writable(PairId, Side),
    /// Nobody reads the sink of a one-way pair any more
    SinkClosed(PairId),
}

#[derive(Debug, Clone, Copy)]
enum Watch {
    Source(Side),
    Flush(Side),
    Sink,
}

/// One descriptor of a pair
struct Endpoint {
    file: File,
    /// `O_NONBLOCK` was set on open and is cleared again on drop
    set_nonblocking: bool,
}

impl Endpoint {
    fn new(fd: OwnedFd, nonblocking: bool) -> Self {
        let set_nonblocking = nonblocking && set_flag(&fd, true);
        Self {
            file: File::from(fd),
            set_nonblocking,
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // The description may be shared with the parent process's stdio.
        if self.set_nonblocking {
            set_flag(&self.file, false);
        }
    }
}

/// Toggle `O_NONBLOCK`; returns true when the flag actually changed
fn set_flag(fd: &impl AsRawFd, nonblocking: bool) -> bool {
    let raw = fd.as_raw_fd();
    let flags = match fcntl(raw, FcntlArg::F_GETFL) {
        Ok(bits) => OFlag::from_bits_truncate(bits),
        Err(e) => {
            tracing::debug!("fd {} keeps its mode: {}", raw, e);
            return false;
        }
    };
    if flags.contains(OFlag::O_NONBLOCK) == nonblocking {
        return false;
    }
    let mut updated = flags;
    updated.set(OFlag::O_NONBLOCK, nonblocking);
    match fcntl(raw, FcntlArg::F_SETFL(updated)) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("fd {} keeps its mode: {}", raw, e);
            false
        }
    }
}

struct Pair {
    local: Endpoint,
    remote: Endpoint,
    direction: Direction,
    /// Bytes read from the local side not yet written to the remote one
    from_local: Vec<u8>,
    /// Bytes read from the remote side not yet written to the local one
    from_remote: Vec<u8>,
}

impl Pair {
    fn reads_from(&self, side: Side) -> bool {
        self.direction.writes_to(side.other())
    }

    fn file(&self, side: Side) -> &File {
        match side {
            Side::Local => &self.local.file,
            Side::Remote => &self.remote.file,
        }
    }

    fn pending(&self, source: Side) -> &[u8] {
        match source {
            Side::Local => &self.from_local,
            Side::Remote => &self.from_remote,
        }
    }

    /// Read one chunk from `source` into its pending buffer
    fn fill(&mut self, source: Side, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let (file, pending) = match source {
            Side::Local => (&mut self.local.file, &mut self.from_local),
            Side::Remote => (&mut self.remote.file, &mut self.from_remote),
        };
        match file.read(buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                Ok(Some(n))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                Ok(Some(0))
            }
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write as much of `source`'s pending bytes as the sink takes now
    fn flush(&mut self, source: Side) -> io::Result<Transfer> {
        let (pending, sink) = match source {
            Side::Local => (&mut self.from_local, &mut self.remote.file),
            Side::Remote => (&mut self.from_remote, &mut self.local.file),
        };
        let mut written = 0;
        while written < pending.len() {
            match sink.write(&pending[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(Transfer::Closed),
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(Transfer::Closed),
                Err(e) => return Err(e),
            }
        }
        pending.drain(..written);
        Ok(Transfer::Forwarded(written))
    }
}

/// Outcome of moving bytes inside one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes read by [`ProxyMap::pump`] or written by [`ProxyMap::flush`]
    Forwarded(usize),
    Closed,
}

/// Local ↔ remote descriptor pairs of one session
#[derive(Default)]
pub struct ProxyMap {
    pairs: Vec<Option<Pair>>,
}

impl ProxyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal ↔ pty master
    pub fn interactive(terminal: OwnedFd, master: OwnedFd) -> Self {
        let mut map = Self::new();
        map.insert(terminal, master, Direction::Both);
        map
    }

    /// stdin → stdin-write, stdout-read → stdout, stderr-read → stderr
    ///
    /// `remote` must be in protocol order: [stdin-write, stdout-read, stderr-read].
    pub fn pipes(local: [OwnedFd; 3], remote: [OwnedFd; 3]) -> Self {
        let mut map = Self::new();
        let [stdin, stdout, stderr] = local;
        let [stdin_write, stdout_read, stderr_read] = remote;
        map.insert(stdin, stdin_write, Direction::Outbound);
        map.insert(stdout, stdout_read, Direction::Inbound);
        map.insert(stderr, stderr_read, Direction::Inbound);
        map
    }

    /// Add a pair; every descriptor it writes to becomes non-blocking
    pub fn insert(&mut self, local: OwnedFd, remote: OwnedFd, direction: Direction) -> PairId {
        self.pairs.push(Some(Pair {
            local: Endpoint::new(local, direction.writes_to(Side::Local)),
            remote: Endpoint::new(remote, direction.writes_to(Side::Remote)),
            direction,
            from_local: Vec::new(),
            from_remote: Vec::new(),
        }));
        self.pairs.len() - 1
    }

    /// Drop a pair, closing both of its descriptors
    pub fn remove(&mut self, pair: PairId) {
        if let Some(slot) = self.pairs.get_mut(pair) {
            *slot = None;
        }
    }

    pub fn contains(&self, pair: PairId) -> bool {
        matches!(self.pairs.get(pair), Some(Some(_)))
    }

    /// Number of live pairs
    pub fn len(&self) -> usize {
        self.pairs.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes read from `side` of `pair` that its sink has not taken yet
    pub fn pending(&self, pair: PairId, side: Side) -> usize {
        match self.pairs.get(pair) {
            Some(Some(entry)) => entry.pending(side).len(),
            _ => 0,
        }
    }

    /// Block until a source is readable, a backlogged sink is writable, or
    /// a one-way sink hung up
    ///
    /// A signal interrupting the wait yields an empty list.
    pub fn wait_ready(&self) -> io::Result<Vec<Ready>> {
        let mut watched: Vec<(PairId, Watch, &File)> = Vec::new();
        for (id, pair) in self
            .pairs
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|pair| (id, pair)))
        {
            for side in [Side::Local, Side::Remote] {
                if !pair.reads_from(side) {
                    continue;
                }
                let sink = pair.file(side.other());
                if !pair.pending(side).is_empty() {
                    watched.push((id, Watch::Flush(side), sink));
                    continue;
                }
                watched.push((id, Watch::Source(side), pair.file(side)));
                if pair.direction != Direction::Both {
                    watched.push((id, Watch::Sink, sink));
                }
            }
        }

        let mut fds: Vec<PollFd<'_>> = watched
            .iter()
            .map(|(_, watch, file)| {
                let events = match watch {
                    Watch::Source(_) => PollFlags::POLLIN,
                    Watch::Flush(_) => PollFlags::POLLOUT,
                    Watch::Sink => PollFlags::empty(),
                };
                PollFd::new(file.as_fd(), events)
            })
            .collect();

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;
        let mut ready = Vec::new();
        for ((id, watch, _), fd) in watched.iter().zip(&fds) {
            let revents = fd.revents().unwrap_or(PollFlags::empty());
            if revents.contains(PollFlags::POLLNVAL) {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            match watch {
                Watch::Source(side) if revents.intersects(PollFlags::POLLIN | hangup) => {
                    ready.push(Ready::Readable(*id, *side))
                }
                Watch::Flush(side) if revents.intersects(PollFlags::POLLOUT | hangup) => {
                    ready.push(Ready::Writable(*id, *side))
                }
                Watch::Sink if revents.intersects(hangup) => ready.push(Ready::SinkClosed(*id)),
                _ => {}
            }
        }
        Ok(ready)
    }

    /// Read one chunk from `side` of `pair` and pass it on to the other side
    ///
    /// Whatever the sink does not take right away stays pending for
    /// [`ProxyMap::flush`]. End-of-stream on the source, `EIO` from a pty
    /// master whose slave is gone, or a broken pipe on the sink all report
    /// [`Transfer::Closed`].
    pub fn pump(&mut self, pair: PairId, side: Side, buf: &mut [u8]) -> io::Result<Transfer> {
        let Some(Some(entry)) = self.pairs.get_mut(pair) else {
            return Ok(Transfer::Closed);
        };
        let Some(n) = entry.fill(side, buf)? else {
            return Ok(Transfer::Closed);
        };
        match entry.flush(side)? {
            Transfer::Closed => Ok(Transfer::Closed),
            Transfer::Forwarded(_) => Ok(Transfer::Forwarded(n)),
        }
    }

    /// Write pending bytes read from `side` of `pair` to the other side
    pub fn flush(&mut self, pair: PairId, side: Side) -> io::Result<Transfer> {
        match self.pairs.get_mut(pair) {
            Some(Some(entry)) => entry.flush(side),
            _ => Ok(Transfer::Closed),
        }
    }
}

/// Relay bytes until every pair is closed or an I/O operation fails
pub fn relay(map: &mut ProxyMap) -> io::Result<()> {
    let mut buf = [0u8; CHUNK_SIZE];
    while !map.is_empty() {
        for event in map.wait_ready()? {
            match event {
                Ready::Readable(pair, side) if map.contains(pair) => {
                    if map.pump(pair, side, &mut buf)? == Transfer::Closed {
                        tracing::debug!("pair {} closed on {:?} side", pair, side);
                        map.remove(pair);
                    }
                }
                Ready::Writable(pair, side) if map.contains(pair) => {
                    if map.flush(pair, side)? == Transfer::Closed {
                        tracing::debug!("pair {} sink closed", pair);
                        map.remove(pair);
                    }
                }
                Ready::SinkClosed(pair) if map.contains(pair) => {
                    tracing::debug!("pair {} sink hung up", pair);
                    map.remove(pair);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Client half of a live session
///
/// Owns the relay map, the original connection (for the exit-status byte)
/// and, for interactive sessions, the raw-mode guard of the local terminal
/// and the SIGWINCH action resizing the remote one.
pub struct TerminalProxy {
    map: ProxyMap,
    connection: UnixStream,
    raw_mode: Option<RawModeGuard>,
    window_watch: Option<SigId>,
}

impl TerminalProxy {
    /// Interactive session: local terminal ↔ remote pty master
    ///
    /// The terminal goes into raw mode when it supports it, and the remote
    /// side immediately gets the local window size.
    pub fn interactive(
        terminal: impl AsFd,
        master: OwnedFd,
        connection: UnixStream,
    ) -> io::Result<Self> {
        let tty = terminal.as_fd();
        let raw_mode = match RawModeGuard::enter(tty) {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::debug!("terminal stays in cooked mode: {}", e);
                None
            }
        };
        terminal::sync_window_size(tty, &master);

        // The action only ever sees descriptors owned by the map.
        let local = tty.try_clone_to_owned()?;
        let window_watch = signal::on_window_change(local.as_raw_fd(), master.as_raw_fd())?;
        Ok(Self {
            map: ProxyMap::interactive(local, master),
            connection,
            raw_mode,
            window_watch: Some(window_watch),
        })
    }

    /// Non-interactive session over the process's own stdio
    pub fn pipes(remote: [OwnedFd; 3], connection: UnixStream) -> io::Result<Self> {
        let local = [
            io::stdin().as_fd().try_clone_to_owned()?,
            io::stdout().as_fd().try_clone_to_owned()?,
            io::stderr().as_fd().try_clone_to_owned()?,
        ];
        Ok(Self::with_map(ProxyMap::pipes(local, remote), connection))
    }

    /// Session over an arbitrary map, with no terminal handling
    pub fn with_map(map: ProxyMap, connection: UnixStream) -> Self {
        Self {
            map,
            connection,
            raw_mode: None,
            window_watch: None,
        }
    }

    /// SIGWINCH action of an interactive session, until the relay ends
    pub fn window_watch(&self) -> Option<SigId> {
        self.window_watch
    }

    fn stop_window_watch(&mut self) {
        if let Some(id) = self.window_watch.take() {
            signal_hook::low_level::unregister(id);
        }
    }

    /// Relay until the worker is done and return the status to exit with
    ///
    /// The terminal mode is restored on every path before the status byte
    /// is read.
    pub fn session(mut self) -> i32 {
        if let Err(e) = relay(&mut self.map) {
            tracing::warn!("session i/o failed: {}", e);
        }
        self.stop_window_watch();
        drop(std::mem::take(&mut self.map));

        if let Some(mut guard) = self.raw_mode.take() {
            if let Err(e) = guard.restore() {
                tracing::warn!("failed to restore terminal mode: {}", e);
            }
        }

        match protocol::recv_exit_status(&mut self.connection) {
            Ok(Some(status)) => i32::from(status),
            Ok(None) => {
                tracing::warn!("connection closed before exit status");
                EXIT_CONNECTION_LOST
            }
            Err(e) => {
                tracing::warn!("failed to read exit status: {}", e);
                EXIT_CONNECTION_LOST
            }
        }
    }

    /// Run the session and exit the process with the worker's status
    pub fn run(self) -> ! {
        let code = self.session();
        std::process::exit(code)
    }
}

impl Drop for TerminalProxy {
    fn drop(&mut self) {
        self.stop_window_watch();
    }
}
