/// warmsh session daemon
///
/// - `protocol`: request framing and the exit-status byte
/// - `channel`: descriptor passing over the Unix socket (SCM_RIGHTS)
/// - `spawner`: fork-based session workers with PTY or pipe stdio
/// - `server`: Unix socket server, accept loop and child reaping
/// - `proxy`: client-side byte relay between local and remote descriptors
/// - `client`: thin client that starts a session and attaches to it
/// - `config`: socket, log and shell settings

pub mod channel;
pub mod client;
pub mod config;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod spawner;

pub use client::{RemoteIo, SessionClient};
pub use config::DaemonConfig;
pub use protocol::{read_request, write_request, SessionRequest, EXIT_CONNECTION_LOST};
pub use proxy::{ProxyMap, TerminalProxy};
pub use server::{reap_children, SessionHandle, SessionId, SessionServer};
pub use spawner::{IoMode, Worker};
