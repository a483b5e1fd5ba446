//! warmsh wire protocol
//!
//! One connection carries exactly one session. The exchange is strictly
//! request/response:
//!
//! ```text
//! client                                   daemon / worker
//!   │── <5 ASCII digits><JSON request> ──────▶│
//!   │◀── descriptors (SCM_RIGHTS, 1 or 3) ────│   see `channel`
//!   │    ... raw bytes on the descriptors ... │
//!   │◀── 1 byte exit status ──────────────────│   written by the worker
//! ```
//!
//! The length prefix is zero padded decimal, so a payload can never exceed
//! [`MAX_PAYLOAD_LEN`] bytes.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;

/// Width of the ASCII length prefix
pub const LENGTH_DIGITS: usize = 5;

/// Largest payload the length prefix can describe
pub const MAX_PAYLOAD_LEN: usize = 99_999;

/// Client exit status when the connection drops before the status byte
pub const EXIT_CONNECTION_LOST: i32 = 1;

/// Session request sent by the client (Client → Daemon)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionRequest {
    /// Environment the worker adopts
    pub env: BTreeMap<String, String>,
    /// Working directory the worker changes into
    pub cwd: String,
    /// Full argument vector of the client, program name included
    pub argv: Vec<String>,
    /// Whether the client sits on a terminal (PTY session) or not (pipes)
    pub interactive: bool,
}

impl SessionRequest {
    /// Capture the calling process's environment, directory and arguments
    pub fn from_current_process(interactive: bool) -> io::Result<Self> {
        let env = env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let cwd = env::current_dir()?.to_string_lossy().into_owned();
        let argv = env::args_os()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        Ok(Self {
            env,
            cwd,
            argv,
            interactive,
        })
    }
}

/// Encode a request into the wire format
///
/// Format: [5 ASCII digits, zero padded][JSON payload]
pub fn encode(request: &SessionRequest) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(request)
        .map_err(|e| SessionError::protocol(format!("failed to serialize request: {e}")))?;

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(SessionError::protocol(format!(
            "request too large: {} bytes (limit {})",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    let mut frame = Vec::with_capacity(LENGTH_DIGITS + payload.len());
    frame.extend_from_slice(format!("{:0width$}", payload.len(), width = LENGTH_DIGITS).as_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a complete frame held in memory
pub fn decode(frame: &[u8]) -> Result<SessionRequest> {
    if frame.len() < LENGTH_DIGITS {
        return Err(SessionError::protocol("frame shorter than length prefix"));
    }
    let (header, payload) = frame.split_at(LENGTH_DIGITS);
    let declared = parse_length(header)?;
    if declared != payload.len() {
        return Err(SessionError::protocol(format!(
            "declared length {} does not match payload length {}",
            declared,
            payload.len()
        )));
    }
    parse_payload(payload)
}

/// Read one request from a stream
///
/// A peer that closes before the declared length is reached, or that stalls
/// past the stream's read timeout, yields [`SessionError::Protocol`]. A peer
/// that closes without sending a single byte yields
/// [`SessionError::Disconnected`].
pub fn read_request<R: Read>(reader: &mut R) -> Result<SessionRequest> {
    let mut header = [0u8; LENGTH_DIGITS];
    match read_full(reader, &mut header, "length prefix")? {
        0 => return Err(SessionError::Disconnected),
        n if n < LENGTH_DIGITS => return Err(truncated(n, LENGTH_DIGITS, "length prefix")),
        _ => {}
    }
    let declared = parse_length(&header)?;

    let mut payload = vec![0u8; declared];
    let n = read_full(reader, &mut payload, "payload")?;
    if n < declared {
        return Err(truncated(n, declared, "payload"));
    }
    parse_payload(&payload)
}

/// Write one request to a stream
pub fn write_request<W: Write>(writer: &mut W, request: &SessionRequest) -> Result<()> {
    let frame = encode(request)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Fail if the peer already sent bytes beyond the declared payload
pub fn ensure_drained(stream: &UnixStream) -> Result<()> {
    stream.set_nonblocking(true)?;
    let mut probe = [0u8; 1];
    let outcome = (&*stream).read(&mut probe);
    stream.set_nonblocking(false)?;

    match outcome {
        Ok(0) => Ok(()),
        Ok(_) => Err(SessionError::protocol("unexpected bytes after request payload")),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Send the worker's exit status (Worker → Client)
pub fn send_exit_status<W: Write>(writer: &mut W, status: u8) -> io::Result<()> {
    writer.write_all(&[status])?;
    writer.flush()
}

/// Receive the worker's exit status
///
/// Returns `None` when the connection closed before the byte arrived.
pub fn recv_exit_status<R: Read>(reader: &mut R) -> io::Result<Option<u8>> {
    let mut status = [0u8; 1];
    loop {
        match reader.read(&mut status) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(status[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Fold a shell exit code into the single status byte
pub fn status_byte(code: i32) -> u8 {
    (code & 0xff) as u8
}

fn parse_length(header: &[u8]) -> Result<usize> {
    if header.len() != LENGTH_DIGITS || !header.iter().all(u8::is_ascii_digit) {
        return Err(SessionError::protocol(format!(
            "length prefix must be {} ASCII digits, got {:?}",
            LENGTH_DIGITS,
            String::from_utf8_lossy(header)
        )));
    }
    header
        .iter()
        .try_fold(0usize, |acc, digit| Some(acc * 10 + usize::from(digit - b'0')))
        .ok_or_else(|| SessionError::protocol("length prefix overflow"))
}

fn parse_payload(payload: &[u8]) -> Result<SessionRequest> {
    serde_json::from_slice(payload)
        .map_err(|e| SessionError::protocol(format!("malformed request payload: {e}")))
}

/// Fill `buf` unless the peer closes first; returns the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(SessionError::protocol(format!(
                    "timed out after {} of {} {} bytes",
                    filled,
                    buf.len(),
                    what
                )))
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn truncated(got: usize, expected: usize, what: &str) -> SessionError {
    SessionError::protocol(format!("peer closed after {got} of {expected} {what} bytes"))
}
