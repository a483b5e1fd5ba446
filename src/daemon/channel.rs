//! Descriptor transfer over a connected Unix stream socket (SCM_RIGHTS)
//!
//! Each message is a single `sendmsg` with the descriptors attached as
//! ancillary data and a small framed payload:
//!
//! ```text
//! ┌──────────┬─────────────┬─────────────────────┐
//! │ fd count │ payload len │ payload (≤255 bytes)│
//! │ (1 byte) │  (1 byte)   │                     │
//! └──────────┴─────────────┴─────────────────────┘
//! ```
//!
//! The sender keeps ownership of its descriptors; it must close its own copies
//! once the send succeeded. Received descriptors come back as [`OwnedFd`].

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut, Read};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Most descriptors a single message may carry
pub const MAX_FDS: usize = 16;

/// Largest payload a single message may carry
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

const HEADER_LEN: usize = 2;

/// Send `payload` and `fds` as one message
pub fn send_fds(socket: &UnixStream, payload: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload too large: {} bytes", payload.len()),
        ));
    }
    if fds.len() > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("too many descriptors: {}", fds.len()),
        ));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(fds.len() as u8);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);

    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let rights = [ControlMessage::ScmRights(&raw)];
    let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() { &[] } else { &rights };
    let iov = [IoSlice::new(&frame)];

    let sent = loop {
        match sendmsg::<()>(socket.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    };

    if sent != frame.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short descriptor message: {} of {} bytes", sent, frame.len()),
        ));
    }
    Ok(())
}

/// Receive one message carrying exactly `expected` descriptors
pub fn recv_fds(socket: &UnixStream, expected: usize) -> io::Result<(Vec<u8>, Vec<OwnedFd>)> {
    let mut header = [0u8; HEADER_LEN];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);

    let (received, fds, truncated) = loop {
        let mut iov = [IoSliceMut::new(&mut header)];
        let msg = match recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                // SAFETY: the kernel installed these descriptors for us and
                // nothing else refers to them yet.
                fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        break (msg.bytes, fds, msg.flags.contains(MsgFlags::MSG_CTRUNC));
    };

    if received == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed before sending descriptors",
        ));
    }
    if truncated {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "descriptor message truncated",
        ));
    }

    let mut reader = socket;
    if received < HEADER_LEN {
        reader.read_exact(&mut header[received..])?;
    }

    let declared = usize::from(header[0]);
    if declared != fds.len() || fds.len() != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "expected {} descriptors, header declared {}, received {}",
                expected,
                declared,
                fds.len()
            ),
        ));
    }

    let mut payload = vec![0u8; usize::from(header[1])];
    reader.read_exact(&mut payload)?;
    Ok((payload, fds))
}
