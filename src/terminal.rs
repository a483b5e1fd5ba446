use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

nix::ioctl_read_bad!(get_window_size, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, libc::winsize);

/// Whether the client runs on a terminal for both input and output
pub fn is_interactive() -> bool {
    atty::is(atty::Stream::Stdin) && atty::is(atty::Stream::Stdout)
}

/// Raw mode on a terminal, undone when the guard is dropped
pub struct RawModeGuard {
    fd: OwnedFd,
    saved: Termios,
    restored: bool,
}

impl RawModeGuard {
    /// Save the terminal's current mode and switch it to raw mode
    pub fn enter(terminal: BorrowedFd<'_>) -> io::Result<Self> {
        let fd = terminal.try_clone_to_owned()?;
        let saved = tcgetattr(&fd)?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&fd, SetArg::TCSANOW, &raw)?;
        Ok(Self {
            fd,
            saved,
            restored: false,
        })
    }

    /// Mode captured before raw mode was applied
    pub fn saved_mode(&self) -> &Termios {
        &self.saved
    }

    /// Put the saved mode back, discarding unread input
    pub fn restore(&mut self) -> io::Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        tcsetattr(&self.fd, SetArg::TCSAFLUSH, &self.saved)?;
        Ok(())
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::warn!("failed to restore terminal mode: {}", e);
        }
    }
}

/// Read the window size of a terminal
pub fn window_size(fd: RawFd) -> io::Result<libc::winsize> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `size` is a valid winsize for the kernel to fill.
    unsafe { get_window_size(fd, &mut size) }?;
    Ok(size)
}

/// Apply the window size of `from` to `to`
///
/// Only ioctls, so it may run inside a signal handler.
pub fn copy_window_size(from: RawFd, to: RawFd) -> io::Result<()> {
    let size = window_size(from)?;
    // SAFETY: `size` outlives the call.
    unsafe { set_window_size(to, &size) }?;
    Ok(())
}

/// Best-effort resize of the remote terminal; failures are ignored
pub fn sync_window_size(local: BorrowedFd<'_>, remote: &impl AsFd) {
    let _ = copy_window_size(local.as_raw_fd(), remote.as_fd().as_raw_fd());
}
