// Integration tests for fork-based session workers
//
// These tests verify that:
// - Pipe workers hand out exactly 3 descriptors, PTY workers exactly 1
// - The child sees its stdio (and controlling terminal) wired up
// - The parent keeps no copy of a descriptor once the worker is released
// - Dropping an unreleased worker aborts the handoff
//
// Forking test bodies are serialized so no child inherits another test's
// descriptors. Children leave through `_exit` and only use raw syscalls.

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{isatty, Pid};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use warmsh::daemon::spawner::{self, IoMode};

static FORK_LOCK: Mutex<()> = Mutex::new(());

fn fork_lock() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn child_exit(code: i32) -> ! {
    // SAFETY: `_exit` skips atexit handlers inherited from the test harness.
    unsafe { libc::_exit(code) }
}

fn raw_write(fd: RawFd, bytes: &[u8]) {
    // SAFETY: plain write(2) of a live buffer.
    unsafe {
        libc::write(fd, bytes.as_ptr().cast(), bytes.len());
    }
}

fn wait_exit(pid: Pid) -> i32 {
    match waitpid(pid, None).unwrap() {
        WaitStatus::Exited(_, code) => code,
        other => panic!("worker did not exit normally: {other:?}"),
    }
}

fn fd_target(fd: BorrowedFd<'_>) -> String {
    fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd()))
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

/// Number of open descriptors in this process pointing at `target`
fn open_copies(target: &str) -> usize {
    fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| fs::read_link(entry.ok()?.path()).ok())
        .filter(|link| link.to_string_lossy() == target)
        .count()
}

fn owned_copies(fds: &[BorrowedFd<'_>]) -> Vec<OwnedFd> {
    fds.iter().map(|fd| fd.try_clone_to_owned().unwrap()).collect()
}

// ============================================================================
// PIPE WORKERS
// ============================================================================

#[test]
fn test_pipe_worker_gets_three_descriptors() {
    let _guard = fork_lock();

    let worker = spawner::spawn(IoMode::Pipes, |handoff| {
        raw_write(libc::STDOUT_FILENO, b"to stdout");
        raw_write(libc::STDERR_FILENO, b"to stderr");
        child_exit(if handoff.wait() { 7 } else { 9 })
    })
    .unwrap();

    assert_eq!(worker.mode(), IoMode::Pipes);
    let fds = worker.client_fds();
    assert_eq!(fds.len(), 3);
    let [stdin_write, stdout_read, stderr_read]: [OwnedFd; 3] =
        owned_copies(&fds).try_into().unwrap();
    drop(fds);

    let pid = worker.release().unwrap();
    drop(stdin_write);

    let mut out = String::new();
    File::from(stdout_read).read_to_string(&mut out).unwrap();
    let mut err = String::new();
    File::from(stderr_read).read_to_string(&mut err).unwrap();

    assert_eq!(out, "to stdout");
    assert_eq!(err, "to stderr");
    assert_eq!(wait_exit(pid), 7);
}

#[test]
fn test_pipe_worker_reads_stdin_until_eof() {
    let _guard = fork_lock();

    let worker = spawner::spawn(IoMode::Pipes, |handoff| {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: read(2) into a live stack buffer.
            let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
            raw_write(libc::STDOUT_FILENO, &buf[..n as usize]);
        }
        child_exit(if handoff.wait() { 0 } else { 9 })
    })
    .unwrap();

    let [stdin_write, stdout_read, _stderr_read]: [OwnedFd; 3] =
        owned_copies(&worker.client_fds()).try_into().unwrap();
    let pid = worker.release().unwrap();

    let mut stdin = File::from(stdin_write);
    stdin.write_all(b"ping ").unwrap();
    stdin.write_all(b"pong").unwrap();
    drop(stdin);

    let mut out = String::new();
    File::from(stdout_read).read_to_string(&mut out).unwrap();
    assert_eq!(out, "ping pong");
    assert_eq!(wait_exit(pid), 0);
}

#[test]
fn test_released_descriptors_leave_no_daemon_copy() {
    let _guard = fork_lock();

    let worker = spawner::spawn(IoMode::Pipes, |handoff| {
        handoff.wait();
        child_exit(0)
    })
    .unwrap();

    let fds = worker.client_fds();
    let targets: Vec<String> = fds.iter().map(|fd| fd_target(*fd)).collect();
    let copies = owned_copies(&fds);
    drop(fds);

    // worker-held copy plus ours
    for target in &targets {
        assert_eq!(open_copies(target), 2, "{target}");
    }

    let pid = worker.release().unwrap();
    for target in &targets {
        assert_eq!(open_copies(target), 1, "{target} still open in the daemon");
    }

    drop(copies);
    assert_eq!(wait_exit(pid), 0);
}

// ============================================================================
// PTY WORKERS
// ============================================================================

#[test]
fn test_pty_worker_gets_master() {
    let _guard = fork_lock();

    let worker = spawner::spawn(IoMode::Pty, |handoff| {
        let stdio_is_tty = (0..3).all(|fd| {
            // SAFETY: isatty(3) only inspects the descriptor.
            unsafe { libc::isatty(fd) == 1 }
        });
        // A controlling terminal makes /dev/tty openable.
        // SAFETY: open(2) of a static path; the result is only compared.
        let has_ctty = unsafe { libc::open(c"/dev/tty".as_ptr(), libc::O_RDWR) } >= 0;
        let released = handoff.wait();
        child_exit(match (stdio_is_tty, has_ctty, released) {
            (true, true, true) => 0,
            (false, _, _) => 2,
            (_, false, _) => 3,
            _ => 4,
        })
    })
    .unwrap();

    assert_eq!(worker.mode(), IoMode::Pty);
    let fds = worker.client_fds();
    assert_eq!(fds.len(), 1);
    assert!(isatty(fds[0].as_raw_fd()).unwrap());
    let master = fds[0].try_clone_to_owned().unwrap();
    drop(fds);

    let pid = worker.release().unwrap();
    assert_eq!(wait_exit(pid), 0);
    drop(master);
}

#[test]
fn test_pty_worker_output_reaches_master() {
    let _guard = fork_lock();

    let worker = spawner::spawn(IoMode::Pty, |handoff| {
        raw_write(libc::STDOUT_FILENO, b"hello from pty");
        handoff.wait();
        child_exit(0)
    })
    .unwrap();

    let master = worker.client_fds()[0].try_clone_to_owned().unwrap();
    let pid = worker.release().unwrap();

    let mut master = File::from(master);
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    while !String::from_utf8_lossy(&out).contains("hello from pty") {
        match master.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            // EIO once the slave side is gone
            Err(_) => break,
        }
    }
    assert!(String::from_utf8_lossy(&out).contains("hello from pty"));
    assert_eq!(wait_exit(pid), 0);
}

// ============================================================================
// HANDOFF AND SIGNALS
// ============================================================================

#[test]
fn test_dropped_worker_aborts_handoff() {
    let _guard = fork_lock();

    let worker = spawner::spawn(IoMode::Pipes, |handoff| {
        child_exit(if handoff.wait() { 0 } else { 42 })
    })
    .unwrap();
    let pid = worker.pid();
    drop(worker);

    assert_eq!(wait_exit(pid), 42);
}

#[test]
fn test_child_restores_default_sigchld() {
    let _guard = fork_lock();
    signal_hook::flag::register(libc::SIGCHLD, Arc::new(AtomicBool::new(false))).unwrap();

    let worker = spawner::spawn(IoMode::Pipes, |handoff| {
        // SAFETY: querying the current disposition with a zeroed out-param.
        let default = unsafe {
            let mut current: libc::sigaction = std::mem::zeroed();
            libc::sigaction(libc::SIGCHLD, std::ptr::null(), &mut current);
            current.sa_sigaction == libc::SIG_DFL
        };
        handoff.wait();
        child_exit(if default { 0 } else { 5 })
    })
    .unwrap();

    let pid = worker.release().unwrap();
    assert_eq!(wait_exit(pid), 0);
}

#[test]
fn test_worker_pid_matches_release() {
    let _guard = fork_lock();

    let worker = spawner::spawn(IoMode::Pipes, |handoff| {
        handoff.wait();
        child_exit(0)
    })
    .unwrap();
    let pid = worker.pid();
    assert_eq!(worker.release().unwrap(), pid);
    assert_eq!(wait_exit(pid), 0);
}
