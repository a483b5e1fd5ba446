// Integration tests for the client-side relay
//
// These tests verify that:
// - Independent pairs are relayed byte-exact, whatever the write sizes
// - Closing one pair mid-stream does not disturb the others
// - A pair carrying both directions works over sockets
// - A vanished reader ends its pair without failing the relay
// - Input and output backing up at the same time never stall the relay

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use warmsh::daemon::proxy::{relay, Direction, ProxyMap, CHUNK_SIZE};

fn pipe() -> (OwnedFd, OwnedFd) {
    nix::unistd::pipe().unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn write_in_chunks(fd: OwnedFd, data: &[u8], sizes: &[usize]) {
    let mut file = File::from(fd);
    let mut offset = 0;
    for size in sizes.iter().cycle() {
        if offset >= data.len() {
            break;
        }
        let end = (offset + size).min(data.len());
        file.write_all(&data[offset..end]).unwrap();
        offset = end;
    }
}

fn read_all(fd: OwnedFd) -> Vec<u8> {
    let mut out = Vec::new();
    File::from(fd).read_to_end(&mut out).unwrap();
    out
}

// ============================================================================
// INDEPENDENT PAIRS
// ============================================================================

#[test]
fn test_three_pairs_with_one_closed_mid_stream() {
    let stdin_data = pattern(10_000, 1);
    let stdout_data = pattern(3 * CHUNK_SIZE + 17, 2);
    let stderr_data = pattern(100, 3);

    // stdin: local source → remote sink
    let (stdin_src_read, stdin_src_write) = pipe();
    let (stdin_sink_read, stdin_sink_write) = pipe();
    // stdout and stderr: remote source → local sink
    let (stdout_src_read, stdout_src_write) = pipe();
    let (stdout_sink_read, stdout_sink_write) = pipe();
    let (stderr_src_read, stderr_src_write) = pipe();
    let (stderr_sink_read, stderr_sink_write) = pipe();

    let mut map = ProxyMap::pipes(
        [stdin_src_read, stdout_sink_write, stderr_sink_write],
        [stdin_sink_write, stdout_src_read, stderr_src_read],
    );

    let (stderr_done_tx, stderr_done_rx) = mpsc::channel::<()>();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let stderr_reader = thread::spawn(move || {
        let out = read_all(stderr_sink_read);
        stderr_done_tx.send(()).unwrap();
        out
    });
    let stdin_reader = thread::spawn(move || read_all(stdin_sink_read));
    let stdout_reader = thread::spawn(move || read_all(stdout_sink_read));

    let stderr_writer = {
        let data = stderr_data.clone();
        thread::spawn(move || write_in_chunks(stderr_src_write, &data, &[100]))
    };
    let stdin_writer = {
        let data = stdin_data.clone();
        thread::spawn(move || {
            let (first, second) = data.split_at(data.len() / 2);
            let mut file = File::from(stdin_src_write);
            for byte in first {
                file.write_all(std::slice::from_ref(byte)).unwrap();
            }
            resume_rx.recv().unwrap();
            file.write_all(second).unwrap();
        })
    };
    let stdout_writer = {
        let data = stdout_data.clone();
        thread::spawn(move || {
            let (first, second) = data.split_at(7);
            let mut file = File::from(stdout_src_write);
            file.write_all(first).unwrap();
            // the stderr pair must close while this one is still open
            stderr_done_rx.recv().unwrap();
            resume_tx.send(()).unwrap();
            write_in_chunks(
                OwnedFd::from(file),
                second,
                &[1, 333, CHUNK_SIZE + 1, 4099],
            );
        })
    };

    relay(&mut map).unwrap();
    assert!(map.is_empty());

    stderr_writer.join().unwrap();
    stdin_writer.join().unwrap();
    stdout_writer.join().unwrap();

    assert_eq!(stderr_reader.join().unwrap(), stderr_data);
    assert_eq!(stdin_reader.join().unwrap(), stdin_data);
    assert_eq!(stdout_reader.join().unwrap(), stdout_data);
}

#[test]
fn test_large_single_write_is_split_into_chunks() {
    let data = pattern(64 * 1024 + 5, 9);
    let (src_read, src_write) = pipe();
    let (sink_read, sink_write) = pipe();

    let mut map = ProxyMap::new();
    map.insert(sink_write, src_read, Direction::Inbound);

    let reader = thread::spawn(move || read_all(sink_read));
    let writer = {
        let data = data.clone();
        thread::spawn(move || File::from(src_write).write_all(&data).unwrap())
    };

    relay(&mut map).unwrap();
    writer.join().unwrap();
    assert_eq!(reader.join().unwrap(), data);
}

// ============================================================================
// BIDIRECTIONAL PAIRS
// ============================================================================

#[test]
fn test_bidirectional_pair_over_sockets() {
    let (terminal, user) = UnixStream::pair().unwrap();
    let (master, worker) = UnixStream::pair().unwrap();

    let mut map = ProxyMap::interactive(OwnedFd::from(terminal), OwnedFd::from(master));

    let worker_side = thread::spawn(move || {
        let mut worker = worker;
        let mut line = [0u8; 5];
        worker.read_exact(&mut line).unwrap();
        assert_eq!(&line, b"ls -l");
        worker.write_all(b"total 0\r\n").unwrap();
        // the worker goes away first, like a shell exiting
    });

    let mut user = user;
    user.write_all(b"ls -l").unwrap();
    let relay_thread = thread::spawn(move || {
        relay(&mut map).unwrap();
        map.is_empty()
    });

    let mut reply = Vec::new();
    user.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"total 0\r\n");

    worker_side.join().unwrap();
    assert!(relay_thread.join().unwrap());
}

// ============================================================================
// VANISHED READERS
// ============================================================================

#[test]
fn test_closed_local_sink_does_not_stop_other_pairs() {
    let (dead_src_read, dead_src_write) = pipe();
    let (dead_sink_read, dead_sink_write) = pipe();
    let (live_src_read, live_src_write) = pipe();
    let (live_sink_read, live_sink_write) = pipe();
    drop(dead_sink_read);

    let mut map = ProxyMap::new();
    map.insert(dead_sink_write, dead_src_read, Direction::Inbound);
    map.insert(live_sink_write, live_src_read, Direction::Inbound);

    let data = pattern(5_000, 4);
    let reader = thread::spawn(move || read_all(live_sink_read));
    let writer = {
        let data = data.clone();
        thread::spawn(move || {
            let mut dead = File::from(dead_src_write);
            // EPIPE once the relay dropped the pair
            let _ = dead.write_all(b"nobody listens");
            drop(dead);
            thread::sleep(Duration::from_millis(20));
            write_in_chunks(live_src_write, &data, &[999]);
        })
    };

    relay(&mut map).unwrap();
    writer.join().unwrap();
    assert_eq!(reader.join().unwrap(), data);
}

#[test]
fn test_quiet_stdin_does_not_outlive_worker() {
    // local stdin that never reaches end-of-stream
    let (stdin_read, _stdin_write) = pipe();
    let (worker_stdin_read, worker_stdin_write) = pipe();
    let (stdout_src_read, stdout_src_write) = pipe();
    let (stdout_sink_read, stdout_sink_write) = pipe();

    let mut map = ProxyMap::new();
    map.insert(stdin_read, worker_stdin_write, Direction::Outbound);
    map.insert(stdout_sink_write, stdout_src_read, Direction::Inbound);

    let reader = thread::spawn(move || read_all(stdout_sink_read));
    thread::spawn(move || {
        File::from(stdout_src_write).write_all(b"done\n").unwrap();
        // the worker exits: both of its ends close
        drop(worker_stdin_read);
    });

    relay(&mut map).unwrap();
    assert!(map.is_empty());
    assert_eq!(reader.join().unwrap(), b"done\n");
}

// ============================================================================
// BACKPRESSURE
// ============================================================================

#[test]
fn test_filter_with_both_directions_backed_up() {
    // far more than a pipe holds, in both directions at once
    let input = pattern(300 * 1024, 5);

    let (stdin_src_read, stdin_src_write) = pipe();
    let (worker_stdin_read, worker_stdin_write) = pipe();
    let (worker_stdout_read, worker_stdout_write) = pipe();
    let (stdout_sink_read, stdout_sink_write) = pipe();

    let mut map = ProxyMap::new();
    map.insert(stdin_src_read, worker_stdin_write, Direction::Outbound);
    map.insert(stdout_sink_write, worker_stdout_read, Direction::Inbound);

    // the worker is `cat`: it only reads more once its output was taken
    let worker = thread::spawn(move || {
        let mut stdin = File::from(worker_stdin_read);
        let mut stdout = File::from(worker_stdout_write);
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = stdin.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n]).unwrap();
        }
    });
    let writer = {
        let data = input.clone();
        thread::spawn(move || File::from(stdin_src_write).write_all(&data).unwrap())
    };
    let reader = thread::spawn(move || read_all(stdout_sink_read));

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let result = relay(&mut map).map(|()| map.is_empty());
        let _ = done_tx.send(result);
    });

    let finished = done_rx
        .recv_timeout(Duration::from_secs(20))
        .expect("relay stalled with both directions backed up");
    assert!(finished.unwrap());

    writer.join().unwrap();
    worker.join().unwrap();
    let output = reader.join().unwrap();
    assert_eq!(output.len(), input.len());
    assert_eq!(output, input);
}
