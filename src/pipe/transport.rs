//! Retry-safe byte transport over a single pipe descriptor
//!
//! Turns one descriptor plus a `poll(2)` readiness wait into:
//! - "write exactly N bytes" (`write_all`)
//! - "read up to N bytes or one line" (`read_some`)
//!
//! `EINTR` and `EAGAIN` never escape these loops. The first is retried on the
//! spot, the second parks the caller in `poll` until the descriptor is ready.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;
use tracing::debug;

/// Byte that ends a read early
pub const LINE_TERMINATOR: u8 = b'\n';

/// Errors that can occur while moving bytes across a pipe
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to write to child after {written} bytes: {source}")]
    WriteFailed {
        /// Bytes delivered before the failure
        written: usize,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read from child after {read} bytes: {source}")]
    ReadFailed {
        /// Bytes stored in the caller's buffer before the failure
        read: usize,
        #[source]
        source: io::Error,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// What a read does when the descriptor has nothing to offer yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Park in `poll` until data (or end-of-stream) arrives
    Wait,
    /// Hand back whatever has accumulated, possibly nothing
    NoWait,
}

/// Put a descriptor into non-blocking mode, keeping its other status flags
pub fn set_nonblocking<F: AsFd>(fd: &F) -> io::Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Block until `fd` reports one of `events`. No timeout.
fn wait_ready(fd: BorrowedFd<'_>, events: PollFlags) -> io::Result<()> {
    loop {
        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

/// Write every byte of `buf` to `writer`, in order.
///
/// Short writes advance the cursor and loop. A would-block result waits for
/// the descriptor to become writable. Any other failure ends the call with
/// [`TransportError::WriteFailed`], carrying the count delivered so far.
///
/// Returns `buf.len()` on success.
pub fn write_all<W: Write + AsFd>(writer: &mut W, buf: &[u8]) -> TransportResult<usize> {
    let mut written = 0;

    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(TransportError::WriteFailed {
                    written,
                    source: io::Error::from(ErrorKind::WriteZero),
                });
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!(written, remaining = buf.len() - written, "Pipe full, waiting");
                wait_ready(writer.as_fd(), PollFlags::POLLOUT)
                    .map_err(|source| TransportError::WriteFailed { written, source })?;
            }
            Err(source) => return Err(TransportError::WriteFailed { written, source }),
        }
    }

    Ok(written)
}

/// Read at most `buf.len()` bytes from `reader`, stopping early at a line end.
///
/// The loop ends when:
/// - the last byte stored is [`LINE_TERMINATOR`]
/// - the buffer is full
/// - the peer closed its end (end-of-stream)
/// - in [`ReadMode::NoWait`], the descriptor would block
///
/// Only the final byte of the accumulated data is checked for the terminator,
/// so an underlying read that delivers several lines returns all of them.
/// Nothing is pushed back, which makes this unsuitable for reading a known
/// binary length that may contain newline bytes.
pub fn read_some<R: Read + AsFd>(
    reader: &mut R,
    buf: &mut [u8],
    mode: ReadMode,
) -> TransportResult<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            // End of stream
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if buf[filled - 1] == LINE_TERMINATOR {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => match mode {
                ReadMode::Wait => {
                    wait_ready(reader.as_fd(), PollFlags::POLLIN).map_err(|source| {
                        TransportError::ReadFailed {
                            read: filled,
                            source,
                        }
                    })?;
                }
                ReadMode::NoWait => break,
            },
            Err(source) => {
                return Err(TransportError::ReadFailed {
                    read: filled,
                    source,
                })
            }
        }
    }

    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::fs::File;
    use std::sync::{mpsc, Once};
    use std::thread;
    use std::time::Duration;

    fn pipe_pair() -> (File, File) {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        (File::from(read_end), File::from(write_end))
    }

    extern "C" fn ignore_signal(_: nix::libc::c_int) {}

    fn install_sigusr1_handler() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            // No SA_RESTART: a blocked read, write or poll comes back with EINTR
            let action = SigAction::new(
                SigHandler::Handler(ignore_signal),
                SaFlags::empty(),
                SigSet::empty(),
            );
            unsafe { sigaction(Signal::SIGUSR1, &action) }.unwrap();
        });
    }

    fn interrupt(target: Pthread) {
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(10));
            pthread_kill(target, Signal::SIGUSR1).unwrap();
        }
    }

    fn read_across_signals(nonblocking: bool) {
        install_sigusr1_handler();
        let (mut reader, mut writer) = pipe_pair();
        if nonblocking {
            set_nonblocking(&reader).unwrap();
        }

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(pthread_self()).unwrap();
            let mut buf = [0u8; 64];
            let n = read_some(&mut reader, &mut buf, ReadMode::Wait).unwrap();
            buf[..n].to_vec()
        });

        let target = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        interrupt(target);
        writer.write_all(b"ok\n").unwrap();

        assert_eq!(handle.join().unwrap(), b"ok\n");
    }

    fn write_across_signals(nonblocking: bool) {
        install_sigusr1_handler();
        let (mut reader, mut writer) = pipe_pair();
        if nonblocking {
            set_nonblocking(&writer).unwrap();
        }

        let payload = vec![b'z'; 256 * 1024];
        let len = payload.len();

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(pthread_self()).unwrap();
            // writer is dropped on return, ending the stream
            write_all(&mut writer, &payload).unwrap()
        });

        let target = rx.recv().unwrap();
        // Let the writer fill the pipe and park
        thread::sleep(Duration::from_millis(50));
        interrupt(target);

        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();

        assert_eq!(handle.join().unwrap(), len);
        assert_eq!(received.len(), len);
        assert!(received.iter().all(|&b| b == b'z'));
    }

    #[test]
    fn test_read_stops_at_line_terminator() {
        let (mut reader, mut writer) = pipe_pair();
        set_nonblocking(&reader).unwrap();

        writer.write_all(b"plot\n").unwrap();

        let mut buf = [0u8; 64];
        let n = read_some(&mut reader, &mut buf, ReadMode::Wait).unwrap();
        assert_eq!(&buf[..n], b"plot\n");
    }

    #[test]
    fn test_read_never_exceeds_buffer() {
        let (mut reader, mut writer) = pipe_pair();
        set_nonblocking(&reader).unwrap();

        writer.write_all(b"hello world\n").unwrap();

        let mut small = [0u8; 5];
        let n = read_some(&mut reader, &mut small, ReadMode::Wait).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&small, b"hello");

        // The rest is still there, nothing was lost
        let mut buf = [0u8; 64];
        let n = read_some(&mut reader, &mut buf, ReadMode::Wait).unwrap();
        assert_eq!(&buf[..n], b" world\n");
    }

    #[test]
    fn test_read_empty_buffer_is_noop() {
        let (mut reader, _writer) = pipe_pair();
        let mut buf = [0u8; 0];
        assert_eq!(read_some(&mut reader, &mut buf, ReadMode::Wait).unwrap(), 0);
    }

    #[test]
    fn test_nowait_read_with_nothing_pending_returns_zero() {
        let (mut reader, _writer) = pipe_pair();
        set_nonblocking(&reader).unwrap();

        let mut buf = [0u8; 16];
        let n = read_some(&mut reader, &mut buf, ReadMode::NoWait).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_nowait_read_returns_partial_line() {
        let (mut reader, mut writer) = pipe_pair();
        set_nonblocking(&reader).unwrap();

        writer.write_all(b"no newline yet").unwrap();

        let mut buf = [0u8; 64];
        let n = read_some(&mut reader, &mut buf, ReadMode::NoWait).unwrap();
        assert_eq!(&buf[..n], b"no newline yet");
    }

    #[test]
    fn test_read_end_of_stream() {
        let (mut reader, mut writer) = pipe_pair();
        set_nonblocking(&reader).unwrap();

        writer.write_all(b"abc").unwrap();
        drop(writer);

        let mut buf = [0u8; 64];
        let n = read_some(&mut reader, &mut buf, ReadMode::Wait).unwrap();
        assert_eq!(&buf[..n], b"abc");

        let n = read_some(&mut reader, &mut buf, ReadMode::Wait).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_read_waits_for_late_data() {
        let (mut reader, mut writer) = pipe_pair();
        set_nonblocking(&reader).unwrap();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.write_all(b"la").unwrap();
            thread::sleep(Duration::from_millis(20));
            writer.write_all(b"te\n").unwrap();
        });

        let mut buf = [0u8; 64];
        let n = read_some(&mut reader, &mut buf, ReadMode::Wait).unwrap();
        assert_eq!(&buf[..n], b"late\n");

        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_read_retries_after_signal() {
        read_across_signals(false);
    }

    #[test]
    fn test_readiness_wait_on_read_retries_after_signal() {
        read_across_signals(true);
    }

    #[test]
    fn test_blocking_write_retries_after_signal() {
        write_across_signals(false);
    }

    #[test]
    fn test_readiness_wait_on_write_retries_after_signal() {
        write_across_signals(true);
    }

    #[test]
    fn test_writes_compose() {
        let (mut reader, mut writer) = pipe_pair();
        set_nonblocking(&reader).unwrap();

        assert_eq!(write_all(&mut writer, b"AB").unwrap(), 2);
        assert_eq!(write_all(&mut writer, b"CD\n").unwrap(), 3);

        let mut buf = [0u8; 64];
        let n = read_some(&mut reader, &mut buf, ReadMode::Wait).unwrap();
        assert_eq!(&buf[..n], b"ABCD\n");
    }

    #[test]
    fn test_write_survives_full_pipe() {
        let (mut reader, mut writer) = pipe_pair();
        set_nonblocking(&writer).unwrap();

        // Well past the default pipe capacity, so the writer must wait
        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let drain = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut received = Vec::new();
            reader.read_to_end(&mut received).unwrap();
            received
        });

        let written = write_all(&mut writer, &payload).unwrap();
        assert_eq!(written, payload.len());
        drop(writer);

        let received = drain.join().unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_write_to_closed_pipe_fails() {
        let (reader, mut writer) = pipe_pair();
        drop(reader);

        let err = write_all(&mut writer, b"quit\n").unwrap_err();
        match err {
            TransportError::WriteFailed { written, source } => {
                assert_eq!(written, 0);
                assert_eq!(source.kind(), ErrorKind::BrokenPipe);
            }
            other => panic!("expected write failure, got {other:?}"),
        }
    }

    #[test]
    fn test_write_empty_buffer() {
        let (_reader, mut writer) = pipe_pair();
        assert_eq!(write_all(&mut writer, b"").unwrap(), 0);
    }
}
