//! Pseudo-terminal channel.
//!
//! The child only prints its prompt and accepts line input when attached to a
//! terminal, so it gets the subordinate side of a PTY pair on
//! stdin/stdout/stderr. The supervisor keeps the controlling side, set
//! non-blocking and registered with the tokio reactor.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::openpty;
use nix::sys::termios::{LocalFlags, SetArg, tcgetattr, tcsetattr};
use tokio::io::unix::AsyncFd;

/// Size of a single non-blocking read.
pub const READ_CHUNK: usize = 4096;

/// Result of a non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes produced by the child.
    Data(Vec<u8>),
    /// Nothing available yet.
    Empty,
    /// The subordinate side is gone (every holder closed it or exited).
    Closed,
}

/// Subordinate side of the pair, handed to the child at launch.
#[derive(Debug)]
pub struct Subordinate {
    fd: OwnedFd,
}

impl Subordinate {
    /// Three handles for stdin, stdout and stderr of the child.
    ///
    /// The originals are dropped with `self`; the clones are closed in this
    /// process once the spawning `Command` is dropped.
    pub fn into_stdio(self) -> io::Result<(Stdio, Stdio, Stdio)> {
        let stdout = self.fd.try_clone()?;
        let stderr = self.fd.try_clone()?;
        Ok((Stdio::from(self.fd), Stdio::from(stdout), Stdio::from(stderr)))
    }
}

/// Controlling side of the pair.
#[derive(Debug)]
pub struct TerminalChannel {
    fd: Option<AsyncFd<File>>,
}

/// Allocate a PTY pair.
///
/// Local echo is turned off on the subordinate side so that the only echo
/// observed is the one the child prints itself on its prompt line. Must be
/// called from within a tokio runtime.
pub fn open() -> io::Result<(TerminalChannel, Subordinate)> {
    let pty = openpty(None, None).map_err(io::Error::from)?;

    let mut termios = tcgetattr(&pty.slave).map_err(io::Error::from)?;
    termios.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(&pty.slave, SetArg::TCSANOW, &termios).map_err(io::Error::from)?;

    let raw = pty.master.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL).map_err(io::Error::from)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io::Error::from)?;

    let master = AsyncFd::try_new(File::from(pty.master)).map_err(io::Error::from)?;
    Ok((
        TerminalChannel { fd: Some(master) },
        Subordinate { fd: pty.slave },
    ))
}

impl TerminalChannel {
    fn inner(&self) -> io::Result<&AsyncFd<File>> {
        self.fd
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "terminal channel closed"))
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// Send bytes to the child's input.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let fd = self.inner()?;
        let mut written = 0;
        while written < data.len() {
            let mut guard = fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(&data[written..])
            }) {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "terminal accepted no bytes",
                    ));
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Read whatever is available without waiting, at most `max` bytes.
    pub fn try_read(&self, max: usize) -> io::Result<ReadOutcome> {
        let fd = self.inner()?;
        let mut buf = vec![0u8; max.max(1)];
        let mut file = fd.get_ref();
        match file.read(&mut buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => {
                buf.truncate(n);
                Ok(ReadOutcome::Data(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::Empty),
            // Linux reports a hung-up PTY master as EIO.
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => Ok(ReadOutcome::Closed),
            Err(e) => Err(e),
        }
    }

    /// Suspend until the reactor reports the channel readable, or `max_wait`
    /// elapses. Readiness is cleared on return, so callers must drain with
    /// [`try_read`](Self::try_read) until `Empty` before waiting again.
    pub async fn wait_readable(&self, max_wait: Duration) -> io::Result<()> {
        let fd = self.inner()?;
        match tokio::time::timeout(max_wait, fd.readable()).await {
            Ok(Ok(mut guard)) => {
                guard.clear_ready();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(()),
        }
    }

    /// Release the controlling handle. Safe to call more than once.
    pub fn close(&mut self) {
        self.fd.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut channel, _sub) = open().unwrap();
        assert!(!channel.is_closed());
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        let err = channel.try_read(16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(channel.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_open_registers_with_reactor() {
        let (channel, sub) = open().unwrap();
        let mut peer = File::from(sub.fd);
        peer.write_all(b"hi").unwrap();
        channel
            .wait_readable(Duration::from_secs(2))
            .await
            .unwrap();
        match channel.try_read(READ_CHUNK).unwrap() {
            ReadOutcome::Data(bytes) => assert_eq!(bytes, b"hi"),
            other => panic!("unexpected read: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_read_is_not_an_error() {
        let (channel, _sub) = open().unwrap();
        assert_eq!(channel.try_read(READ_CHUNK).unwrap(), ReadOutcome::Empty);
    }

    #[tokio::test]
    async fn test_wait_readable_respects_bound() {
        let (channel, _sub) = open().unwrap();
        let start = std::time::Instant::now();
        channel
            .wait_readable(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
