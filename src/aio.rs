//! Async pipe I/O primitives.
//!
//! Whole-buffer reads and writes against anonymous pipe descriptors,
//! suspending on readiness instead of blocking. Both helpers own their
//! descriptor and close it when done; closing the write end is what
//! delivers EOF to the reader on the far side.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Transfer chunk size; matches the default Linux pipe capacity.
const CHUNK: usize = 64 * 1024;

/// Create an anonymous pipe. Both ends are close-on-exec, so a descriptor
/// only crosses into a child when the spawn step arranges it.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 just handed us two fresh descriptors nobody else owns.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Read `fd` to EOF, then close it.
pub(crate) async fn read_all(fd: OwnedFd) -> io::Result<Vec<u8>> {
    set_nonblocking(&fd)?;
    let afd = AsyncFd::with_interest(fd, Interest::READABLE)?;
    let mut out = Vec::new();
    let mut chunk = vec![0u8; CHUNK];
    loop {
        let mut guard = afd.readable().await?;
        match guard.try_io(|inner| raw_read(inner.as_raw_fd(), &mut chunk)) {
            Ok(Ok(0)) => return Ok(out),
            Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => continue,
        }
    }
}

/// Write the whole buffer into `fd`, then close it.
///
/// A reader that goes away early surfaces as EPIPE; that is ordinary
/// pipeline termination, so the write completes silently instead of
/// erroring.
pub(crate) async fn write_all(fd: OwnedFd, data: Vec<u8>) -> io::Result<()> {
    set_nonblocking(&fd)?;
    let afd = AsyncFd::with_interest(fd, Interest::WRITABLE)?;
    let mut written = 0;
    while written < data.len() {
        let mut guard = afd.writable().await?;
        let end = data.len().min(written + CHUNK);
        match guard.try_io(|inner| raw_write(inner.as_raw_fd(), &data[written..end])) {
            Ok(Ok(n)) => written += n,
            Ok(Err(err)) if err.raw_os_error() == Some(libc::EPIPE) => return Ok(()),
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_small_buffer() {
        let (rd, wr) = pipe().unwrap();
        let (wrote, read) = tokio::join!(write_all(wr, b"hello".to_vec()), read_all(rd));
        wrote.unwrap();
        assert_eq!(read.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn round_trip_larger_than_pipe_buffer() {
        let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let (rd, wr) = pipe().unwrap();
        let (wrote, read) = tokio::join!(write_all(wr, data.clone()), read_all(rd));
        wrote.unwrap();
        assert_eq!(read.unwrap(), data);
    }

    #[tokio::test]
    async fn empty_write_delivers_immediate_eof() {
        let (rd, wr) = pipe().unwrap();
        let (wrote, read) = tokio::join!(write_all(wr, Vec::new()), read_all(rd));
        wrote.unwrap();
        assert!(read.unwrap().is_empty());
    }

    #[tokio::test]
    async fn epipe_is_swallowed() {
        let (rd, wr) = pipe().unwrap();
        drop(rd);
        // Reader already gone: the write must finish cleanly anyway.
        write_all(wr, vec![7u8; 1024 * 1024]).await.unwrap();
    }

    #[tokio::test]
    async fn read_sees_data_written_in_pieces() {
        let (rd, wr) = pipe().unwrap();
        let writer = async move {
            let raw = wr.as_raw_fd();
            for piece in [b"ab".as_slice(), b"cd".as_slice()] {
                assert_eq!(raw_write(raw, piece).unwrap(), piece.len());
            }
            drop(wr);
        };
        let (_, read) = tokio::join!(writer, read_all(rd));
        assert_eq!(read.unwrap(), b"abcd");
    }
}
