//! File-descriptor discipline (spec.md §5): raise `NOFILE` up to
//! `FD_SETSIZE` at startup, and keep low-numbered fds free for stdio-based
//! tapes by duplicating new sockets above a configurable reservation.

use rlimit::Resource;

/// Conservative, portable stand-in for `FD_SETSIZE` (1024 on Linux).
pub const FD_SETSIZE: u64 = 1024;

pub fn raise_nofile_limit() -> anyhow::Result<u64> {
    let (soft, hard) = Resource::NOFILE.get()?;
    let target = FD_SETSIZE.min(hard);
    if soft < target {
        Resource::NOFILE.set(target, hard)?;
    }
    Ok(target)
}

/// Duplicates `fd` to the lowest available descriptor at or above
/// `reserve_below`, closing the original. No-op if `fd` is already above
/// the reservation.
pub fn dup_above_reservation(fd: std::os::unix::io::RawFd, reserve_below: std::os::unix::io::RawFd) -> std::io::Result<std::os::unix::io::RawFd> {
    if fd >= reserve_below {
        return Ok(fd);
    }
    // `F_DUPFD` returns the lowest available fd >= the given argument.
    let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD, reserve_below) };
    if new_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe {
        libc::close(fd);
    }
    Ok(new_fd)
}

/// A Connection must refuse to open a socket whose fd would exceed
/// `FD_SETSIZE` (spec.md §8 invariant 8).
pub fn fd_within_bounds(fd: std::os::unix::io::RawFd) -> bool {
    (fd as u64) < FD_SETSIZE
}

/// Default low-fd reservation: newly opened sockets are duped above this so
/// low-numbered fds stay free for stdio-based tapes (spec.md §5).
pub const DEFAULT_LOW_FD_RESERVATION: std::os::unix::io::RawFd = 16;

/// Applies the fd discipline described in spec.md §5 to a freshly connected
/// socket: duplicates it above `reserve_below` (freeing the original low fd,
/// if any) and rejects it outright if the result would still exceed
/// `FD_SETSIZE`. Returns the stream unchanged if it already satisfies both.
pub fn enforce_fd_discipline(
    stream: tokio::net::TcpStream,
    reserve_below: std::os::unix::io::RawFd,
) -> std::io::Result<tokio::net::TcpStream> {
    use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

    let fd = stream.as_raw_fd();
    if fd >= reserve_below {
        return if fd_within_bounds(fd) {
            Ok(stream)
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("socket fd {fd} exceeds FD_SETSIZE ({FD_SETSIZE})"),
            ))
        };
    }

    let std_stream = stream.into_std()?;
    let raw = std_stream.into_raw_fd();
    let new_fd = dup_above_reservation(raw, reserve_below)?;
    if !fd_within_bounds(new_fd) {
        unsafe { libc::close(new_fd) };
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("socket fd {new_fd} exceeds FD_SETSIZE ({FD_SETSIZE})"),
        ));
    }
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(new_fd) };
    std_stream.set_nonblocking(true)?;
    tokio::net::TcpStream::from_std(std_stream)
}
