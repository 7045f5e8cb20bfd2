//! Thin wrappers over the Unix plumbing the engine needs: fd passing,
//! eventfd wakeups, socketpairs, and monotonic time/frame conversion.

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use nix::unistd;

use crate::error::{CoreError, CoreResult};

/// Maximum file descriptors accepted in a single control datagram.
pub const MAX_RX_FDS: usize = 2;

/// Sends one datagram with optional attached file descriptors.
pub fn send_with_fds(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> CoreResult<usize> {
    let iov = [std::io::IoSlice::new(buf)];
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    let sent = sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)?;
    Ok(sent)
}

/// Receives one datagram, returning the byte count and any passed fds.
///
/// Returns `PeerGone` on EOF, `Transient` when the socket has no data.
pub fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> CoreResult<(usize, Vec<RawFd>)> {
    let mut iov = [std::io::IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_RX_FDS]);

    let msg = match recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
        Ok(msg) => msg,
        Err(nix::Error::EAGAIN) => return Err(CoreError::Transient),
        Err(e) => return Err(e.into()),
    };

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received);
        }
    }

    if msg.bytes == 0 && fds.is_empty() {
        return Err(CoreError::PeerGone);
    }
    Ok((msg.bytes, fds))
}

/// Closes fds received with a rejected message.
pub fn close_fds(fds: &[RawFd]) {
    for fd in fds {
        let _ = unistd::close(*fd);
    }
}

pub fn set_nonblocking(fd: RawFd) -> CoreResult<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A `SOCK_STREAM` socketpair for the per-stream audio message channel.
/// Returns (server side, client side).
pub fn audio_socketpair() -> CoreResult<(RawFd, RawFd)> {
    let (server, client) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    set_nonblocking(server)?;
    Ok((server, client))
}

/// An eventfd used to wake a `poll()` loop when a channel has messages.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> CoreResult<Self> {
        let fd = eventfd(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Wakes the polling side. Counter saturation is fine, any nonzero
    /// value means "drain the channel".
    pub fn notify(&self) {
        let one = 1u64.to_ne_bytes();
        let _ = unistd::write(self.fd, &one);
    }

    /// Clears the wakeup counter. Call before draining the channel.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = unistd::read(self.fd, &mut buf);
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

/// Monotonic clock in nanoseconds, for timestamps published in shm.
pub fn monotonic_ns() -> u64 {
    nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

/// Playback/capture time a number of frames covers at the given rate.
pub fn frames_to_duration(frames: u64, frame_rate: u32) -> Duration {
    if frame_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(frames * 1_000_000_000 / frame_rate as u64)
}

/// Frames elapsed in a wall-clock interval at the given rate.
pub fn duration_to_frames(dur: Duration, frame_rate: u32) -> u64 {
    dur.as_nanos() as u64 * frame_rate as u64 / 1_000_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_duration_conversion() {
        assert_eq!(
            frames_to_duration(48000, 48000),
            Duration::from_secs(1)
        );
        assert_eq!(
            frames_to_duration(480, 48000),
            Duration::from_millis(10)
        );
        assert_eq!(duration_to_frames(Duration::from_millis(10), 48000), 480);
        assert_eq!(frames_to_duration(100, 0), Duration::ZERO);
    }

    #[test]
    fn test_eventfd_notify_drain() {
        let efd = EventFd::new().unwrap();
        efd.notify();
        efd.notify();
        efd.drain();
        // Drained: a further drain reads nothing but must not block.
        efd.drain();
    }

    #[test]
    fn test_audio_socketpair_passes_bytes() {
        let (server, client) = audio_socketpair().unwrap();
        nix::unistd::write(client, b"ping").unwrap();
        let mut buf = [0u8; 8];
        let n = nix::unistd::read(server, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        let _ = nix::unistd::close(server);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_monotonic_ns_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
