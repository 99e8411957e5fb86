//! Hang-up detection for a client connection owned by `tiny_http`.
//!
//! Once a request is turned into a raw writer the socket is out of reach, so
//! the accepted descriptor is located by its peer address and duplicated.
//! A write to a closed connection would also fail, but a command that prints
//! nothing gives no chance to write; polling the duplicate covers that case.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::debug;

/// A duplicate of the socket serving one client.
#[derive(Debug)]
pub struct PeerWatch {
    fd: OwnedFd,
}

impl PeerWatch {
    /// Find the open socket whose remote end is `peer` and hold a duplicate.
    pub fn attach(peer: SocketAddr) -> Option<Self> {
        let entries = match std::fs::read_dir("/proc/self/fd") {
            Ok(entries) => entries,
            Err(e) => {
                debug!("cannot list descriptors: {e}");
                return None;
            }
        };
        for entry in entries.flatten() {
            let Some(fd) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<RawFd>().ok())
            else {
                continue;
            };
            if peer_of(fd).is_some_and(|a| a.ip() == peer.ip() && a.port() == peer.port()) {
                return duplicate(fd).map(|fd| Self { fd });
            }
        }
        None
    }

    /// True once the client has closed or reset its end.
    #[allow(unsafe_code)]
    pub fn hung_up(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLRDHUP,
            revents: 0,
        };
        // SAFETY: `pfd` is a valid pollfd for the duration of the call and
        // the count is 1. A zero timeout never blocks.
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        ready > 0 && pfd.revents & (libc::POLLRDHUP | libc::POLLHUP | libc::POLLERR) != 0
    }
}

#[allow(unsafe_code)]
fn peer_of(fd: RawFd) -> Option<SocketAddr> {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    #[allow(clippy::cast_possible_truncation)]
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: the pointer and length describe `storage`, which outlives the
    // call. Non-socket descriptors fail with ENOTSOCK and are skipped.
    let rc = unsafe {
        libc::getpeername(fd, std::ptr::addr_of_mut!(storage).cast(), &mut len)
    };
    if rc != 0 {
        return None;
    }
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            // SAFETY: the family says the storage holds a sockaddr_in.
            let sin = unsafe { &*std::ptr::addr_of!(storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            // SAFETY: the family says the storage holds a sockaddr_in6.
            let sin6 = unsafe { &*std::ptr::addr_of!(storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

#[allow(unsafe_code)]
fn duplicate(fd: RawFd) -> Option<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC on an open descriptor returns a new one or -1.
    let copy = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if copy < 0 {
        return None;
    }
    // SAFETY: `copy` was just returned by fcntl and nothing else owns it.
    Some(unsafe { OwnedFd::from_raw_fd(copy) })
}
