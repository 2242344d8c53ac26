//! Raw ICMP socket ownership and bounded receive.

use icmprobe_common::{IpFamily, ProbeError};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

/// Transport over which probes are sent and replies received.
///
/// One implementor owns one socket for one address family; tests
/// substitute their own.
pub trait Transport: Send {
    /// Single best-effort transmission; no retry at this layer.
    fn send(&mut self, datagram: &[u8], dst: IpAddr) -> Result<(), ProbeError>;

    /// Waits up to `timeout` for an inbound datagram, then performs
    /// one non-blocking read. The bound is a hard per-call limit, not
    /// cumulative across calls. Returns the byte count and the
    /// sender's address, or [`ProbeError::Timeout`] on expiry.
    fn recv_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, IpAddr), ProbeError>;

    /// Sets the TTL / hop limit the kernel applies to outgoing
    /// datagrams. Irrelevant when the caller supplies the IP header.
    fn set_ttl(&mut self, ttl: u8) -> Result<(), ProbeError>;
}

/// Raw socket bound to one protocol family for the life of a session.
///
/// The file descriptor is closed on every exit path via `Drop`.
#[cfg(unix)]
#[derive(Debug)]
pub struct RawIcmpTransport {
    fd: std::os::unix::io::RawFd,
    family: IpFamily,
}

#[cfg(unix)]
impl RawIcmpTransport {
    /// Opens a raw ICMP (or ICMPv6) socket.
    ///
    /// `header_included` switches the socket to header-include mode:
    /// the caller supplies the IPv4 header and the kernel must not
    /// rebuild it. IPv6 header-include is rejected here since the
    /// builder only emits IPv4 headers. Raw sockets need elevated
    /// privilege; failure to acquire one is fatal to the caller and
    /// surfaced, never retried.
    pub fn open(family: IpFamily, header_included: bool) -> Result<Self, ProbeError> {
        if header_included && family == IpFamily::V6 {
            return Err(ProbeError::Unsupported("IPv6 header-include mode"));
        }
        let (domain, proto) = match family {
            IpFamily::V4 => (libc::AF_INET, libc::IPPROTO_ICMP),
            IpFamily::V6 => (libc::AF_INET6, libc::IPPROTO_ICMPV6),
        };
        let fd = unsafe { libc::socket(domain, libc::SOCK_RAW | libc::SOCK_NONBLOCK, proto) };
        if fd < 0 {
            return Err(open_error(io::Error::last_os_error()));
        }
        let transport = Self { fd, family };
        if header_included {
            transport
                .set_opt(libc::IPPROTO_IP, libc::IP_HDRINCL, 1)
                .map_err(|err| ProbeError::Internal(format!("failed to set IP_HDRINCL: {}", err)))?;
        }
        Ok(transport)
    }

    fn set_opt(&self, level: i32, opt: i32, value: libc::c_int) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                opt,
                &value as *const _ as *const libc::c_void,
                mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(unix)]
fn open_error(err: io::Error) -> ProbeError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(err),
        io::ErrorKind::Unsupported => ProbeError::Unsupported("raw ICMP socket"),
        _ => ProbeError::Internal(err.to_string()),
    }
}

#[cfg(unix)]
impl Transport for RawIcmpTransport {
    fn send(&mut self, datagram: &[u8], dst: IpAddr) -> Result<(), ProbeError> {
        let (storage, socklen) = sockaddr_from_ip(dst);
        loop {
            let rc = unsafe {
                libc::sendto(
                    self.fd,
                    datagram.as_ptr() as *const libc::c_void,
                    datagram.len(),
                    0,
                    &storage as *const _ as *const libc::sockaddr,
                    socklen,
                )
            };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => continue,
                _ => return Err(ProbeError::SendFailed(err)),
            }
        }
    }

    fn recv_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, IpAddr), ProbeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut fds = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut fds as *mut _, 1, remaining.as_millis() as i32) };
            if rc == 0 {
                return Err(ProbeError::Timeout);
            }
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ProbeError::ReceiveFailed(err));
            }

            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let rc = unsafe {
                libc::recvfrom(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut addrlen,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    continue;
                }
                return Err(ProbeError::ReceiveFailed(err));
            }
            let sender = ip_from_sockaddr(&storage).ok_or_else(|| {
                ProbeError::Internal("sender address family unknown".to_string())
            })?;
            return Ok((rc as usize, sender));
        }
    }

    fn set_ttl(&mut self, ttl: u8) -> Result<(), ProbeError> {
        let (level, opt) = match self.family {
            IpFamily::V4 => (libc::IPPROTO_IP, libc::IP_TTL),
            IpFamily::V6 => (libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS),
        };
        self.set_opt(level, opt, ttl as libc::c_int)
            .map_err(|err| ProbeError::Internal(format!("failed to set TTL: {}", err)))
    }
}

#[cfg(unix)]
impl Drop for RawIcmpTransport {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(unix)]
fn sockaddr_from_ip(addr: IpAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        IpAddr::V4(v4) => {
            let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
            sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
            sockaddr.sin_port = 0;
            sockaddr.sin_addr = libc::in_addr {
                s_addr: u32::from_be_bytes(v4.octets()).to_be(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sockaddr as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (
                storage,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        IpAddr::V6(v6) => {
            let mut sockaddr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sockaddr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sockaddr.sin6_port = 0;
            sockaddr.sin6_addr = libc::in6_addr {
                s6_addr: v6.octets(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sockaddr as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (
                storage,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

#[cfg(unix)]
fn ip_from_sockaddr(storage: &libc::sockaddr_storage) -> Option<IpAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin: &libc::sockaddr_in =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                sin.sin_addr.s_addr,
            ))))
        }
        libc::AF_INET6 => {
            let sin6: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trips_v4() {
        let addr: IpAddr = "192.0.2.33".parse().unwrap();
        let (storage, _) = sockaddr_from_ip(addr);
        assert_eq!(ip_from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trips_v6() {
        let addr: IpAddr = "2001:db8::42".parse().unwrap();
        let (storage, _) = sockaddr_from_ip(addr);
        assert_eq!(ip_from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn unknown_family_is_rejected() {
        let storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(ip_from_sockaddr(&storage), None);
    }

    #[test]
    fn v6_header_include_is_unsupported() {
        let err = RawIcmpTransport::open(IpFamily::V6, true).unwrap_err();
        assert!(matches!(err, ProbeError::Unsupported(_)));
    }
}
