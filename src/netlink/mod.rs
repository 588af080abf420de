//! Shared raw-netlink socket plumbing used by both the generic-netlink
//! taskstats session (`crate::taskstats`) and the connector-protocol process
//! event listener (`crate::pid_scanner::netlink_scanner`).
//!
//! Built directly on `libc` rather than `nix`'s socket wrappers: neither the
//! connector protocol nor generic netlink's family-resolution dance are
//! covered by `nix`'s safe address types, and the original collector this is
//! modeled on does the exact same raw `socket`/`bind`/`sendto`/`recvfrom`
//! dance (`original_source/collector/tasks-netlink.c`,
//! `original_source/collector/collector.c::init_taskstat`).

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use crate::bindings::netlink::sockaddr_nl;

pub fn open_socket(protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::PF_NETLINK, libc::SOCK_RAW | libc::SOCK_CLOEXEC, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn open_dgram_socket(protocol: libc::c_int) -> io::Result<RawFd> {
    let fd =
        unsafe { libc::socket(libc::PF_NETLINK, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn bind(fd: RawFd, groups: u32, pid: u32) -> io::Result<()> {
    let mut addr: sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_pid = pid;
    addr.nl_groups = groups;

    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<sockaddr_nl>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Sends the whole buffer, retrying on partial writes and `EAGAIN`, failing
/// on any other error (spec.md §4.5: "the send loop retries on partial
/// send; on EAGAIN retries, otherwise fails").
pub fn send_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                continue;
            }
            return Err(err);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(n as usize);
    }
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut addr: sockaddr_nl = unsafe { mem::zeroed() };
    let mut addrlen = mem::size_of::<sockaddr_nl>() as libc::socklen_t;
    loop {
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut addr as *mut sockaddr_nl as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(n as usize);
    }
}

/// `poll()`s a single fd for readability, with a timeout in milliseconds.
pub fn poll_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret > 0 && pfd.revents & libc::POLLIN != 0)
}

pub mod genetlink;
