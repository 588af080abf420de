//! Message construction and attribute walking shared by family-id resolution
//! and taskstats requests (`crate::taskstats`).
//!
//! Grounded on `original_source/collector/collector.c`'s `send_cmd`,
//! `get_family_id` and `wait_taskstats`.

use std::os::unix::io::RawFd;

use crate::bindings::netlink::{
    self, genlmsghdr, nlattr, nlmsghdr, MsgTemplate, GENL_HDRLEN, NLA_HDRLEN, NLMSG_HDRLEN,
};
use crate::error::{Error, Result};

/// Builds and sends a single generic-netlink request carrying one attribute,
/// mirroring `send_cmd`'s fixed single-attribute shape: every caller in this
/// crate (family lookup, taskstats-by-pid) only ever needs one.
pub fn send_cmd(
    fd: RawFd,
    nlmsg_type: u16,
    nlmsg_pid: u32,
    genl_cmd: u8,
    nla_type: u16,
    nla_payload: &[u8],
) -> Result<()> {
    let mut msg = MsgTemplate::zeroed();
    msg.n.nlmsg_len = netlink::nlmsg_align(NLMSG_HDRLEN + GENL_HDRLEN) as u32;
    msg.n.nlmsg_type = nlmsg_type;
    msg.n.nlmsg_flags = netlink::NLM_F_REQUEST;
    msg.n.nlmsg_seq = 0;
    msg.n.nlmsg_pid = nlmsg_pid;
    msg.g.cmd = genl_cmd;
    msg.g.version = 0x1;

    let na_offset = netlink::nlmsg_align(NLMSG_HDRLEN + GENL_HDRLEN) - NLMSG_HDRLEN - GENL_HDRLEN;
    unsafe {
        let base = msg.as_mut_ptr() as *mut u8;
        let na = base.add(NLMSG_HDRLEN + GENL_HDRLEN + na_offset) as *mut nlattr;
        (*na).nla_type = nla_type;
        (*na).nla_len = (nla_payload.len() + NLA_HDRLEN) as u16;
        std::ptr::copy_nonoverlapping(
            nla_payload.as_ptr(),
            (na as *mut u8).add(NLA_HDRLEN),
            nla_payload.len(),
        );
    }
    msg.n.nlmsg_len += netlink::nlmsg_align(nla_payload.len() + NLA_HDRLEN) as u32;

    let total = msg.n.nlmsg_len as usize;
    let bytes = &msg.as_bytes()[..total];
    crate::netlink::send_all(fd, bytes).map_err(|e| Error::Netlink(e.to_string()))
}

/// Receives one generic-netlink reply and returns (`genlmsghdr`, attribute
/// bytes starting right after it).
pub fn recv_reply(fd: RawFd) -> Result<(genlmsghdr, Vec<u8>)> {
    let mut msg = MsgTemplate::zeroed();
    let n = crate::netlink::recv(fd, unsafe {
        std::slice::from_raw_parts_mut(
            msg.as_mut_ptr() as *mut u8,
            std::mem::size_of::<MsgTemplate>(),
        )
    })
    .map_err(|e| Error::Netlink(e.to_string()))?;

    if msg.n.nlmsg_type == netlink::NLMSG_ERROR {
        return Err(Error::Netlink("kernel returned NLMSG_ERROR".into()));
    }

    let payload_len = n.saturating_sub(NLMSG_HDRLEN + GENL_HDRLEN);
    let attrs = unsafe {
        let p = netlink::genlmsg_data(&msg.n as *const nlmsghdr);
        std::slice::from_raw_parts(p, payload_len).to_vec()
    };
    Ok((msg.g, attrs))
}

/// Walks a buffer of back-to-back, alignment-padded `nlattr` records,
/// yielding `(nla_type, payload)` for each (mirrors the `wait_taskstats`
/// `while (len < rep_len) { ... na = GENLMSG_DATA + len }` walk).
pub fn for_each_attr<'a>(buf: &'a [u8], mut f: impl FnMut(u16, &'a [u8])) {
    let mut offset = 0usize;
    while offset + NLA_HDRLEN <= buf.len() {
        let na = unsafe { &*(buf[offset..].as_ptr() as *const nlattr) };
        let nla_len = na.nla_len as usize;
        if nla_len < NLA_HDRLEN || offset + nla_len > buf.len() {
            break;
        }
        let payload = &buf[offset + NLA_HDRLEN..offset + nla_len];
        f(na.nla_type, payload);
        offset += netlink::nla_align(nla_len);
    }
}
