//! `#[repr(C)]` transcriptions of the handful of UAPI structs/constants this
//! crate talks to directly: plain `NETLINK_ROUTE`-style headers, the
//! connector protocol (`CN_IDX_PROC`) and generic netlink (taskstats).
//!
//! Field layouts are taken from the kernel headers `tasks-netlink.c` and
//! `collector.c` include (`<linux/netlink.h>`, `<linux/connector.h>`,
//! `<linux/cn_proc.h>`, `<linux/genetlink.h>`, `<linux/taskstats.h>`).

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_ushort, c_void, pid_t};

// ---- plain netlink ----

pub const NETLINK_ROUTE: c_int = 0;
pub const NETLINK_GENERIC: c_int = 16;
pub const NETLINK_CONNECTOR: c_int = 11;

pub const NLM_F_REQUEST: u16 = 1;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

pub const NLMSG_ALIGNTO: usize = 4;

pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

pub const fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct nlmsghdr {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

pub const NLMSG_HDRLEN: usize = std::mem::size_of::<nlmsghdr>();

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct sockaddr_nl {
    pub nl_family: libc::sa_family_t,
    pub nl_pad: c_ushort,
    pub nl_pid: u32,
    pub nl_groups: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct nlattr {
    pub nla_len: u16,
    pub nla_type: u16,
}

pub const NLA_HDRLEN: usize = nla_align(std::mem::size_of::<nlattr>());

// ---- connector protocol (CN_IDX_PROC) ----

pub const CN_IDX_PROC: u32 = 0x1;
pub const CN_VAL_PROC: u32 = 0x1;
pub const PROC_CN_MCAST_LISTEN: u32 = 1;
#[allow(dead_code)]
pub const PROC_CN_MCAST_IGNORE: u32 = 2;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct cb_id {
    pub idx: u32,
    pub val: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct cn_msg {
    pub id: cb_id,
    pub seq: u32,
    pub ack: u32,
    pub len: u16,
    pub flags: u16,
    // `data` follows immediately; accessed via raw pointer arithmetic since
    // its size is the length-prefixed payload, not part of the struct.
}

pub const PROC_EVENT_NONE: u32 = 0x0000_0000;
pub const PROC_EVENT_FORK: u32 = 0x0000_0001;
pub const PROC_EVENT_EXEC: u32 = 0x0000_0002;
#[allow(dead_code)]
pub const PROC_EVENT_UID: u32 = 0x0000_0004;
pub const PROC_EVENT_EXIT: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct proc_event_fork {
    pub parent_pid: pid_t,
    pub parent_tgid: pid_t,
    pub child_pid: pid_t,
    pub child_tgid: pid_t,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct proc_event_exec {
    pub process_pid: pid_t,
    pub process_tgid: pid_t,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct proc_event_exit {
    pub process_pid: pid_t,
    pub process_tgid: pid_t,
    pub exit_code: u32,
    pub exit_signal: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct proc_event_ack {
    pub err: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union proc_event_data {
    pub fork: proc_event_fork,
    pub exec: proc_event_exec,
    pub exit: proc_event_exit,
    pub ack: proc_event_ack,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct proc_event {
    pub what: u32,
    pub cpu: u32,
    pub timestamp_ns: u64,
    pub event_data: proc_event_data,
}

pub const PROC_EVENT_HDRLEN: usize = std::mem::size_of::<proc_event>();

// ---- generic netlink / taskstats ----

pub const GENL_ID_CTRL: u16 = NLMSG_MIN_TYPE;
const NLMSG_MIN_TYPE: u16 = 0x10;

pub const GENL_HDRLEN: usize = std::mem::size_of::<genlmsghdr>();

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct genlmsghdr {
    pub cmd: u8,
    pub version: u8,
    pub reserved: u16,
}

pub const CTRL_CMD_GETFAMILY: u8 = 3;

pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;

pub const TASKSTATS_GENL_NAME: &[u8] = b"TASKSTATS\0";

pub const TASKSTATS_CMD_GET: u8 = 1;
pub const TASKSTATS_CMD_ATTR_PID: u16 = 1;

pub const TASKSTATS_TYPE_AGGR_PID: u16 = 3;
pub const TASKSTATS_TYPE_PID: u16 = 1;
#[allow(dead_code)]
pub const TASKSTATS_TYPE_STATS: u16 = 4;

pub const TS_COMM_LEN: usize = 32;

/// Transcribed from `<linux/taskstats.h>` (struct taskstats, version 8+).
/// The kernel always writes the full structure; truncating it would shift
/// every field after the first omission.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct taskstats {
    pub version: u16,
    pub ac_exitcode: u32,
    pub ac_flag: u8,
    pub ac_nice: u8,
    pub cpu_count: u64,
    pub cpu_delay_total: u64,
    pub blkio_count: u64,
    pub blkio_delay_total: u64,
    pub swapin_count: u64,
    pub swapin_delay_total: u64,
    pub cpu_run_real_total: u64,
    pub cpu_run_virtual_total: u64,
    pub ac_comm: [c_char; TS_COMM_LEN],
    pub ac_sched: u8,
    pub ac_pad: [u8; 3],
    pub ac_uid: u32,
    pub ac_gid: u32,
    pub ac_pid: u32,
    pub ac_ppid: u32,
    pub ac_btime: u32,
    pub ac_etime: u64,
    pub ac_utime: u64,
    pub ac_stime: u64,
    pub ac_minflt: u64,
    pub ac_majflt: u64,
    pub coremem: u64,
    pub virtmem: u64,
    pub hiwater_rss: u64,
    pub hiwater_vm: u64,
    pub read_char: u64,
    pub write_char: u64,
    pub read_syscalls: u64,
    pub write_syscalls: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub cancelled_write_bytes: u64,
    pub nvcsw: u64,
    pub nivcsw: u64,
    pub ac_utimescaled: u64,
    pub ac_stimescaled: u64,
    pub cpu_scaled_run_real_total: u64,
}

/// Generic message template large enough for a `TASKSTATS_CMD_GET`
/// request/response or a `CTRL_CMD_GETFAMILY` round trip.
pub const MAX_MSG_SIZE: usize = 1024;

#[repr(C)]
pub struct MsgTemplate {
    pub n: nlmsghdr,
    pub g: genlmsghdr,
    pub buf: [u8; MAX_MSG_SIZE],
}

impl MsgTemplate {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self as *mut Self as *mut c_void
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self as *const Self as *const u8,
                std::mem::size_of::<Self>(),
            )
        }
    }
}

pub unsafe fn nla_data(na: *const nlattr) -> *const u8 {
    (na as *const u8).add(NLA_HDRLEN)
}

pub unsafe fn nla_data_mut(na: *mut nlattr) -> *mut u8 {
    (na as *mut u8).add(NLA_HDRLEN)
}

pub unsafe fn genlmsg_data(n: *const nlmsghdr) -> *const u8 {
    (n as *const u8).add(NLMSG_HDRLEN).add(GENL_HDRLEN)
}

pub unsafe fn genlmsg_data_mut(n: *mut nlmsghdr) -> *mut u8 {
    (n as *mut u8).add(NLMSG_HDRLEN).add(GENL_HDRLEN)
}
