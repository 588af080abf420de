//! Generic-netlink client for the kernel `taskstats` accounting interface
//! (spec.md §4.5).
//!
//! Grounded on `original_source/collector/collector.c`'s
//! `init_taskstat`/`get_family_id`/`get_taskstats`/`get_tgid_taskstats`.

use std::os::unix::io::RawFd;

use crate::bindings::netlink::{self, taskstats};
use crate::error::{Error, Result};
use crate::netlink::genetlink;
use crate::pid_scanner::PidScanner;

/// Per-pid figures this crate actually cares about (spec.md §4.6's
/// `cpu_run_real blkio_delay swapin_delay` line).
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskDelays {
    pub ac_pid: u32,
    pub ac_ppid: u32,
    pub ac_comm: [u8; netlink::TS_COMM_LEN],
    pub cpu_run_real_total: u64,
    pub blkio_delay_total: u64,
    pub swapin_delay_total: u64,
}

impl TaskDelays {
    pub fn comm(&self) -> String {
        let nul = self.ac_comm.iter().position(|&b| b == 0).unwrap_or(self.ac_comm.len());
        String::from_utf8_lossy(&self.ac_comm[..nul]).into_owned()
    }

    pub fn time_total(&self) -> u64 {
        self.cpu_run_real_total + self.blkio_delay_total + self.swapin_delay_total
    }

    fn from_raw(ts: &taskstats) -> TaskDelays {
        TaskDelays {
            ac_pid: ts.ac_pid,
            ac_ppid: ts.ac_ppid,
            ac_comm: unsafe { std::mem::transmute(ts.ac_comm) },
            cpu_run_real_total: ts.cpu_run_real_total,
            blkio_delay_total: ts.blkio_delay_total,
            swapin_delay_total: ts.swapin_delay_total,
        }
    }

    fn add_thread(&mut self, other: &TaskDelays) {
        self.cpu_run_real_total += other.cpu_run_real_total;
        self.blkio_delay_total += other.blkio_delay_total;
        self.swapin_delay_total += other.swapin_delay_total;
    }
}

pub struct TaskstatsClient {
    fd: RawFd,
    family_id: u16,
    pid: u32,
}

impl TaskstatsClient {
    /// Opens the netlink session and resolves the family id. Returns
    /// `Err` if either step fails; the caller falls back to raw
    /// `/proc/<pid>/stat` sampling (spec.md §4.6 step 2).
    pub fn new() -> Result<TaskstatsClient> {
        let fd = crate::netlink::open_socket(netlink::NETLINK_GENERIC)
            .map_err(|e| Error::Netlink(e.to_string()))?;
        let pid = std::process::id();
        crate::netlink::bind(fd, 0, pid).map_err(|e| Error::Netlink(e.to_string()))?;

        let family_id = resolve_family_id(fd, pid)?;
        if family_id == 0 {
            return Err(Error::Taskstats);
        }

        Ok(TaskstatsClient { fd, family_id, pid })
    }

    /// Fetches the raw per-pid sample, verifying the kernel echoed back the
    /// pid we asked for (spec.md §4.5: "If the reply's ac_pid field does not
    /// equal the requested pid, fail").
    pub fn get(&self, target_pid: i32) -> Result<TaskDelays> {
        let pid_arg = target_pid as u32;
        genetlink::send_cmd(
            self.fd,
            self.family_id,
            self.pid,
            netlink::TASKSTATS_CMD_GET,
            netlink::TASKSTATS_CMD_ATTR_PID,
            &pid_arg.to_ne_bytes(),
        )?;

        let (_g, attrs) = genetlink::recv_reply(self.fd)?;
        let mut found: Option<TaskDelays> = None;
        genetlink::for_each_attr(&attrs, |ty, payload| {
            if found.is_some() || ty != netlink::TASKSTATS_TYPE_AGGR_PID {
                return;
            }
            genetlink::for_each_attr(payload, |inner_ty, inner_payload| {
                if found.is_some() || inner_ty != netlink::TASKSTATS_TYPE_STATS {
                    return;
                }
                if inner_payload.len() >= std::mem::size_of::<taskstats>() {
                    let ts = unsafe { &*(inner_payload.as_ptr() as *const taskstats) };
                    found = Some(TaskDelays::from_raw(ts));
                }
            });
        });

        match found {
            Some(delays) if delays.ac_pid == pid_arg => Ok(delays),
            Some(_) => Err(Error::Netlink("taskstats reply carried a stale pid".into())),
            None => Err(Error::Netlink("taskstats reply missing TYPE_STATS".into())),
        }
    }

    /// Aggregates per-thread delays into a per-tgid total (spec.md §4.5
    /// `get_tgid`). `cur_pid` is the scanner's current cursor pid (the tgid).
    pub fn get_tgid(&self, scanner: &mut dyn PidScanner, cur_pid: i32) -> Result<TaskDelays> {
        let mut total = self.get(cur_pid)?;

        scanner.get_tasks_start();
        loop {
            let tid = scanner.get_tasks_next();
            if tid == 0 {
                break;
            }
            if tid == cur_pid {
                continue;
            }
            if let Ok(thread_delays) = self.get(tid) {
                total.add_thread(&thread_delays);
            }
        }
        scanner.get_tasks_stop();

        Ok(total)
    }
}

impl Drop for TaskstatsClient {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn resolve_family_id(fd: RawFd, pid: u32) -> Result<u16> {
    genetlink::send_cmd(
        fd,
        netlink::GENL_ID_CTRL,
        pid,
        netlink::CTRL_CMD_GETFAMILY,
        netlink::CTRL_ATTR_FAMILY_NAME,
        netlink::TASKSTATS_GENL_NAME,
    )?;

    let (_g, attrs) = genetlink::recv_reply(fd)?;
    let mut id = 0u16;
    genetlink::for_each_attr(&attrs, |ty, payload| {
        if ty == netlink::CTRL_ATTR_FAMILY_ID && payload.len() >= 2 {
            id = u16::from_ne_bytes([payload[0], payload[1]]);
        }
    });
    Ok(id)
}
