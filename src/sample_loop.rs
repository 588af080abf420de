//! The sampling orchestrator (spec.md §4.6).
//!
//! Grounded on `original_source/collector/collector.c`'s `main` loop,
//! `dump_taskstat`, `dump_proc_stat`, `dump_cmdline`, `dump_paternity`.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::buffer_file::BufferFile;
use crate::chunk::StackMap;
use crate::error::Result;
use crate::pid_scanner::{self, PidScanner};
use crate::taskstats::TaskstatsClient;

const PROC_PATH: &str = "/proc";

/// Per-pid accumulator used only to suppress duplicate `taskstats.log` rows
/// (spec.md §3 `PidEntry`).
#[derive(Default, Clone, Copy)]
struct PidEntry {
    ppid: i32,
    time_total: u64,
}

pub struct Config {
    pub hz: u32,
    pub relative_time: bool,
}

/// Runs forever (until killed), as spec.md §5 describes: "The collector has
/// no clean-shutdown protocol initiated from within itself."
pub fn run(config: Config) -> Result<()> {
    let mut stat_fd = open_proc_file("stat")?;
    let mut diskstats_fd = open_proc_file("diskstats")?;
    let mut uptime_fd = open_proc_file("uptime")?;
    let mut meminfo_fd = open_proc_file("meminfo")?;

    let taskstats = TaskstatsClient::new().ok();
    if taskstats.is_none() {
        log::warn!("taskstats unavailable, falling back to /proc/<pid>/stat sampling");
    }

    let stack_map = Mutex::new(StackMap::new());

    let mut proc_stat_file = BufferFile::new(&stack_map, "proc_stat.log");
    let mut proc_diskstats_file = BufferFile::new(&stack_map, "proc_diskstats.log");
    let mut proc_meminfo_file = BufferFile::new(&stack_map, "proc_meminfo.log");
    let mut tasks_file = BufferFile::new(
        &stack_map,
        if taskstats.is_some() { "taskstats.log" } else { "proc_ps.log" },
    );
    let cmdline_file = Mutex::new(BufferFile::new(&stack_map, "cmdline2.log"));
    let paternity_file = Mutex::new(BufferFile::new(&stack_map, "paternity.log"));

    let mut pid_entries: HashMap<i32, PidEntry> = HashMap::new();

    let reltime = if config.relative_time {
        Some(read_uptime(&mut uptime_fd))
    } else {
        None
    };

    thread::scope(|scope| -> Result<()> {
        let mut scanner: Box<dyn PidScanner> = match pid_scanner::NetlinkPidScanner::try_new() {
            Ok(nls) => {
                let fd = nls.socket_fd();
                let queue = nls.queue_handle();
                pid_scanner::netlink_scanner::spawn_listener(
                    scope,
                    fd,
                    queue,
                    |child, parent| {
                        let mut f = paternity_file.lock().expect("paternity BufferFile poisoned");
                        f.append(format!("{} {}\n", child, parent).as_bytes());
                    },
                    |pid| {
                        emit_cmdline(&cmdline_file, pid);
                    },
                );
                Box::new(nls)
            }
            Err(_) => {
                log::warn!("netlink process tracker unavailable, falling back to procfs polling");
                Box::new(pid_scanner::ProcfsPidScanner::new()?)
            }
        };
        let scanner = scanner.as_mut();

        let period = Duration::from_micros(1_000_000 / config.hz as u64);

        loop {
            let uptime_raw = read_uptime(&mut uptime_fd);
            let uptime_value = uptime_raw.saturating_sub(reltime.unwrap_or(0));
            let uptime_bytes = format!("{}\n", uptime_value).into_bytes();

            proc_stat_file.dump_frame_with_timestamp(stat_fd.as_raw_fd(), &uptime_bytes);
            proc_diskstats_file.dump_frame_with_timestamp(diskstats_fd.as_raw_fd(), &uptime_bytes);
            proc_meminfo_file.dump_frame_with_timestamp(meminfo_fd.as_raw_fd(), &uptime_bytes);

            tasks_file.append(&uptime_bytes);
            scanner.restart();
            loop {
                let pid = scanner.next();
                if pid == 0 {
                    break;
                }
                match &taskstats {
                    Some(client) => emit_taskstat(&mut tasks_file, client, scanner, pid, &mut pid_entries),
                    None => emit_proc_stat_fallback(&mut tasks_file, pid),
                }
            }
            tasks_file.append(b"\n");

            thread::sleep(period);
        }
    })
}

fn open_proc_file(name: &str) -> Result<std::fs::File> {
    let path = format!("{}/{}", PROC_PATH, name);
    std::fs::File::open(&path).map_err(|source| crate::error::Error::Open {
        path: path.into(),
        source,
    })
}

fn read_uptime(fd: &mut std::fs::File) -> u64 {
    use std::io::{Seek, SeekFrom};
    let _ = fd.seek(SeekFrom::Start(0));
    let mut buf = String::new();
    if fd.read_to_string(&mut buf).is_err() {
        return 0;
    }
    let mut parts = buf.trim().splitn(2, '.');
    let whole: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let frac: u64 = parts
        .next()
        .and_then(|s| s.get(..2).unwrap_or(s).parse().ok())
        .unwrap_or(0);
    whole * 100 + frac
}

fn emit_taskstat(
    file: &mut BufferFile<'_>,
    client: &TaskstatsClient,
    scanner: &mut dyn PidScanner,
    cur_pid: i32,
    pid_entries: &mut HashMap<i32, PidEntry>,
) {
    let delays = match client.get_tgid(scanner, cur_pid) {
        Ok(d) => d,
        Err(_) => return, // process exited before we got there
    };

    let time_total = delays.time_total();
    let prior = pid_entries.entry(delays.ac_pid as i32).or_default();
    let mut ppid = scanner.get_cur_ppid();
    if ppid == 0 {
        ppid = delays.ac_ppid as i32;
    }

    if prior.time_total == time_total && prior.ppid == ppid {
        return;
    }
    *prior = PidEntry { ppid, time_total };

    let line = format!(
        "{} {} {} {} {} {}\n",
        delays.ac_pid,
        ppid,
        delays.comm(),
        delays.cpu_run_real_total,
        delays.blkio_delay_total,
        delays.swapin_delay_total,
    );
    file.append(line.as_bytes());
}

fn emit_proc_stat_fallback(file: &mut BufferFile<'_>, pid: i32) {
    let path = format!("{}/{}/stat", PROC_PATH, pid);
    if let Ok(f) = std::fs::File::open(&path) {
        file.dump(f.as_raw_fd());
    }
}

/// Called from the netlink listener thread on exec events (spec.md §4.6
/// "cmdline framing").
fn emit_cmdline(cmdline_file: &Mutex<BufferFile<'_>>, pid: i32) {
    let exe_link = format!("{}/{}/exe", PROC_PATH, pid);
    let path = match std::fs::read_link(&exe_link) {
        Ok(p) => p,
        Err(_) => return,
    };

    let mut f = cmdline_file.lock().expect("cmdline BufferFile poisoned");
    f.append(format!("{}\n:{}\n:", pid, path.display()).as_bytes());

    let cmdline_path = format!("{}/{}/cmdline", PROC_PATH, pid);
    if let Ok(mut cf) = std::fs::File::open(&cmdline_path) {
        let mut buffer = [0u8; 4096];
        if let Ok(len) = cf.read(&mut buffer) {
            let mut start = 0;
            for i in 0..len {
                let is_newline = buffer[i] == b'\n';
                if is_newline {
                    buffer[i] = 0;
                }
                if buffer[i] == 0 {
                    f.append(&buffer[start..=i]);
                    start = i + 1;
                }
            }
        }
    }

    f.append(b"\n\n");
}
