//! The sibling extraction role (spec.md §4.7).
//!
//! Grounded on `original_source/collector/dump.c`, with ptrace idiom drawn
//! from `examples/other_examples/*ptrace_dumper*` (`nix::sys::ptrace`
//! instead of raw `libc::ptrace`).

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::chunk::{ChunkHeader, StackMapView, CHUNK_PAYLOAD, CHUNK_SIZE, HEADER_SIZE, STACK_MAP_MAGIC};
use crate::error::{Error, Result};

const MAX_ATTACH_ATTEMPTS: u32 = 8;

/// `--probe-running`: succeeds iff a collector other than ourselves is
/// discoverable, without attaching to it.
pub fn probe_running() -> Result<()> {
    find_running_collector().map(|_| ())
}

pub fn extract_and_dump(output_path: &Path) -> Result<()> {
    std::env::set_current_dir(output_path).map_err(|source| Error::Open {
        path: output_path.to_path_buf(),
        source,
    })?;

    let pid = find_running_collector()?;
    log::info!("extracting profile data from pid {}", pid);

    for attempt in 0..MAX_ATTACH_ATTEMPTS {
        let state = match attach(pid) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("ptrace attach to {} failed: {}", pid, e);
                continue;
            }
        };

        let found = find_stack_map(&state);
        match found {
            Some(view) => {
                dump_buffers(&state, &view);
                detach_and_terminate(state, false);
                return Ok(());
            }
            None => {
                log::warn!(
                    "couldn't find the collector's state on pid {}'s stack{}",
                    pid,
                    if attempt + 1 < MAX_ATTACH_ATTEMPTS { ", retrying" } else { ", aborting" }
                );
                detach_and_terminate(state, true);
            }
        }
    }

    Err(Error::StackMapNotFound { attempts: MAX_ATTACH_ATTEMPTS })
}

struct DumpState {
    pid: Pid,
    mem: File,
}

fn attach(pid: i32) -> Result<DumpState> {
    let nix_pid = Pid::from_raw(pid);
    ptrace::attach(nix_pid)?;
    let mem = File::open(format!("/proc/{}/mem", pid)).map_err(|source| Error::Open {
        path: format!("/proc/{}/mem", pid).into(),
        source,
    })?;
    Ok(DumpState { pid: nix_pid, mem })
}

/// Reads every `[stack]` mapping of the remote process and searches it for
/// the `StackMap` magic (spec.md §4.7 step 4).
fn find_stack_map(state: &DumpState) -> Option<StackMapView> {
    let maps_path = format!("/proc/{}/maps", state.pid);
    let maps = File::open(&maps_path).ok()?;
    let reader = BufReader::new(maps);

    for line in reader.lines().flatten() {
        if !line.ends_with("[stack]") {
            continue;
        }
        let range = line.split_whitespace().next()?;
        let mut parts = range.splitn(2, '-');
        let start = u64::from_str_radix(parts.next()?, 16).ok()?;
        let end = u64::from_str_radix(parts.next()?, 16).ok()?;
        let len = (end - start) as usize;

        let mut buf = vec![0u8; len];
        if pread_exact(state.mem.as_raw_fd(), &mut buf, start).is_err() {
            continue;
        }

        if let Some(view) = search_stack(&buf) {
            return Some(view);
        }
    }
    None
}

fn search_stack(buf: &[u8]) -> Option<StackMapView> {
    let view_size = std::mem::size_of::<StackMapView>();
    if buf.len() < view_size {
        return None;
    }
    let magic = STACK_MAP_MAGIC.as_bytes();
    for offset in 0..=(buf.len() - view_size) {
        if &buf[offset..offset + magic.len()] == magic {
            let view = unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const StackMapView) };
            return Some(view);
        }
    }
    None
}

/// Positional cross-process read, accumulating over short reads and
/// retrying on `EINTR`/`EAGAIN` (spec.md §9 "Cross-process read
/// correctness").
fn pread_exact(fd: RawFd, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = unsafe {
            libc::pread(
                fd,
                buf[read..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - read,
                (offset + read as u64) as libc::off_t,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted || err.kind() == std::io::ErrorKind::WouldBlock {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            break;
        }
        read += n as usize;
    }
    Ok(())
}

/// Iterates chunks `[0, max_chunk - 1)`, deliberately excluding the final
/// chunk: it may carry a torn tail after a capacity overflow (spec.md §4.7
/// step 6).
fn dump_buffers(state: &DumpState, view: &StackMapView) {
    let max_chunk = effective_max_chunk(view.max_chunk, view.chunks.len());
    let mut bytes_dumped = 0u64;

    for addr in &view.chunks[..max_chunk] {
        let mut raw = vec![0u8; CHUNK_SIZE];
        if pread_exact(state.mem.as_raw_fd(), &mut raw, *addr as u64).is_err() {
            continue;
        }
        // `raw` is a `Vec<u8>`-backed buffer with no guaranteed alignment for
        // `ChunkHeader`'s `u64` field, so its header is copied out by value
        // via `read_unaligned` rather than reinterpreted in place by
        // reference, matching the idiom `search_stack` already uses for
        // `StackMapView`. The payload bytes that follow need no such care:
        // they're indexed as plain `u8`s, never reinterpreted.
        let header = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const ChunkHeader) };
        let dest = header.dest_stream();
        if dest.is_empty() {
            continue;
        }
        let len = (header.length as usize).min(CHUNK_PAYLOAD);

        match std::fs::OpenOptions::new().append(true).create(true).open(dest) {
            Ok(mut out) => {
                let _ = out.write_all(&raw[HEADER_SIZE..HEADER_SIZE + len]);
                bytes_dumped += len as u64;
            }
            Err(e) => log::warn!("failed to open {} for append: {}", dest, e),
        }
    }
    log::info!("wrote {} kb", (bytes_dumped + 1023) / 1024);
}

/// The exclusive upper bound of chunks safe to dump: `view.max_chunk` clamped
/// to the array's own capacity, then reduced by one to drop the final chunk,
/// which may carry a torn tail after a capacity overflow (spec.md §4.7 step
/// 6). Pulled out of `dump_buffers` so the boundary arithmetic is testable
/// without a real `/proc/<pid>/mem` fd.
fn effective_max_chunk(view_max_chunk: usize, chunks_len: usize) -> usize {
    view_max_chunk.min(chunks_len).saturating_sub(1)
}

/// Sends `SIGTERM`, detaches, then polls up to 1s for the collector to
/// actually go away (spec.md §4.7 step 7). `avoid_kill` is set on a failed
/// attach attempt, where we only want to let go, not terminate the process
/// we never successfully read from.
fn detach_and_terminate(state: DumpState, avoid_kill: bool) {
    if !avoid_kill {
        if let Err(e) = signal::kill(state.pid, Signal::SIGTERM) {
            log::warn!("failed to terminate pid {}: {}", state.pid, e);
        }
    }
    let _ = ptrace::detach(state.pid, None);

    if avoid_kill {
        return;
    }

    let cmdline = format!("/proc/{}/cmdline", state.pid);
    for _ in 0..100 {
        if !Path::new(&cmdline).exists() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Finds the collector's pid by scanning `/proc/<n>/exe`, excluding
/// ourselves and any `--usleep`-only sibling (spec.md §4.7 step 2).
fn find_running_collector() -> Result<i32> {
    let self_exe = std::env::current_exe().ok();
    let my_pid = std::process::id();

    for entry in std::fs::read_dir("/proc").map_err(Error::Io)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) if n.chars().next().map_or(false, |c| c.is_ascii_digit()) => n,
            _ => continue,
        };
        let pid: u32 = match name.parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        if pid == my_pid {
            continue;
        }

        let exe_link = format!("/proc/{}/exe", pid);
        let target = match std::fs::read_link(&exe_link) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if Some(&target) != self_exe.as_ref() {
            continue;
        }

        if has_usleep_arg(pid) {
            continue;
        }

        return Ok(pid as i32);
    }

    Err(Error::NoCollector)
}

fn has_usleep_arg(pid: u32) -> bool {
    let path = format!("/proc/{}/cmdline", pid);
    match std::fs::read(&path) {
        Ok(bytes) => bytes
            .split(|&b| b == 0)
            .any(|arg| arg == b"--usleep"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CAPACITY;

    #[test]
    fn effective_max_chunk_excludes_the_torn_tail() {
        assert_eq!(effective_max_chunk(5, CAPACITY), 4);
        assert_eq!(effective_max_chunk(1, CAPACITY), 0);
        assert_eq!(effective_max_chunk(0, CAPACITY), 0); // saturating, never underflows
    }

    #[test]
    fn effective_max_chunk_clamps_to_the_array_length() {
        // a view.max_chunk beyond the chunks array itself (corrupt/foreign
        // memory) must not produce an out-of-bounds slice bound.
        assert_eq!(effective_max_chunk(CAPACITY + 10, CAPACITY), CAPACITY - 1);
    }

    fn stack_map_view_with_magic(max_chunk: usize) -> StackMapView {
        let mut magic = [0u8; 64];
        let bytes = STACK_MAP_MAGIC.as_bytes();
        magic[..bytes.len()].copy_from_slice(bytes);
        StackMapView {
            magic,
            chunks: [0usize; CAPACITY],
            max_chunk,
        }
    }

    #[test]
    fn search_stack_finds_the_magic_at_an_offset() {
        let view = stack_map_view_with_magic(7);
        let view_bytes = unsafe {
            std::slice::from_raw_parts(
                &view as *const StackMapView as *const u8,
                std::mem::size_of::<StackMapView>(),
            )
        };

        let mut buf = vec![0xAAu8; 4096];
        let offset = 123;
        buf[offset..offset + view_bytes.len()].copy_from_slice(view_bytes);

        let found = search_stack(&buf).expect("magic should be found");
        assert_eq!(found.max_chunk, 7);
    }

    #[test]
    fn search_stack_returns_none_without_a_match() {
        let buf = vec![0u8; 4096];
        assert!(search_stack(&buf).is_none());
    }

    #[test]
    fn search_stack_returns_none_on_a_too_small_buffer() {
        let buf = vec![0u8; 8];
        assert!(search_stack(&buf).is_none());
    }

    /// Requires `CAP_SYS_PTRACE` (or an unrestricted `ptrace_scope`); skips
    /// gracefully rather than failing when the sandbox denies it.
    #[test]
    fn attach_and_detach_round_trip_when_permitted() {
        let mut child = match std::process::Command::new("sleep").arg("5").spawn() {
            Ok(c) => c,
            Err(_) => return, // no shell available in this environment either
        };
        thread::sleep(Duration::from_millis(50));

        match attach(child.id() as i32) {
            Ok(state) => detach_and_terminate(state, true),
            Err(e) => log::info!("skipping ptrace attach test, unavailable here: {}", e),
        }

        let _ = child.kill();
        let _ = child.wait();
    }
}
