//! Procfs-polling `PidScanner` backend (spec.md §4.4.a).
//!
//! Grounded on `original_source/collector/tasks.c`.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::pid_map::PidMap;
use crate::pid_scanner::{PidEvent, PidScanner};

pub struct ProcfsPidScanner {
    proc_dir: *mut libc::DIR,
    proc_fd: RawFd,
    known: PidMap,
    cur_pid: i32,
    task_dir: *mut libc::DIR,
}

// `DIR*` is only ever touched from the sample-loop thread that owns this
// scanner; it is never shared across threads.
unsafe impl Send for ProcfsPidScanner {}

impl ProcfsPidScanner {
    pub fn new() -> std::io::Result<ProcfsPidScanner> {
        let path = CString::new("/proc").unwrap();
        let proc_dir = unsafe { libc::opendir(path.as_ptr()) };
        if proc_dir.is_null() {
            return Err(std::io::Error::last_os_error());
        }
        let proc_fd = unsafe { libc::dirfd(proc_dir) };

        Ok(ProcfsPidScanner {
            proc_dir,
            proc_fd,
            known: PidMap::new(),
            cur_pid: 0,
            task_dir: std::ptr::null_mut(),
        })
    }
}

impl Drop for ProcfsPidScanner {
    fn drop(&mut self) {
        if !self.task_dir.is_null() {
            unsafe {
                libc::closedir(self.task_dir);
            }
        }
        unsafe {
            libc::closedir(self.proc_dir);
        }
    }
}

impl PidScanner for ProcfsPidScanner {
    fn restart(&mut self) {
        unsafe {
            libc::rewinddir(self.proc_dir);
        }
    }

    fn next(&mut self) -> i32 {
        loop {
            let entry = unsafe { libc::readdir(self.proc_dir) };
            if entry.is_null() {
                self.cur_pid = 0;
                return 0;
            }
            let name = unsafe { std::ffi::CStr::from_ptr((*entry).d_name.as_ptr()) };
            let name = match name.to_str() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if !name.as_bytes().first().map_or(false, |b| b.is_ascii_digit()) {
                continue;
            }
            let pid: i32 = match name.parse() {
                Ok(p) => p,
                Err(_) => continue,
            };
            self.known.was_known(pid);
            self.cur_pid = pid;
            return pid;
        }
    }

    fn get_cur_pid(&self) -> i32 {
        self.cur_pid
    }

    fn get_cur_ppid(&self) -> i32 {
        0
    }

    fn get_tasks_start(&mut self) {
        let path = CString::new(format!("{}/task", self.cur_pid)).unwrap();
        let fd = unsafe { libc::openat(self.proc_fd, path.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
        self.task_dir = if fd < 0 {
            std::ptr::null_mut()
        } else {
            unsafe { libc::fdopendir(fd) }
        };
    }

    fn get_tasks_next(&mut self) -> i32 {
        if self.task_dir.is_null() {
            return 0;
        }
        loop {
            let entry = unsafe { libc::readdir(self.task_dir) };
            if entry.is_null() {
                return 0;
            }
            let name = unsafe { std::ffi::CStr::from_ptr((*entry).d_name.as_ptr()) };
            let name = match name.to_str() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let tid: i32 = match name.parse() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if tid == self.cur_pid {
                continue;
            }
            return tid;
        }
    }

    fn get_tasks_stop(&mut self) {
        if !self.task_dir.is_null() {
            unsafe {
                libc::closedir(self.task_dir);
            }
            self.task_dir = std::ptr::null_mut();
        }
    }

    fn take_events(&mut self) -> Vec<PidEvent> {
        Vec::new()
    }
}
