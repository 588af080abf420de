//! A logical append-only stream identified by a destination name, backed by
//! chunks allocated from a shared `StackMap` (spec.md §4.2).
//!
//! Grounded on `original_source/collector/output.c`.

use std::io::Read;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Mutex;

use crate::chunk::{self, StackMap};

pub struct BufferFile<'a> {
    sm: &'a Mutex<StackMap>,
    dest: String,
    cur: usize,
}

impl<'a> BufferFile<'a> {
    /// Safe to call from a single thread only (spec.md §4.2 note). Each
    /// output stream is owned by exactly one thread for its lifetime
    /// (spec.md §5: the listener thread only ever touches `cmdline2.log`/
    /// `paternity.log`, the sample loop touches the rest).
    pub fn new(sm: &'a Mutex<StackMap>, dest: impl Into<String>) -> BufferFile<'a> {
        let dest = dest.into();
        let cur = chunk::chunk_alloc(sm, &dest);
        BufferFile { sm, dest, cur }
    }

    fn cur_chunk(&mut self) -> &mut chunk::Chunk {
        unsafe { chunk::chunk_mut_at(self.cur) }
    }

    /// Appends raw bytes, splitting across as many chunks as necessary.
    pub fn append(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let chunk = self.cur_chunk();
            let free = chunk::CHUNK_PAYLOAD - chunk.len();
            let to_write = free.min(bytes.len());
            let start = chunk.len();
            chunk.data[start..start + to_write].copy_from_slice(&bytes[..to_write]);
            chunk.header.length += to_write as u64;
            bytes = &bytes[to_write..];

            if chunk.len() >= chunk::CHUNK_PAYLOAD {
                self.cur = chunk::chunk_alloc(self.sm, &self.dest);
            }
        }
    }

    /// Reads from `input_fd` into the current chunk's free space until EOF,
    /// a short read, or a read error; allocates new chunks as needed exactly
    /// like `append`.
    pub fn dump(&mut self, input_fd: RawFd) {
        let mut file =
            std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(input_fd) });
        loop {
            let chunk = self.cur_chunk();
            let start = chunk.len();
            let free = chunk::CHUNK_PAYLOAD - start;
            if free == 0 {
                self.cur = chunk::chunk_alloc(self.sm, &self.dest);
                continue;
            }
            let chunk = self.cur_chunk();
            match file.read(&mut chunk.data[start..start + free]) {
                Ok(0) => break,
                Ok(n) => {
                    chunk.header.length += n as u64;
                    if chunk.len() >= chunk::CHUNK_PAYLOAD {
                        self.cur = chunk::chunk_alloc(self.sm, &self.dest);
                    }
                    if n < free {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("read error dumping into {}: {}", self.dest, e);
                    break;
                }
            }
        }
    }

    /// Emits `uptime_bytes`, rewinds `input_fd` to offset 0, dumps its
    /// contents, then emits a trailing newline — the on-disk framing
    /// `<uptime>\n<file contents>\n` per sample (spec.md §4.2, §4.6).
    pub fn dump_frame_with_timestamp(&mut self, input_fd: RawFd, uptime_bytes: &[u8]) {
        self.append(uptime_bytes);
        unsafe {
            libc::lseek(input_fd, 0, libc::SEEK_SET);
        }
        self.dump(input_fd);
        self.append(b"\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn append_splits_across_chunks() {
        let sm = Mutex::new(StackMap::new());
        let mut bf = BufferFile::new(&sm, "test.log");
        let payload = vec![b'a'; chunk::CHUNK_PAYLOAD + 100];
        bf.append(&payload);

        // reconstruct the concatenation in StackMap allocation order
        let addrs: Vec<usize> = {
            let guard = sm.lock().unwrap();
            guard.view.chunks[..guard.view.max_chunk].to_vec()
        };
        let mut out = Vec::new();
        for addr in addrs {
            let c = unsafe { chunk::chunk_mut_at(addr) };
            out.extend_from_slice(&c.data[..c.len()]);
        }
        assert!(out.ends_with(&payload));
    }

    #[test]
    fn dump_frame_with_timestamp_frames_correctly() {
        let sm = Mutex::new(StackMap::new());
        let mut bf = BufferFile::new(&sm, "framed.log");

        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"hello world").unwrap();
        tmp.seek(SeekFrom::Start(5)).unwrap(); // dump() should rewind anyway
        let fd = tmp.as_raw_fd();

        bf.dump_frame_with_timestamp(fd, b"1234\n");

        let addrs: Vec<usize> = {
            let guard = sm.lock().unwrap();
            guard.view.chunks[..guard.view.max_chunk].to_vec()
        };
        let mut out = Vec::new();
        for addr in addrs {
            let c = unsafe { chunk::chunk_mut_at(addr) };
            out.extend_from_slice(&c.data[..c.len()]);
        }
        assert_eq!(out, b"1234\nhello world\n");
    }
}
