//! Fixed-size page-aligned chunks and the stack-resident index over them.
//!
//! Grounded on `original_source/collector/common.h` and
//! `original_source/collector/output.c::chunk_alloc`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Design constant: ~128 MiB of total logging space across 1024 chunks.
pub const CHUNK_SIZE: usize = 128 * 1024;

/// A marker long and distinctive enough that an accidental match elsewhere
/// on the collector's stack is negligible (spec.md §3, StackMap invariant).
pub const STACK_MAP_MAGIC: &str = "bootcollect-stack-resident-chunk-index-rendezvous-marker-v1";

const DEST_STREAM_LEN: usize = 60;
pub const CAPACITY: usize = 1024;

/// Byte-exact header the dumper parses out of another process's address
/// space with no further metadata (spec.md §3).
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ChunkHeader {
    pub dest_stream: [u8; DEST_STREAM_LEN],
    pub length: u64,
}

impl ChunkHeader {
    pub fn dest_stream(&self) -> &str {
        let nul = self.dest_stream.iter().position(|&b| b == 0).unwrap_or(DEST_STREAM_LEN);
        std::str::from_utf8(&self.dest_stream[..nul]).unwrap_or("")
    }
}

pub const HEADER_SIZE: usize = std::mem::size_of::<ChunkHeader>();
pub const CHUNK_PAYLOAD: usize = CHUNK_SIZE - HEADER_SIZE;

/// A fixed-size, zero-initialized chunk: header followed by payload bytes.
/// `#[repr(C)]` so that the dumper, which only ever sees this type as a
/// `pread`ed byte blob reinterpreted via `&Chunk`, can rely on the layout.
#[repr(C)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub data: [u8; CHUNK_PAYLOAD],
}

impl Chunk {
    fn new(dest: &str) -> Box<Chunk> {
        let mut c: Box<Chunk> = unsafe {
            let layout = std::alloc::Layout::new::<Chunk>();
            let ptr = std::alloc::alloc_zeroed(layout) as *mut Chunk;
            assert!(!ptr.is_null(), "failed to allocate a chunk");
            Box::from_raw(ptr)
        };
        let bytes = dest.as_bytes();
        let n = bytes.len().min(DEST_STREAM_LEN - 1);
        c.header.dest_stream[..n].copy_from_slice(&bytes[..n]);
        c.header.length = 0;
        c
    }

    pub fn dest_stream(&self) -> &str {
        self.header.dest_stream()
    }

    pub fn len(&self) -> usize {
        self.header.length as usize
    }

    fn reset(&mut self) {
        self.header.length = 0;
    }

    /// Raw starting address of this chunk, as recorded in a `StackMap`.
    /// Only meaningful within the process that allocated it; the dumper
    /// reinterprets it in a *different* address space via `pread`.
    pub fn address(&self) -> usize {
        self as *const Chunk as usize
    }
}

/// The plain-old-data prefix that is actually the rendezvous object: a magic
/// marker, a bounded array of chunk addresses, and a used count. This is the
/// type the dumper casts a byte offset to after finding the magic — it must
/// stay free of anything that isn't meaningful once copied out of another
/// process's memory (no `Vec`, no lock, no `Drop`).
#[repr(C)]
#[derive(Copy, Clone)]
pub struct StackMapView {
    pub magic: [u8; 64],
    pub chunks: [usize; CAPACITY],
    pub max_chunk: usize,
}

impl StackMapView {
    fn new() -> StackMapView {
        let mut magic = [0u8; 64];
        let bytes = STACK_MAP_MAGIC.as_bytes();
        magic[..bytes.len()].copy_from_slice(bytes);
        StackMapView {
            magic,
            chunks: [0; CAPACITY],
            max_chunk: 0,
        }
    }
}

/// The real, live value kept on the collector's main-thread stack
/// (spec.md §3: "allocated as a local variable in the top-level entry
/// procedure and kept live until process exit"). `view` is the byte-exact
/// part the dumper scans for and copies; `store` is this process's own
/// bookkeeping for the chunks it owns and is never read by the dumper.
#[repr(C)]
pub struct StackMap {
    pub view: StackMapView,
    overflowed: AtomicBool,
    store: Vec<Box<Chunk>>,
}

impl StackMap {
    pub fn new() -> StackMap {
        StackMap {
            view: StackMapView::new(),
            overflowed: AtomicBool::new(false),
            store: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        CAPACITY
    }

    pub fn max_chunk(&self) -> usize {
        self.view.max_chunk
    }
}

impl Default for StackMap {
    fn default() -> Self {
        Self::new()
    }
}

/// `chunk_alloc(sm, dest_name)` (spec.md §4.1). Serialized by the caller's
/// mutex — this is the sole shared mutable state between the sample-loop
/// thread and the netlink listener thread (spec.md §5).
pub fn chunk_alloc(sm: &Mutex<StackMap>, dest: &str) -> usize {
    let mut sm = sm.lock().expect("StackMap mutex poisoned");

    if sm.view.max_chunk == sm.capacity() {
        if !sm.overflowed.swap(true, Ordering::SeqCst) {
            log::warn!(
                "bootcollect - internal buffer overflow! did you set hz too high, \
                 or is your boot time too long?"
            );
        }
        let last = sm.store.last_mut().expect("overflow with no chunks allocated");
        last.reset();
        return sm.view.chunks[sm.view.max_chunk - 1];
    }

    let chunk = Chunk::new(dest);
    let addr = chunk.address();
    sm.store.push(chunk);
    let idx = sm.view.max_chunk;
    sm.view.chunks[idx] = addr;
    sm.view.max_chunk += 1;
    addr
}

/// Dereferences a chunk address allocated by `chunk_alloc` from within this
/// same process. Never used by the dumper, which reads a *foreign*
/// process's memory instead.
///
/// # Safety
/// `addr` must be a value previously returned by `chunk_alloc` against the
/// same `StackMap`, and the `StackMap` (and therefore its chunk store) must
/// still be alive.
pub unsafe fn chunk_mut_at(addr: usize) -> &'static mut Chunk {
    &mut *(addr as *mut Chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_byte_exact() {
        assert_eq!(HEADER_SIZE, DEST_STREAM_LEN + 8);
        assert_eq!(CHUNK_PAYLOAD, CHUNK_SIZE - HEADER_SIZE);
    }

    #[test]
    fn magic_fits_in_field() {
        assert!(STACK_MAP_MAGIC.len() >= 50);
        assert!(STACK_MAP_MAGIC.len() < 64);
    }

    #[test]
    fn chunk_alloc_records_address_and_dest() {
        let sm = Mutex::new(StackMap::new());
        let addr = chunk_alloc(&sm, "proc_stat.log");
        {
            let guard = sm.lock().unwrap();
            assert_eq!(guard.view.max_chunk, 1);
            assert_eq!(guard.view.chunks[0], addr);
        }
        let chunk = unsafe { chunk_mut_at(addr) };
        assert_eq!(chunk.dest_stream(), "proc_stat.log");
        assert_eq!(chunk.len(), 0);
    }

    #[test]
    fn chunk_alloc_saturates_capacity_and_latches_overflow() {
        let sm = Mutex::new(StackMap::new());
        let cap = sm.lock().unwrap().capacity();
        let mut last_addr = 0;
        for _ in 0..cap {
            last_addr = chunk_alloc(&sm, "x.log");
        }
        assert_eq!(sm.lock().unwrap().view.max_chunk, cap);

        // one more alloc must not grow max_chunk, and must overwrite the
        // final chunk rather than fail
        let addr = chunk_alloc(&sm, "x.log");
        assert_eq!(addr, last_addr);
        assert_eq!(sm.lock().unwrap().view.max_chunk, cap);
        assert!(sm.lock().unwrap().overflowed.load(Ordering::SeqCst));
    }

    #[test]
    fn dest_stream_truncates_to_field_width() {
        let long_name = "x".repeat(200);
        let sm = Mutex::new(StackMap::new());
        let addr = chunk_alloc(&sm, &long_name);
        let chunk = unsafe { chunk_mut_at(addr) };
        assert!(chunk.dest_stream().len() < DEST_STREAM_LEN);
    }
}
