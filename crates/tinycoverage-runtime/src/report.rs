//! Memory-mapped report file
//!
//! The report is written through a shared, write-only mapping of a file
//! pre-sized to an upper bound; shutdown truncates it back to the written
//! prefix. Words go straight into the mapping, so a `test_finished` call
//! costs no syscalls at all.

use std::ffi::CStr;

use crate::error::{RuntimeError, RuntimeResult};

/// Default report capacity. Adequate for typical test runs; sustained
/// fuzzing sessions should pass a larger value to
/// [`init_with_capacity`](crate::init_with_capacity).
pub const DEFAULT_REPORT_CAPACITY: usize = 200 * 1024;

pub(crate) struct ReportFile {
    fd: libc::c_int,
    base: *mut u32,
    capacity_bytes: usize,
    len_words: usize,
    cursor: usize,
}

impl ReportFile {
    /// Create (or truncate) `path`, size it to `capacity` bytes, and map
    /// it shared and write-only.
    pub(crate) fn create(path: &CStr, capacity: usize) -> RuntimeResult<Self> {
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                0o666 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(RuntimeError::io("open"));
        }

        if unsafe { libc::ftruncate(fd, capacity as libc::off_t) } != 0 {
            let err = RuntimeError::io("ftruncate");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = RuntimeError::io("mmap");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self {
            fd,
            base: base.cast::<u32>(),
            capacity_bytes: capacity,
            len_words: capacity / 4,
            cursor: 0,
        })
    }

    /// Append one little-endian word. Saturates silently once the mapping
    /// is full; the capacity is a deployment parameter, not a correctness
    /// boundary.
    pub(crate) fn push(&mut self, word: u32) {
        if self.cursor >= self.len_words {
            return;
        }
        // Storing the `to_le` value makes the bytes little-endian on any
        // host.
        unsafe { self.base.add(self.cursor).write(word.to_le()) };
        self.cursor += 1;
    }

    /// Append a length-prefixed, NUL-padded string.
    pub(crate) fn push_str(&mut self, bytes: &[u8]) {
        for word in tinycoverage_format::string_words(bytes) {
            self.push(word);
        }
    }

    pub(crate) fn words_written(&self) -> usize {
        self.cursor
    }

    /// Flush, unmap, shrink the file to the written prefix plus one word,
    /// and close it.
    pub(crate) fn finalize(self) -> RuntimeResult<()> {
        let final_bytes = (self.cursor + 1) * 4;
        unsafe {
            if libc::msync(self.base.cast(), self.capacity_bytes, libc::MS_SYNC) != 0 {
                return Err(RuntimeError::io("msync"));
            }
            if libc::munmap(self.base.cast(), self.capacity_bytes) != 0 {
                return Err(RuntimeError::io("munmap"));
            }
            if libc::ftruncate(self.fd, final_bytes as libc::off_t) != 0 {
                return Err(RuntimeError::io("ftruncate"));
            }
            if libc::close(self.fd) != 0 {
                return Err(RuntimeError::io("close"));
            }
        }
        Ok(())
    }
}
