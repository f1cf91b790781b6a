//! Executable memory for generated kernels.
//!
//! The stream (code followed by its constant pool) is copied into an
//! anonymous mapping, which is then flipped from read-write to
//! read-execute. The mapping is released on drop.

use crate::types::{BrgemmError, BrgemmResult};

/// A read-only, executable copy of one instruction stream.
pub struct ExecutableBuffer {
    ptr: *mut u8,
    /// Mapped length (page multiple).
    len: usize,
    /// Bytes of the stream actually copied.
    used: usize,
}

// SAFETY: the mapping is owned exclusively and never written after
// construction (PROT_READ | PROT_EXEC).
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Map `code` executable.
    pub fn new(code: &[u8]) -> BrgemmResult<Self> {
        if code.is_empty() {
            return Err(BrgemmError::Memory("empty instruction stream".into()));
        }
        let page = page_size()?;
        let len = code.len().next_multiple_of(page);

        // SAFETY: anonymous private mapping, no file descriptor. The result
        // is checked against MAP_FAILED.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(BrgemmError::Memory(format!(
                "mmap of {len} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let ptr = raw as *mut u8;

        // SAFETY: the mapping is at least `code.len()` bytes and writable.
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };

        // SAFETY: `ptr`/`len` describe the mapping created above.
        let ret = unsafe { libc::mprotect(raw, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: same mapping, not yet handed out.
            unsafe { libc::munmap(raw, len) };
            return Err(BrgemmError::Memory(format!("mprotect failed: {err}")));
        }

        Ok(ExecutableBuffer {
            ptr,
            len,
            used: code.len(),
        })
    }

    /// Start of the mapping (the kernel entry point).
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// The copied stream.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the first `used` bytes were initialized by `new` and the
        // mapping stays readable for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.used) }
    }

    /// Mapped size in bytes.
    pub fn mapped_len(&self) -> usize {
        self.len
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` are exactly the mapping created in `new`.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for ExecutableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("used", &self.used)
            .finish()
    }
}

fn page_size() -> BrgemmResult<usize> {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        return Err(BrgemmError::Memory("cannot query the page size".into()));
    }
    Ok(page as usize)
}
