//! Page-aligned pinned buffers for the ring buffers.
//!
//! The rings are registered with the HCA as memory regions, so their backing
//! store must be page-aligned and must never move. An anonymous private mmap
//! gives both.

use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

pub(crate) struct MappedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedBuffer {
    pub fn new(len: usize) -> io::Result<Self> {
        let nz_len = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length must be non-zero"))?;

        let ptr = mmap_anonymous(
            None,
            nz_len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_aligned_and_writable() {
        let buf = MappedBuffer::new(1 << 16).expect("mmap failed");
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        assert_eq!(buf.len(), 1 << 16);

        unsafe {
            std::ptr::write_bytes(buf.as_ptr(), 0xAB, buf.len());
            assert_eq!(*buf.as_ptr().add(buf.len() - 1), 0xAB);
        }
    }
}
