//! Protection Domain and Memory Region management.

use std::ptr::NonNull;
use std::rc::Rc;
use std::{fmt, io};

use bitflags::bitflags;

use crate::device::Context;

bitflags! {
    /// Memory access flags for Memory Region registration and QP access
    /// rights. Local read access is always implied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Enable local write access.
        const LOCAL_WRITE = ibverbs_sys::ibv_access_flags_IBV_ACCESS_LOCAL_WRITE;

        /// Enable remote write access. Requires `LOCAL_WRITE`.
        const REMOTE_WRITE = ibverbs_sys::ibv_access_flags_IBV_ACCESS_REMOTE_WRITE;

        /// Enable remote read access.
        const REMOTE_READ = ibverbs_sys::ibv_access_flags_IBV_ACCESS_REMOTE_READ;
    }
}

pub(crate) struct PdInner {
    pd: NonNull<ibverbs_sys::ibv_pd>,
    /// Keep the context alive while this PD exists.
    _ctx: Context,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_dealloc_pd(self.pd.as_ptr());
        }
    }
}

/// Protection Domain for RDMA resources.
///
/// All resources that need to work together (QPs, MRs, SRQs) must be created
/// within the same PD. Cheaply cloneable via `Rc`.
#[derive(Clone)]
pub struct Pd(Rc<PdInner>);

impl fmt::Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pd").finish_non_exhaustive()
    }
}

impl Context {
    /// Allocate a Protection Domain for this device context.
    pub fn alloc_pd(&self) -> io::Result<Pd> {
        unsafe {
            let pd = ibverbs_sys::ibv_alloc_pd(self.as_ptr());
            NonNull::new(pd).map_or(Err(io::Error::last_os_error()), |pd| {
                Ok(Pd(Rc::new(PdInner {
                    pd,
                    _ctx: self.clone(),
                })))
            })
        }
    }
}

impl Pd {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_pd {
        self.0.pd.as_ptr()
    }
}

/// Memory Region registered with the HCA.
///
/// Provides the `lkey` used when posting local buffers and the `rkey` the
/// remote side uses to RDMA into this region. Deregistered on drop.
pub struct MemoryRegion {
    mr: NonNull<ibverbs_sys::ibv_mr>,
    /// Keep the PD alive while this MR exists.
    _pd: Pd,
}

impl Pd {
    /// Register a memory region with the HCA.
    ///
    /// # Safety
    /// The `len` bytes starting at `addr` must stay valid (and not move) for
    /// the lifetime of the returned `MemoryRegion`.
    pub unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        let mr = ibverbs_sys::ibv_reg_mr(
            self.as_ptr(),
            addr as *mut std::ffi::c_void,
            len,
            access.bits() as i32,
        );
        NonNull::new(mr).map_or(Err(io::Error::last_os_error()), |mr| {
            Ok(MemoryRegion {
                mr,
                _pd: self.clone(),
            })
        })
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_dereg_mr(self.mr.as_ptr());
        }
    }
}

impl MemoryRegion {
    /// Local key, for `ibv_sge` entries posted from this process.
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    /// Remote key, for the peer's RDMA operations targeting this region.
    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).rkey }
    }

    /// Starting address of the registered range.
    pub fn addr(&self) -> *mut u8 {
        unsafe { (*self.mr.as_ptr()).addr as *mut u8 }
    }

    /// Length of the registered range in bytes.
    pub fn len(&self) -> usize {
        unsafe { (*self.mr.as_ptr()).length }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
