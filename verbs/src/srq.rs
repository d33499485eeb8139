//! Shared Receive Queue management.
//!
//! One SRQ serves every QP of a reactor. The transport's incoming traffic
//! carries no receive payload (RDMA WRITE WITH IMM lands directly in the
//! inbox ring, SEND WITH IMM acks are payload-free), so receive WRs are
//! posted with no scatter-gather entries at all.

use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::rc::Rc;
use std::{fmt, io};

use crate::pd::Pd;

pub(crate) struct SrqInner {
    srq: NonNull<ibverbs_sys::ibv_srq>,
    /// Keep the PD alive while this SRQ exists.
    _pd: Pd,
}

impl Drop for SrqInner {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_destroy_srq(self.srq.as_ptr());
        }
    }
}

/// Shared Receive Queue. Cheaply cloneable via `Rc`.
#[derive(Clone)]
pub struct Srq(Rc<SrqInner>);

impl fmt::Debug for Srq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Srq").finish_non_exhaustive()
    }
}

impl Pd {
    pub fn create_srq(&self, max_wr: u32) -> io::Result<Srq> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_srq_init_attr = MaybeUninit::zeroed().assume_init();
            attr.attr.max_wr = max_wr;
            attr.attr.max_sge = 1;

            let srq = ibverbs_sys::ibv_create_srq(self.as_ptr(), &mut attr);
            NonNull::new(srq).map_or(Err(io::Error::last_os_error()), |srq| {
                Ok(Srq(Rc::new(SrqInner {
                    srq,
                    _pd: self.clone(),
                })))
            })
        }
    }
}

impl Srq {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_srq {
        self.0.srq.as_ptr()
    }

    /// Post one receive WR with no scatter-gather list.
    pub fn post_recv(&self, wr_id: u64) -> io::Result<()> {
        unsafe {
            let mut wr: ibverbs_sys::ibv_recv_wr = MaybeUninit::zeroed().assume_init();
            wr.wr_id = wr_id;
            wr.sg_list = std::ptr::null_mut();
            wr.num_sge = 0;

            let mut bad_wr = std::ptr::null_mut();
            let ret = ibverbs_sys::inline::ibv_post_srq_recv(self.as_ptr(), &mut wr, &mut bad_wr);
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
        }
        Ok(())
    }
}
