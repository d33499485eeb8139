//! Completion Queue management and work-completion parsing.

use std::ptr::NonNull;
use std::rc::Rc;
use std::{fmt, io};

use crate::device::Context;

/// Status of a completion whose work request never reached the NIC.
pub const WC_STATUS_FATAL_ERR: u32 = ibverbs_sys::ibv_wc_status_IBV_WC_FATAL_ERR;

/// Work-completion opcodes the transport dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// A local SEND finished.
    Send,
    /// A local RDMA WRITE finished.
    RdmaWrite,
    /// A remote SEND landed in a receive WR.
    Recv,
    /// A remote RDMA WRITE WITH IMM consumed a receive WR.
    RecvRdmaWithImm,
    Other(u32),
}

impl WcOpcode {
    fn from_raw(v: u32) -> Self {
        match v {
            ibverbs_sys::ibv_wc_opcode_IBV_WC_SEND => Self::Send,
            ibverbs_sys::ibv_wc_opcode_IBV_WC_RDMA_WRITE => Self::RdmaWrite,
            ibverbs_sys::ibv_wc_opcode_IBV_WC_RECV => Self::Recv,
            ibverbs_sys::ibv_wc_opcode_IBV_WC_RECV_RDMA_WITH_IMM => Self::RecvRdmaWithImm,
            other => Self::Other(other),
        }
    }
}

/// A work completion.
#[repr(transparent)]
pub struct Wc(ibverbs_sys::ibv_wc);

impl Default for Wc {
    fn default() -> Self {
        // All-zero ibv_wc is a valid (if meaningless) value.
        Self(unsafe { std::mem::zeroed() })
    }
}

impl Clone for Wc {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl Wc {
    pub fn wr_id(&self) -> u64 {
        self.0.wr_id
    }

    pub fn status(&self) -> u32 {
        self.0.status
    }

    pub fn is_success(&self) -> bool {
        self.0.status == ibverbs_sys::ibv_wc_status_IBV_WC_SUCCESS
    }

    /// Only meaningful when `is_success()`; the opcode field of a failed
    /// completion is undefined.
    pub fn opcode(&self) -> WcOpcode {
        WcOpcode::from_raw(self.0.opcode)
    }

    pub fn qp_num(&self) -> u32 {
        self.0.qp_num
    }

    pub fn byte_len(&self) -> u32 {
        self.0.byte_len
    }

    /// Immediate data carried by a RECV / RECV_RDMA_WITH_IMM completion.
    pub fn imm_data(&self) -> u32 {
        unsafe { self.0.__bindgen_anon_1.imm_data }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .field("qp_num", &self.qp_num())
            .finish_non_exhaustive()
    }
}

pub(crate) struct CqInner {
    cq: NonNull<ibverbs_sys::ibv_cq>,
    /// Keep the context alive while this CQ exists.
    _ctx: Context,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_destroy_cq(self.cq.as_ptr());
        }
    }
}

/// Completion Queue shared by every QP of one reactor.
#[derive(Clone)]
pub struct Cq(Rc<CqInner>);

impl Context {
    pub fn create_cq(&self, depth: i32) -> io::Result<Cq> {
        unsafe {
            let cq = ibverbs_sys::ibv_create_cq(
                self.as_ptr(),
                depth,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0,
            );
            NonNull::new(cq).map_or(Err(io::Error::last_os_error()), |cq| {
                Ok(Cq(Rc::new(CqInner {
                    cq,
                    _ctx: self.clone(),
                })))
            })
        }
    }
}

impl Cq {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_cq {
        self.0.cq.as_ptr()
    }

    /// Poll up to `wc.len()` completions into `wc`, returning the count.
    pub fn poll(&self, wc: &mut [Wc]) -> io::Result<usize> {
        let n = unsafe {
            ibverbs_sys::inline::ibv_poll_cq(
                self.as_ptr(),
                wc.len() as i32,
                wc.as_mut_ptr() as *mut ibverbs_sys::ibv_wc,
            )
        };
        if n < 0 {
            return Err(io::Error::other("ibv_poll_cq failed"));
        }
        Ok(n as usize)
    }
}
