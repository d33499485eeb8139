//! Minimal safe wrapper over libibverbs.
//!
//! Covers exactly the surface a reliable-connection byte transport needs:
//! device discovery, protection domains and memory regions, one completion
//! queue, one shared receive queue, and RC queue pairs driven through the
//! RESET -> INIT -> RTR -> RTS (-> ERR) state machine with
//! `RDMA WRITE WITH IMM` / `SEND WITH IMM` posting.
//!
//! Resource types are `Rc`-backed handles; dropping the last handle releases
//! the verbs object. Parents are kept alive by their children (an MR holds
//! its PD, a QP holds its CQ and SRQ), so teardown order mistakes cannot
//! use-after-free at the verbs layer.

pub mod cq;
pub mod device;
pub mod pd;
pub mod qp;
pub mod srq;
pub mod types;

pub use cq::{Cq, Wc, WcOpcode};
pub use device::{Context, Device, DeviceList};
pub use pd::{AccessFlags, MemoryRegion, Pd};
pub use qp::{QpState, RcQp};
pub use srq::Srq;
pub use types::{Gid, PortAttr, PortState, RemoteQpInfo};

/// Human-readable name of a work-completion status code.
pub fn wc_status_str(status: u32) -> &'static str {
    unsafe {
        let s = ibverbs_sys::ibv_wc_status_str(status);
        if s.is_null() {
            "unknown"
        } else {
            std::ffi::CStr::from_ptr(s)
                .to_str()
                .unwrap_or("unknown")
        }
    }
}
