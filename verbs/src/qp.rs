//! Reliable-connection queue pairs.

use std::cell::Cell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::rc::Rc;
use std::{fmt, io};

use crate::cq::Cq;
use crate::pd::{AccessFlags, Pd};
use crate::srq::Srq;
use crate::types::RemoteQpInfo;

/// Ack timeout exponent: the requester waits 4.096us * 2^n, so 14 is about
/// 67 ms per attempt.
const ACK_TIMEOUT_EXP: u8 = 14;
/// Transport retries before a send fails with retry-exceeded.
const MAX_SEND_RETRIES: u8 = 7;
/// RNR NAK retries; the value 7 encodes "retry without limit".
const MAX_RNR_RETRIES: u8 = 7;
/// Minimum RNR NAK delay advertised to the peer; code 12 encodes 640 us.
const MIN_RNR_DELAY: u8 = 12;

/// Verbs QP state, tracked locally to reject out-of-order transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

pub(crate) struct QpInner {
    qp: NonNull<ibverbs_sys::ibv_qp>,
    state: Cell<QpState>,
    /// Keep parents alive while this QP exists.
    _pd: Pd,
    _cq: Cq,
    _srq: Srq,
}

impl Drop for QpInner {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_destroy_qp(self.qp.as_ptr());
        }
    }
}

/// An RC queue pair bound to a shared CQ and SRQ.
///
/// Cheaply cloneable via `Rc`; destroyed when the last clone drops.
#[derive(Clone)]
pub struct RcQp(Rc<QpInner>);

impl fmt::Debug for RcQp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcQp")
            .field("qpn", &self.qpn())
            .field("state", &self.state())
            .finish()
    }
}

impl Pd {
    /// Create an RC QP whose send and receive completions both land on `cq`
    /// and whose receives come from `srq`. Every send WR is signaled.
    pub fn create_rc_qp(&self, cq: &Cq, srq: &Srq, max_send_wr: u32) -> io::Result<RcQp> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_init_attr = MaybeUninit::zeroed().assume_init();
            attr.qp_type = ibverbs_sys::ibv_qp_type_IBV_QPT_RC;
            attr.send_cq = cq.as_ptr();
            attr.recv_cq = cq.as_ptr();
            attr.srq = srq.as_ptr();
            attr.cap.max_send_wr = max_send_wr;
            attr.cap.max_send_sge = 1;
            attr.sq_sig_all = 1;

            let qp = ibverbs_sys::ibv_create_qp(self.as_ptr(), &mut attr);
            NonNull::new(qp).map_or(Err(io::Error::last_os_error()), |qp| {
                Ok(RcQp(Rc::new(QpInner {
                    qp,
                    state: Cell::new(QpState::Reset),
                    _pd: self.clone(),
                    _cq: cq.clone(),
                    _srq: srq.clone(),
                })))
            })
        }
    }
}

impl RcQp {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_qp {
        self.0.qp.as_ptr()
    }

    pub fn qpn(&self) -> u32 {
        unsafe { (*self.0.qp.as_ptr()).qp_num }
    }

    pub fn state(&self) -> QpState {
        self.0.state.get()
    }

    fn expect_state(&self, want: QpState) -> io::Result<()> {
        let current = self.0.state.get();
        if current != want {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("queue pair is in {:?}, transition needs {:?}", current, want),
            ));
        }
        Ok(())
    }

    /// Apply one `ibv_modify_qp` call and record the state it reached.
    fn modify(
        &self,
        attr: &mut ibverbs_sys::ibv_qp_attr,
        mask: u32,
        reached: QpState,
    ) -> io::Result<()> {
        let ret = unsafe { ibverbs_sys::ibv_modify_qp(self.as_ptr(), attr, mask as i32) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        self.0.state.set(reached);
        Ok(())
    }

    /// Transition RESET -> INIT.
    pub fn modify_to_init(&self, port: u8, access: AccessFlags) -> io::Result<()> {
        self.expect_state(QpState::Reset)?;

        let mut attr: ibverbs_sys::ibv_qp_attr = unsafe { MaybeUninit::zeroed().assume_init() };
        attr.qp_state = ibverbs_sys::ibv_qp_state_IBV_QPS_INIT;
        attr.port_num = port;
        attr.pkey_index = 0;
        attr.qp_access_flags = access.bits();

        self.modify(
            &mut attr,
            ibverbs_sys::ibv_qp_attr_mask_IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_PKEY_INDEX
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_PORT
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_ACCESS_FLAGS,
            QpState::Init,
        )
    }

    /// Transition INIT -> RTR using the peer's setup information.
    ///
    /// When the peer GID is nonzero the path carries a GRH (RoCE, or
    /// cross-subnet InfiniBand); otherwise plain LID routing is used.
    pub fn modify_to_rtr(
        &self,
        remote: &RemoteQpInfo,
        port: u8,
        path_mtu: u32,
        sgid_index: u8,
    ) -> io::Result<()> {
        self.expect_state(QpState::Init)?;

        let mut attr: ibverbs_sys::ibv_qp_attr = unsafe { MaybeUninit::zeroed().assume_init() };
        attr.qp_state = ibverbs_sys::ibv_qp_state_IBV_QPS_RTR;
        attr.path_mtu = path_mtu;
        attr.dest_qp_num = remote.qp_number;
        attr.rq_psn = remote.packet_sequence_number;
        attr.max_dest_rd_atomic = 0;
        attr.min_rnr_timer = MIN_RNR_DELAY;
        attr.ah_attr.dlid = remote.local_identifier;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = port;
        if remote.global_identifier.is_zero() {
            attr.ah_attr.is_global = 0;
        } else {
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid.raw = remote.global_identifier.raw();
            attr.ah_attr.grh.sgid_index = sgid_index;
            attr.ah_attr.grh.hop_limit = 1;
        }

        self.modify(
            &mut attr,
            ibverbs_sys::ibv_qp_attr_mask_IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_AV
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_PATH_MTU
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_DEST_QPN
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_RQ_PSN
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_MAX_DEST_RD_ATOMIC
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_MIN_RNR_TIMER,
            QpState::Rtr,
        )
    }

    /// Transition RTR -> RTS using our own initial packet sequence number.
    pub fn modify_to_rts(&self, local_psn: u32) -> io::Result<()> {
        self.expect_state(QpState::Rtr)?;

        let mut attr: ibverbs_sys::ibv_qp_attr = unsafe { MaybeUninit::zeroed().assume_init() };
        attr.qp_state = ibverbs_sys::ibv_qp_state_IBV_QPS_RTS;
        attr.sq_psn = local_psn;
        attr.timeout = ACK_TIMEOUT_EXP;
        attr.retry_cnt = MAX_SEND_RETRIES;
        attr.rnr_retry = MAX_RNR_RETRIES;
        attr.max_rd_atomic = 0;

        self.modify(
            &mut attr,
            ibverbs_sys::ibv_qp_attr_mask_IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_TIMEOUT
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_RETRY_CNT
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_RNR_RETRY
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_SQ_PSN
                | ibverbs_sys::ibv_qp_attr_mask_IBV_QP_MAX_QP_RD_ATOMIC,
            QpState::Rts,
        )
    }

    /// Transition to ERROR, flushing every outstanding work request.
    ///
    /// Idempotent. Some providers reject ERR directly from INIT; the caller
    /// may ignore that failure and destroy the QP regardless.
    pub fn modify_to_error(&self) -> io::Result<()> {
        if self.0.state.get() == QpState::Error {
            return Ok(());
        }

        let mut attr: ibverbs_sys::ibv_qp_attr = unsafe { MaybeUninit::zeroed().assume_init() };
        attr.qp_state = ibverbs_sys::ibv_qp_state_IBV_QPS_ERR;

        self.modify(
            &mut attr,
            ibverbs_sys::ibv_qp_attr_mask_IBV_QP_STATE,
            QpState::Error,
        )
    }

    /// Post an RDMA WRITE WITH IMM of one contiguous local buffer.
    pub fn post_write_with_imm(
        &self,
        wr_id: u64,
        local_addr: u64,
        len: u32,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        imm: u32,
    ) -> io::Result<()> {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = MaybeUninit::zeroed().assume_init();
            sge.addr = local_addr;
            sge.length = len;
            sge.lkey = lkey;

            let mut wr: ibverbs_sys::ibv_send_wr = MaybeUninit::zeroed().assume_init();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = ibverbs_sys::ibv_wr_opcode_IBV_WR_RDMA_WRITE_WITH_IMM;
            wr.__bindgen_anon_1.imm_data = imm;
            wr.wr.rdma.remote_addr = remote_addr;
            wr.wr.rdma.rkey = rkey;

            let mut bad_wr = std::ptr::null_mut();
            let ret = ibverbs_sys::inline::ibv_post_send(self.as_ptr(), &mut wr, &mut bad_wr);
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
        }
        Ok(())
    }

    /// Post a payload-free SEND WITH IMM.
    pub fn post_send_with_imm(&self, wr_id: u64, imm: u32) -> io::Result<()> {
        unsafe {
            let mut wr: ibverbs_sys::ibv_send_wr = MaybeUninit::zeroed().assume_init();
            wr.wr_id = wr_id;
            wr.sg_list = std::ptr::null_mut();
            wr.num_sge = 0;
            wr.opcode = ibverbs_sys::ibv_wr_opcode_IBV_WR_SEND_WITH_IMM;
            wr.__bindgen_anon_1.imm_data = imm;

            let mut bad_wr = std::ptr::null_mut();
            let ret = ibverbs_sys::inline::ibv_post_send(self.as_ptr(), &mut wr, &mut bad_wr);
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
        }
        Ok(())
    }
}
