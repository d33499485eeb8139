//! Shared verbs state for one context.
//!
//! The reactor owns the device context, protection domain, one completion
//! queue and one shared receive queue. Connections register their QP number
//! here; every completion polled from the CQ is routed to the owning
//! connection. The reactor also enforces the global budgets on outstanding
//! RDMA-write and ack work requests: posts beyond the budget queue up in
//! FIFO order and are flushed as completions return slots.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use fastmap::FastMap;
use log::{debug, warn};
use verbs::{AccessFlags, Cq, DeviceList, Gid, Pd, PortState, RcQp, Srq, Wc, WcOpcode};

use crate::context::Config;
use crate::event_loop::EventLoop;

/// wr_id of every RDMA-write request. Failed completions do not preserve
/// the opcode, so the id is the only way to classify them afterwards.
pub(crate) const WRITE_WR_ID: u64 = 1;
/// wr_id of every send-ack request.
pub(crate) const ACK_WR_ID: u64 = 2;
/// wr_id of the payload-free receives pre-posted on the SRQ.
const RECV_WR_ID: u64 = 0;

const CQ_POLL_BATCH: usize = 16;

/// Verbs completion events delivered to a connection, serialized into the
/// owning loop.
pub(crate) trait QpHandler {
    /// The peer RDMA-wrote `len` bytes into our inbox.
    fn on_remote_produced_data(&self, len: u32);
    /// The peer acked `len` bytes of our outbox.
    fn on_remote_consumed_data(&self, len: u32);
    /// One of our RDMA-write work requests finished.
    fn on_write_completed(&self);
    /// One of our send-ack work requests finished.
    fn on_ack_completed(&self);
    /// A work request on our QP finished with a non-success status.
    fn on_error(&self, status: u32, wr_id: u64);
}

/// A queued RDMA-write request. The immediate data always equals `len`.
pub(crate) struct WriteWr {
    pub local_addr: u64,
    pub len: u32,
    pub lkey: u32,
    pub remote_addr: u64,
    pub rkey: u32,
}

pub(crate) struct Reactor {
    #[allow(dead_code)]
    device: verbs::Context,
    pd: Pd,
    cq: Cq,
    srq: Srq,
    ev: Rc<EventLoop>,

    port: u8,
    lid: u16,
    gid: Gid,
    gid_index: u8,
    /// Active path MTU of the local port, as the raw `ibv_mtu` value.
    mtu: u32,

    max_send_wr: u32,
    handlers: RefCell<FastMap<Rc<dyn QpHandler>>>,

    srq_depth: u32,
    srq_posted: Cell<u32>,

    available_writes: Cell<u32>,
    available_acks: Cell<u32>,
    pending_writes: RefCell<VecDeque<(RcQp, WriteWr)>>,
    pending_acks: RefCell<VecDeque<(RcQp, u32)>>,
}

impl Reactor {
    pub fn new(config: &Config, ev: Rc<EventLoop>) -> io::Result<Self> {
        let devices = DeviceList::list()?;
        let device = devices.get(config.device_index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "RDMA device not found")
        })?;
        debug!(
            "opening RDMA device [{}] {}",
            config.device_index,
            device.name().unwrap_or("?")
        );
        let device = device.open()?;

        let port_attr = device.query_port(config.port)?;
        if port_attr.state != PortState::Active {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "RDMA port is not active",
            ));
        }
        let gid = device.query_gid(config.port, config.gid_index)?;

        let pd = device.alloc_pd()?;
        let cq = device.create_cq(config.cq_depth)?;
        let srq = pd.create_srq(config.srq_depth)?;

        for _ in 0..config.srq_depth {
            srq.post_recv(RECV_WR_ID)?;
        }

        Ok(Self {
            device,
            pd,
            cq,
            srq,
            ev,
            port: config.port,
            lid: port_attr.lid,
            gid,
            gid_index: config.gid_index,
            mtu: port_attr.active_mtu,
            max_send_wr: config.max_write_wrs + config.max_ack_wrs,
            handlers: RefCell::new(FastMap::new()),
            srq_depth: config.srq_depth,
            srq_posted: Cell::new(config.srq_depth),
            available_writes: Cell::new(config.max_write_wrs),
            available_acks: Cell::new(config.max_ack_wrs),
            pending_writes: RefCell::new(VecDeque::new()),
            pending_acks: RefCell::new(VecDeque::new()),
        })
    }

    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn gid_index(&self) -> u8 {
        self.gid_index
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Create an RC QP bound to the reactor's CQ and SRQ.
    pub fn create_qp(&self) -> io::Result<RcQp> {
        self.pd.create_rc_qp(&self.cq, &self.srq, self.max_send_wr)
    }

    /// The access a connection grants its peer: RDMA writes into the inbox.
    pub fn qp_access(&self) -> AccessFlags {
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE
    }

    pub fn register_qp(&self, qpn: u32, handler: Rc<dyn QpHandler>) {
        self.handlers.borrow_mut().insert(qpn, handler);
    }

    pub fn unregister_qp(&self, qpn: u32) {
        self.handlers.borrow_mut().remove(qpn);
    }

    /// True once no connection holds verbs resources and nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.handlers.borrow().is_empty()
            && self.pending_writes.borrow().is_empty()
            && self.pending_acks.borrow().is_empty()
    }

    /// Post (or queue) an RDMA WRITE WITH IMM. The caller has already
    /// counted the request in its in-flight accounting; a completion is
    /// guaranteed to be delivered for it eventually, even if the verbs post
    /// itself fails.
    pub fn post_write(&self, qp: &RcQp, wr: WriteWr) {
        let available = self.available_writes.get();
        if available == 0 {
            self.pending_writes.borrow_mut().push_back((qp.clone(), wr));
            return;
        }
        self.available_writes.set(available - 1);
        self.do_post_write(qp, &wr);
    }

    /// Post (or queue) a SEND WITH IMM ack. Same completion guarantee as
    /// [`Reactor::post_write`].
    pub fn post_ack(&self, qp: &RcQp, imm: u32) {
        let available = self.available_acks.get();
        if available == 0 {
            self.pending_acks.borrow_mut().push_back((qp.clone(), imm));
            return;
        }
        self.available_acks.set(available - 1);
        self.do_post_ack(qp, imm);
    }

    fn do_post_write(&self, qp: &RcQp, wr: &WriteWr) {
        let ret = qp.post_write_with_imm(
            WRITE_WR_ID,
            wr.local_addr,
            wr.len,
            wr.lkey,
            wr.remote_addr,
            wr.rkey,
            wr.len,
        );
        if let Err(e) = ret {
            warn!("posting RDMA write on QP {} failed: {}", qp.qpn(), e);
            self.available_writes.set(self.available_writes.get() + 1);
            self.synthesize_error(qp.qpn(), WRITE_WR_ID);
        }
    }

    fn do_post_ack(&self, qp: &RcQp, imm: u32) {
        if let Err(e) = qp.post_send_with_imm(ACK_WR_ID, imm) {
            warn!("posting ack on QP {} failed: {}", qp.qpn(), e);
            self.available_acks.set(self.available_acks.get() + 1);
            self.synthesize_error(qp.qpn(), ACK_WR_ID);
        }
    }

    /// A verbs post failed, so the NIC will never flush this request. Fake
    /// the error completion (deferred, so the caller's stack unwinds first)
    /// to keep the connection's in-flight accounting converging.
    fn synthesize_error(&self, qpn: u32, wr_id: u64) {
        let handler = self.handlers.borrow().get(qpn).cloned();
        if let Some(handler) = handler {
            self.ev.defer(move || {
                handler.on_error(verbs::cq::WC_STATUS_FATAL_ERR, wr_id);
            });
        }
    }

    /// Drain the CQ, dispatch completions, replenish the SRQ, and flush
    /// queued posts into freed budget slots.
    pub fn poll(&self) {
        let mut wcs = vec![Wc::default(); CQ_POLL_BATCH];
        let mut srq_consumed = 0u32;

        loop {
            let n = match self.cq.poll(&mut wcs) {
                Ok(n) => n,
                Err(e) => {
                    warn!("CQ poll failed: {}", e);
                    break;
                }
            };
            if n == 0 {
                break;
            }

            for wc in &wcs[..n] {
                let handler = self.handlers.borrow().get(wc.qp_num()).cloned();

                if !wc.is_success() {
                    match wc.wr_id() {
                        RECV_WR_ID => srq_consumed += 1,
                        WRITE_WR_ID => {
                            self.available_writes.set(self.available_writes.get() + 1)
                        }
                        ACK_WR_ID => self.available_acks.set(self.available_acks.get() + 1),
                        _ => {}
                    }
                    if let Some(handler) = handler {
                        handler.on_error(wc.status(), wc.wr_id());
                    }
                    continue;
                }

                match wc.opcode() {
                    WcOpcode::RecvRdmaWithImm => {
                        srq_consumed += 1;
                        if let Some(handler) = handler {
                            handler.on_remote_produced_data(wc.imm_data());
                        }
                    }
                    WcOpcode::Recv => {
                        srq_consumed += 1;
                        if let Some(handler) = handler {
                            handler.on_remote_consumed_data(wc.imm_data());
                        }
                    }
                    WcOpcode::RdmaWrite => {
                        self.available_writes.set(self.available_writes.get() + 1);
                        if let Some(handler) = handler {
                            handler.on_write_completed();
                        }
                    }
                    WcOpcode::Send => {
                        self.available_acks.set(self.available_acks.get() + 1);
                        if let Some(handler) = handler {
                            handler.on_ack_completed();
                        }
                    }
                    _ => {}
                }
            }
        }

        self.replenish_srq(srq_consumed);
        self.flush_pending();
    }

    fn replenish_srq(&self, consumed: u32) {
        if consumed == 0 {
            return;
        }
        let mut posted = self.srq_posted.get().saturating_sub(consumed);

        // Repost in batches once below two thirds of the configured depth.
        let threshold = self.srq_depth * 2 / 3;
        if posted < threshold {
            while posted < self.srq_depth {
                if let Err(e) = self.srq.post_recv(RECV_WR_ID) {
                    warn!("SRQ repost failed: {}", e);
                    break;
                }
                posted += 1;
            }
        }
        self.srq_posted.set(posted);
    }

    fn flush_pending(&self) {
        loop {
            if self.available_writes.get() == 0 {
                break;
            }
            let next = self.pending_writes.borrow_mut().pop_front();
            let Some((qp, wr)) = next else { break };
            self.available_writes.set(self.available_writes.get() - 1);
            self.do_post_write(&qp, &wr);
        }

        loop {
            if self.available_acks.get() == 0 {
                break;
            }
            let next = self.pending_acks.borrow_mut().pop_front();
            let Some((qp, imm)) = next else { break };
            self.available_acks.set(self.available_acks.get() - 1);
            self.do_post_ack(&qp, imm);
        }
    }
}
