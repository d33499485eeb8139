//! The connection: a reliable byte stream whose data plane is a pair of
//! ring buffers driven by RDMA.
//!
//! Lifecycle: a connection starts from either an accepted control socket or
//! a peer address to dial. It allocates its inbox/outbox rings, registers
//! them with the HCA, creates an RC queue pair, exchanges setup information
//! over the control socket, transitions the QP to RTS, and then serves
//! queued operations until it is closed or hits a fatal error. Teardown
//! waits for the NIC to flush every outstanding work request before the QP
//! and the pinned rings are released.
//!
//! Everything below the public API runs on the context's loop; the public
//! methods defer a closure capturing the `Rc`'d internals and return
//! immediately.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use socket2::{Domain, Type};
use verbs::{MemoryRegion, RcQp};

use crate::bootstrap::{Exchange, SetupInfo, EXCHANGE_LEN};
use crate::context::CtxInner;
use crate::error::{Error, Result};
use crate::event_loop::{FdHandler, EVENT_ERR, EVENT_HUP, EVENT_IN, EVENT_OUT};
use crate::ops::{
    ReadOperation, SizedCallback, UnsizedCallback, WriteCallback, WriteOperation, FRAME_HEADER_LEN,
};
use crate::reactor::{QpHandler, WriteWr, ACK_WR_ID, WRITE_WR_ID};
use crate::ring::RingBuffer;
use crate::RING_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initializing,
    SendAddr,
    RecvAddr,
    Established,
}

/// Everything that pins HCA resources. Field order is release order:
/// the QP first, then each memory region before the ring it covers.
struct DataPlane {
    qp: RcQp,
    inbox_mr: MemoryRegion,
    inbox: RingBuffer,
    outbox_mr: MemoryRegion,
    outbox: RingBuffer,
    self_info: SetupInfo,
}

pub(crate) struct ConnInner {
    weak_self: Weak<ConnInner>,
    ctx: Rc<CtxInner>,

    state: Cell<State>,
    /// Sticky: the first error is retained and fans out to every callback.
    error: RefCell<Option<Error>>,

    socket: RefCell<Option<TcpStream>>,
    dial_addr: Option<SocketAddr>,

    dp: RefCell<Option<DataPlane>>,

    peer_inbox_ptr: Cell<u64>,
    peer_inbox_key: Cell<u32>,
    /// Bytes we have told the NIC to write into the peer's inbox, ever.
    /// Determines the wrap offset of each RDMA write. Not reconciled with
    /// acks; acks account for our outbox instead.
    peer_inbox_head: Cell<u64>,

    /// Bytes transmitted from the outbox but not yet acked. They occupy
    /// [tail, tail + bytes_in_flight) and must not be retransmitted.
    bytes_in_flight: Cell<u32>,
    writes_in_flight: Cell<u32>,
    acks_in_flight: Cell<u32>,

    read_ops: RefCell<VecDeque<ReadOperation>>,
    write_ops: RefCell<VecDeque<WriteOperation>>,

    next_read_submitted: Cell<u64>,
    next_read_callback: Cell<u64>,
    next_write_submitted: Cell<u64>,
    next_write_callback: Cell<u64>,

    id: RefCell<String>,
    closing_token: Cell<Option<usize>>,
    cleanup_queued: Cell<bool>,
}

/// A byte-stream connection to one peer.
///
/// Dropping the handle closes the connection; queued work keeps the
/// internals alive until teardown completes.
pub struct Connection {
    inner: Rc<ConnInner>,
}

impl Connection {
    pub(crate) fn dialing(ctx: &Rc<CtxInner>, addr: SocketAddr, id: String) -> Connection {
        let inner = ConnInner::new(ctx.clone(), None, Some(addr), id);
        let this = inner.clone();
        ctx.ev.defer(move || this.init_from_loop());
        Connection { inner }
    }

    pub(crate) fn accepted(ctx: &Rc<CtxInner>, socket: TcpStream, id: String) -> Connection {
        let inner = ConnInner::new(ctx.clone(), Some(socket), None, id);
        let this = inner.clone();
        ctx.ev.defer(move || this.init_from_loop());
        Connection { inner }
    }

    /// Unsized read: the callback receives one contiguous chunk of whatever
    /// bytes are available, borrowed from the inbox for the duration of the
    /// call.
    pub fn read(&self, cb: impl FnOnce(Result<&[u8]>) + 'static) {
        let inner = self.inner.clone();
        let cb: UnsizedCallback = Box::new(cb);
        self.inner
            .ctx
            .ev
            .defer(move || inner.read_unsized_from_loop(cb));
    }

    /// Sized read: fills `buf` completely, then hands it back.
    pub fn read_exact(&self, buf: Box<[u8]>, cb: impl FnOnce(Result<Box<[u8]>>) + 'static) {
        let inner = self.inner.clone();
        let cb: SizedCallback = Box::new(cb);
        self.inner
            .ctx
            .ev
            .defer(move || inner.read_sized_from_loop(buf, cb));
    }

    /// Object read: reads one length-prefixed frame and decodes it.
    ///
    /// A frame that fails to decode fails this operation with
    /// [`Error::Serde`] and then poisons the connection; the stream offers
    /// no way to resynchronize after a bad frame.
    pub fn read_msg<T, F>(&self, cb: F)
    where
        T: DeserializeOwned + 'static,
        F: FnOnce(Result<T>) + 'static,
    {
        let inner = self.inner.clone();
        let poison = self.inner.clone();
        let finish: UnsizedCallback = Box::new(move |res| match res {
            Ok(bytes) => match bincode::deserialize::<T>(bytes) {
                Ok(value) => cb(Ok(value)),
                Err(e) => {
                    let err = Error::Serde(e.to_string());
                    cb(Err(err.clone()));
                    let this = poison.clone();
                    poison.ctx.ev.defer(move || this.set_error(err));
                }
            },
            Err(e) => cb(Err(e)),
        });
        self.inner
            .ctx
            .ev
            .defer(move || inner.read_object_from_loop(finish));
    }

    /// Raw write. The bytes are copied in at submission; the callback fires
    /// once they have all been staged into the outbox.
    pub fn write(&self, data: &[u8], cb: impl FnOnce(Result<()>) + 'static) {
        let data: Box<[u8]> = data.into();
        let inner = self.inner.clone();
        let cb: WriteCallback = Box::new(cb);
        self.inner
            .ctx
            .ev
            .defer(move || inner.write_from_loop(data, cb));
    }

    /// Object write: serializes `msg` as one length-prefixed frame.
    pub fn write_msg<T, F>(&self, msg: &T, cb: F)
    where
        T: Serialize,
        F: FnOnce(Result<()>) + 'static,
    {
        let frame = bincode::serialize(msg)
            .map(|payload| {
                let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
                frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
                frame.extend_from_slice(&payload);
                frame.into_boxed_slice()
            })
            .map_err(|e| Error::Serde(e.to_string()));
        let inner = self.inner.clone();
        let cb: WriteCallback = Box::new(cb);
        self.inner
            .ctx
            .ev
            .defer(move || inner.write_object_from_loop(frame, cb));
    }

    /// Rename the connection in log output. No effect on the data plane.
    pub fn set_id(&self, id: String) {
        let inner = self.inner.clone();
        self.inner.ctx.ev.defer(move || {
            debug!("connection {} was renamed to {}", inner.id.borrow(), id);
            *inner.id.borrow_mut() = id;
        });
    }

    /// Close the connection. Idempotent; every pending operation fails with
    /// [`Error::Closed`] and teardown begins.
    pub fn close(&self) {
        let inner = self.inner.clone();
        self.inner.ctx.ev.defer(move || inner.close_from_loop());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl ConnInner {
    fn new(
        ctx: Rc<CtxInner>,
        socket: Option<TcpStream>,
        dial_addr: Option<SocketAddr>,
        id: String,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            ctx,
            state: Cell::new(State::Initializing),
            error: RefCell::new(None),
            socket: RefCell::new(socket),
            dial_addr,
            dp: RefCell::new(None),
            peer_inbox_ptr: Cell::new(0),
            peer_inbox_key: Cell::new(0),
            peer_inbox_head: Cell::new(0),
            bytes_in_flight: Cell::new(0),
            writes_in_flight: Cell::new(0),
            acks_in_flight: Cell::new(0),
            read_ops: RefCell::new(VecDeque::new()),
            write_ops: RefCell::new(VecDeque::new()),
            next_read_submitted: Cell::new(0),
            next_read_callback: Cell::new(0),
            next_write_submitted: Cell::new(0),
            next_write_callback: Cell::new(0),
            id: RefCell::new(id),
            closing_token: Cell::new(None),
            cleanup_queued: Cell::new(false),
        })
    }

    fn rc(&self) -> Rc<ConnInner> {
        self.weak_self.upgrade().expect("connection internals gone")
    }

    // ---------------------------------------------------------------------
    // Initialization
    // ---------------------------------------------------------------------

    fn init_from_loop(&self) {
        debug_assert!(self.ctx.ev.in_loop());

        if self.ctx.closed.get() {
            self.set_error(Error::Closed);
            return;
        }

        let token = self
            .ctx
            .closing
            .borrow_mut()
            .insert(Rc::downgrade(&self.rc()));
        self.closing_token.set(Some(token));

        if let Err(e) = self.setup_socket() {
            self.set_error(Error::system("connect", &e));
            return;
        }

        let dp = match self.create_data_plane() {
            Ok(dp) => dp,
            Err(e) => {
                self.set_error(e);
                return;
            }
        };
        let qpn = dp.qp.qpn();
        *self.dp.borrow_mut() = Some(dp);

        let handler: Rc<dyn QpHandler> = self.rc();
        self.ctx.reactor.register_qp(qpn, handler);

        // We send our address first, so wait for writability.
        self.state.set(State::SendAddr);
        let fd = self.socket.borrow().as_ref().map(|s| s.as_raw_fd());
        if let Some(fd) = fd {
            let handler: Rc<dyn FdHandler> = self.rc();
            if let Err(e) = self.ctx.ev.register(fd, EVENT_OUT, handler) {
                self.set_error(Error::system("epoll_ctl", &e));
                return;
            }
        }
        debug!("connection {} initialized on QP {}", self.id.borrow(), qpn);
    }

    fn setup_socket(&self) -> io::Result<()> {
        let mut guard = self.socket.borrow_mut();
        match &*guard {
            Some(sock) => {
                sock.set_nonblocking(true)?;
                sock.set_nodelay(true)?;
            }
            None => {
                let addr = self.dial_addr.expect("neither socket nor address");
                let sock = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
                sock.set_nonblocking(true)?;
                sock.set_nodelay(true)?;
                match sock.connect(&addr.into()) {
                    Ok(()) => {}
                    Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                *guard = Some(sock.into());
            }
        }
        Ok(())
    }

    fn create_data_plane(&self) -> Result<DataPlane> {
        let reactor = &self.ctx.reactor;

        let inbox = RingBuffer::new(RING_CAPACITY).map_err(|e| Error::system("mmap", &e))?;
        let inbox_mr = unsafe {
            reactor
                .pd()
                .register(inbox.as_ptr(), RING_CAPACITY, reactor.qp_access())
        }
        .map_err(|e| Error::system("ibv_reg_mr", &e))?;

        let outbox = RingBuffer::new(RING_CAPACITY).map_err(|e| Error::system("mmap", &e))?;
        let outbox_mr = unsafe {
            reactor
                .pd()
                .register(outbox.as_ptr(), RING_CAPACITY, verbs::AccessFlags::empty())
        }
        .map_err(|e| Error::system("ibv_reg_mr", &e))?;

        let qp = reactor
            .create_qp()
            .map_err(|e| Error::system("ibv_create_qp", &e))?;
        qp.modify_to_init(reactor.port(), reactor.qp_access())
            .map_err(|e| Error::system("ibv_modify_qp", &e))?;

        let self_info = SetupInfo {
            lid: reactor.lid(),
            qpn: qp.qpn(),
            psn: rand::random::<u32>() & 0xFF_FFFF,
            gid: reactor.gid().raw(),
        };

        Ok(DataPlane {
            qp,
            inbox_mr,
            inbox,
            outbox_mr,
            outbox,
            self_info,
        })
    }

    // ---------------------------------------------------------------------
    // Bootstrap over the control socket
    // ---------------------------------------------------------------------

    fn handle_out_from_loop(&self) {
        if self.state.get() != State::SendAddr {
            return;
        }

        let buf = {
            let dp = self.dp.borrow();
            let Some(dp) = dp.as_ref() else { return };
            Exchange {
                setup: dp.self_info,
                inbox_addr: dp.inbox.as_ptr() as u64,
                inbox_rkey: dp.inbox_mr.rkey(),
            }
            .encode()
        };

        let result = {
            let mut sock = self.socket.borrow_mut();
            match sock.as_mut() {
                Some(sock) => sock.write(&buf),
                None => return,
            }
        };

        match result {
            Ok(n) if n == EXCHANGE_LEN => {
                trace!("connection {} sent its setup record", self.id.borrow());
                // Sent our address; wait for the peer's.
                self.state.set(State::RecvAddr);
                let fd = self.socket.borrow().as_ref().map(|s| s.as_raw_fd());
                if let Some(fd) = fd {
                    let handler: Rc<dyn FdHandler> = self.rc();
                    if let Err(e) = self.ctx.ev.register(fd, EVENT_IN, handler) {
                        self.set_error(Error::system("epoll_ctl", &e));
                    }
                }
            }
            Ok(n) => self.set_error(Error::ShortWrite {
                expected: EXCHANGE_LEN,
                got: n,
            }),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => self.set_error(Error::system("write", &e)),
        }
    }

    fn handle_in_from_loop(&self) {
        match self.state.get() {
            State::RecvAddr => {}
            // Nothing is ever sent on the control socket after the
            // handshake; readability means the peer went away.
            State::Established => {
                self.set_error(Error::Eof);
                return;
            }
            _ => return,
        }

        let mut buf = [0u8; EXCHANGE_LEN];
        let result = {
            let mut sock = self.socket.borrow_mut();
            match sock.as_mut() {
                Some(sock) => sock.read(&mut buf),
                None => return,
            }
        };

        let n = match result {
            Ok(n) => n,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return;
            }
            Err(e) => {
                self.set_error(Error::system("read", &e));
                return;
            }
        };
        if n != EXCHANGE_LEN {
            self.set_error(Error::ShortRead {
                expected: EXCHANGE_LEN,
                got: n,
            });
            return;
        }

        let ex = Exchange::decode(&buf);
        let result = {
            let dp = self.dp.borrow();
            let Some(dp) = dp.as_ref() else { return };
            let reactor = &self.ctx.reactor;
            dp.qp
                .modify_to_rtr(
                    &ex.setup.to_remote(),
                    reactor.port(),
                    reactor.mtu(),
                    reactor.gid_index(),
                )
                .and_then(|()| dp.qp.modify_to_rts(dp.self_info.psn))
        };
        if let Err(e) = result {
            self.set_error(Error::system("ibv_modify_qp", &e));
            return;
        }

        self.peer_inbox_ptr.set(ex.inbox_addr);
        self.peer_inbox_key.set(ex.inbox_rkey);

        self.state.set(State::Established);
        debug!(
            "connection {} is established (peer QP {})",
            self.id.borrow(),
            ex.setup.qpn
        );

        self.process_write_ops();
        // A local read() and a remote write may both have happened before
        // the handshake finished; serve them now.
        self.process_read_ops();
    }

    // ---------------------------------------------------------------------
    // Operation intake
    // ---------------------------------------------------------------------

    fn wrap_unsized_cb(&self, seq: u64, cb: UnsizedCallback) -> UnsizedCallback {
        let this = self.rc();
        Box::new(move |res| {
            debug_assert_eq!(seq, this.next_read_callback.get());
            this.next_read_callback.set(seq + 1);
            cb(res);
        })
    }

    fn wrap_sized_cb(&self, seq: u64, cb: SizedCallback) -> SizedCallback {
        let this = self.rc();
        Box::new(move |res| {
            debug_assert_eq!(seq, this.next_read_callback.get());
            this.next_read_callback.set(seq + 1);
            cb(res);
        })
    }

    fn wrap_write_cb(&self, seq: u64, cb: WriteCallback) -> WriteCallback {
        let this = self.rc();
        Box::new(move |res| {
            debug_assert_eq!(seq, this.next_write_callback.get());
            this.next_write_callback.set(seq + 1);
            cb(res);
        })
    }

    fn read_unsized_from_loop(&self, cb: UnsizedCallback) {
        debug_assert!(self.ctx.ev.in_loop());
        let seq = self.next_read_submitted.get();
        self.next_read_submitted.set(seq + 1);
        trace!(
            "connection {} received an unsized read request (#{})",
            self.id.borrow(),
            seq
        );

        let cb = self.wrap_unsized_cb(seq, cb);
        if let Some(err) = self.error.borrow().clone() {
            cb(Err(err));
            return;
        }
        self.read_ops
            .borrow_mut()
            .push_back(ReadOperation::unsized_chunk(cb));
        // The inbox may already hold data.
        self.process_read_ops();
    }

    fn read_sized_from_loop(&self, buf: Box<[u8]>, cb: SizedCallback) {
        debug_assert!(self.ctx.ev.in_loop());
        let seq = self.next_read_submitted.get();
        self.next_read_submitted.set(seq + 1);
        trace!(
            "connection {} received a sized read request for {} bytes (#{})",
            self.id.borrow(),
            buf.len(),
            seq
        );

        let cb = self.wrap_sized_cb(seq, cb);
        if let Some(err) = self.error.borrow().clone() {
            cb(Err(err));
            return;
        }
        self.read_ops
            .borrow_mut()
            .push_back(ReadOperation::sized(buf, cb));
        self.process_read_ops();
    }

    fn read_object_from_loop(&self, finish: UnsizedCallback) {
        debug_assert!(self.ctx.ev.in_loop());
        let seq = self.next_read_submitted.get();
        self.next_read_submitted.set(seq + 1);
        trace!(
            "connection {} received an object read request (#{})",
            self.id.borrow(),
            seq
        );

        let finish = self.wrap_unsized_cb(seq, finish);
        if let Some(err) = self.error.borrow().clone() {
            finish(Err(err));
            return;
        }
        self.read_ops
            .borrow_mut()
            .push_back(ReadOperation::object(finish));
        self.process_read_ops();
    }

    fn write_from_loop(&self, data: Box<[u8]>, cb: WriteCallback) {
        debug_assert!(self.ctx.ev.in_loop());
        let seq = self.next_write_submitted.get();
        self.next_write_submitted.set(seq + 1);
        trace!(
            "connection {} received a write request for {} bytes (#{})",
            self.id.borrow(),
            data.len(),
            seq
        );

        let cb = self.wrap_write_cb(seq, cb);
        if let Some(err) = self.error.borrow().clone() {
            cb(Err(err));
            return;
        }
        self.write_ops
            .borrow_mut()
            .push_back(WriteOperation::new(data, cb));
        // The outbox may already have free space.
        self.process_write_ops();
    }

    fn write_object_from_loop(
        &self,
        frame: std::result::Result<Box<[u8]>, Error>,
        cb: WriteCallback,
    ) {
        debug_assert!(self.ctx.ev.in_loop());
        let seq = self.next_write_submitted.get();
        self.next_write_submitted.set(seq + 1);
        trace!(
            "connection {} received an object write request (#{})",
            self.id.borrow(),
            seq
        );

        let cb = self.wrap_write_cb(seq, cb);
        if let Some(err) = self.error.borrow().clone() {
            cb(Err(err));
            return;
        }
        match frame {
            Ok(data) => {
                self.write_ops
                    .borrow_mut()
                    .push_back(WriteOperation::new(data, cb));
                self.process_write_ops();
            }
            Err(e) => {
                // Fail earlier pending operations first so callbacks still
                // fire in submission order, then this one.
                self.set_error(e.clone());
                cb(Err(e));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Operation processing
    // ---------------------------------------------------------------------

    fn process_read_ops(&self) {
        if self.state.get() != State::Established || self.error.borrow().is_some() {
            return;
        }

        loop {
            let popped = self.read_ops.borrow_mut().pop_front();
            let Some(mut op) = popped else { break };

            let n = {
                let dp = self.dp.borrow();
                match dp.as_ref() {
                    Some(dp) => op.handle_read(&dp.inbox),
                    None => 0,
                }
            };

            if n > 0 {
                // Ack what was consumed so the peer can free that much of
                // its outbox. Correct even if the operation's callback just
                // poisoned the connection: the bytes were consumed.
                let dp = self.dp.borrow();
                if let Some(dp) = dp.as_ref() {
                    trace!(
                        "connection {} is posting an ack for {} bytes on QP {}",
                        self.id.borrow(),
                        n,
                        dp.qp.qpn()
                    );
                    self.acks_in_flight.set(self.acks_in_flight.get() + 1);
                    self.ctx.reactor.post_ack(&dp.qp, n as u32);
                }
            }

            if op.completed() {
                continue;
            }
            // Head-of-line blocking: keep waiting for inbox bytes.
            self.read_ops.borrow_mut().push_front(op);
            break;
        }
    }

    fn process_write_ops(&self) {
        if self.state.get() != State::Established || self.error.borrow().is_some() {
            return;
        }

        loop {
            let popped = self.write_ops.borrow_mut().pop_front();
            let Some(mut op) = popped else { break };

            let n = {
                let dp = self.dp.borrow();
                match dp.as_ref() {
                    Some(dp) => op.handle_write(&dp.outbox),
                    None => 0,
                }
            };

            if n > 0 {
                let dp = self.dp.borrow();
                if let Some(dp) = dp.as_ref() {
                    // Peek at the bytes just staged: skip past what earlier
                    // passes already handed to the NIC, then address the new
                    // range. The transaction is dropped without committing;
                    // the tail only moves when the peer acks.
                    let mut consumer = dp.outbox.consumer();
                    consumer.skip(self.bytes_in_flight.get() as u64);
                    let (first, second) = consumer.map(n);

                    for chunk in [first, second] {
                        if chunk.is_empty() {
                            continue;
                        }
                        let offset = self.peer_inbox_head.get() & (RING_CAPACITY as u64 - 1);
                        trace!(
                            "connection {} is posting an RDMA write of {} bytes on QP {}",
                            self.id.borrow(),
                            chunk.len(),
                            dp.qp.qpn()
                        );
                        self.writes_in_flight.set(self.writes_in_flight.get() + 1);
                        self.ctx.reactor.post_write(
                            &dp.qp,
                            WriteWr {
                                local_addr: chunk.as_ptr() as u64,
                                len: chunk.len() as u32,
                                lkey: dp.outbox_mr.lkey(),
                                remote_addr: self.peer_inbox_ptr.get() + offset,
                                rkey: self.peer_inbox_key.get(),
                            },
                        );
                        self.peer_inbox_head
                            .set(self.peer_inbox_head.get() + chunk.len() as u64);
                    }

                    self.bytes_in_flight
                        .set(self.bytes_in_flight.get() + n as u32);
                }
            }

            if op.completed() {
                continue;
            }
            // Backpressure: a full outbox leaves this operation stuck until
            // acks free space.
            self.write_ops.borrow_mut().push_front(op);
            break;
        }
    }

    // ---------------------------------------------------------------------
    // Errors and teardown
    // ---------------------------------------------------------------------

    pub(crate) fn set_error(&self, err: Error) {
        // Don't overwrite an error that's already set.
        if self.error.borrow().is_some() {
            return;
        }
        *self.error.borrow_mut() = Some(err);
        self.handle_error();
    }

    fn handle_error(&self) {
        let err = self
            .error
            .borrow()
            .clone()
            .expect("handle_error without an error");
        debug!(
            "connection {} is handling error: {}",
            self.id.borrow(),
            err
        );

        loop {
            let op = self.read_ops.borrow_mut().pop_front();
            match op {
                Some(mut op) => op.handle_error(&err),
                None => break,
            }
        }
        loop {
            let op = self.write_ops.borrow_mut().pop_front();
            match op {
                Some(mut op) => op.handle_error(&err),
                None => break,
            }
        }

        {
            let dp = self.dp.borrow();
            if let Some(dp) = dp.as_ref() {
                // The NIC flushes every outstanding WR once the QP is in
                // ERROR; their completions still arrive and drive the
                // in-flight counters to zero. Some providers reject ERR
                // straight from INIT; releasing from INIT is legal, so the
                // failure is ignored.
                let _ = dp.qp.modify_to_error();
            }
        }

        self.try_cleanup();

        if let Some(sock) = self.socket.borrow_mut().take() {
            if self.state.get() != State::Initializing {
                self.ctx.ev.unregister(sock.as_raw_fd());
            }
        }
    }

    fn try_cleanup(&self) {
        if self.error.borrow().is_none() {
            return;
        }
        if self.writes_in_flight.get() == 0 && self.acks_in_flight.get() == 0 {
            if self.cleanup_queued.replace(true) {
                return;
            }
            debug!("connection {} is ready to clean up", self.id.borrow());
            // Deferring lets the reactor drain already-queued completions
            // before the QP goes away.
            let this = self.rc();
            self.ctx.ev.defer(move || this.cleanup());
        } else {
            trace!(
                "connection {} still has {} writes and {} acks in flight",
                self.id.borrow(),
                self.writes_in_flight.get(),
                self.acks_in_flight.get()
            );
        }
    }

    fn cleanup(&self) {
        debug!("connection {} is cleaning up", self.id.borrow());

        if let Some(dp) = self.dp.borrow_mut().take() {
            self.ctx.reactor.unregister_qp(dp.qp.qpn());
            drop(dp);
        }
        if let Some(token) = self.closing_token.take() {
            self.ctx.closing.borrow_mut().try_remove(token);
        }
    }

    fn close_from_loop(&self) {
        debug!("connection {} is closing", self.id.borrow());
        self.set_error(Error::Closed);
    }
}

impl FdHandler for ConnInner {
    fn handle_events(&self, events: u32) {
        debug_assert!(self.ctx.ev.in_loop());

        // Handle one event class per invocation: any handler may close and
        // unregister the socket, invalidating the rest of the mask. Errors
        // come first (the socket can be error'd *and* readable, and reading
        // first would loop forever); hangup last, since a hangup with data
        // still pending should deliver the data path's error instead.
        if events & EVENT_ERR != 0 {
            let result = {
                let sock = self.socket.borrow();
                match sock.as_ref() {
                    Some(sock) => sock.take_error(),
                    None => return,
                }
            };
            match result {
                Ok(Some(e)) => self.set_error(Error::system("async error on socket", &e)),
                Ok(None) => self.set_error(Error::system(
                    "async error on socket",
                    &io::Error::from_raw_os_error(0),
                )),
                Err(e) => self.set_error(Error::system("getsockopt", &e)),
            }
            return;
        }
        if events & EVENT_IN != 0 {
            self.handle_in_from_loop();
            return;
        }
        if events & EVENT_OUT != 0 {
            self.handle_out_from_loop();
            return;
        }
        if events & EVENT_HUP != 0 {
            self.set_error(Error::Eof);
        }
    }
}

impl QpHandler for ConnInner {
    fn on_remote_produced_data(&self, len: u32) {
        debug_assert!(self.ctx.ev.in_loop());
        trace!(
            "connection {} was signalled that {} bytes arrived in its inbox",
            self.id.borrow(),
            len
        );
        {
            let dp = self.dp.borrow();
            if let Some(dp) = dp.as_ref() {
                // We are the sole inbox consumer and this is the only place
                // its head advances; no transaction needed.
                dp.inbox.advance_head(len as u64);
            }
        }
        self.process_read_ops();
    }

    fn on_remote_consumed_data(&self, len: u32) {
        debug_assert!(self.ctx.ev.in_loop());
        trace!(
            "connection {} was signalled that {} bytes of its outbox were acked",
            self.id.borrow(),
            len
        );
        {
            let dp = self.dp.borrow();
            if let Some(dp) = dp.as_ref() {
                dp.outbox.advance_tail(len as u64);
            }
        }
        self.bytes_in_flight
            .set(self.bytes_in_flight.get() - len);
        self.process_write_ops();
    }

    fn on_write_completed(&self) {
        debug_assert!(self.ctx.ev.in_loop());
        self.writes_in_flight.set(self.writes_in_flight.get() - 1);
        self.try_cleanup();
    }

    fn on_ack_completed(&self) {
        debug_assert!(self.ctx.ev.in_loop());
        self.acks_in_flight.set(self.acks_in_flight.get() - 1);
        self.try_cleanup();
    }

    fn on_error(&self, status: u32, wr_id: u64) {
        debug_assert!(self.ctx.ev.in_loop());
        self.set_error(Error::Ibv(status));
        // Failed completions don't preserve the opcode; the wr_id tags are
        // the only way to keep the in-flight accounting converging.
        if wr_id == WRITE_WR_ID {
            self.on_write_completed();
        } else if wr_id == ACK_WR_ID {
            self.on_ack_completed();
        }
    }
}
