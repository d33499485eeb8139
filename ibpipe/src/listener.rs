//! Accepting side of the bootstrap handshake.
//!
//! The listener owns a nonblocking TCP socket registered with the event
//! loop. Each accepted control socket becomes a new [`Connection`] that
//! proceeds through the usual bootstrap exchange.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use log::debug;
use socket2::{Domain, Socket, Type};

use crate::conn::Connection;
use crate::context::CtxInner;
use crate::error::{Error, Result};
use crate::event_loop::{FdHandler, EVENT_IN};

type AcceptCallback = Box<dyn FnOnce(Result<Connection>)>;

pub(crate) struct ListenerInner {
    ctx: Rc<CtxInner>,
    socket: Socket,
    local_addr: SocketAddr,
    pending: RefCell<VecDeque<AcceptCallback>>,
}

/// A bound, listening bootstrap socket.
///
/// Dropping the listener unregisters and closes it; already-accepted
/// connections are unaffected.
pub struct Listener {
    inner: Rc<ListenerInner>,
}

impl Listener {
    pub(crate) fn bind(ctx: &Rc<CtxInner>, addr: SocketAddr) -> io::Result<Listener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("listener has no inet address"))?;

        let inner = Rc::new(ListenerInner {
            ctx: ctx.clone(),
            socket,
            local_addr,
            pending: RefCell::new(VecDeque::new()),
        });

        debug!("listener bound to {}", local_addr);

        let register = inner.clone();
        ctx.ev.defer(move || {
            let handler: Rc<dyn FdHandler> = register.clone();
            let fd = register.socket.as_raw_fd();
            if let Err(e) = register.ctx.ev.register(fd, EVENT_IN, handler) {
                register.fail_pending(Error::system("epoll_ctl", &e));
            }
        });

        Ok(Listener { inner })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Queue one accept. The callback receives the next inbound connection.
    pub fn accept(&self, cb: impl FnOnce(Result<Connection>) + 'static) {
        let inner = self.inner.clone();
        let cb: AcceptCallback = Box::new(cb);
        self.inner.ctx.ev.defer(move || {
            inner.pending.borrow_mut().push_back(cb);
            // A connection may already be waiting in the backlog.
            inner.pump();
        });
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        self.inner.ctx.ev.defer(move || {
            debug!("listener on {} is closing", inner.local_addr);
            inner.ctx.ev.unregister(inner.socket.as_raw_fd());
            inner.fail_pending(Error::Closed);
        });
    }
}

impl ListenerInner {
    fn pump(&self) {
        loop {
            if self.pending.borrow().is_empty() {
                break;
            }
            match self.socket.accept() {
                Ok((sock, _peer)) => {
                    let cb = self.pending.borrow_mut().pop_front();
                    if let Some(cb) = cb {
                        let id = self.ctx.next_conn_id("s");
                        debug!("listener on {} accepted connection {}", self.local_addr, id);
                        cb(Ok(Connection::accepted(&self.ctx, sock.into(), id)));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let cb = self.pending.borrow_mut().pop_front();
                    if let Some(cb) = cb {
                        cb(Err(Error::system("accept", &e)));
                    }
                    break;
                }
            }
        }
    }

    fn fail_pending(&self, err: Error) {
        loop {
            let cb = self.pending.borrow_mut().pop_front();
            match cb {
                Some(cb) => cb(Err(err.clone())),
                None => break,
            }
        }
    }
}

impl FdHandler for ListenerInner {
    fn handle_events(&self, _events: u32) {
        debug_assert!(self.ctx.ev.in_loop());
        self.pump();
    }
}
