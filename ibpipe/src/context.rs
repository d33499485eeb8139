//! The per-thread context: one event loop, one reactor, many connections.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::debug;
use slab::Slab;

use crate::conn::{ConnInner, Connection};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::listener::Listener;
use crate::reactor::Reactor;

/// Context configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Index into the host's RDMA device list.
    pub device_index: usize,
    /// Physical port to bind QPs to.
    pub port: u8,
    /// GID table index used for global addressing.
    pub gid_index: u8,
    /// Completion queue depth.
    pub cq_depth: i32,
    /// Shared receive queue depth.
    pub srq_depth: u32,
    /// Maximum outstanding RDMA-write work requests across the context.
    pub max_write_wrs: u32,
    /// Maximum outstanding ack work requests across the context.
    pub max_ack_wrs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_index: 0,
            port: 1,
            gid_index: 0,
            cq_depth: 4096,
            srq_depth: 1024,
            max_write_wrs: 256,
            max_ack_wrs: 256,
        }
    }
}

pub(crate) struct CtxInner {
    pub ev: Rc<EventLoop>,
    pub reactor: Reactor,
    /// Connections subscribed to the closing notification, severed on
    /// connection cleanup.
    pub closing: RefCell<Slab<Weak<ConnInner>>>,
    pub closed: Cell<bool>,
    conn_seq: Cell<u64>,
}

impl CtxInner {
    pub fn next_conn_id(&self, prefix: &str) -> String {
        let seq = self.conn_seq.get();
        self.conn_seq.set(seq + 1);
        format!("{}{}", prefix, seq)
    }
}

/// Owns the shared verbs state and the loop every connection runs on.
///
/// The context is single-threaded and caller-driven: nothing happens until
/// [`Context::poll`] runs, and all connection callbacks fire from inside it.
pub struct Context {
    inner: Rc<CtxInner>,
}

impl Context {
    pub fn new(config: &Config) -> io::Result<Self> {
        let ev = Rc::new(EventLoop::new()?);
        let reactor = Reactor::new(config, ev.clone())?;
        Ok(Self {
            inner: Rc::new(CtxInner {
                ev,
                reactor,
                closing: RefCell::new(Slab::new()),
                closed: Cell::new(false),
                conn_seq: Cell::new(0),
            }),
        })
    }

    /// Create a connection that dials `addr` for its bootstrap handshake.
    /// Failures surface through the operation callbacks, not here.
    pub fn connect(&self, addr: SocketAddr) -> Connection {
        let id = self.inner.next_conn_id("c");
        debug!("context is opening connection {} to {}", id, addr);
        Connection::dialing(&self.inner, addr, id)
    }

    /// Bind a listener that accepts bootstrap sockets at `addr`.
    pub fn listen(&self, addr: SocketAddr) -> io::Result<Listener> {
        Listener::bind(&self.inner, addr)
    }

    /// Run one loop iteration: deferred work, control-socket readiness,
    /// then verbs completions.
    pub fn poll(&self) {
        let _guard = self.inner.ev.enter();
        self.inner.ev.run_deferred();
        self.inner.ev.poll_descriptors();
        self.inner.reactor.poll();
    }

    /// Fail every connection with [`Error::Closed`] and begin teardown.
    /// Idempotent; callers keep polling until teardown finishes.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        debug!("context is closing");
        let inner = self.inner.clone();
        self.inner.ev.defer(move || {
            let subscribers: Vec<_> = inner
                .closing
                .borrow()
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            for conn in subscribers {
                conn.set_error(Error::Closed);
            }
        });
    }

    /// Close, then poll until every connection has released its resources.
    pub fn join(&self) {
        self.close();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.is_idle() {
            self.poll();
            if Instant::now() > deadline {
                debug!("context join timed out with work still pending");
                break;
            }
            std::hint::spin_loop();
        }
    }

    fn is_idle(&self) -> bool {
        self.inner.closing.borrow().is_empty() && self.inner.reactor.is_idle()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.join();
    }
}
