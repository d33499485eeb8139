//! Deferred execution and control-socket readiness dispatch.
//!
//! Everything a connection does happens "on the loop": public API entry
//! points push a closure here and return, and `Context::poll` drains the
//! queue before dispatching epoll readiness and verbs completions. The
//! closures capture an `Rc` of the connection internals, which keeps them
//! alive until the queued work has run.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

pub(crate) const EVENT_IN: u32 = libc::EPOLLIN as u32;
pub(crate) const EVENT_OUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const EVENT_ERR: u32 = libc::EPOLLERR as u32;
pub(crate) const EVENT_HUP: u32 = libc::EPOLLHUP as u32;

const POLL_BATCH: usize = 64;

/// Receiver of readiness events for one registered descriptor.
pub(crate) trait FdHandler {
    fn handle_events(&self, events: u32);
}

pub(crate) struct EventLoop {
    epfd: RawFd,
    handlers: RefCell<HashMap<RawFd, Rc<dyn FdHandler>>>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    in_loop: Cell<bool>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            handlers: RefCell::new(HashMap::new()),
            deferred: RefCell::new(VecDeque::new()),
            in_loop: Cell::new(false),
        })
    }

    /// Queue `f` to run on the next loop iteration.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        self.deferred.borrow_mut().push_back(Box::new(f));
    }

    /// True while `Context::poll` is executing loop work.
    pub fn in_loop(&self) -> bool {
        self.in_loop.get()
    }

    pub fn enter(&self) -> LoopGuard<'_> {
        debug_assert!(!self.in_loop.get());
        self.in_loop.set(true);
        LoopGuard { ev: self }
    }

    /// Register `fd` for `events`, or change its interest mask if already
    /// registered. The mask is level-triggered.
    pub fn register(&self, fd: RawFd, events: u32, handler: Rc<dyn FdHandler>) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let op = if self.handlers.borrow().contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        self.handlers.borrow_mut().insert(fd, handler);
        Ok(())
    }

    pub fn unregister(&self, fd: RawFd) {
        if self.handlers.borrow_mut().remove(&fd).is_some() {
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    /// Run queued closures, including ones queued while draining.
    pub fn run_deferred(&self) {
        loop {
            let f = self.deferred.borrow_mut().pop_front();
            match f {
                Some(f) => f(),
                None => break,
            }
        }
    }

    /// Dispatch pending readiness without blocking.
    pub fn poll_descriptors(&self) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; POLL_BATCH];
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), POLL_BATCH as i32, 0)
        };
        if n <= 0 {
            return;
        }
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            // The handler may unregister fds (including its own) while
            // running, so look it up fresh and drop the borrow first.
            let handler = self.handlers.borrow().get(&fd).cloned();
            if let Some(handler) = handler {
                handler.handle_events(ev.events);
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

pub(crate) struct LoopGuard<'a> {
    ev: &'a EventLoop,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.ev.in_loop.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_closures_run_in_order() {
        let ev = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        ev.defer(move || o.borrow_mut().push(1));
        let o = order.clone();
        ev.defer(move || o.borrow_mut().push(2));

        ev.run_deferred();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn deferred_closure_can_defer_more() {
        let ev = Rc::new(EventLoop::new().unwrap());
        let hits = Rc::new(Cell::new(0));

        let ev2 = ev.clone();
        let hits2 = hits.clone();
        ev.defer(move || {
            hits2.set(hits2.get() + 1);
            let hits3 = hits2.clone();
            ev2.defer(move || hits3.set(hits3.get() + 1));
        });

        ev.run_deferred();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn loop_guard_tracks_in_loop() {
        let ev = EventLoop::new().unwrap();
        assert!(!ev.in_loop());
        {
            let _g = ev.enter();
            assert!(ev.in_loop());
        }
        assert!(!ev.in_loop());
    }
}
