//! Loopback integration tests: two contexts on two threads, bootstrap over
//! 127.0.0.1, data plane through the local HCA.
//!
//! All tests skip (return early) when no active RDMA device is present,
//! since even loopback RDMA traffic goes through the adapter.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use ibpipe::{Config, Connection, Context, Error};

fn rdma_available() -> bool {
    match Context::new(&Config::default()) {
        Ok(_) => true,
        Err(e) => {
            eprintln!("skipping: no usable RDMA device ({})", e);
            false
        }
    }
}

fn make_context() -> Context {
    Context::new(&Config::default()).expect("failed to create context")
}

fn poll_until(ctx: &Context, what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !done() {
        ctx.poll();
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::hint::spin_loop();
    }
}

/// Accept exactly one connection and hold on to it.
fn accept_one(ctx: &Context, addr_tx: mpsc::Sender<SocketAddr>) -> Rc<RefCell<Option<Connection>>> {
    let listener = ctx
        .listen("127.0.0.1:0".parse().unwrap())
        .expect("failed to bind listener");
    addr_tx.send(listener.local_addr()).unwrap();

    let slot: Rc<RefCell<Option<Connection>>> = Rc::new(RefCell::new(None));
    let slot2 = slot.clone();
    listener.accept(move |res| {
        *slot2.borrow_mut() = Some(res.expect("accept failed"));
    });
    poll_until(ctx, "accept", || slot.borrow().is_some());
    // Keep the listener alive until the accept has landed, then let it go.
    drop(listener);
    slot
}

#[test]
fn small_round_trip() {
    if !rdma_available() {
        return;
    }

    let (addr_tx, addr_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>();

    let server = thread::spawn(move || {
        let ctx = make_context();
        let slot = accept_one(&ctx, addr_tx);

        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        slot.borrow()
            .as_ref()
            .unwrap()
            .read_exact(vec![0u8; 13].into_boxed_slice(), move |res| {
                let buf = res.expect("read failed");
                data_tx.send(buf.to_vec()).unwrap();
                done2.set(true);
            });
        poll_until(&ctx, "server read", || done.get());
    });

    let ctx = make_context();
    let conn = ctx.connect(addr_rx.recv().unwrap());

    let wrote = Rc::new(Cell::new(false));
    let wrote2 = wrote.clone();
    conn.write(b"hello, world!", move |res| {
        res.expect("write failed");
        wrote2.set(true);
    });
    poll_until(&ctx, "client write", || wrote.get());

    let received = data_rx.recv_timeout(Duration::from_secs(15)).unwrap();
    assert_eq!(received, b"hello, world!");

    server.join().unwrap();
}

#[test]
fn unsized_read_returns_first_chunk() {
    if !rdma_available() {
        return;
    }

    let (addr_tx, addr_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>();

    let server = thread::spawn(move || {
        let ctx = make_context();
        let slot = accept_one(&ctx, addr_tx);

        // Issue the read before any data has arrived.
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        slot.borrow().as_ref().unwrap().read(move |res| {
            let chunk = res.expect("read failed");
            data_tx.send(chunk.to_vec()).unwrap();
            done2.set(true);
        });
        poll_until(&ctx, "server unsized read", || done.get());
    });

    let ctx = make_context();
    let conn = ctx.connect(addr_rx.recv().unwrap());

    let payload: Vec<u8> = (0..100u32).map(|i| (i % 251) as u8).collect();
    let wrote = Rc::new(Cell::new(false));
    let wrote2 = wrote.clone();
    conn.write(&payload, move |res| {
        res.expect("write failed");
        wrote2.set(true);
    });
    poll_until(&ctx, "client write", || wrote.get());

    let chunk = data_rx.recv_timeout(Duration::from_secs(15)).unwrap();
    assert!(!chunk.is_empty() && chunk.len() <= 100);
    assert_eq!(&chunk[..], &payload[..chunk.len()]);

    server.join().unwrap();
}

#[test]
fn wrap_around_with_backpressure() {
    if !rdma_available() {
        return;
    }

    const FIRST: usize = 3 * 512 * 1024; // 1.5 MiB
    const SECOND: usize = 1024 * 1024; // 1.0 MiB
    const TOTAL: usize = FIRST + SECOND; // exceeds the 2 MiB ring

    let (addr_tx, addr_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>();

    let server = thread::spawn(move || {
        let ctx = make_context();
        let slot = accept_one(&ctx, addr_tx);

        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        slot.borrow()
            .as_ref()
            .unwrap()
            .read_exact(vec![0u8; TOTAL].into_boxed_slice(), move |res| {
                let buf = res.expect("read failed");
                data_tx.send(buf.to_vec()).unwrap();
                done2.set(true);
            });
        poll_until(&ctx, "server bulk read", || done.get());
    });

    let pattern: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();

    let ctx = make_context();
    let conn = ctx.connect(addr_rx.recv().unwrap());

    let completions = Rc::new(Cell::new(0u32));
    let c1 = completions.clone();
    conn.write(&pattern[..FIRST], move |res| {
        res.expect("first write failed");
        c1.set(c1.get() + 1);
    });
    let c2 = completions.clone();
    conn.write(&pattern[FIRST..], move |res| {
        res.expect("second write failed");
        c2.set(c2.get() + 1);
    });
    poll_until(&ctx, "client writes", || completions.get() == 2);

    let received = data_rx.recv_timeout(Duration::from_secs(15)).unwrap();
    assert_eq!(received.len(), TOTAL);
    assert!(received == pattern, "bulk payload mismatch");

    server.join().unwrap();
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Greeting {
    tag: u32,
    body: String,
}

#[test]
fn object_round_trip() {
    if !rdma_available() {
        return;
    }

    let (addr_tx, addr_rx) = mpsc::channel();
    let (obj_tx, obj_rx) = mpsc::channel::<Greeting>();

    let server = thread::spawn(move || {
        let ctx = make_context();
        let slot = accept_one(&ctx, addr_tx);

        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        slot.borrow()
            .as_ref()
            .unwrap()
            .read_msg::<Greeting, _>(move |res| {
                obj_tx.send(res.expect("object read failed")).unwrap();
                done2.set(true);
            });
        poll_until(&ctx, "server object read", || done.get());
    });

    let ctx = make_context();
    let conn = ctx.connect(addr_rx.recv().unwrap());

    let msg = Greeting {
        tag: 7,
        body: "ping".to_string(),
    };
    let wrote = Rc::new(Cell::new(false));
    let wrote2 = wrote.clone();
    conn.write_msg(&msg, move |res| {
        res.expect("object write failed");
        wrote2.set(true);
    });
    poll_until(&ctx, "client object write", || wrote.get());

    assert_eq!(obj_rx.recv_timeout(Duration::from_secs(15)).unwrap(), msg);

    server.join().unwrap();
}

#[test]
fn read_callbacks_fire_in_submission_order() {
    if !rdma_available() {
        return;
    }

    let (addr_tx, addr_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel::<Vec<(u32, Vec<u8>)>>();

    let server = thread::spawn(move || {
        let ctx = make_context();
        let slot = accept_one(&ctx, addr_tx);

        let order: Rc<RefCell<Vec<(u32, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let conn = slot.borrow();
            let conn = conn.as_ref().unwrap();
            for (idx, len) in [(0u32, 3usize), (1, 5), (2, 4)] {
                let order = order.clone();
                conn.read_exact(vec![0u8; len].into_boxed_slice(), move |res| {
                    order.borrow_mut().push((idx, res.unwrap().to_vec()));
                });
            }
        }
        poll_until(&ctx, "ordered reads", || order.borrow().len() == 3);
        data_tx.send(order.borrow().clone()).unwrap();
    });

    let ctx = make_context();
    let conn = ctx.connect(addr_rx.recv().unwrap());

    let wrote = Rc::new(Cell::new(false));
    let wrote2 = wrote.clone();
    // One contiguous stream; chunk boundaries are not preserved.
    conn.write(b"aaabbbbbcccc", move |res| {
        res.expect("write failed");
        wrote2.set(true);
    });
    poll_until(&ctx, "client write", || wrote.get());

    let order = data_rx.recv_timeout(Duration::from_secs(15)).unwrap();
    assert_eq!(
        order,
        vec![
            (0, b"aaa".to_vec()),
            (1, b"bbbbb".to_vec()),
            (2, b"cccc".to_vec()),
        ]
    );

    server.join().unwrap();
}

#[test]
fn close_fails_pending_writes_and_peer_sees_eof() {
    if !rdma_available() {
        return;
    }

    const BIG: usize = 5 * 512 * 1024; // 2.5 MiB, larger than the ring

    let (addr_tx, addr_rx) = mpsc::channel();
    let (closed_tx, closed_rx) = mpsc::channel::<()>();
    let (peer_err_tx, peer_err_rx) = mpsc::channel::<Error>();

    let server = thread::spawn(move || {
        let ctx = make_context();
        let slot = accept_one(&ctx, addr_tx);

        // Wait until the client has closed, then try to read more than it
        // ever sent.
        closed_rx.recv().unwrap();
        let failed = Rc::new(Cell::new(false));
        let failed2 = failed.clone();
        slot.borrow()
            .as_ref()
            .unwrap()
            .read_exact(vec![0u8; BIG + 1].into_boxed_slice(), move |res| {
                peer_err_tx.send(res.unwrap_err()).unwrap();
                failed2.set(true);
            });
        poll_until(&ctx, "peer read failure", || failed.get());
    });

    let ctx = make_context();
    let conn = ctx.connect(addr_rx.recv().unwrap());

    let results: Rc<RefCell<Vec<Result<(), Error>>>> = Rc::new(RefCell::new(Vec::new()));
    let data = vec![0x42u8; BIG];
    for chunk in [&data[..], &data[..1024], &data[..2048]] {
        let results = results.clone();
        conn.write(chunk, move |res| results.borrow_mut().push(res));
    }
    // Let the first write stage up to the ring capacity and stall.
    for _ in 0..50 {
        ctx.poll();
    }
    assert!(results.borrow().is_empty());

    conn.close();
    poll_until(&ctx, "write failures", || results.borrow().len() == 3);
    for res in results.borrow().iter() {
        assert_eq!(res.clone().unwrap_err(), Error::Closed);
    }
    closed_tx.send(()).unwrap();

    // Teardown drains in-flight work requests before releasing resources;
    // join polls until that has happened.
    ctx.join();

    let peer_err = peer_err_rx.recv_timeout(Duration::from_secs(15)).unwrap();
    assert_ne!(peer_err, Error::Closed, "peer must see a transport error");

    server.join().unwrap();
}

#[test]
fn submissions_after_close_fail_immediately() {
    if !rdma_available() {
        return;
    }

    let (addr_tx, addr_rx) = mpsc::channel();

    let server = thread::spawn(move || {
        let ctx = make_context();
        let slot = accept_one(&ctx, addr_tx);
        // Hold the connection briefly so the client bootstrap completes.
        for _ in 0..100 {
            ctx.poll();
        }
        drop(slot);
    });

    let ctx = make_context();
    let conn = ctx.connect(addr_rx.recv().unwrap());

    conn.close();
    conn.close(); // close is idempotent

    let errors: Rc<RefCell<Vec<Error>>> = Rc::new(RefCell::new(Vec::new()));
    let e1 = errors.clone();
    conn.write(b"late", move |res| e1.borrow_mut().push(res.unwrap_err()));
    let e2 = errors.clone();
    conn.read(move |res| e2.borrow_mut().push(res.unwrap_err()));

    poll_until(&ctx, "late submissions", || errors.borrow().len() == 2);
    assert!(errors.borrow().iter().all(|e| *e == Error::Closed));

    server.join().unwrap();
}

#[test]
fn short_bootstrap_record_is_fatal() {
    if !rdma_available() {
        return;
    }

    // A plain TCP peer that accepts, consumes our record, sends back a
    // truncated one and disappears.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let stub = thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = [0u8; 38];
        sock.read_exact(&mut buf).unwrap();
        sock.write_all(&buf[..10]).unwrap();
        // Closing here makes the truncation observable in a single read.
    });

    let ctx = make_context();
    let conn = ctx.connect(addr);

    let errors: Rc<RefCell<Vec<Error>>> = Rc::new(RefCell::new(Vec::new()));
    let e1 = errors.clone();
    conn.read(move |res| e1.borrow_mut().push(res.unwrap_err()));
    let e2 = errors.clone();
    conn.write(b"never sent", move |res| e2.borrow_mut().push(res.unwrap_err()));

    poll_until(&ctx, "bootstrap failure", || errors.borrow().len() == 2);
    stub.join().unwrap();

    for err in errors.borrow().iter() {
        match err {
            Error::ShortRead { expected: 38, got } => assert!(*got < 38),
            other => panic!("expected a short read, got {:?}", other),
        }
    }

    // No work request was ever posted, so teardown completes promptly.
    ctx.join();
}
