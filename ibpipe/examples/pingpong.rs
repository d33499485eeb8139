//! Byte-stream ping-pong between two contexts over loopback bootstrap.
//!
//! Usage: cargo run --example pingpong

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use ibpipe::{Config, Connection, Context};

const ROUNDS: u32 = 1000;
const MSG: &[u8] = b"ping!";

type Shared = Rc<RefCell<Option<Connection>>>;

fn pump(ctx: &Context, mut done: impl FnMut() -> bool) {
    while !done() {
        ctx.poll();
        std::hint::spin_loop();
    }
}

/// Echo one message, then re-arm until all rounds are served.
fn echo_next(conn: Shared, remaining: Rc<Cell<u32>>) {
    let slot = conn.clone();
    let guard = conn.borrow();
    let Some(c) = guard.as_ref() else { return };
    c.read_exact(vec![0u8; MSG.len()].into_boxed_slice(), move |res| {
        let buf = res.expect("echo read failed");
        {
            let guard = slot.borrow();
            let Some(c) = guard.as_ref() else { return };
            c.write(&buf, |res| res.expect("echo write failed"));
        }
        let left = remaining.get() - 1;
        remaining.set(left);
        if left > 0 {
            echo_next(slot.clone(), remaining.clone());
        }
    });
}

/// One client round: send the ping, read the pong, repeat from the callback.
fn fire(conn: Rc<Connection>, left: Rc<Cell<u32>>, confirmed: Rc<Cell<bool>>) {
    conn.write(MSG, |res| res.expect("write failed"));
    let next = conn.clone();
    let counter = left.clone();
    conn.read_exact(vec![0u8; MSG.len()].into_boxed_slice(), move |res| {
        let buf = res.expect("read failed");
        assert_eq!(&*buf, MSG);
        let remaining = counter.get() - 1;
        counter.set(remaining);
        if remaining > 0 {
            fire(next.clone(), counter.clone(), confirmed.clone());
        } else {
            // Confirm receipt of the last pong so the echo side knows it is
            // safe to tear down.
            let confirmed = confirmed.clone();
            next.write(&[0xFF], move |res| {
                res.expect("finish write failed");
                confirmed.set(true);
            });
        }
    });
}

fn main() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let echo = thread::spawn(move || {
        let ctx = Context::new(&Config::default()).expect("context");
        let listener = ctx.listen("127.0.0.1:0".parse().unwrap()).expect("listen");
        addr_tx.send(listener.local_addr()).unwrap();

        let conn: Shared = Rc::new(RefCell::new(None));
        let slot = conn.clone();
        listener.accept(move |res| {
            *slot.borrow_mut() = Some(res.expect("accept failed"));
        });
        pump(&ctx, || conn.borrow().is_some());

        let remaining = Rc::new(Cell::new(ROUNDS));
        echo_next(conn.clone(), remaining.clone());
        pump(&ctx, || remaining.get() == 0);

        // Wait for the client's confirmation byte before tearing down, so
        // the last pong is not flushed away mid-transfer.
        let finished = Rc::new(Cell::new(false));
        let finished2 = finished.clone();
        conn.borrow()
            .as_ref()
            .unwrap()
            .read_exact(vec![0u8; 1].into_boxed_slice(), move |res| {
                res.expect("finish read failed");
                finished2.set(true);
            });
        pump(&ctx, || finished.get());
    });

    let ctx = Context::new(&Config::default()).expect("context");
    let conn = Rc::new(ctx.connect(addr_rx.recv().unwrap()));

    let start = Instant::now();
    let rounds_left = Rc::new(Cell::new(ROUNDS));
    let confirmed = Rc::new(Cell::new(false));
    fire(conn.clone(), rounds_left.clone(), confirmed.clone());

    pump(&ctx, || confirmed.get());
    let elapsed = start.elapsed();
    println!(
        "{} round trips in {:?} ({:.1} us/rt)",
        ROUNDS,
        elapsed,
        elapsed.as_micros() as f64 / ROUNDS as f64
    );

    echo.join().unwrap();
    drop(conn);
}
