//! Pending read and write operations.
//!
//! An operation makes progress in passes: each pass consumes from (reads) or
//! produces into (writes) a ring buffer and reports how many bytes it moved.
//! An operation that cannot finish in one pass stays at the head of its queue
//! and blocks the operations behind it; completion callbacks therefore fire
//! in submission order.

use crate::error::{Error, Result};
use crate::ring::RingBuffer;

pub(crate) type UnsizedCallback = Box<dyn FnOnce(Result<&[u8]>)>;
pub(crate) type SizedCallback = Box<dyn FnOnce(Result<Box<[u8]>>)>;
pub(crate) type WriteCallback = Box<dyn FnOnce(Result<()>)>;

/// Length prefix in front of every serialized object on the stream.
pub(crate) const FRAME_HEADER_LEN: usize = 8;

/// Copy from a (possibly wrap-split) pair of source slices.
fn gather(dst: &mut [u8], src: (&[u8], &[u8])) {
    let (a, b) = src;
    dst[..a.len()].copy_from_slice(a);
    dst[a.len()..a.len() + b.len()].copy_from_slice(b);
}

/// Copy into a (possibly wrap-split) pair of destination slices.
fn scatter(dst: (&mut [u8], &mut [u8]), src: &[u8]) {
    let (a, b) = dst;
    let split = a.len();
    a.copy_from_slice(&src[..split]);
    b.copy_from_slice(&src[split..split + b.len()]);
}

enum ReadShape {
    /// Hand the caller one contiguous chunk of whatever is available.
    Unsized { cb: Option<UnsizedCallback> },
    /// Fill the caller's buffer completely, across as many passes as needed.
    Sized {
        buf: Option<Box<[u8]>>,
        filled: usize,
        cb: Option<SizedCallback>,
    },
    /// Read a length prefix, then that many payload bytes, then finish.
    Object {
        header: [u8; FRAME_HEADER_LEN],
        header_filled: usize,
        payload: Vec<u8>,
        payload_filled: usize,
        payload_len: Option<usize>,
        finish: Option<UnsizedCallback>,
    },
}

pub(crate) struct ReadOperation {
    shape: ReadShape,
    done: bool,
}

impl ReadOperation {
    pub fn unsized_chunk(cb: UnsizedCallback) -> Self {
        Self {
            shape: ReadShape::Unsized { cb: Some(cb) },
            done: false,
        }
    }

    pub fn sized(buf: Box<[u8]>, cb: SizedCallback) -> Self {
        Self {
            shape: ReadShape::Sized {
                buf: Some(buf),
                filled: 0,
                cb: Some(cb),
            },
            done: false,
        }
    }

    /// `finish` receives the complete payload (without the length prefix).
    pub fn object(finish: UnsizedCallback) -> Self {
        Self {
            shape: ReadShape::Object {
                header: [0u8; FRAME_HEADER_LEN],
                header_filled: 0,
                payload: Vec::new(),
                payload_filled: 0,
                payload_len: None,
                finish: Some(finish),
            },
            done: false,
        }
    }

    pub fn completed(&self) -> bool {
        self.done
    }

    /// Consume from the inbox; returns the bytes consumed in this pass.
    pub fn handle_read(&mut self, inbox: &RingBuffer) -> u64 {
        match &mut self.shape {
            ReadShape::Unsized { cb } => {
                let consumer = inbox.consumer();
                let chunk = consumer.contiguous();
                if chunk == 0 {
                    return 0;
                }
                let (slice, _) = consumer.map(chunk);
                (cb.take().expect("callback already taken"))(Ok(slice));
                consumer.commit(chunk);
                self.done = true;
                chunk
            }
            ReadShape::Sized { buf, filled, cb } => {
                let target_len = buf.as_ref().expect("buffer already taken").len();
                let consumer = inbox.consumer();
                let n = consumer.readable().min((target_len - *filled) as u64);
                if n > 0 {
                    let target = buf.as_mut().expect("buffer already taken");
                    gather(&mut target[*filled..*filled + n as usize], consumer.map(n));
                    consumer.commit(n);
                    *filled += n as usize;
                }
                if *filled == target_len {
                    let out = buf.take().expect("buffer already taken");
                    (cb.take().expect("callback already taken"))(Ok(out));
                    self.done = true;
                }
                n
            }
            ReadShape::Object {
                header,
                header_filled,
                payload,
                payload_filled,
                payload_len,
                finish,
            } => {
                let mut consumer = inbox.consumer();
                let mut consumed = 0u64;

                if *header_filled < FRAME_HEADER_LEN {
                    let n = consumer
                        .readable()
                        .min((FRAME_HEADER_LEN - *header_filled) as u64);
                    if n > 0 {
                        gather(
                            &mut header[*header_filled..*header_filled + n as usize],
                            consumer.map(n),
                        );
                        consumer.skip(n);
                        *header_filled += n as usize;
                        consumed += n;
                    }
                    if *header_filled == FRAME_HEADER_LEN {
                        let len = u64::from_le_bytes(*header) as usize;
                        *payload_len = Some(len);
                        payload.resize(len, 0);
                    }
                }

                if let Some(len) = *payload_len {
                    let n = consumer.readable().min((len - *payload_filled) as u64);
                    if n > 0 {
                        gather(
                            &mut payload[*payload_filled..*payload_filled + n as usize],
                            consumer.map(n),
                        );
                        consumer.skip(n);
                        *payload_filled += n as usize;
                        consumed += n;
                    }
                    if *payload_filled == len {
                        (finish.take().expect("callback already taken"))(Ok(&payload[..]));
                        self.done = true;
                    }
                }

                consumer.commit(consumed);
                consumed
            }
        }
    }

    /// Fail the operation with the sticky error.
    pub fn handle_error(&mut self, err: &Error) {
        self.done = true;
        match &mut self.shape {
            ReadShape::Unsized { cb } => {
                if let Some(cb) = cb.take() {
                    cb(Err(err.clone()));
                }
            }
            ReadShape::Sized { cb, .. } => {
                if let Some(cb) = cb.take() {
                    cb(Err(err.clone()));
                }
            }
            ReadShape::Object { finish, .. } => {
                if let Some(finish) = finish.take() {
                    finish(Err(err.clone()));
                }
            }
        }
    }
}

pub(crate) struct WriteOperation {
    data: Box<[u8]>,
    written: usize,
    cb: Option<WriteCallback>,
}

impl WriteOperation {
    pub fn new(data: Box<[u8]>, cb: WriteCallback) -> Self {
        Self {
            data,
            written: 0,
            cb: Some(cb),
        }
    }

    pub fn completed(&self) -> bool {
        self.cb.is_none()
    }

    /// Produce into the outbox; returns the bytes produced in this pass.
    ///
    /// The completion callback fires once the whole payload has been copied
    /// into the outbox; delivery and acknowledgment happen asynchronously
    /// behind it.
    pub fn handle_write(&mut self, outbox: &RingBuffer) -> u64 {
        let mut producer = outbox.producer();
        let remaining = (self.data.len() - self.written) as u64;
        let n = producer.writable().min(remaining);
        if n > 0 {
            scatter(
                producer.map(n),
                &self.data[self.written..self.written + n as usize],
            );
            producer.commit(n);
            self.written += n as usize;
        }
        if self.written == self.data.len() {
            if let Some(cb) = self.cb.take() {
                cb(Ok(()));
            }
        }
        n
    }

    /// Fail the operation with the sticky error.
    pub fn handle_error(&mut self, err: &Error) {
        if let Some(cb) = self.cb.take() {
            cb(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn ring(cap: usize) -> RingBuffer {
        RingBuffer::new(cap).expect("mmap failed")
    }

    fn produce(rb: &RingBuffer, data: &[u8]) {
        let mut p = rb.producer();
        assert!(p.writable() >= data.len() as u64);
        scatter(p.map(data.len() as u64), data);
        p.commit(data.len() as u64);
    }

    #[test]
    fn sized_read_across_passes() {
        let rb = ring(64);
        let got: Rc<Cell<Option<Box<[u8]>>>> = Rc::new(Cell::new(None));
        let got2 = got.clone();

        let mut op = ReadOperation::sized(
            vec![0u8; 10].into_boxed_slice(),
            Box::new(move |res| got2.set(Some(res.unwrap()))),
        );

        produce(&rb, b"hell");
        assert_eq!(op.handle_read(&rb), 4);
        assert!(!op.completed());

        produce(&rb, b"o worl");
        assert_eq!(op.handle_read(&rb), 6);
        assert!(op.completed());
        assert_eq!(&*got.take().unwrap(), b"hello worl");
        assert_eq!(rb.used(), 0);
    }

    #[test]
    fn unsized_read_returns_first_chunk() {
        let rb = ring(64);
        let seen = Rc::new(Cell::new(0usize));
        let seen2 = seen.clone();

        let mut op = ReadOperation::unsized_chunk(Box::new(move |res| {
            let chunk = res.unwrap();
            assert!(chunk.iter().all(|&b| b == 0x5A));
            seen2.set(chunk.len());
        }));

        // Nothing available: no progress, no callback.
        assert_eq!(op.handle_read(&rb), 0);
        assert!(!op.completed());

        produce(&rb, &[0x5A; 7]);
        assert_eq!(op.handle_read(&rb), 7);
        assert!(op.completed());
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn unsized_read_stops_at_wrap() {
        let rb = ring(16);
        // Move cursors so 4 contiguous bytes remain before the boundary.
        produce(&rb, &[0u8; 12]);
        rb.advance_tail(12);

        produce(&rb, &[0x33; 8]);

        let seen = Rc::new(Cell::new(0usize));
        let seen2 = seen.clone();
        let mut op = ReadOperation::unsized_chunk(Box::new(move |res| {
            seen2.set(res.unwrap().len());
        }));

        // One contiguous chunk only: the 4 bytes up to the wrap.
        assert_eq!(op.handle_read(&rb), 4);
        assert_eq!(seen.get(), 4);
        assert_eq!(rb.used(), 4);
    }

    #[test]
    fn object_read_waits_for_frame() {
        let rb = ring(64);
        let got: Rc<Cell<Option<Vec<u8>>>> = Rc::new(Cell::new(None));
        let got2 = got.clone();

        let mut op = ReadOperation::object(Box::new(move |res| {
            got2.set(Some(res.unwrap().to_vec()));
        }));

        let payload = b"object bytes";
        let mut frame = (payload.len() as u64).to_le_bytes().to_vec();
        frame.extend_from_slice(payload);

        // Header split across passes, then the payload.
        produce(&rb, &frame[..5]);
        assert_eq!(op.handle_read(&rb), 5);
        assert!(!op.completed());

        produce(&rb, &frame[5..]);
        assert_eq!(op.handle_read(&rb), frame.len() as u64 - 5);
        assert!(op.completed());
        assert_eq!(got.take().unwrap(), payload);
        assert_eq!(rb.used(), 0);
    }

    #[test]
    fn write_blocks_on_full_outbox() {
        let rb = ring(16);
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();

        let mut op = WriteOperation::new(
            vec![0xEE; 24].into_boxed_slice(),
            Box::new(move |res| {
                res.unwrap();
                done2.set(true);
            }),
        );

        assert_eq!(op.handle_write(&rb), 16);
        assert!(!op.completed());
        assert!(!done.get());

        // Peer acks 8 bytes; the remainder fits.
        rb.advance_tail(8);
        assert_eq!(op.handle_write(&rb), 8);
        assert!(op.completed());
        assert!(done.get());
    }

    #[test]
    fn error_fires_callback_once() {
        let rb = ring(16);
        let errs = Rc::new(Cell::new(0u32));
        let errs2 = errs.clone();

        let mut op = ReadOperation::sized(
            vec![0u8; 4].into_boxed_slice(),
            Box::new(move |res| {
                assert_eq!(res.unwrap_err(), Error::Closed);
                errs2.set(errs2.get() + 1);
            }),
        );

        op.handle_error(&Error::Closed);
        op.handle_error(&Error::Closed);
        assert!(op.completed());
        assert_eq!(errs.get(), 1);
        assert_eq!(rb.used(), 0);
    }
}
