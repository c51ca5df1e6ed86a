mod common;

use libos_queue::queue::endpoint::{Endpoint, Transport};
use libos_queue::{
    BypassContext, Category, Config, Error, IoQueue, LibOs, NetworkBackend, OpResult, PinTable,
    QToken, Queue, QueueConfig, SgArray,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};

/// Only one bypass context can be alive at a time, so tests that create one take turns.
static CONTEXT_LOCK: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    CONTEXT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A stand-in bypass stack whose sockets loop every written byte back to their own reads.
struct LoopbackStack;

struct LoopbackEndpoint {
    wire: Rc<RefCell<VecDeque<u8>>>,
}

impl Endpoint for LoopbackEndpoint {
    fn transport(&self) -> Transport {
        Transport::Stream
    }

    fn category(&self) -> Category {
        Category::BypassNetwork
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.wire.borrow_mut();
        if wire.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = wire.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(wire.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut wire = self.wire.borrow_mut();
        let before = wire.len();
        for slice in bufs {
            wire.extend(slice.iter());
        }
        Ok(wire.len() - before)
    }

    fn close(&mut self) -> libos_queue::Result<()> {
        Ok(())
    }
}

impl NetworkBackend for LoopbackStack {
    fn socket(
        &self,
        _domain: i32,
        ty: i32,
        _protocol: i32,
        config: &QueueConfig,
        pins: &PinTable,
    ) -> libos_queue::Result<Box<dyn IoQueue>> {
        if ty != libc::SOCK_STREAM {
            return Err(Error::Os(libc::ESOCKTNOSUPPORT));
        }

        let endpoint = LoopbackEndpoint {
            wire: Rc::default(),
        };
        Ok(Box::new(Queue::new(endpoint, config.clone(), pins.clone())))
    }
}

#[test]
fn context_is_initialized_once_at_a_time() {
    let _guard = exclusive();

    let context = BypassContext::init(Box::new(LoopbackStack)).unwrap();
    assert!(BypassContext::is_initialized());

    let err = BypassContext::init(Box::new(LoopbackStack)).unwrap_err();
    assert_eq!(err, Error::AlreadyInitialized);
    assert_eq!(err.errno(), libc::EEXIST);

    drop(context);
    assert!(!BypassContext::is_initialized());

    let context = BypassContext::init(Box::new(LoopbackStack)).unwrap();
    drop(context);
}

#[test]
fn bypass_network_queues_use_the_stack() {
    let _guard = exclusive();
    common::init_tracing();

    let context = BypassContext::init(Box::new(LoopbackStack)).unwrap();
    let mut libos = LibOs::with_bypass(Config::default(), context);

    let qd = libos
        .socket(Category::BypassNetwork, libc::AF_INET, libc::SOCK_STREAM, 0)
        .unwrap();
    assert_eq!(libos.category(qd).unwrap(), Category::BypassNetwork);

    let err = libos
        .socket(Category::BypassNetwork, libc::AF_INET, libc::SOCK_DGRAM, 0)
        .unwrap_err();
    assert_eq!(err.errno(), libc::ESOCKTNOSUPPORT);

    // Storage-only operations are rejected on the network category.
    let err = libos
        .open(Category::BypassNetwork, "/tmp/unused", libc::O_RDWR, None)
        .unwrap_err();
    assert_eq!(err, Error::WrongCategory);

    let sga = SgArray::from_segments([&b"looped"[..], &b"back"[..]]);
    let push = QToken::push(1);
    assert_eq!(
        libos.push(qd, push, sga.clone()).unwrap(),
        OpResult::Pushed { nbytes: 10 }
    );

    let pop = QToken::pop(1);
    let result = libos.pop(qd, pop).unwrap();
    assert_eq!(result.sga().unwrap().segments, sga.segments);
    libos.discard(qd, pop).unwrap();

    libos.close(qd).unwrap();
}

#[test]
fn storage_queues_share_one_device() {
    let _guard = exclusive();
    common::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.bin");

    let context = BypassContext::init(Box::new(LoopbackStack)).unwrap();
    let mut libos = LibOs::with_bypass(Config::default(), context);

    let writer = libos
        .open(
            Category::BypassStorage,
            &path,
            libc::O_CREAT | libc::O_RDWR,
            Some(0o600),
        )
        .unwrap();
    assert_eq!(libos.category(writer).unwrap(), Category::BypassStorage);
    assert!(path.exists());

    let first = SgArray::from_segments([&b"stored"[..]]);
    let second = SgArray::from_segments([&b"and"[..], &b"again"[..]]);

    // Completions arrive from the worker thread, so pushes start out pending.
    for (seq, sga) in [&first, &second].into_iter().enumerate() {
        let qt = QToken::push(seq as u64);
        libos.push(writer, qt, sga.clone()).unwrap();
        assert_eq!(
            libos.wait(writer, qt).unwrap(),
            OpResult::Pushed { nbytes: sga.total_len() }
        );
    }

    // A second queue reads the device from the start.
    let reader = libos
        .open(Category::BypassStorage, &path, libc::O_RDWR, None)
        .unwrap();
    for (seq, sga) in [&first, &second].into_iter().enumerate() {
        let qt = QToken::pop(seq as u64);
        libos.pop(reader, qt).unwrap();
        let result = libos.wait(reader, qt).unwrap();
        assert_eq!(result.sga().unwrap().segments, sga.segments);
    }

    // Storage queues have no socket setup.
    assert_eq!(
        libos.bind(reader, "127.0.0.1:0".parse().unwrap()),
        Err(Error::WrongCategory)
    );

    libos.close(reader).unwrap();
    libos.close(writer).unwrap();
    drop(libos);

    assert!(!BypassContext::is_initialized());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * 24 + 8 + 6 + 2 * 8 + 8);
}

#[test]
fn peek_does_not_stall_later_storage_pushes() {
    let _guard = exclusive();
    common::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peeked.bin");

    let context = BypassContext::init(Box::new(LoopbackStack)).unwrap();
    let mut libos = LibOs::with_bypass(Config::default(), context);

    let writer = libos
        .open(
            Category::BypassStorage,
            &path,
            libc::O_CREAT | libc::O_RDWR,
            Some(0o600),
        )
        .unwrap();

    // The read submitted by an empty peek must not hold up the push behind it.
    assert!(libos.peek(writer).unwrap().is_pending());
    let first = SgArray::from_segments([&b"after"[..], &b"peek"[..]]);
    let qt = QToken::push(1);
    libos.push(writer, qt, first.clone()).unwrap();
    assert_eq!(libos.wait(writer, qt).unwrap(), OpResult::Pushed { nbytes: 9 });

    let qt = QToken::pop(1);
    libos.pop(writer, qt).unwrap();
    let result = libos.wait(writer, qt).unwrap();
    assert_eq!(result.sga().unwrap().segments, first.segments);

    // A peek that does find data keeps it for the pops that follow a push.
    let reader = libos
        .open(Category::BypassStorage, &path, libc::O_RDWR, None)
        .unwrap();
    assert!(libos.peek(reader).unwrap().is_pending());
    let second = SgArray::from_segments([&b"appended"[..]]);
    let qt = QToken::push(2);
    libos.push(reader, qt, second.clone()).unwrap();
    assert_eq!(libos.wait(reader, qt).unwrap(), OpResult::Pushed { nbytes: 8 });

    for (seq, sga) in [&first, &second].into_iter().enumerate() {
        let qt = QToken::pop(seq as u64 + 2);
        libos.pop(reader, qt).unwrap();
        let result = libos.wait(reader, qt).unwrap();
        assert_eq!(result.sga().unwrap().segments, sga.segments);
    }

    libos.close(reader).unwrap();
    libos.close(writer).unwrap();
}
