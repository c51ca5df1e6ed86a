mod common;

use bytes::Bytes;
use libos_queue::{Category, Config, Error, LibOs, OpResult, QDesc, QToken, SgArray};
use std::net::SocketAddr;

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Returns a connected pair of TCP queues: the client side and the accepted server side.
fn tcp_pair(libos: &mut LibOs) -> (QDesc, QDesc) {
    let listener = libos
        .socket(Category::Posix, libc::AF_INET, libc::SOCK_STREAM, 0)
        .unwrap();
    libos.bind(listener, localhost()).unwrap();
    libos.listen(listener, 16).unwrap();
    let addr = libos.local_addr(listener).unwrap();

    let client = libos
        .socket(Category::Posix, libc::AF_INET, libc::SOCK_STREAM, 0)
        .unwrap();
    libos.connect(client, addr).unwrap();

    let (server, peer) = libos.accept(listener).unwrap();
    assert_eq!(peer, libos.local_addr(client).unwrap());
    libos.close(listener).unwrap();

    (client, server)
}

#[test]
fn tcp_loopback_round_trip() {
    common::init_tracing();

    let mut libos = LibOs::new(Config::default());
    let (client, server) = tcp_pair(&mut libos);

    let sga = SgArray::from_segments([&b"abc"[..], &b"xy"[..]]);
    let pushed = libos.push(client, QToken::push(1), sga).unwrap();
    assert_eq!(pushed, OpResult::Pushed { nbytes: 5 });

    let qt = QToken::pop(1);
    libos.pop(server, qt).unwrap();
    match libos.wait(server, qt).unwrap() {
        OpResult::Popped { sga, nbytes } => {
            assert_eq!(nbytes, 5);
            assert_eq!(
                sga.segments,
                vec![Bytes::from_static(b"abc"), Bytes::from_static(b"xy")]
            );
        }
        other => panic!("Unexpected result {other:?}"),
    }

    libos.close(client).unwrap();
    libos.close(server).unwrap();
}

#[test]
fn tcp_random_arrays_arrive_in_order() {
    common::init_tracing();
    let mut rng = rand::thread_rng();

    let mut libos = LibOs::new(Config::default());
    let (client, server) = tcp_pair(&mut libos);

    let sent: Vec<SgArray> = (0..16)
        .map(|_| common::random_sga(&mut rng, 8, 4096))
        .collect();

    // Register every pop up front so they complete strictly in order.
    for seq in 0..sent.len() as u64 {
        assert!(libos.pop(server, QToken::pop(seq)).unwrap().is_pending());
    }

    for (seq, sga) in sent.iter().enumerate() {
        let (push, pop) = (QToken::push(seq as u64), QToken::pop(seq as u64));
        libos.push(client, push, sga.clone()).unwrap();

        // Drive both ends until the frame has crossed.
        while libos.poll(client, push).unwrap().is_pending()
            || libos.poll(server, pop).unwrap().is_pending()
        {
            libos.service(client, 1).unwrap();
            libos.service(server, 1).unwrap();
        }

        assert_eq!(
            libos.wait(client, push).unwrap(),
            OpResult::Pushed { nbytes: sga.total_len() }
        );
        let result = libos.wait(server, pop).unwrap();
        assert_eq!(result.sga().unwrap().segments, sga.segments);
    }
}

#[test]
fn peer_close_is_reported_on_pop() {
    let mut libos = LibOs::new(Config::default());
    let (client, server) = tcp_pair(&mut libos);

    libos.close(client).unwrap();

    let qt = QToken::pop(1);
    libos.pop(server, qt).unwrap();
    let result = libos.wait(server, qt).unwrap();
    assert_eq!(result, OpResult::Failed(Error::ConnectionClosed));
    assert_eq!(result.error().unwrap().errno(), libc::ECONNRESET);
}

#[test]
fn udp_pop_reports_the_sender() {
    common::init_tracing();

    let mut libos = LibOs::new(Config::default());
    let sender = libos
        .socket(Category::Posix, libc::AF_INET, libc::SOCK_DGRAM, 0)
        .unwrap();
    let receiver = libos
        .socket(Category::Posix, libc::AF_INET, libc::SOCK_DGRAM, 0)
        .unwrap();
    libos.bind(sender, localhost()).unwrap();
    libos.bind(receiver, localhost()).unwrap();

    let sender_addr = libos.local_addr(sender).unwrap();
    let receiver_addr = libos.local_addr(receiver).unwrap();

    // Nothing has arrived yet.
    assert!(libos.peek(receiver).unwrap().is_pending());

    let sga = SgArray::from_segments([&b"datagram"[..]]).with_addr(receiver_addr);
    let pushed = libos.push(sender, QToken::push(1), sga).unwrap();
    assert_eq!(pushed, OpResult::Pushed { nbytes: 8 });

    let qt = QToken::pop(1);
    libos.pop(receiver, qt).unwrap();
    let result = libos.wait(receiver, qt).unwrap();
    assert_eq!(result.nbytes(), Some(8));
    assert_eq!(result.sga().unwrap().addr, Some(sender_addr));
}

#[test]
fn udp_frame_with_many_segments_stays_one_datagram() {
    common::init_tracing();

    let mut libos = LibOs::new(Config::default());
    let sender = libos
        .socket(Category::Posix, libc::AF_INET, libc::SOCK_DGRAM, 0)
        .unwrap();
    let receiver = libos
        .socket(Category::Posix, libc::AF_INET, libc::SOCK_DGRAM, 0)
        .unwrap();
    libos.bind(receiver, localhost()).unwrap();
    let receiver_addr = libos.local_addr(receiver).unwrap();

    // Two slices per segment puts this frame past the kernel's vectored write limit.
    let sga = SgArray::from_segments((0..600u16).map(|i| Bytes::from(vec![i as u8])))
        .with_addr(receiver_addr);
    let qt = QToken::push(1);
    libos.push(sender, qt, sga.clone()).unwrap();
    assert_eq!(libos.wait(sender, qt).unwrap(), OpResult::Pushed { nbytes: 600 });

    let qt = QToken::pop(1);
    libos.pop(receiver, qt).unwrap();
    let result = libos.wait(receiver, qt).unwrap();
    assert_eq!(result.nbytes(), Some(600));
    assert_eq!(result.sga().unwrap().segments, sga.segments);

    // Nothing trails the frame.
    assert!(libos.peek(receiver).unwrap().is_pending());
}

#[test]
fn file_queue_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.bin");

    let mut libos = LibOs::new(Config::default());
    let writer = libos.creat(Category::Posix, &path, 0o600).unwrap();
    assert_eq!(libos.category(writer).unwrap(), Category::Posix);

    let sga = SgArray::from_segments([&b"on"[..], &b"disk"[..]]);
    let qt = QToken::push(1);
    libos.push(writer, qt, sga.clone()).unwrap();
    assert_eq!(libos.wait(writer, qt).unwrap(), OpResult::Pushed { nbytes: 6 });
    libos.close(writer).unwrap();

    let reader = libos
        .open(Category::Posix, &path, libc::O_RDONLY, None)
        .unwrap();
    let qt = QToken::pop(1);
    libos.pop(reader, qt).unwrap();
    let result = libos.wait(reader, qt).unwrap();
    assert_eq!(result.sga().unwrap().segments, sga.segments);

    // Setup operations are for sockets only.
    assert_eq!(libos.listen(reader, 1), Err(Error::WrongCategory));
}

#[test]
fn bypass_queues_need_initialization() {
    let mut libos = LibOs::new(Config::default());

    let err = libos
        .socket(Category::BypassNetwork, libc::AF_INET, libc::SOCK_STREAM, 0)
        .unwrap_err();
    assert_eq!(err, Error::Uninitialized);
    assert_eq!(err.errno(), libc::EPERM);

    let err = libos
        .open(Category::BypassStorage, "/tmp/unused", libc::O_RDWR, None)
        .unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);
}

#[test]
fn descriptors_and_categories_are_checked() {
    let mut libos = LibOs::new(Config::default());

    let err = libos
        .socket(Category::BypassStorage, libc::AF_INET, libc::SOCK_STREAM, 0)
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);

    let err = libos
        .socket(Category::Posix, libc::AF_INET, libc::SOCK_RAW, 0)
        .unwrap_err();
    assert_eq!(err.errno(), libc::ESOCKTNOSUPPORT);

    let qd = libos
        .socket(Category::Posix, libc::AF_INET, libc::SOCK_DGRAM, 0)
        .unwrap();
    libos.close(qd).unwrap();

    assert_eq!(libos.close(qd), Err(Error::BadDescriptor(qd)));
    let err = libos.pop(qd, QToken::pop(1)).unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);
    assert_eq!(err.code(), -(libc::EBADF as i64));
}
