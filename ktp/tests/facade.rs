//! Socket facade contract: error kinds, slot lifecycle and reclamation.

use std::net::SocketAddr;
use std::time::Duration;

use ktp::retry::{recv_with_retry, send_with_retry, RetryPolicy};
use ktp::{KtpConfig, KtpError, KtpStack, OwnerId, SocketHandle, SocketType};
use socket2::Domain;

fn config(max_connections: usize) -> KtpConfig {
    KtpConfig {
        message_size: 16,
        window_capacity: 4,
        retransmit_interval: Duration::from_millis(100),
        loss_probability: 0.0,
        max_connections,
        loss_seed: None,
    }
}

fn free_addr() -> SocketAddr {
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").expect("probe bind");
    probe.local_addr().expect("probe addr")
}

fn any_remote() -> SocketAddr {
    "127.0.0.1:9".parse().unwrap()
}

fn create(stack: &KtpStack) -> SocketHandle {
    stack.socket(Domain::IPV4, SocketType::Ktp, None).unwrap()
}

#[tokio::test]
async fn test_unsupported_socket_type() {
    let stack = KtpStack::start(config(2)).unwrap();
    for ty in [SocketType::Datagram, SocketType::Stream] {
        assert!(matches!(
            stack.socket(Domain::IPV4, ty, None),
            Err(KtpError::UnsupportedType(t)) if t == ty
        ));
    }
}

#[tokio::test]
async fn test_no_capacity_when_table_is_full() {
    let stack = KtpStack::start(config(3)).unwrap();
    let handles: Vec<_> = (0..3).map(|_| create(&stack)).collect();
    assert_eq!(handles, vec![SocketHandle(0), SocketHandle(1), SocketHandle(2)]);
    assert!(matches!(
        stack.socket(Domain::IPV4, SocketType::Ktp, None),
        Err(KtpError::NoCapacity)
    ));

    stack.close(handles[1]).unwrap();
    assert_eq!(create(&stack), SocketHandle(1));
}

#[tokio::test]
async fn test_invalid_handles() {
    let stack = KtpStack::start(config(2)).unwrap();
    let mut buf = [0u8; 16];
    for handle in [SocketHandle(0), SocketHandle(99)] {
        assert!(matches!(
            stack.bind(handle, free_addr(), any_remote()),
            Err(KtpError::InvalidHandle)
        ));
        assert!(matches!(
            stack.send_to(handle, b"x", any_remote()),
            Err(KtpError::InvalidHandle)
        ));
        assert!(matches!(stack.recv_from(handle, &mut buf), Err(KtpError::InvalidHandle)));
        assert!(matches!(stack.close(handle), Err(KtpError::InvalidHandle)));
        assert!(matches!(stack.status(handle), Err(KtpError::InvalidHandle)));
    }
}

#[tokio::test]
async fn test_close_twice() {
    let stack = KtpStack::start(config(2)).unwrap();
    let handle = create(&stack);
    stack.bind(handle, free_addr(), any_remote()).unwrap();
    stack.close(handle).unwrap();
    assert!(matches!(stack.close(handle), Err(KtpError::InvalidHandle)));
}

#[tokio::test]
async fn test_send_requires_the_bound_destination() {
    let stack = KtpStack::start(config(2)).unwrap();
    let handle = create(&stack);
    assert!(matches!(
        stack.send_to(handle, b"early", any_remote()),
        Err(KtpError::NotBound)
    ));

    stack.bind(handle, free_addr(), any_remote()).unwrap();
    let elsewhere: SocketAddr = "127.0.0.1:10".parse().unwrap();
    assert!(matches!(
        stack.send_to(handle, b"x", elsewhere),
        Err(KtpError::NotBound)
    ));
    assert_eq!(stack.send_to(handle, b"x", any_remote()).unwrap(), 1);
}

#[tokio::test]
async fn test_oversized_message_is_truncated() {
    let stack = KtpStack::start(config(2)).unwrap();
    let handle = create(&stack);
    stack.bind(handle, free_addr(), any_remote()).unwrap();
    assert_eq!(stack.send_to(handle, &[1u8; 100], any_remote()).unwrap(), 16);
}

#[tokio::test]
async fn test_send_queue_full_and_empty_receive() {
    // Total loss keeps everything in flight and the window closed.
    let stack = KtpStack::start(KtpConfig {
        loss_probability: 1.0,
        ..config(2)
    })
    .unwrap();
    let handle = create(&stack);
    stack.bind(handle, free_addr(), any_remote()).unwrap();

    let mut accepted = 0;
    while stack.send_to(handle, b"m", any_remote()).is_ok() {
        accepted += 1;
        assert!(accepted <= 4 * 3, "send queue never filled");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(matches!(
        stack.send_to(handle, b"m", any_remote()),
        Err(KtpError::NoSpace)
    ));

    let mut buf = [0u8; 16];
    assert!(matches!(stack.recv_from(handle, &mut buf), Err(KtpError::NoMessage)));
}

#[tokio::test]
async fn test_bind_errors_are_channel_errors() {
    let stack = KtpStack::start(config(3)).unwrap();
    let first = create(&stack);
    let addr = free_addr();
    stack.bind(first, addr, any_remote()).unwrap();
    assert!(matches!(
        stack.bind(first, free_addr(), any_remote()),
        Err(KtpError::Channel(_))
    ));

    let second = create(&stack);
    assert!(matches!(
        stack.bind(second, addr, any_remote()),
        Err(KtpError::Channel(_))
    ));
    // A failed bind leaves the connection usable.
    stack.bind(second, free_addr(), any_remote()).unwrap();
}

#[tokio::test]
async fn test_local_addr_resolves_ephemeral_port() {
    let stack = KtpStack::start(config(2)).unwrap();
    let handle = create(&stack);
    assert!(matches!(stack.local_addr(handle), Err(KtpError::NotBound)));

    stack
        .bind(handle, "127.0.0.1:0".parse().unwrap(), any_remote())
        .unwrap();
    let local = stack.local_addr(handle).unwrap();
    assert_ne!(local.port(), 0);
    assert_eq!(stack.status(handle).unwrap().local, Some(local));
}

#[tokio::test]
async fn test_reclaim_releases_only_the_dead_owner() {
    let stack = KtpStack::start(config(4)).unwrap();
    let dead = OwnerId(4242);
    let alive = OwnerId(7);
    let a = stack.socket_as(dead, Domain::IPV4, SocketType::Ktp, None).unwrap();
    let b = stack.socket_as(alive, Domain::IPV4, SocketType::Ktp, None).unwrap();
    let c = stack.socket_as(dead, Domain::IPV4, SocketType::Ktp, None).unwrap();
    stack.bind(a, free_addr(), any_remote()).unwrap();

    assert_eq!(stack.reclaim(dead), vec![a, c]);
    assert!(stack.reclaim(dead).is_empty());
    assert!(matches!(stack.status(a), Err(KtpError::InvalidHandle)));
    assert!(matches!(stack.status(c), Err(KtpError::InvalidHandle)));
    assert_eq!(stack.status(b).unwrap().owner, alive);

    // Freed slots are handed out again.
    assert_eq!(create(&stack), a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closing_one_connection_leaves_others_running() {
    let stack = KtpStack::start(config(4)).unwrap();
    let (a_addr, b_addr, c_addr, d_addr) = (free_addr(), free_addr(), free_addr(), free_addr());
    let a = create(&stack);
    let b = create(&stack);
    let c = create(&stack);
    let d = create(&stack);
    stack.bind(a, a_addr, b_addr).unwrap();
    stack.bind(b, b_addr, a_addr).unwrap();
    stack.bind(c, c_addr, d_addr).unwrap();
    stack.bind(d, d_addr, c_addr).unwrap();

    // Leave traffic in flight towards a connection that disappears.
    for i in 0..4u8 {
        stack.send_to(c, &[i], d_addr).unwrap();
    }
    stack.close(d).unwrap();

    let policy = RetryPolicy::fixed(1_000, Duration::from_millis(5));
    let mut buf = [0u8; 16];
    for i in 0..12u8 {
        send_with_retry(&stack, a, &[i], b_addr, &policy).await.unwrap();
        recv_with_retry(&stack, b, &mut buf, &policy).await.unwrap();
        assert_eq!(buf[0], i);
    }
    assert!(stack.status(c).unwrap().in_flight > 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let bad = KtpConfig {
        loss_probability: 1.5,
        ..config(2)
    };
    assert!(matches!(KtpStack::start(bad), Err(KtpError::Config(_))));
}
