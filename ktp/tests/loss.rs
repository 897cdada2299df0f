//! Recovery from segment loss: random loss through the stock simulator and a
//! single forced drop through a custom [`LossModel`].

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ktp::retry::{recv_with_retry, send_with_retry, RetryPolicy};
use ktp::segment::Segment;
use ktp::{KtpConfig, KtpError, KtpStack, LossModel, SocketHandle, SocketType};
use socket2::Domain;

fn free_addr() -> SocketAddr {
    let probe = StdUdpSocket::bind("127.0.0.1:0").expect("probe bind");
    probe.local_addr().expect("probe addr")
}

fn config(retransmit_ms: u64, loss: f64) -> KtpConfig {
    KtpConfig {
        message_size: 64,
        window_capacity: 10,
        retransmit_interval: Duration::from_millis(retransmit_ms),
        loss_probability: loss,
        max_connections: 4,
        loss_seed: Some(0x5eed),
    }
}

fn pair(stack: &KtpStack) -> (SocketHandle, SocketAddr, SocketHandle, SocketAddr) {
    let (a_addr, b_addr) = (free_addr(), free_addr());
    let a = stack.socket(Domain::IPV4, SocketType::Ktp, None).unwrap();
    let b = stack.socket(Domain::IPV4, SocketType::Ktp, None).unwrap();
    stack.bind(a, a_addr, b_addr).unwrap();
    stack.bind(b, b_addr, a_addr).unwrap();
    (a, a_addr, b, b_addr)
}

fn patient() -> RetryPolicy {
    RetryPolicy::fixed(6_000, Duration::from_millis(5))
}

fn numbered(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn number(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_random_loss_delivers_everything_once_in_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    const COUNT: u32 = 40;
    let stack = KtpStack::start(config(100, 0.2)).unwrap();
    let (a, _, b, b_addr) = pair(&stack);

    let producer = {
        let stack = stack.clone();
        tokio::spawn(async move {
            for i in 0..COUNT {
                send_with_retry(&stack, a, &numbered(i), b_addr, &patient())
                    .await
                    .unwrap();
            }
        })
    };

    let mut buf = [0u8; 64];
    let mut received = Vec::new();
    for _ in 0..COUNT {
        recv_with_retry(&stack, b, &mut buf, &patient()).await.unwrap();
        received.push(number(&buf));
    }
    producer.await.unwrap();
    assert_eq!(received, (0..COUNT).collect::<Vec<_>>());

    // Late retransmissions must not surface as extra messages.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(stack.recv_from(b, &mut buf), Err(KtpError::NoMessage)));

    let sent = stack.stats(a).unwrap();
    let got = stack.stats(b).unwrap();
    assert!(sent.simulated_drops + got.simulated_drops > 0);
    assert!(sent.retransmissions > 0);
    assert!(sent.transmissions_per_message().unwrap() > 1.0);
    assert_eq!(got.delivered, COUNT as u64);
}

/// Drops the first transmission of one data sequence number and remembers
/// when it did.
struct DropOnce {
    seq: u8,
    dropped_at: Arc<Mutex<Option<Instant>>>,
}

impl LossModel for DropOnce {
    fn should_drop(&mut self, segment: &Segment) -> bool {
        if segment.header.ack || segment.header.seq != self.seq {
            return false;
        }
        let mut dropped_at = self.dropped_at.lock().unwrap();
        if dropped_at.is_some() {
            return false;
        }
        *dropped_at = Some(Instant::now());
        true
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_segment_is_resent_after_retransmit_interval() {
    let _ = env_logger::builder().is_test(true).try_init();
    let retransmit = Duration::from_millis(400);
    let dropped_at = Arc::new(Mutex::new(None));
    let model = DropOnce {
        seq: 3,
        dropped_at: Arc::clone(&dropped_at),
    };
    let stack =
        KtpStack::start_with_loss_model(config(retransmit.as_millis() as u64, 0.0), Box::new(model))
            .unwrap();
    let (a, _, b, b_addr) = pair(&stack);

    for i in 0..6 {
        stack.send_to(a, &numbered(i), b_addr).unwrap();
    }

    let mut buf = [0u8; 64];
    let mut received = Vec::new();
    let mut third_at = None;
    while received.len() < 6 {
        recv_with_retry(&stack, b, &mut buf, &RetryPolicy::fixed(1_000, Duration::from_millis(2)))
            .await
            .unwrap();
        if number(&buf) == 3 {
            third_at = Some(Instant::now());
        }
        received.push(number(&buf));
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4, 5]);

    let dropped_at = dropped_at.lock().unwrap().expect("segment 3 was never dropped");
    let waited = third_at.unwrap() - dropped_at;
    assert!(
        waited >= retransmit - Duration::from_millis(50),
        "segment 3 came back after only {waited:?}"
    );

    let stats = stack.stats(a).unwrap();
    assert_eq!(stats.segments_sent, 6);
    assert_eq!(stats.retransmissions, 1);
    assert_eq!(stack.stats(b).unwrap().simulated_drops, 1);
    assert_eq!(stack.stats(b).unwrap().delivered, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unacknowledged_segments_stay_in_flight_under_total_loss() {
    let stack = KtpStack::start(config(100, 1.0)).unwrap();
    let (a, _, b, b_addr) = pair(&stack);

    stack.send_to(a, b"lost", b_addr).unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;

    let status = stack.status(a).unwrap();
    assert_eq!(status.in_flight, 1);
    assert!(stack.stats(a).unwrap().retransmissions >= 2);
    let mut buf = [0u8; 64];
    assert!(matches!(stack.recv_from(b, &mut buf), Err(KtpError::NoMessage)));
}
