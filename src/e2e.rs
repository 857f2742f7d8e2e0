//! Relay, sender and receiver wired together over loopback WebSockets.

use std::path::PathBuf;
use std::time::Duration;

use crate::codec::{save_jpeg, RawFrame};
use crate::crypto::FrameKey;
use crate::metrics::{read_rows, summarize, MetricsRecorder};
use crate::receiver::{Receiver, ReceiverConfig, SessionEnd};
use crate::relay::{RelayServer, Registry};
use crate::sender::{QualitySweepPlan, Sender, SenderConfig};
use crate::transport::WsTransport;

const PASSPHRASE: &str = "loopback";

async fn spawn_relay() -> (String, Registry) {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let registry = server.registry();
    tokio::spawn(server.run());
    (url, registry)
}

async fn wait_for_peers(registry: &Registry, n: usize) {
    for _ in 0..200 {
        if registry.len().await >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never saw {} peers", n);
}

fn receiver_config(idle_timeout: Duration) -> ReceiverConfig {
    ReceiverConfig {
        idle_timeout,
        sync_retry: Duration::from_millis(100),
        ..ReceiverConfig::new(FrameKey::from_passphrase(PASSPHRASE))
    }
}

#[tokio::test]
async fn test_one_second_sweep_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("sample_image.jpg");
    save_jpeg(&RawFrame::noise(640, 480), &image, 95).unwrap();
    let log = dir.path().join("stream_log.csv");

    let (url, registry) = spawn_relay().await;

    let mut rx_transport = WsTransport::connect(&url).await.unwrap();
    wait_for_peers(&registry, 1).await;
    let mut tx_transport = WsTransport::connect(&url).await.unwrap();
    wait_for_peers(&registry, 2).await;

    let mut recorder = MetricsRecorder::open(&log).unwrap();
    let mut receiver = Receiver::new(receiver_config(Duration::from_secs(2)));
    let mut sender = Sender::new(SenderConfig {
        setup_description: "loopback e2e".to_string(),
        plan: QualitySweepPlan::uniform(&[50], 1.0, 30).unwrap(),
        key: FrameKey::from_passphrase(PASSPHRASE),
        sync_wait: Duration::from_secs(5),
    });
    let images: Vec<PathBuf> = vec![image];

    let (received, sent) = tokio::join!(
        receiver.run(&mut rx_transport, &mut recorder),
        sender.run(&mut tx_transport, &images)
    );
    let sent = sent.unwrap();
    let received = received.unwrap();

    assert!(sent.synced);
    assert_eq!(sent.frames_sent, 30);
    assert_eq!(received.rows, 30);
    assert_eq!(received.discarded, 0);
    assert_eq!(received.end, SessionEnd::IdleTimeout);

    let rows = read_rows(&log).unwrap();
    assert_eq!(rows.len(), 30);
    assert_eq!(rows.iter().map(|r| r.frame_id).collect::<Vec<_>>(), (1..=30).collect::<Vec<u64>>());
    for row in &rows {
        assert_eq!(row.filename, "sample_image.jpg");
        assert_eq!(row.setup_description, "loopback e2e");
        assert_eq!(row.jpeg_quality, 50);
        assert_eq!(row.resolution, "640x480");
        // Capture-to-arrival over loopback: encode, encrypt, two socket hops
        assert!(row.latency_ms > -5.0 && row.latency_ms < 100.0, "latency {}", row.latency_ms);
    }

    let summary = summarize(&rows);
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].frames, 30);
}

#[tokio::test]
async fn test_receiver_alone_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("stream_log.csv");
    let (url, registry) = spawn_relay().await;

    let mut transport = WsTransport::connect(&url).await.unwrap();
    wait_for_peers(&registry, 1).await;

    let mut recorder = MetricsRecorder::open(&log).unwrap();
    let report = Receiver::new(receiver_config(Duration::from_millis(400)))
        .run(&mut transport, &mut recorder)
        .await
        .unwrap();

    assert_eq!(report.end, SessionEnd::IdleTimeout);
    assert_eq!(report.rows, 0);
    assert!(read_rows(&log).unwrap().is_empty());
}
