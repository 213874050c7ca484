//! Ingest loop against in-memory serial ports
//!
//! Each `connect` hands out the next duplex stream; dropping the device end
//! looks like the cable being pulled.

use parking_lot::Mutex;
use pos_bridge::domain::{DeviceState, FrameParser, MagellanParser};
use pos_bridge::infra::{BridgeError, BridgeResult, Metrics};
use pos_bridge::io::{Backoff, SerialConnector, SerialHandle};
use pos_bridge::services::{IngestLoop, IngestSettings, SharedState};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

struct DuplexConnector {
    ports: Mutex<VecDeque<DuplexStream>>,
}

impl SerialConnector for DuplexConnector {
    type Port = DuplexStream;

    fn connect(&self) -> BridgeResult<DuplexStream> {
        self.ports
            .lock()
            .pop_front()
            .ok_or_else(|| BridgeError::device_unavailable("/dev/ttyTEST", "No such file or directory"))
    }

    fn device(&self) -> &str {
        "/dev/ttyTEST"
    }
}

struct Harness {
    state: Arc<SharedState>,
    metrics: Arc<Metrics>,
    serial_state: watch::Receiver<DeviceState>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(ports: Vec<DuplexStream>, poll: Option<Duration>) -> Self {
        let (state_tx, serial_state) = watch::channel(DeviceState::Disconnected);
        let connector = DuplexConnector { ports: Mutex::new(ports.into()) };
        let handle = SerialHandle::new(connector, state_tx, Duration::from_millis(20));

        let state = Arc::new(SharedState::new(Duration::from_secs(2), 64));
        let metrics = Arc::new(Metrics::new());
        let settings = IngestSettings {
            divisor: 100.0,
            weight_request: b"S11\r".to_vec(),
            weight_poll_interval: poll,
            backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        };
        let parser: Arc<dyn FrameParser> = Arc::new(MagellanParser::default());
        let ingest = IngestLoop::new(handle, parser, state.clone(), metrics.clone(), settings);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(ingest.run(shutdown_rx));
        Self { state, metrics, serial_state, shutdown, task }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), self.task).await.unwrap().unwrap();
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_disconnect_then_reconnect_restores_barcode_and_weight() {
    let (first, mut device_a) = tokio::io::duplex(256);
    let (second, mut device_b) = tokio::io::duplex(256);
    let harness = Harness::start(vec![first, second], None);

    device_a.write_all(b"\x01\x02!!\r7501234567890\rS110045\r").await.unwrap();
    wait_until("first scan", || harness.state.pending_barcodes() == 1).await;
    wait_until("first weight", || harness.state.get_weight() == Some(0.45)).await;
    assert_eq!(harness.state.pop_barcode().map(|e| e.code).as_deref(), Some("7501234567890"));
    assert_eq!(harness.state.pop_barcode(), None);
    assert_eq!(harness.metrics.snapshot().malformed_frames, 1);

    // Cable pulled
    drop(device_a);
    wait_until("disconnect", || harness.metrics.snapshot().serial_disconnects == 1).await;
    wait_until("reconnect", || harness.metrics.snapshot().serial_connects == 2).await;
    assert_eq!(*harness.serial_state.borrow(), DeviceState::Connected);

    device_b.write_all(b"S110201\r4006381333931\r").await.unwrap();
    wait_until("scan after reconnect", || harness.state.pending_barcodes() == 1).await;
    wait_until("weight after reconnect", || harness.state.get_weight() == Some(2.01)).await;
    assert_eq!(harness.state.pop_barcode().map(|e| e.code).as_deref(), Some("4006381333931"));

    harness.stop().await;
}

#[tokio::test]
async fn test_absent_device_is_retried_without_crashing() {
    let harness = Harness::start(vec![], None);

    wait_until("retries", || harness.metrics.snapshot().serial_open_failures >= 3).await;
    assert_eq!(*harness.serial_state.borrow(), DeviceState::Error);
    assert_eq!(harness.state.get_weight(), None);

    harness.stop().await;
}

#[tokio::test]
async fn test_scale_is_polled_for_weight() {
    let (port, mut scale) = tokio::io::duplex(256);
    let harness = Harness::start(vec![port], Some(Duration::from_millis(20)));

    // Scale answers each request with a fixed reading
    let scale_task = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            match scale.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if buf[..n].windows(4).any(|w| w == b"S11\r") {
                        if scale.write_all(b"S110045\r").await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    wait_until("polled weight", || harness.state.get_weight() == Some(0.45)).await;
    assert!(harness.metrics.snapshot().weight_frames >= 1);
    assert_eq!(harness.state.pending_barcodes(), 0);

    harness.stop().await;
    scale_task.await.unwrap();
}
