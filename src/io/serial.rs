//! Serial port handle for the scanner/scale
//!
//! Line settings: 8N1, no flow control. The handle is the only owner of the
//! port; the ingest loop drives it and nothing else touches the device.
//!
//! State machine: `Disconnected → Connecting → Connected`, with `Error` when
//! an open attempt fails. Any I/O error (or end of stream) on an open port
//! closes it and moves back to `Disconnected`; the caller decides when to
//! call [`SerialHandle::reconnect`], pacing itself with [`Backoff`].

use crate::domain::types::DeviceState;
use crate::infra::config::Config;
use crate::infra::error::{BridgeError, BridgeResult};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::{info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Opens the underlying byte stream. Real hardware uses [`TtyConnector`].
pub trait SerialConnector: Send + Sync + 'static {
    type Port: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> BridgeResult<Self::Port>;

    /// Device path for logs and errors
    fn device(&self) -> &str;
}

/// Serial TTY via tokio-serial
#[derive(Debug, Clone)]
pub struct TtyConnector {
    path: String,
    baud: u32,
}

impl TtyConnector {
    pub fn new(path: &str, baud: u32) -> Self {
        Self { path: path.to_string(), baud }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.serial_port(), config.serial_baud())
    }
}

impl SerialConnector for TtyConnector {
    type Port = tokio_serial::SerialStream;

    fn connect(&self) -> BridgeResult<Self::Port> {
        tokio_serial::new(&self.path, self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| BridgeError::device_unavailable(&self.path, e))
    }

    fn device(&self) -> &str {
        &self.path
    }
}

/// Bounded exponential backoff for reopen attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self { initial, max, next: initial }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.reconnect_initial(), config.reconnect_max())
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

pub struct SerialHandle<C: SerialConnector> {
    connector: C,
    port: Option<C::Port>,
    state_tx: watch::Sender<DeviceState>,
    read_timeout: Duration,
}

impl<C: SerialConnector> SerialHandle<C> {
    pub fn new(connector: C, state_tx: watch::Sender<DeviceState>, read_timeout: Duration) -> Self {
        state_tx.send_replace(DeviceState::Disconnected);
        Self { connector, port: None, state_tx, read_timeout }
    }

    pub fn device(&self) -> &str {
        self.connector.device()
    }

    pub fn state(&self) -> DeviceState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.port.is_some()
    }

    /// Drop any open port and try to open a fresh one
    pub fn reconnect(&mut self) -> BridgeResult<()> {
        self.port = None;
        self.transition(DeviceState::Connecting);

        match self.connector.connect() {
            Ok(port) => {
                self.port = Some(port);
                self.transition(DeviceState::Connected);
                info!(device = %self.connector.device(), "serial_port_opened");
                Ok(())
            }
            Err(e) => {
                self.transition(DeviceState::Error);
                warn!(device = %self.connector.device(), error = %e, "serial_port_open_failed");
                Err(e)
            }
        }
    }

    /// Read with the configured timeout.
    ///
    /// `Ok(None)` means nothing arrived in time. End of stream counts as a
    /// disconnect: a live tty read waits for data rather than returning 0.
    pub async fn read(&mut self, buf: &mut [u8]) -> BridgeResult<Option<usize>> {
        let Some(port) = self.port.as_mut() else {
            return Err(BridgeError::device_unavailable(self.connector.device(), "not connected"));
        };

        match tokio::time::timeout(self.read_timeout, port.read(buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(self.close("end of stream")),
            Ok(Ok(n)) => Ok(Some(n)),
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Ok(Err(e)) => Err(self.close(&e.to_string())),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> BridgeResult<()> {
        let Some(port) = self.port.as_mut() else {
            return Err(BridgeError::device_unavailable(self.connector.device(), "not connected"));
        };

        let result = tokio::time::timeout(WRITE_TIMEOUT, async {
            port.write_all(data).await?;
            port.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.close(&e.to_string())),
            Err(_) => Err(self.close("write timed out")),
        }
    }

    /// Close the port after a failure, returning the error to hand upward
    pub fn close(&mut self, reason: &str) -> BridgeError {
        self.port = None;
        warn!(device = %self.connector.device(), reason = %reason, "serial_port_closed");
        self.transition(DeviceState::Disconnected);
        BridgeError::device_unavailable(self.connector.device(), reason)
    }

    fn transition(&self, next: DeviceState) {
        let device = self.connector.device();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(device = %device, from = %current.as_str(), to = %next.as_str(), "serial_state_changed");
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;

    /// Hands out pre-made in-memory streams, one per connect
    struct DuplexConnector {
        ports: Mutex<VecDeque<DuplexStream>>,
    }

    impl SerialConnector for DuplexConnector {
        type Port = DuplexStream;

        fn connect(&self) -> BridgeResult<DuplexStream> {
            self.ports
                .lock()
                .pop_front()
                .ok_or_else(|| BridgeError::device_unavailable("/dev/test", "No such file or directory"))
        }

        fn device(&self) -> &str {
            "/dev/test"
        }
    }

    fn handle_with(ports: Vec<DuplexStream>) -> SerialHandle<DuplexConnector> {
        let (state_tx, _) = watch::channel(DeviceState::Disconnected);
        let connector = DuplexConnector { ports: Mutex::new(ports.into()) };
        SerialHandle::new(connector, state_tx, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_open_failure_marks_error() {
        let mut handle = handle_with(vec![]);
        assert_eq!(handle.state(), DeviceState::Disconnected);

        let err = handle.reconnect().unwrap_err();
        assert_eq!(err.code(), "device_unavailable");
        assert_eq!(handle.state(), DeviceState::Error);
        assert!(!handle.is_healthy());
    }

    #[tokio::test]
    async fn test_read_and_timeout() {
        let (bridge, mut device) = tokio::io::duplex(64);
        let mut handle = handle_with(vec![bridge]);
        handle.reconnect().unwrap();
        assert_eq!(handle.state(), DeviceState::Connected);

        let mut buf = [0u8; 16];
        assert_eq!(handle.read(&mut buf).await.unwrap(), None);

        device.write_all(b"123\r").await.unwrap();
        assert_eq!(handle.read(&mut buf).await.unwrap(), Some(4));
        assert_eq!(&buf[..4], b"123\r");
    }

    #[tokio::test]
    async fn test_disconnect_mid_read_closes_handle() {
        let (bridge, device) = tokio::io::duplex(64);
        let mut handle = handle_with(vec![bridge]);
        let mut state_rx = handle.subscribe();
        handle.reconnect().unwrap();

        drop(device);
        let mut buf = [0u8; 16];
        let err = handle.read(&mut buf).await.unwrap_err();
        assert_eq!(err.code(), "device_unavailable");
        assert_eq!(handle.state(), DeviceState::Disconnected);
        assert!(!handle.is_healthy());
        assert_eq!(*state_rx.borrow_and_update(), DeviceState::Disconnected);

        // Further reads fail fast instead of hanging
        assert!(handle.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_restores_reads() {
        let (first, device_a) = tokio::io::duplex(64);
        let (second, mut device_b) = tokio::io::duplex(64);
        let mut handle = handle_with(vec![first, second]);
        handle.reconnect().unwrap();

        drop(device_a);
        let mut buf = [0u8; 16];
        assert!(handle.read(&mut buf).await.is_err());

        handle.reconnect().unwrap();
        device_b.write_all(b"S110045\r").await.unwrap();
        assert_eq!(handle.read(&mut buf).await.unwrap(), Some(8));
        assert_eq!(handle.state(), DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_write_reaches_device() {
        let (bridge, mut device) = tokio::io::duplex(64);
        let mut handle = handle_with(vec![bridge]);
        handle.reconnect().unwrap();

        handle.write(b"S11\r").await.unwrap();
        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"S11\r");
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(3000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(3000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(3000));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
