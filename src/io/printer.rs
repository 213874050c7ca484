//! Printer transports
//!
//! Two ways to reach the receipt printer:
//! - Direct: write the raw ESC/POS stream to the USB character device (e.g. /dev/usb/lp0)
//! - Spooler: hand the stream to a CUPS raw queue via `lp -d <queue> -o raw`
//!
//! [`PrinterHandles`] owns both and tracks their health separately so the
//! dispatcher can pick one per job. Nothing else writes to the printer.

use crate::domain::types::{DeviceState, Transport, TransportHealth};
use crate::infra::config::Config;
use crate::infra::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

/// ESC p m t1 t2: pulse drawer kick connector pin 2 (25*2ms on, 250*2ms off)
pub const DRAWER_KICK: [u8; 5] = [0x1B, 0x70, 0x00, 25, 250];

/// One way of getting bytes to the printer
#[async_trait]
pub trait PrintTransport: Send + Sync {
    fn transport(&self) -> Transport;

    /// Device path or queue name
    fn target(&self) -> &str;

    /// Cheap reachability check. Must not write anything to the printer.
    async fn probe(&self) -> bool;

    async fn send(&self, payload: &[u8]) -> BridgeResult<()>;
}

/// Raw USB printer device file
#[derive(Debug, Clone)]
pub struct DirectUsbTransport {
    path: String,
    timeout: Duration,
}

impl DirectUsbTransport {
    pub fn new(path: &str, timeout: Duration) -> Self {
        Self { path: path.to_string(), timeout }
    }

    async fn open(&self) -> std::io::Result<tokio::fs::File> {
        // append: never seek or truncate, harmless on a character device
        tokio::fs::OpenOptions::new().append(true).open(&self.path).await
    }

    fn map_io_error(&self, e: std::io::Error) -> BridgeError {
        match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                BridgeError::device_unavailable(&self.path, e)
            }
            _ => BridgeError::transport_failure(Transport::DirectUsb, e),
        }
    }
}

#[async_trait]
impl PrintTransport for DirectUsbTransport {
    fn transport(&self) -> Transport {
        Transport::DirectUsb
    }

    fn target(&self) -> &str {
        &self.path
    }

    async fn probe(&self) -> bool {
        matches!(tokio::time::timeout(Duration::from_millis(500), self.open()).await, Ok(Ok(_)))
    }

    async fn send(&self, payload: &[u8]) -> BridgeResult<()> {
        let write = async {
            let mut file = self.open().await?;
            file.write_all(payload).await?;
            file.flush().await
        };

        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.map_io_error(e)),
            Err(_) => Err(BridgeError::transport_failure(
                Transport::DirectUsb,
                format!("write timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }
}

/// CUPS queue driven through the `lp`/`lpstat` command line tools
#[derive(Debug, Clone)]
pub struct SpoolerTransport {
    queue: String,
    submit_command: String,
    status_command: String,
    timeout: Duration,
}

impl SpoolerTransport {
    pub fn new(queue: &str, submit_command: &str, status_command: &str, timeout: Duration) -> Self {
        Self {
            queue: queue.to_string(),
            submit_command: submit_command.to_string(),
            status_command: status_command.to_string(),
            timeout,
        }
    }

    async fn submit(&self, payload: &[u8]) -> BridgeResult<()> {
        let failure = |reason: String| BridgeError::transport_failure(Transport::Spooler, reason);

        let mut child = Command::new(&self.submit_command)
            .args(["-d", &self.queue, "-o", "raw"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failure(format!("cannot run {}: {e}", self.submit_command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload).await.map_err(|e| failure(format!("stdin: {e}")))?;
            // Dropping stdin closes the pipe so lp sees EOF
        }

        let output = child.wait_with_output().await.map_err(|e| failure(e.to_string()))?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            info!(queue = %self.queue, response = %stdout.trim(), "spooler_job_submitted");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(failure(format!("{} exited with {}: {}", self.submit_command, output.status, stderr.trim())))
        }
    }
}

#[async_trait]
impl PrintTransport for SpoolerTransport {
    fn transport(&self) -> Transport {
        Transport::Spooler
    }

    fn target(&self) -> &str {
        &self.queue
    }

    /// `lpstat -p <queue>` prints "printer <queue> is idle.  enabled since ..."
    async fn probe(&self) -> bool {
        let status = Command::new(&self.status_command)
            .args(["-p", &self.queue])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(Duration::from_secs(2), status).await {
            Ok(Ok(output)) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                text.contains("enabled") && !text.contains("disabled")
            }
            _ => false,
        }
    }

    async fn send(&self, payload: &[u8]) -> BridgeResult<()> {
        tokio::time::timeout(self.timeout, self.submit(payload)).await.map_err(|_| {
            BridgeError::transport_failure(
                Transport::Spooler,
                format!("submission timed out after {}ms", self.timeout.as_millis()),
            )
        })?
    }
}

/// Owner of both printer transports and their last observed health
pub struct PrinterHandles {
    direct: Arc<dyn PrintTransport>,
    spooler: Arc<dyn PrintTransport>,
    health: Mutex<TransportHealth>,
}

impl PrinterHandles {
    pub fn new(direct: Arc<dyn PrintTransport>, spooler: Arc<dyn PrintTransport>) -> Self {
        Self { direct, spooler, health: Mutex::new(TransportHealth::default()) }
    }

    /// Build both transports from config (device path + spooler queue name)
    pub fn from_config(config: &Config) -> Self {
        let direct = DirectUsbTransport::new(config.printer_device(), config.transport_timeout());
        let spooler = SpoolerTransport::new(
            config.printer_queue(),
            config.spooler_command(),
            config.status_command(),
            config.transport_timeout(),
        );
        Self::new(Arc::new(direct), Arc::new(spooler))
    }

    pub fn get(&self, transport: Transport) -> Option<&Arc<dyn PrintTransport>> {
        match transport {
            Transport::DirectUsb => Some(&self.direct),
            Transport::Spooler => Some(&self.spooler),
            Transport::Unavailable => None,
        }
    }

    /// Probe both transports and record the result, logging any change
    pub async fn probe(&self) -> TransportHealth {
        let (direct, spooler) = tokio::join!(self.direct.probe(), self.spooler.probe());

        let mut health = self.health.lock();
        log_transition(self.direct.as_ref(), health.direct, direct);
        log_transition(self.spooler.as_ref(), health.spooler, spooler);
        health.direct = direct;
        health.spooler = spooler;
        *health
    }

    /// Last recorded health without probing
    pub fn health(&self) -> TransportHealth {
        *self.health.lock()
    }

    pub fn record_direct_result(&self, ok: bool) {
        self.health.lock().direct_failed_last = !ok;
    }
}

fn log_transition(transport: &dyn PrintTransport, was: bool, now: bool) {
    if was == now {
        return;
    }
    let state = if now { DeviceState::Connected } else { DeviceState::Disconnected };
    if now {
        info!(transport = %transport.transport(), target = %transport.target(), state = %state.as_str(), "printer_transport_changed");
    } else {
        warn!(transport = %transport.transport(), target = %transport.target(), state = %state.as_str(), "printer_transport_changed");
    }
}
