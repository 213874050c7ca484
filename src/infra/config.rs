//! Configuration loading from TOML files
//!
//! The binary picks the file path (`--config`, then `CONFIG_FILE`, then
//! config/bridge.toml) and hands it to [`Config::load_from_path`].
//!
//! `BRIDGE_*` environment variables override individual values after the file
//! is loaded.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Command that makes the scale reply with a weight frame
    #[serde(default = "default_weight_request")]
    pub weight_request: String,
    /// 0 disables weight polling
    #[serde(default = "default_weight_poll_interval_ms")]
    pub weight_poll_interval_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud: default_baud(),
            read_timeout_ms: default_read_timeout_ms(),
            weight_request: default_weight_request(),
            weight_poll_interval_ms: default_weight_poll_interval_ms(),
        }
    }
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud() -> u32 {
    9600
}

fn default_read_timeout_ms() -> u64 {
    350 // long enough for an S11 reply at 9600 baud
}

fn default_weight_request() -> String {
    "S11\r".to_string()
}

fn default_weight_poll_interval_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScaleConfig {
    /// Raw weight is divided by this (100 or 1000 depending on scale setup)
    #[serde(default = "default_divisor")]
    pub divisor: f64,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self { divisor: default_divisor(), stale_after_ms: default_stale_after_ms() }
    }
}

fn default_divisor() -> f64 {
    100.0
}

fn default_stale_after_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Scans held for pollers before the oldest is dropped
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { max_pending: default_max_pending() }
    }
}

fn default_max_pending() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrinterConfig {
    #[serde(default = "default_printer_device")]
    pub device: String,
    #[serde(default = "default_printer_queue")]
    pub queue: String,
    #[serde(default = "default_spooler_command")]
    pub spooler_command: String,
    #[serde(default = "default_status_command")]
    pub status_command: String,
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
    #[serde(default = "default_print_timeout_ms")]
    pub print_timeout_ms: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            device: default_printer_device(),
            queue: default_printer_queue(),
            spooler_command: default_spooler_command(),
            status_command: default_status_command(),
            transport_timeout_ms: default_transport_timeout_ms(),
            print_timeout_ms: default_print_timeout_ms(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_printer_device() -> String {
    "/dev/usb/lp0".to_string()
}

fn default_printer_queue() -> String {
    "epson_pos".to_string()
}

fn default_spooler_command() -> String {
    "lp".to_string()
}

fn default_status_command() -> String {
    "lpstat".to_string()
}

fn default_transport_timeout_ms() -> u64 {
    6000
}

fn default_print_timeout_ms() -> u64 {
    15000
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Timeout for /barcode, /weight and other non-printing routes
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            request_timeout_ms: default_request_timeout_ms(),
            cors_origin: default_cors_origin(),
        }
    }
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_cors_origin() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { initial_ms: default_reconnect_initial_ms(), max_ms: default_reconnect_max_ms() }
    }
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub scale: ScaleConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    serial_port: String,
    serial_baud: u32,
    serial_read_timeout_ms: u64,
    weight_request: String,
    weight_poll_interval_ms: u64,
    weight_divisor: f64,
    stale_after_ms: u64,
    max_pending_barcodes: usize,
    printer_device: String,
    printer_queue: String,
    spooler_command: String,
    status_command: String,
    transport_timeout_ms: u64,
    print_timeout_ms: u64,
    max_payload_bytes: usize,
    http_host: String,
    http_port: u16,
    request_timeout_ms: u64,
    cors_origin: String,
    reconnect_initial_ms: u64,
    reconnect_max_ms: u64,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            serial_port: toml_config.serial.port,
            serial_baud: toml_config.serial.baud,
            serial_read_timeout_ms: toml_config.serial.read_timeout_ms,
            weight_request: toml_config.serial.weight_request,
            weight_poll_interval_ms: toml_config.serial.weight_poll_interval_ms,
            weight_divisor: toml_config.scale.divisor,
            stale_after_ms: toml_config.scale.stale_after_ms,
            max_pending_barcodes: toml_config.scanner.max_pending,
            printer_device: toml_config.printer.device,
            printer_queue: toml_config.printer.queue,
            spooler_command: toml_config.printer.spooler_command,
            status_command: toml_config.printer.status_command,
            transport_timeout_ms: toml_config.printer.transport_timeout_ms,
            print_timeout_ms: toml_config.printer.print_timeout_ms,
            max_payload_bytes: toml_config.printer.max_payload_bytes,
            http_host: toml_config.http.host,
            http_port: toml_config.http.port,
            request_timeout_ms: toml_config.http.request_timeout_ms,
            cors_origin: toml_config.http.cors_origin,
            reconnect_initial_ms: toml_config.reconnect.initial_ms,
            reconnect_max_ms: toml_config.reconnect.max_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: config_file.to_string(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, &path.display().to_string());
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(self.weight_divisor.is_finite() && self.weight_divisor > 0.0) {
            anyhow::bail!("scale.divisor must be a positive number, got {}", self.weight_divisor);
        }
        if self.serial_read_timeout_ms == 0 {
            anyhow::bail!("serial.read_timeout_ms must be greater than 0");
        }
        if self.max_pending_barcodes == 0 {
            anyhow::bail!("scanner.max_pending must be greater than 0");
        }
        Ok(())
    }

    /// Load configuration from a path, falling back to defaults, then apply
    /// `BRIDGE_*` environment overrides
    pub fn load_from_path(path: &str) -> Self {
        let mut config = match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| env::var(key).ok());
        config
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key = %key, value = %value, "config_env_override_ignored");
                    None
                }
            }
        }

        if let Some(v) = lookup("BRIDGE_SERIAL_PORT") {
            self.serial_port = v;
        }
        if let Some(v) = parsed("BRIDGE_BAUD", lookup("BRIDGE_BAUD")) {
            self.serial_baud = v;
        }
        if let Some(v) = parsed::<f64>("BRIDGE_WEIGHT_DIVISOR", lookup("BRIDGE_WEIGHT_DIVISOR")) {
            if v.is_finite() && v > 0.0 {
                self.weight_divisor = v;
            } else {
                tracing::warn!(value = %v, "config_env_override_ignored");
            }
        }
        if let Some(v) = parsed("BRIDGE_STALE_AFTER_MS", lookup("BRIDGE_STALE_AFTER_MS")) {
            self.stale_after_ms = v;
        }
        if let Some(v) = lookup("BRIDGE_HOST") {
            self.http_host = v;
        }
        if let Some(v) = parsed("BRIDGE_PORT", lookup("BRIDGE_PORT")) {
            self.http_port = v;
        }
        if let Some(v) = lookup("BRIDGE_PRINTER_DEVICE") {
            self.printer_device = v;
        }
        if let Some(v) = lookup("BRIDGE_PRINTER_QUEUE") {
            self.printer_queue = v;
        }
    }

    // Getters for all config fields
    pub fn serial_port(&self) -> &str {
        &self.serial_port
    }

    pub fn serial_baud(&self) -> u32 {
        self.serial_baud
    }

    pub fn serial_read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_read_timeout_ms)
    }

    pub fn weight_request(&self) -> &[u8] {
        self.weight_request.as_bytes()
    }

    /// None when polling is disabled
    pub fn weight_poll_interval(&self) -> Option<Duration> {
        (self.weight_poll_interval_ms > 0).then(|| Duration::from_millis(self.weight_poll_interval_ms))
    }

    pub fn weight_divisor(&self) -> f64 {
        self.weight_divisor
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn max_pending_barcodes(&self) -> usize {
        self.max_pending_barcodes
    }

    pub fn printer_device(&self) -> &str {
        &self.printer_device
    }

    pub fn printer_queue(&self) -> &str {
        &self.printer_queue
    }

    pub fn spooler_command(&self) -> &str {
        &self.spooler_command
    }

    pub fn status_command(&self) -> &str {
        &self.status_command
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn print_timeout(&self) -> Duration {
        Duration::from_millis(self.print_timeout_ms)
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    pub fn http_host(&self) -> &str {
        &self.http_host
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cors_origin(&self) -> &str {
        &self.cors_origin
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Point the printer transports elsewhere (tests, bench rigs)
    pub fn with_printer(mut self, device: &str, spooler_command: &str, status_command: &str) -> Self {
        self.printer_device = device.to_string();
        self.spooler_command = spooler_command.to_string();
        self.status_command = status_command.to_string();
        self
    }
}
