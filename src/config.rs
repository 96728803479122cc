/// Runtime configuration for the link, supervisor, scheduler and WIPS engine.
///
/// Timings are stored as milliseconds so the structs stay `Copy` and map
/// one-to-one onto the companion's JSON settings document. The scheduler and
/// WIPS sections can be updated at runtime from such a document; missing
/// fields keep their defaults.
use core::time::Duration;

use serde::Deserialize;

/// Which radio backs a scan kind that both the internal and external
/// hardware can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioSource {
    /// External when present, otherwise internal.
    Auto,
    Internal,
    External,
    Both,
}

impl RadioSource {
    /// Whether the internal radio should run for this source setting.
    pub fn use_internal(self, external_available: bool) -> bool {
        match self {
            RadioSource::Auto => !external_available,
            RadioSource::Internal | RadioSource::Both => true,
            RadioSource::External => false,
        }
    }

    /// Whether the external radio should run for this source setting.
    pub fn use_external(self, external_available: bool) -> bool {
        external_available && !matches!(self, RadioSource::Internal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RadioSource::Auto => "Auto",
            RadioSource::Internal => "Internal",
            RadioSource::External => "External",
            RadioSource::Both => "Both",
        }
    }
}

/// Link manager settings.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Upper bound on any internal lock acquisition.
    pub lock_timeout_ms: u64,
}

impl LinkConfig {
    pub const fn new() -> Self {
        Self {
            lock_timeout_ms: 500,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Discovery, heartbeat and reconnect policy.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Reply deadline for a synchronous `Ping` or `GetInfo`.
    pub ping_timeout_ms: u64,
    /// Ping attempts before declaring the radio absent.
    pub detect_attempts: u8,
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    /// Consecutive heartbeat send failures that force a disconnect.
    pub max_consecutive_failures: u8,
    /// Settle time before the first detection attempt.
    pub boot_delay_ms: u64,
    /// Worker wake-up period.
    pub tick_ms: u64,
}

impl SupervisorConfig {
    pub const fn new() -> Self {
        Self {
            ping_timeout_ms: 1000,
            detect_attempts: 3,
            heartbeat_interval_ms: 5000,
            reconnect_interval_ms: 10000,
            max_consecutive_failures: 3,
            boot_delay_ms: 100,
            tick_ms: 100,
        }
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Silence longer than this means the radio is gone.
    pub fn rx_silence_limit(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.saturating_mul(3))
    }

    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Detection scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enable_subghz: bool,
    pub enable_ble: bool,
    pub enable_wifi: bool,
    pub enable_ir: bool,
    pub enable_nfc: bool,

    /// Dwell per Sub-GHz frequency.
    pub subghz_hop_interval_ms: u64,
    /// Hop through the frequency table during all downtime.
    pub subghz_continuous: bool,

    pub ble_scan_duration_ms: u64,
    pub ble_scan_interval_ms: u64,

    pub ir_scan_duration_ms: u64,
    pub ir_scan_interval_ms: u64,

    pub wifi_scan_interval_ms: u64,

    /// Periodic receiver recreation.
    pub cleanup_interval_ms: u64,
    pub tick_ms: u64,
    pub lock_timeout_ms: u64,

    pub subghz_source: RadioSource,
    pub ble_source: RadioSource,
    pub wifi_source: RadioSource,
}

impl SchedulerConfig {
    pub const fn new() -> Self {
        Self {
            enable_subghz: true,
            enable_ble: true,
            enable_wifi: true,
            enable_ir: true,
            enable_nfc: true,
            subghz_hop_interval_ms: 2500,
            subghz_continuous: true,
            ble_scan_duration_ms: 2000,
            ble_scan_interval_ms: 5000,
            ir_scan_duration_ms: 3000,
            ir_scan_interval_ms: 10000,
            wifi_scan_interval_ms: 10000,
            cleanup_interval_ms: 60000,
            tick_ms: 100,
            lock_timeout_ms: 500,
            subghz_source: RadioSource::Auto,
            ble_source: RadioSource::Auto,
            // No internal WiFi hardware.
            wifi_source: RadioSource::External,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// WIPS detector switches and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WipsConfig {
    pub detect_evil_twin: bool,
    pub detect_deauth: bool,
    pub detect_karma: bool,
    pub detect_hidden_strong: bool,
    pub detect_weak_encryption: bool,
    pub detect_suspicious_open: bool,
    pub detect_rogue_ap: bool,

    /// Hidden networks stronger than this (dBm) raise an alert.
    pub hidden_strong_rssi: i8,
    pub deauth_window_ms: u32,
    /// Deauth frames within the window that constitute a flood.
    pub deauth_threshold: u32,
    pub karma_window_ms: u32,
    /// Distinct SSIDs answered by one BSSID within the window.
    pub karma_threshold: u8,
}

impl WipsConfig {
    pub const fn new() -> Self {
        Self {
            detect_evil_twin: true,
            detect_deauth: true,
            detect_karma: true,
            detect_hidden_strong: true,
            detect_weak_encryption: true,
            detect_suspicious_open: true,
            detect_rogue_ap: true,
            hidden_strong_rssi: -55,
            deauth_window_ms: 5000,
            deauth_threshold: 10,
            karma_window_ms: 60000,
            karma_threshold: 3,
        }
    }
}

impl Default for WipsConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a WIPS settings document. Absent fields keep their defaults.
pub fn parse_wips_config(data: &[u8]) -> Option<WipsConfig> {
    parse_document(data)
}

/// Parse a scheduler settings document. Absent fields keep their defaults.
pub fn parse_scheduler_config(data: &[u8]) -> Option<SchedulerConfig> {
    parse_document(data)
}

fn parse_document<'de, T: Deserialize<'de>>(data: &'de [u8]) -> Option<T> {
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return None;
    }
    match serde_json_core::from_slice::<T>(trimmed) {
        Ok((config, _)) => Some(config),
        Err(e) => {
            log::warn!("Rejected settings document: {:?}", e);
            None
        }
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && data[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &data[..end]
}
