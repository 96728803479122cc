/// External radio identity, capabilities and response payload layouts.
///
/// All multi-byte integers in radio-originated payloads are little-endian
/// except where noted (the BLE advertisement length is big-endian, as the
/// co-processor firmware writes it).
use heapless::String;

use crate::scanner::{
    BleAdvParser, BleDevice, DeauthEvent, Detection, SecurityType, SubGhzSignal, WifiNetwork,
};

/// Kind of co-processor attached to the serial header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioType {
    None,
    Esp32,
    Esp8266,
    Cc1101,
    Nrf24,
    Cc2500,
    Sx1276,
    MultiBoard,
    Unknown(u8),
}

impl RadioType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => RadioType::None,
            1 => RadioType::Esp32,
            2 => RadioType::Esp8266,
            3 => RadioType::Cc1101,
            4 => RadioType::Nrf24,
            5 => RadioType::Cc2500,
            6 => RadioType::Sx1276,
            10 => RadioType::MultiBoard,
            other => RadioType::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RadioType::Esp32 => "ESP32",
            RadioType::Esp8266 => "ESP8266",
            RadioType::Cc1101 => "CC1101",
            RadioType::Nrf24 => "nRF24L01+",
            RadioType::Cc2500 => "CC2500",
            RadioType::Sx1276 => "SX1276/LoRa",
            RadioType::MultiBoard => "Multi-radio",
            RadioType::None | RadioType::Unknown(_) => "Unknown",
        }
    }
}

/// A single capability bit advertised by the external radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Capability {
    WifiScan = 1 << 0,
    WifiMonitor = 1 << 1,
    WifiDeauth = 1 << 2,
    WifiInject = 1 << 3,
    SubGhzRx = 1 << 4,
    SubGhzTx = 1 << 5,
    BleScan = 1 << 6,
    BleAdv = 1 << 7,
    Nrf24Sniff = 1 << 8,
    Nrf24Inject = 1 << 9,
    Nrf24Mousejack = 1 << 10,
    Zigbee = 1 << 11,
}

/// Capability bitmask from the `GetInfo` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const NONE: Self = Self(0);

    pub fn has(self, cap: Capability) -> bool {
        self.0 & cap as u32 != 0
    }

    pub fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap as u32)
    }
}

/// Length of the NUL-padded name field in the info payload.
pub const INFO_NAME_LEN: usize = 16;

/// Encoded size of the `GetInfo` response: type, name, version, capabilities.
pub const INFO_LEN: usize = 1 + INFO_NAME_LEN + 3 + 4;

/// Identity reported by the external radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioInfo {
    pub radio_type: RadioType,
    pub name: String<INFO_NAME_LEN>,
    pub version: (u8, u8, u8),
    pub capabilities: Capabilities,
}

impl RadioInfo {
    /// Parse a `GetInfo` response payload. Returns `None` if it is short.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < INFO_LEN {
            return None;
        }
        let radio_type = RadioType::from_byte(data[0]);
        let name = nul_terminated(&data[1..1 + INFO_NAME_LEN]);
        let v = &data[1 + INFO_NAME_LEN..1 + INFO_NAME_LEN + 3];
        let caps_at = 1 + INFO_NAME_LEN + 3;
        let caps = u32::from_le_bytes(data[caps_at..caps_at + 4].try_into().ok()?);
        Some(Self {
            radio_type,
            name,
            version: (v[0], v[1], v[2]),
            capabilities: Capabilities(caps),
        })
    }

    /// Encode into the wire layout (used by simulators and tests).
    pub fn encode(&self) -> [u8; INFO_LEN] {
        let mut out = [0u8; INFO_LEN];
        out[0] = match self.radio_type {
            RadioType::None => 0,
            RadioType::Esp32 => 1,
            RadioType::Esp8266 => 2,
            RadioType::Cc1101 => 3,
            RadioType::Nrf24 => 4,
            RadioType::Cc2500 => 5,
            RadioType::Sx1276 => 6,
            RadioType::MultiBoard => 10,
            RadioType::Unknown(b) => b,
        };
        let name = self.name.as_bytes();
        let n = name.len().min(INFO_NAME_LEN);
        out[1..1 + n].copy_from_slice(&name[..n]);
        out[1 + INFO_NAME_LEN] = self.version.0;
        out[2 + INFO_NAME_LEN] = self.version.1;
        out[3 + INFO_NAME_LEN] = self.version.2;
        out[4 + INFO_NAME_LEN..].copy_from_slice(&self.capabilities.0.to_le_bytes());
        out
    }
}

/// Encoded size of a `WifiNetwork` record.
pub const EXT_WIFI_NETWORK_LEN: usize = 33 + 6 + 1 + 1 + 1 + 1 + 2;

/// Encoded size of a `WifiDeauth` record.
pub const EXT_WIFI_DEAUTH_LEN: usize = 6 + 6 + 1 + 1 + 4;

/// Encoded size of a `WifiProbe` record.
pub const EXT_WIFI_PROBE_LEN: usize = 6 + 33 + 1 + 1 + 4;

/// Header size of a `SubGhzSignal` record; raw samples follow.
pub const EXT_SUBGHZ_SIGNAL_LEN: usize = 4 + 1 + 1 + 2 + 2;

/// Minimum size of an external BLE device record.
pub const EXT_BLE_DEVICE_MIN_LEN: usize = 10;

/// Parse a `WifiNetwork` response record.
pub fn parse_wifi_network(data: &[u8]) -> Option<WifiNetwork> {
    if data.len() < EXT_WIFI_NETWORK_LEN {
        return None;
    }
    let ssid = nul_terminated(&data[..33]);
    let bssid: [u8; 6] = data[33..39].try_into().ok()?;
    Some(WifiNetwork {
        ssid,
        bssid,
        rssi: data[39] as i8,
        channel: data[40],
        security: SecurityType::from_byte(data[41]),
        hidden: data[42] != 0,
    })
}

/// Parse a `WifiDeauth` response record.
pub fn parse_wifi_deauth(data: &[u8]) -> Option<DeauthEvent> {
    if data.len() < EXT_WIFI_DEAUTH_LEN {
        return None;
    }
    Some(DeauthEvent {
        bssid: data[0..6].try_into().ok()?,
        target: data[6..12].try_into().ok()?,
        reason: data[12],
        rssi: data[13] as i8,
        count: u32::from_le_bytes(data[14..18].try_into().ok()?),
    })
}

/// Parse a `WifiProbe` record: a client probing for a network.
pub fn parse_wifi_probe(data: &[u8]) -> Option<Detection> {
    if data.len() < EXT_WIFI_PROBE_LEN {
        return None;
    }
    Some(Detection::ProbeRequest {
        client: data[0..6].try_into().ok()?,
        ssid: nul_terminated(&data[6..39]),
        rssi: data[39] as i8,
    })
}

/// Parse a `SubGhzSignal` record header. The raw sample data is not kept.
pub fn parse_subghz_signal(data: &[u8]) -> Option<SubGhzSignal> {
    if data.len() < EXT_SUBGHZ_SIGNAL_LEN {
        return None;
    }
    Some(SubGhzSignal {
        frequency: u32::from_le_bytes(data[0..4].try_into().ok()?),
        rssi: data[4] as i8,
        modulation: data[5],
        duration_ms: u16::from_le_bytes([data[6], data[7]]),
        protocol: String::new(),
    })
}

/// Parse an external BLE device record:
/// `[mac:6][addr_type][rssi][adv_len:u16 BE][adv data...]`.
///
/// A record whose declared advertisement length runs past the end is
/// truncated to the bytes actually present.
pub fn parse_ble_device(data: &[u8]) -> Option<BleDevice> {
    if data.len() < EXT_BLE_DEVICE_MIN_LEN {
        log::warn!("External BLE device record too short: {} bytes", data.len());
        return None;
    }
    let mac: [u8; 6] = data[0..6].try_into().ok()?;
    let rssi = data[7] as i8;
    let declared = u16::from_be_bytes([data[8], data[9]]) as usize;
    let available = data.len() - EXT_BLE_DEVICE_MIN_LEN;
    if declared > available {
        log::warn!(
            "External BLE record truncated: adv_len={}, available={}",
            declared,
            available
        );
    }
    let adv = &data[EXT_BLE_DEVICE_MIN_LEN..EXT_BLE_DEVICE_MIN_LEN + declared.min(available)];
    Some(BleAdvParser::parse(&mac, rssi, adv))
}

/// Copy a NUL-padded byte field into a bounded string, dropping invalid UTF-8.
fn nul_terminated<const N: usize>(field: &[u8]) -> String<N> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let mut s = String::new();
    if let Ok(text) = core::str::from_utf8(&field[..end]) {
        for ch in text.chars() {
            if s.push(ch).is_err() {
                break;
            }
        }
    }
    s
}
