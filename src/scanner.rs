/// Normalized detection types and the scanner collaborator interface.
///
/// WiFi: raw 802.11 management frames are normalized with the ieee80211
/// crate (beacons, probes) plus a raw header parse for deauthentication and
/// anything the crate does not model.
/// BLE: advertisement AD structures are parsed by [`BleAdvParser`], for both
/// internal advertisement reports and external-radio device records.
///
/// Scanner drivers implement [`Scanner`]; the scheduler only ever calls
/// start/stop/frequency/reset on them and receives [`Detection`]s back.
use heapless::{String, Vec};

use ieee80211::match_frames;
use ieee80211::mgmt_frame::{BeaconFrame, ProbeRequestFrame, ProbeResponseFrame};

use crate::error::ScanError;
use crate::protocol::NameString;

/// 6-byte hardware address.
pub type Mac = [u8; 6];

/// Logical scan kinds the scheduler arbitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    SubGhz,
    Ble,
    Wifi,
    Ir,
    Nfc,
}

impl ScanKind {
    pub const ALL: [ScanKind; 5] = [
        ScanKind::SubGhz,
        ScanKind::Ble,
        ScanKind::Wifi,
        ScanKind::Ir,
        ScanKind::Nfc,
    ];

    pub fn index(self) -> usize {
        match self {
            ScanKind::SubGhz => 0,
            ScanKind::Ble => 1,
            ScanKind::Wifi => 2,
            ScanKind::Ir => 3,
            ScanKind::Nfc => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::SubGhz => "subghz",
            ScanKind::Ble => "ble",
            ScanKind::Wifi => "wifi",
            ScanKind::Ir => "ir",
            ScanKind::Nfc => "nfc",
        }
    }
}

/// WiFi security classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    Open,
    Wep,
    Wpa,
    Wpa2,
    Wpa3,
    Wpa2Enterprise,
    Wpa3Enterprise,
    Unknown,
}

impl SecurityType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => SecurityType::Open,
            1 => SecurityType::Wep,
            2 => SecurityType::Wpa,
            3 => SecurityType::Wpa2,
            4 => SecurityType::Wpa3,
            5 => SecurityType::Wpa2Enterprise,
            6 => SecurityType::Wpa3Enterprise,
            _ => SecurityType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityType::Open => "open",
            SecurityType::Wep => "wep",
            SecurityType::Wpa => "wpa",
            SecurityType::Wpa2 => "wpa2",
            SecurityType::Wpa3 => "wpa3",
            SecurityType::Wpa2Enterprise => "wpa2_ent",
            SecurityType::Wpa3Enterprise => "wpa3_ent",
            SecurityType::Unknown => "unknown",
        }
    }

    /// Deprecated encryption that should raise a weak-encryption alert.
    pub fn is_weak(&self) -> bool {
        matches!(self, SecurityType::Wep)
    }
}

/// One access point sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiNetwork {
    pub ssid: NameString,
    pub bssid: Mac,
    pub rssi: i8,
    pub channel: u8,
    pub security: SecurityType,
    pub hidden: bool,
}

/// Deauthentication/disassociation activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeauthEvent {
    pub bssid: Mac,
    pub target: Mac,
    pub reason: u8,
    pub rssi: i8,
    /// Frames represented by this event (1 for a single sniffed frame).
    pub count: u32,
}

/// A parsed BLE advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleDevice {
    pub mac: Mac,
    pub name: NameString,
    pub rssi: i8,
    /// 16-bit service UUIDs extracted from AD structures
    pub service_uuids_16: Vec<u16, 8>,
    /// Manufacturer company ID (0 if not present)
    pub manufacturer_id: u16,
}

/// A decoded or unidentified Sub-GHz transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubGhzSignal {
    pub frequency: u32,
    pub rssi: i8,
    pub modulation: u8,
    pub duration_ms: u16,
    pub protocol: String<16>,
}

/// A decoded infrared command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrSignal {
    pub protocol: String<16>,
    pub address: u32,
    pub command: u32,
    pub repeat: bool,
}

/// An NFC tag or card in the field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfcTag {
    pub uid: Vec<u8, 10>,
    pub type_name: String<16>,
    pub sak: u8,
}

/// Normalized detection event delivered by scanners to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Wifi(WifiNetwork),
    Deauth(DeauthEvent),
    /// A client asking for a network by name.
    ProbeRequest { client: Mac, ssid: NameString, rssi: i8 },
    /// An access point answering a probe (karma input).
    ProbeResponse { bssid: Mac, ssid: NameString },
    Ble(BleDevice),
    SubGhz(SubGhzSignal),
    Ir(IrSignal),
    Nfc(NfcTag),
}

impl Detection {
    pub fn kind(&self) -> ScanKind {
        match self {
            Detection::Wifi(_)
            | Detection::Deauth(_)
            | Detection::ProbeRequest { .. }
            | Detection::ProbeResponse { .. } => ScanKind::Wifi,
            Detection::Ble(_) => ScanKind::Ble,
            Detection::SubGhz(_) => ScanKind::SubGhz,
            Detection::Ir(_) => ScanKind::Ir,
            Detection::Nfc(_) => ScanKind::Nfc,
        }
    }
}

/// Driver-side interface the scheduler drives for one scan kind.
///
/// Implementations wrap a concrete radio driver. Only `start_scan` and
/// `stop_scan` are mandatory.
pub trait Scanner: Send {
    fn start_scan(&mut self) -> Result<(), ScanError>;

    fn stop_scan(&mut self);

    fn is_running(&self) -> bool;

    /// Retune the receiver (Sub-GHz only).
    fn set_frequency(&mut self, _hz: u32) -> Result<(), ScanError> {
        Err(ScanError::Unsupported)
    }

    /// Recreate long-lived receiver objects.
    fn reset(&mut self) -> Result<(), ScanError> {
        Ok(())
    }

    /// Whether a decode is in progress and retuning/cleanup should wait.
    fn is_decoding(&self) -> bool {
        false
    }
}

/// WiFi frame type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Beacon,
    ProbeRequest,
    ProbeResponse,
    Deauth,
    Data,
    Other,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Beacon => "beacon",
            FrameType::ProbeRequest => "probe_req",
            FrameType::ProbeResponse => "probe_resp",
            FrameType::Deauth => "deauth",
            FrameType::Data => "data",
            FrameType::Other => "other",
        }
    }
}

/// A parsed WiFi frame event
#[derive(Debug, Clone)]
pub struct WiFiEvent {
    pub mac: Mac,
    pub ssid: NameString,
    pub rssi: i8,
    pub channel: u8,
    pub frame_type: FrameType,
}

// 802.11 management header is 24 bytes; beacon/probe-response fixed fields
// (timestamp, interval, capability) follow.
const MGMT_HEADER_LEN: usize = 24;
const CAPABILITY_OFFSET: usize = MGMT_HEADER_LEN + 10;
const IE_OFFSET: usize = MGMT_HEADER_LEN + 12;
const CAP_PRIVACY: u16 = 0x0010;

const SUBTYPE_DISASSOC: u8 = 10;
const SUBTYPE_DEAUTH: u8 = 12;

/// Parse a raw 802.11 frame into a WiFiEvent using the ieee80211 crate.
///
/// Management frames (beacons, probes) are parsed with full SSID extraction.
/// Deauthentication/disassociation and everything else fall through to a raw
/// header parse that extracts the transmitter MAC (Address 2, offset 10).
pub fn parse_wifi_frame(frame: &[u8], rssi: i8, channel: u8) -> Option<WiFiEvent> {
    let result = match_frames! {
        frame,
        beacon = BeaconFrame<'_> => {
            build_wifi_event(
                &beacon.header.transmitter_address.0,
                beacon.body.ssid().unwrap_or(""),
                rssi, channel, FrameType::Beacon,
            )
        }
        probe_req = ProbeRequestFrame<'_> => {
            build_wifi_event(
                &probe_req.header.transmitter_address.0,
                probe_req.body.ssid().unwrap_or(""),
                rssi, channel, FrameType::ProbeRequest,
            )
        }
        probe_resp = ProbeResponseFrame<'_> => {
            build_wifi_event(
                &probe_resp.header.transmitter_address.0,
                probe_resp.body.ssid().unwrap_or(""),
                rssi, channel, FrameType::ProbeResponse,
            )
        }
    };

    match result {
        Ok(event) => Some(event),
        Err(_) => {
            // Minimum 16 bytes: frame ctrl, duration, addr1, addr2
            if frame.len() < 16 {
                return None;
            }
            let frame_type = match ((frame[0] >> 2) & 0x3, frame[0] >> 4) {
                (0, SUBTYPE_DEAUTH) | (0, SUBTYPE_DISASSOC) => FrameType::Deauth,
                (2, _) => FrameType::Data,
                _ => FrameType::Other,
            };
            let mac: Mac = frame[10..16].try_into().ok()?;
            Some(build_wifi_event(&mac, "", rssi, channel, frame_type))
        }
    }
}

/// Normalize a raw 802.11 frame into a scheduler detection.
///
/// Beacons become network sightings, probe responses feed karma tracking,
/// deauth/disassoc frames feed flood tracking, probe requests are reported
/// as-is. Other frames yield `None`.
pub fn normalize_frame(frame: &[u8], rssi: i8, channel: u8) -> Option<Detection> {
    let event = parse_wifi_frame(frame, rssi, channel)?;
    match event.frame_type {
        FrameType::Beacon => {
            let bssid: Mac = frame.get(16..22)?.try_into().ok()?;
            Some(Detection::Wifi(WifiNetwork {
                hidden: event.ssid.is_empty(),
                ssid: event.ssid,
                bssid,
                rssi,
                channel,
                security: classify_security(frame),
            }))
        }
        FrameType::ProbeRequest => Some(Detection::ProbeRequest {
            client: event.mac,
            ssid: event.ssid,
            rssi,
        }),
        FrameType::ProbeResponse => Some(Detection::ProbeResponse {
            bssid: event.mac,
            ssid: event.ssid,
        }),
        FrameType::Deauth => {
            let target: Mac = frame.get(4..10)?.try_into().ok()?;
            let bssid: Mac = frame.get(16..22)?.try_into().ok()?;
            // Reason code is a little-endian u16; every defined code fits a byte.
            let reason = frame.get(MGMT_HEADER_LEN).copied().unwrap_or(0);
            Some(Detection::Deauth(DeauthEvent {
                bssid,
                target,
                reason,
                rssi,
                count: 1,
            }))
        }
        _ => None,
    }
}

/// Derive security from the capability privacy bit and RSN/WPA elements.
fn classify_security(frame: &[u8]) -> SecurityType {
    let Some(cap) = frame.get(CAPABILITY_OFFSET..CAPABILITY_OFFSET + 2) else {
        return SecurityType::Unknown;
    };
    let privacy = u16::from_le_bytes([cap[0], cap[1]]) & CAP_PRIVACY != 0;

    let mut rsn = false;
    let mut wpa = false;
    let ies = frame.get(IE_OFFSET..).unwrap_or(&[]);
    let mut pos = 0;
    while pos + 2 <= ies.len() {
        let id = ies[pos];
        let len = ies[pos + 1] as usize;
        let Some(body) = ies.get(pos + 2..pos + 2 + len) else {
            break;
        };
        match id {
            48 => rsn = true,
            221 if body.starts_with(&[0x00, 0x50, 0xF2, 0x01]) => wpa = true,
            _ => {}
        }
        pos += 2 + len;
    }

    match (privacy, rsn, wpa) {
        (false, _, _) => SecurityType::Open,
        (true, true, _) => SecurityType::Wpa2,
        (true, false, true) => SecurityType::Wpa,
        (true, false, false) => SecurityType::Wep,
    }
}

fn build_wifi_event(
    mac: &Mac,
    ssid: &str,
    rssi: i8,
    channel: u8,
    frame_type: FrameType,
) -> WiFiEvent {
    let mut ssid_str = NameString::new();
    let _ = ssid_str.push_str(ssid);
    WiFiEvent {
        mac: *mac,
        ssid: ssid_str,
        rssi,
        channel,
        frame_type,
    }
}

/// Parse BLE advertisement data (AD structures) to extract service UUIDs,
/// local name and manufacturer ID.
///
/// AD structure format: [length] [type] [data...]
/// Types we care about:
///   0x02/0x03 = Incomplete/Complete list of 16-bit service UUIDs
///   0x08/0x09 = Shortened/Complete local name
///   0xFF      = Manufacturer specific data (first 2 bytes = company ID, little-endian)
pub struct BleAdvParser;

impl BleAdvParser {
    pub fn parse(addr: &Mac, rssi: i8, ad_data: &[u8]) -> BleDevice {
        let mut device = BleDevice {
            mac: *addr,
            name: NameString::new(),
            rssi,
            service_uuids_16: Vec::new(),
            manufacturer_id: 0,
        };

        let mut pos = 0;
        while pos < ad_data.len() {
            let len = ad_data[pos] as usize;
            if len == 0 || pos + 1 + len > ad_data.len() {
                break;
            }

            let ad_type = ad_data[pos + 1];
            let data = &ad_data[pos + 2..pos + 1 + len];

            match ad_type {
                0x02 | 0x03 => {
                    let mut i = 0;
                    while i + 1 < data.len() {
                        let uuid = u16::from_le_bytes([data[i], data[i + 1]]);
                        let _ = device.service_uuids_16.push(uuid);
                        i += 2;
                    }
                }
                0x08 | 0x09 => {
                    if let Ok(name) = core::str::from_utf8(data) {
                        let _ = device.name.push_str(name);
                    }
                }
                0xFF => {
                    if data.len() >= 2 {
                        device.manufacturer_id = u16::from_le_bytes([data[0], data[1]]);
                    }
                }
                _ => {}
            }

            pos += 1 + len;
        }

        device
    }
}
