/// JSON message protocol for results reported to the companion app.
///
/// All messages are newline-delimited JSON (NDJSON), one object per line,
/// tagged by `"type"`. Uses `heapless` types so a message can be built and
/// serialized without touching the heap.
use heapless::{String, Vec};
use serde::Serialize;

/// Maximum length for MAC address strings ("AA:BB:CC:DD:EE:FF")
pub type MacString = String<18>;

/// Maximum length for SSID / device name strings
pub type NameString = String<33>;

/// Hex-encoded NFC UID (up to 10 bytes)
pub type UidString = String<21>;

/// Alert description text
pub type DescString = String<64>;

/// Messages sent from the device to the companion app
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// Access point sighting
    #[serde(rename = "wifi")]
    WiFi {
        mac: &'a MacString,
        ssid: &'a NameString,
        rssi: i8,
        ch: u8,
        /// "open", "wep", "wpa", "wpa2", ...
        sec: &'static str,
        hidden: bool,
        /// Milliseconds since the scheduler started
        ts: u32,
    },
    /// Client probe request
    #[serde(rename = "probe")]
    ProbeRequest {
        mac: &'a MacString,
        ssid: &'a NameString,
        rssi: i8,
        ts: u32,
    },
    /// Probe response observed (karma input)
    #[serde(rename = "probe_resp")]
    ProbeResponse {
        mac: &'a MacString,
        ssid: &'a NameString,
        ts: u32,
    },
    /// Deauthentication activity
    #[serde(rename = "deauth")]
    Deauth {
        bssid: &'a MacString,
        target: &'a MacString,
        reason: u8,
        rssi: i8,
        count: u32,
        ts: u32,
    },
    /// BLE advertisement
    #[serde(rename = "ble")]
    Ble {
        mac: &'a MacString,
        name: &'a NameString,
        rssi: i8,
        /// First 16-bit service UUID, if advertised
        #[serde(skip_serializing_if = "Option::is_none")]
        uuid: Option<u16>,
        /// Manufacturer company ID
        mfr: u16,
        ts: u32,
    },
    /// Sub-GHz transmission
    #[serde(rename = "subghz")]
    SubGhz {
        freq: u32,
        rssi: i8,
        modulation: u8,
        dur: u16,
        #[serde(skip_serializing_if = "str::is_empty")]
        proto: &'a str,
        ts: u32,
    },
    /// Infrared command
    #[serde(rename = "ir")]
    Ir {
        proto: &'a str,
        addr: u32,
        cmd: u32,
        repeat: bool,
        ts: u32,
    },
    /// NFC tag in field
    #[serde(rename = "nfc")]
    Nfc {
        uid: &'a UidString,
        tag: &'a str,
        sak: u8,
        ts: u32,
    },
    /// WIPS alert
    #[serde(rename = "wips")]
    Wips {
        alert: &'static str,
        severity: &'static str,
        ssid: &'a NameString,
        bssids: &'a Vec<MacString, 4>,
        desc: &'a DescString,
        ts: u32,
    },
    /// Device status report
    #[serde(rename = "status")]
    Status {
        scanning: bool,
        /// Uptime in seconds
        uptime: u32,
        /// External radio link state: "connected", "connecting", "disconnected"
        radio: &'static str,
        detections: u32,
        alerts: u32,
        /// Library version
        version: &'static str,
    },
    /// Structured error reported for a failed request
    #[serde(rename = "error")]
    Error { code: &'static str, msg: &'a str },
}

/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;

/// Format a MAC as colon-separated uppercase hex.
pub fn format_mac(mac: &[u8; 6]) -> MacString {
    use core::fmt::Write;
    let mut buf = MacString::new();
    let _ = write!(
        buf,
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
    buf
}

/// Format an NFC UID as contiguous uppercase hex.
pub fn format_uid(uid: &[u8]) -> UidString {
    use core::fmt::Write;
    let mut buf = UidString::new();
    for b in uid.iter().take(10) {
        let _ = write!(buf, "{:02X}", b);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json(msg: &DeviceMessage) -> std::string::String {
        let mut buf = [0u8; MAX_MSG_LEN];
        let len = serde_json_core::to_slice(msg, &mut buf).unwrap();
        core::str::from_utf8(&buf[..len]).unwrap().into()
    }

    #[test]
    fn mac_formatting() {
        let mac = format_mac(&[0xB4, 0x1E, 0x52, 0xAB, 0xCD, 0xEF]);
        assert_eq!(mac.as_str(), "B4:1E:52:AB:CD:EF");
    }

    #[test]
    fn uid_formatting() {
        assert_eq!(format_uid(&[0x04, 0xA1, 0xFF, 0x00]).as_str(), "04A1FF00");
        assert_eq!(format_uid(&[0xAB; 12]).len(), 20);
    }

    #[test]
    fn serialize_status_message() {
        let msg = DeviceMessage::Status {
            scanning: true,
            uptime: 120,
            radio: "connected",
            detections: 42,
            alerts: 3,
            version: "0.1.0",
        };
        let json = to_json(&msg);
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""scanning":true"#));
        assert!(json.contains(r#""uptime":120"#));
        assert!(json.contains(r#""radio":"connected""#));
    }

    #[test]
    fn serialize_wifi_message() {
        let mac = MacString::try_from("B4:1E:52:AB:CD:EF").unwrap();
        let ssid = NameString::try_from("Corp").unwrap();
        let msg = DeviceMessage::WiFi {
            mac: &mac,
            ssid: &ssid,
            rssi: -45,
            ch: 6,
            sec: "wpa2",
            hidden: false,
            ts: 1000,
        };
        let json = to_json(&msg);
        assert!(json.contains(r#""type":"wifi""#));
        assert!(json.contains(r#""mac":"B4:1E:52:AB:CD:EF""#));
        assert!(json.contains(r#""ssid":"Corp""#));
        assert!(json.contains(r#""rssi":-45"#));
        assert!(json.contains(r#""sec":"wpa2""#));
    }

    #[test]
    fn serialize_ble_without_uuid_omits_field() {
        let mac = MacString::try_from("58:8E:81:AA:BB:CC").unwrap();
        let name = NameString::try_from("FS Ext Battery").unwrap();
        let msg = DeviceMessage::Ble {
            mac: &mac,
            name: &name,
            rssi: -60,
            uuid: None,
            mfr: 0x09C8,
            ts: 2000,
        };
        let json = to_json(&msg);
        assert!(json.contains(r#""type":"ble""#));
        assert!(json.contains(r#""mfr":2504"#));
        assert!(!json.contains("uuid"));
    }

    #[test]
    fn serialize_wips_alert() {
        let ssid = NameString::try_from("Corp").unwrap();
        let mut bssids = Vec::<MacString, 4>::new();
        let _ = bssids.push(MacString::try_from("AA:BB:CC:DD:EE:01").unwrap());
        let _ = bssids.push(MacString::try_from("AA:BB:CC:DD:EE:02").unwrap());
        let desc = DescString::try_from("2 APs share this SSID").unwrap();
        let msg = DeviceMessage::Wips {
            alert: "evil_twin",
            severity: "high",
            ssid: &ssid,
            bssids: &bssids,
            desc: &desc,
            ts: 5,
        };
        let json = to_json(&msg);
        assert!(json.contains(r#""type":"wips""#));
        assert!(json.contains(r#""alert":"evil_twin""#));
        assert!(json.contains(r#""bssids":["AA:BB:CC:DD:EE:01","AA:BB:CC:DD:EE:02"]"#));
    }

    #[test]
    fn serialize_subghz_without_protocol() {
        let msg = DeviceMessage::SubGhz {
            freq: 433_920_000,
            rssi: -70,
            modulation: 0,
            dur: 120,
            proto: "",
            ts: 9,
        };
        let json = to_json(&msg);
        assert!(json.contains(r#""freq":433920000"#));
        assert!(!json.contains("proto"));
    }

    #[test]
    fn serialize_error() {
        let json = to_json(&DeviceMessage::Error {
            code: "hardware_unavailable",
            msg: "no external radio",
        });
        assert_eq!(
            json,
            r#"{"type":"error","code":"hardware_unavailable","msg":"no external radio"}"#
        );
    }

    #[test]
    fn version_is_semver() {
        let parts: heapless::Vec<&str, 4> = VERSION.split('.').collect();
        assert_eq!(
            parts.len(),
            3,
            "VERSION should be semver (major.minor.patch)"
        );
        for part in &parts {
            assert!(part.parse::<u32>().is_ok(), "'{part}' is not a number");
        }
    }
}
