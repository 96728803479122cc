/// Outward reporting: result serialization and the uplink transport.
///
/// Detections, WIPS alerts, status reports and request errors are rendered
/// as newline-delimited JSON ([`DeviceMessage`]) by a [`ResultSerializer`]
/// and handed to an [`Uplink`] that carries them to the companion app.
/// Both traits take `&self` so detections of different kinds can be
/// reported in parallel; implementations do their own locking.
use std::io::{self, Write};

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use crate::link::LinkState;
use crate::protocol::{
    format_mac, format_uid, DeviceMessage, MacString, MsgBuffer, NameString, MAX_MSG_LEN, VERSION,
};
use crate::scanner::Detection;
use crate::wips::Alert;

/// Scheduler status snapshot for a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub scanning: bool,
    pub uptime_secs: u32,
    pub radio: LinkState,
    pub detections: u32,
    pub alerts: u32,
}

/// Anything reported to the companion.
#[derive(Debug, Clone, Copy)]
pub enum Report<'a> {
    Detection {
        detection: &'a Detection,
        /// Milliseconds since the scheduler started
        ts: u32,
    },
    Alert(&'a Alert),
    Status(StatusReport),
    Error { code: &'static str, msg: &'a str },
}

/// Renders reports into an outgoing byte buffer.
pub trait ResultSerializer: Send + Sync {
    /// Serialize into `buf`, returning the number of bytes written, or
    /// `None` if the report does not fit.
    fn serialize(&self, report: &Report, buf: &mut [u8]) -> Option<usize>;
}

/// Transport towards the companion app.
pub trait Uplink: Send + Sync {
    fn send(&self, bytes: &[u8]) -> io::Result<()>;
}

/// Serialize a DeviceMessage to JSON bytes and write to the output buffer.
/// Returns the number of bytes written, or None if serialization failed.
pub fn serialize_message(msg: &DeviceMessage, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) => {
            // Append newline for NDJSON
            if len < buf.len() {
                buf[len] = b'\n';
                Some(len + 1)
            } else {
                Some(len)
            }
        }
        Err(_) => None,
    }
}

/// NDJSON rendering of [`DeviceMessage`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct NdjsonSerializer;

impl ResultSerializer for NdjsonSerializer {
    fn serialize(&self, report: &Report, buf: &mut [u8]) -> Option<usize> {
        match report {
            Report::Detection { detection, ts } => serialize_detection(detection, *ts, buf),
            Report::Alert(alert) => serialize_alert(alert, buf),
            Report::Status(status) => serialize_message(
                &DeviceMessage::Status {
                    scanning: status.scanning,
                    uptime: status.uptime_secs,
                    radio: status.radio.as_str(),
                    detections: status.detections,
                    alerts: status.alerts,
                    version: VERSION,
                },
                buf,
            ),
            Report::Error { code, msg } => serialize_message(
                &DeviceMessage::Error {
                    code: *code,
                    msg: *msg,
                },
                buf,
            ),
        }
    }
}

fn serialize_detection(detection: &Detection, ts: u32, buf: &mut [u8]) -> Option<usize> {
    match detection {
        Detection::Wifi(net) => {
            let mac = format_mac(&net.bssid);
            serialize_message(
                &DeviceMessage::WiFi {
                    mac: &mac,
                    ssid: &net.ssid,
                    rssi: net.rssi,
                    ch: net.channel,
                    sec: net.security.as_str(),
                    hidden: net.hidden,
                    ts,
                },
                buf,
            )
        }
        Detection::ProbeRequest { client, ssid, rssi } => {
            let mac = format_mac(client);
            serialize_message(
                &DeviceMessage::ProbeRequest {
                    mac: &mac,
                    ssid,
                    rssi: *rssi,
                    ts,
                },
                buf,
            )
        }
        Detection::ProbeResponse { bssid, ssid } => {
            let mac = format_mac(bssid);
            serialize_message(&DeviceMessage::ProbeResponse { mac: &mac, ssid, ts }, buf)
        }
        Detection::Deauth(ev) => {
            let bssid = format_mac(&ev.bssid);
            let target = format_mac(&ev.target);
            serialize_message(
                &DeviceMessage::Deauth {
                    bssid: &bssid,
                    target: &target,
                    reason: ev.reason,
                    rssi: ev.rssi,
                    count: ev.count,
                    ts,
                },
                buf,
            )
        }
        Detection::Ble(dev) => {
            let mac = format_mac(&dev.mac);
            serialize_message(
                &DeviceMessage::Ble {
                    mac: &mac,
                    name: &dev.name,
                    rssi: dev.rssi,
                    uuid: dev.service_uuids_16.first().copied(),
                    mfr: dev.manufacturer_id,
                    ts,
                },
                buf,
            )
        }
        Detection::SubGhz(sig) => serialize_message(
            &DeviceMessage::SubGhz {
                freq: sig.frequency,
                rssi: sig.rssi,
                modulation: sig.modulation,
                dur: sig.duration_ms,
                proto: &sig.protocol,
                ts,
            },
            buf,
        ),
        Detection::Ir(ir) => serialize_message(
            &DeviceMessage::Ir {
                proto: &ir.protocol,
                addr: ir.address,
                cmd: ir.command,
                repeat: ir.repeat,
                ts,
            },
            buf,
        ),
        Detection::Nfc(tag) => {
            let uid = format_uid(&tag.uid);
            serialize_message(
                &DeviceMessage::Nfc {
                    uid: &uid,
                    tag: &tag.type_name,
                    sak: tag.sak,
                    ts,
                },
                buf,
            )
        }
    }
}

fn serialize_alert(alert: &Alert, buf: &mut [u8]) -> Option<usize> {
    let mut bssids = heapless::Vec::<MacString, 4>::new();
    for b in alert.bssids.iter() {
        let _ = bssids.push(format_mac(b));
    }
    let ssid: &NameString = &alert.ssid;
    serialize_message(
        &DeviceMessage::Wips {
            alert: alert.alert_type.as_str(),
            severity: alert.severity.as_str(),
            ssid,
            bssids: &bssids,
            desc: &alert.description,
            ts: alert.timestamp_ms,
        },
        buf,
    )
}

/// Serialize a report into a fresh message buffer.
pub fn render(serializer: &dyn ResultSerializer, report: &Report) -> Option<MsgBuffer> {
    let mut buf = [0u8; MAX_MSG_LEN];
    let len = serializer.serialize(report, &mut buf)?;
    MsgBuffer::from_slice(&buf[..len]).ok()
}

/// Uplink over any byte sink (serial port, socket, file).
pub struct WriterUplink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterUplink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> Uplink for WriterUplink<W> {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut w = self.writer.lock();
        w.write_all(bytes)?;
        w.flush()
    }
}

/// Uplink that forwards each serialized line into a channel, for a
/// transport task running on another thread.
pub struct ChannelUplink {
    tx: Sender<MsgBuffer>,
}

impl ChannelUplink {
    pub fn new(tx: Sender<MsgBuffer>) -> Self {
        Self { tx }
    }
}

impl Uplink for ChannelUplink {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let msg = MsgBuffer::from_slice(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
        self.tx
            .try_send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::WouldBlock, "uplink queue full"))
    }
}
