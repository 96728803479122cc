/// Binary frame codec for the external radio co-processor link.
///
/// Wire format (byte stream, no delimiters besides the start marker):
///
/// ```text
/// [0xA5][LEN_HI][LEN_LO][CMD][PAYLOAD ... LEN bytes][CRC]
/// CRC = LEN_HI ^ LEN_LO ^ CMD ^ payload[0] ^ ... ^ payload[LEN-1]
/// ```
///
/// Encoding is a single call. Decoding is the byte-driven [`FrameDecoder`]
/// state machine, because the serial channel has no message boundaries and
/// must resynchronize on the next start marker after any corruption.
use crate::error::FrameError;

/// Start-of-frame marker.
pub const START_BYTE: u8 = 0xA5;

/// Maximum payload length carried by one frame.
pub const MAX_PAYLOAD: usize = 512;

/// Header bytes preceding the payload: start, len hi, len lo, command.
pub const HEADER_LEN: usize = 4;

/// Largest possible encoded frame.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD + 1;

/// Commands sent to the external radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Ping = 0x01,
    GetInfo = 0x02,
    Reset = 0x03,

    WifiScanStart = 0x10,
    WifiScanStop = 0x11,
    WifiSetChannel = 0x12,
    WifiSetMode = 0x13,
    WifiDeauth = 0x14,
    WifiProbe = 0x15,

    SubGhzSetFreq = 0x20,
    SubGhzSetMod = 0x21,
    SubGhzRxStart = 0x22,
    SubGhzRxStop = 0x23,
    SubGhzTxStart = 0x24,
    SubGhzTxStop = 0x25,
    SubGhzGetRssi = 0x26,
    SubGhzSetPreset = 0x27,

    BleScanStart = 0x30,
    BleScanStop = 0x31,
    BleSetChannel = 0x32,

    Nrf24SniffStart = 0x40,
    Nrf24SniffStop = 0x41,
    Nrf24SetChannel = 0x42,
    Nrf24SetAddress = 0x43,
    Nrf24Tx = 0x44,
    Nrf24Config = 0x45,
    Nrf24Mousejack = 0x46,

    ZigbeeScanStart = 0x50,
    ZigbeeScanStop = 0x51,
    ZigbeeBeacon = 0x52,
    ZigbeeSetChannel = 0x53,
}

impl Command {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Response and event codes sent by the external radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Response {
    Ack = 0x01,
    Nack = 0x02,
    Info = 0x03,

    WifiNetwork = 0x10,
    WifiScanDone = 0x11,
    WifiProbe = 0x12,
    WifiDeauth = 0x13,
    WifiRaw = 0x14,

    SubGhzSignal = 0x20,
    SubGhzRssi = 0x21,
    SubGhzRaw = 0x22,

    BleDevice = 0x30,
    BleScanDone = 0x31,

    Nrf24Packet = 0x40,
    Nrf24SniffDone = 0x41,
    Nrf24TxDone = 0x42,
}

impl Response {
    /// Map a received command byte to a known response code.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let resp = match byte {
            0x01 => Self::Ack,
            0x02 => Self::Nack,
            0x03 => Self::Info,
            0x10 => Self::WifiNetwork,
            0x11 => Self::WifiScanDone,
            0x12 => Self::WifiProbe,
            0x13 => Self::WifiDeauth,
            0x14 => Self::WifiRaw,
            0x20 => Self::SubGhzSignal,
            0x21 => Self::SubGhzRssi,
            0x22 => Self::SubGhzRaw,
            0x30 => Self::BleDevice,
            0x31 => Self::BleScanDone,
            0x40 => Self::Nrf24Packet,
            0x41 => Self::Nrf24SniffDone,
            0x42 => Self::Nrf24TxDone,
            _ => return None,
        };
        Some(resp)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// XOR checksum over length bytes, command and payload.
pub fn checksum(command: u8, payload: &[u8]) -> u8 {
    let len = payload.len() as u16;
    let [hi, lo] = len.to_be_bytes();
    payload.iter().fold(hi ^ lo ^ command, |crc, &b| crc ^ b)
}

/// Encode one frame. Fails if the payload exceeds [`MAX_PAYLOAD`].
pub fn encode(command: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let [hi, lo] = (payload.len() as u16).to_be_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    out.extend_from_slice(&[START_BYTE, hi, lo, command]);
    out.extend_from_slice(payload);
    out.push(checksum(command, payload));
    Ok(out)
}

/// A complete, checksum-valid frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

/// Receive state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    WaitStart,
    LenHigh,
    LenLow,
    Cmd,
    Payload,
    Crc,
}

/// Outcome of feeding one byte into the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// More bytes are needed.
    Pending,
    /// A valid frame completed on this byte.
    Frame(Frame),
    /// A frame was dropped; the decoder is back in `WaitStart`.
    Dropped(FrameError),
}

/// Byte-driven frame decoder.
///
/// Never allocates past `MAX_PAYLOAD` and never consumes bytes following an
/// oversized length header as payload.
pub struct FrameDecoder {
    state: RxState,
    len: u16,
    cmd: u8,
    crc: u8,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: RxState::WaitStart,
            len: 0,
            cmd: 0,
            crc: 0,
            buf: Vec::with_capacity(MAX_PAYLOAD),
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    /// Drop any partial frame and wait for the next start marker.
    pub fn reset(&mut self) {
        self.state = RxState::WaitStart;
        self.buf.clear();
    }

    /// Feed a single byte.
    pub fn feed(&mut self, byte: u8) -> Feed {
        match self.state {
            RxState::WaitStart => {
                if byte == START_BYTE {
                    self.state = RxState::LenHigh;
                    self.crc = 0;
                    self.buf.clear();
                }
            }
            RxState::LenHigh => {
                self.len = (byte as u16) << 8;
                self.crc ^= byte;
                self.state = RxState::LenLow;
            }
            RxState::LenLow => {
                self.len |= byte as u16;
                self.crc ^= byte;
                if self.len as usize > MAX_PAYLOAD {
                    let len = self.len;
                    self.reset();
                    return Feed::Dropped(FrameError::DeclaredLengthTooLarge(len));
                }
                self.state = RxState::Cmd;
            }
            RxState::Cmd => {
                self.cmd = byte;
                self.crc ^= byte;
                self.state = if self.len > 0 {
                    RxState::Payload
                } else {
                    RxState::Crc
                };
            }
            RxState::Payload => {
                self.buf.push(byte);
                self.crc ^= byte;
                if self.buf.len() >= self.len as usize {
                    self.state = RxState::Crc;
                }
            }
            RxState::Crc => {
                let expected = self.crc;
                self.state = RxState::WaitStart;
                if byte != expected {
                    self.buf.clear();
                    return Feed::Dropped(FrameError::ChecksumMismatch {
                        expected,
                        got: byte,
                    });
                }
                let payload = core::mem::take(&mut self.buf);
                self.buf.reserve(MAX_PAYLOAD);
                return Feed::Frame(Frame {
                    command: self.cmd,
                    payload,
                });
            }
        }
        Feed::Pending
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(dec: &mut FrameDecoder, bytes: &[u8]) -> (Vec<Frame>, Vec<FrameError>) {
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        for &b in bytes {
            match dec.feed(b) {
                Feed::Frame(f) => frames.push(f),
                Feed::Dropped(e) => errors.push(e),
                Feed::Pending => {}
            }
        }
        (frames, errors)
    }

    #[test]
    fn encode_ping_layout() {
        let bytes = encode(Command::Ping.as_byte(), &[]).unwrap();
        assert_eq!(bytes, vec![0xA5, 0x00, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn encode_checksum_covers_length_and_payload() {
        let bytes = encode(0x15, &[0x03, b'a', b'b', b'c']).unwrap();
        assert_eq!(&bytes[..4], &[0xA5, 0x00, 0x04, 0x15]);
        let crc = 0x00 ^ 0x04 ^ 0x15 ^ 0x03 ^ b'a' ^ b'b' ^ b'c';
        assert_eq!(*bytes.last().unwrap(), crc);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            encode(0x01, &payload),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn round_trip_at_size_boundaries() {
        let mut dec = FrameDecoder::new();
        for n in [0usize, 1, 255, 256, MAX_PAYLOAD - 1, MAX_PAYLOAD] {
            let payload: Vec<u8> = (0..n).map(|i| (i * 7) as u8).collect();
            let bytes = encode(0x30, &payload).unwrap();
            let (frames, errors) = decode_all(&mut dec, &bytes);
            assert!(errors.is_empty(), "n={n}");
            assert_eq!(frames, vec![Frame { command: 0x30, payload }], "n={n}");
            assert_eq!(dec.state(), RxState::WaitStart);
        }
    }

    #[test]
    fn corrupt_crc_drops_frame() {
        let mut bytes = encode(0x10, &[1, 2, 3]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut dec = FrameDecoder::new();
        let (frames, errors) = decode_all(&mut dec, &bytes);
        assert!(frames.is_empty());
        assert!(matches!(errors.as_slice(), [FrameError::ChecksumMismatch { .. }]));
        assert_eq!(dec.state(), RxState::WaitStart);
    }

    #[test]
    fn oversized_length_resyncs_without_eating_payload() {
        let mut dec = FrameDecoder::new();
        // Declares 0xFFFF bytes, then a valid frame follows immediately.
        let mut bytes = vec![START_BYTE, 0xFF, 0xFF];
        let good = encode(0x01, &[0x42]).unwrap();
        bytes.extend_from_slice(&good);
        let (frames, errors) = decode_all(&mut dec, &bytes);
        assert_eq!(errors, vec![FrameError::DeclaredLengthTooLarge(0xFFFF)]);
        assert_eq!(
            frames,
            vec![Frame {
                command: 0x01,
                payload: vec![0x42]
            }]
        );
    }

    #[test]
    fn garbage_before_start_is_ignored() {
        let mut dec = FrameDecoder::new();
        let mut bytes = vec![0x00, 0x13, 0x37, 0xFF];
        bytes.extend_from_slice(&encode(0x03, &[9, 9]).unwrap());
        let (frames, errors) = decode_all(&mut dec, &bytes);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, 0x03);
    }

    #[test]
    fn back_to_back_frames() {
        let mut dec = FrameDecoder::new();
        let mut bytes = encode(0x10, &[1]).unwrap();
        bytes.extend_from_slice(&encode(0x11, &[]).unwrap());
        let (frames, _) = decode_all(&mut dec, &bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].command, 0x11);
        assert!(frames[1].payload.is_empty());
    }

    #[test]
    fn response_codes_map() {
        assert_eq!(Response::from_byte(0x13), Some(Response::WifiDeauth));
        assert_eq!(Response::from_byte(0x31), Some(Response::BleScanDone));
        assert_eq!(Response::from_byte(0x99), None);
    }
}
