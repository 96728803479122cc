/// Error types for the link, scheduler, probe and scanner layers.
///
/// Framing errors never reach a caller: the receive state machine logs
/// them and resynchronizes. Everything else is surfaced as a value; nothing
/// in this crate panics or tears down the host on a radio failure.
use thiserror::Error;

use crate::radio::Capability;

/// Framing errors raised while encoding or parsing external-radio frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Payload handed to the encoder exceeds `MAX_PAYLOAD`.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Received checksum does not match the computed XOR.
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{got:02X}")]
    ChecksumMismatch { expected: u8, got: u8 },

    /// Header declared a payload longer than `MAX_PAYLOAD`.
    #[error("declared payload length {0} exceeds maximum")]
    DeclaredLengthTooLarge(u16),
}

/// Errors surfaced to callers of the link manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Another synchronous call is already in flight.
    #[error("a synchronous call is already pending")]
    Busy,

    /// No reply arrived before the deadline.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The serial channel is closed or went away while waiting.
    #[error("link closed")]
    LinkClosed,

    /// Payload exceeds the frame capacity.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// A bounded lock acquisition expired.
    #[error("lock acquisition timed out")]
    LockTimeout,
}

impl LinkError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Busy | LinkError::Timeout | LinkError::LockTimeout
        )
    }
}

/// Errors returned to the issuer of an active probe or scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// No radio able to service the request is present.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(&'static str),

    /// The external radio is connected but lacks a required capability.
    #[error("external radio lacks capability {0:?}")]
    MissingCapability(Capability),

    /// Request parameters were out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The command could not be delivered to the external radio.
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

impl ProbeError {
    /// Short code used in outward error messages.
    pub fn code(&self) -> &'static str {
        match self {
            ProbeError::HardwareUnavailable(_) | ProbeError::MissingCapability(_) => {
                "hardware_unavailable"
            }
            ProbeError::InvalidParameter(_) => "invalid_param",
            ProbeError::Link(_) => "link_error",
        }
    }
}

/// Errors returned by the detection scheduler's control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The scheduler state lock could not be taken in time.
    #[error("scheduler lock acquisition timed out")]
    LockTimeout,

    /// The worker thread could not be spawned.
    #[error("failed to spawn scheduler worker")]
    SpawnFailed,
}

/// Errors reported by scanner collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScanError {
    /// The driver refused to start.
    #[error("scanner failed to start")]
    StartFailed,

    /// The operation is not supported by this scanner.
    #[error("operation not supported")]
    Unsupported,
}
