/// Link manager for the external radio co-processor.
///
/// Owns the transmit side of the serial channel, the receive state machine
/// and the single pending synchronous call slot. Bytes arriving from the UART
/// are pushed in through [`LinkManager::feed`] from the receive context; every
/// complete, checksum-valid frame is delivered to exactly one place: the
/// pending synchronous caller if there is one, otherwise the event channel.
///
/// All shared state sits behind `parking_lot` mutexes acquired with a bounded
/// timeout, so neither the receive context nor a caller can stall forever on
/// a lock.
use std::io::Write;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::frame::{self, Command, Feed, Frame, FrameDecoder, MAX_PAYLOAD};
use crate::radio::{Capabilities, Capability, RadioInfo};

/// Connection state of the external radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        }
    }
}

/// Events delivered to the consuming thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// An unsolicited frame from the radio.
    Detection { response: u8, payload: Vec<u8> },
    /// The radio answered discovery. `None` if the info request failed.
    LinkConnected(Option<RadioInfo>),
    /// The radio is absent or stopped answering.
    LinkDisconnected,
}

/// Transmit half of the serial channel.
pub type SerialTx = Box<dyn Write + Send>;

/// Snapshot of link traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u32,
    pub frames_received: u32,
    pub frames_dropped: u32,
    pub sync_delivered: u32,
    pub async_delivered: u32,
}

struct PendingCall {
    id: u64,
    reply: Sender<Frame>,
}

struct Inner {
    config: LinkConfig,
    clock: Arc<dyn Clock>,
    tx: Mutex<Option<SerialTx>>,
    decoder: Mutex<FrameDecoder>,
    pending: Mutex<Option<PendingCall>>,
    state: Mutex<LinkState>,
    info: Mutex<Option<RadioInfo>>,
    last_rx: Mutex<Option<Instant>>,
    events: Sender<RadioEvent>,
    next_call_id: AtomicU64,
    frames_sent: AtomicU32,
    frames_received: AtomicU32,
    frames_dropped: AtomicU32,
    sync_delivered: AtomicU32,
    async_delivered: AtomicU32,
}

/// Cloneable handle to one serial link.
#[derive(Clone)]
pub struct LinkManager {
    inner: Arc<Inner>,
}

impl LinkManager {
    /// Create a closed link. The returned receiver yields every
    /// [`RadioEvent`] in arrival order.
    pub fn new(config: LinkConfig, clock: Arc<dyn Clock>) -> (Self, Receiver<RadioEvent>) {
        let (events, rx) = channel::unbounded();
        let inner = Inner {
            config,
            clock,
            tx: Mutex::new(None),
            decoder: Mutex::new(FrameDecoder::new()),
            pending: Mutex::new(None),
            state: Mutex::new(LinkState::Disconnected),
            info: Mutex::new(None),
            last_rx: Mutex::new(None),
            events,
            next_call_id: AtomicU64::new(1),
            frames_sent: AtomicU32::new(0),
            frames_received: AtomicU32::new(0),
            frames_dropped: AtomicU32::new(0),
            sync_delivered: AtomicU32::new(0),
            async_delivered: AtomicU32::new(0),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Attach the transmit half of the serial channel.
    pub fn open(&self, tx: SerialTx) -> Result<(), LinkError> {
        *self.lock(&self.inner.tx)? = Some(tx);
        self.lock(&self.inner.decoder)?.reset();
        log::info!("External radio serial link opened");
        Ok(())
    }

    /// Detach the serial channel. A caller blocked in a synchronous call is
    /// released with [`LinkError::LinkClosed`].
    pub fn close(&self) {
        if let Some(mut tx) = self.inner.tx.try_lock_for(self.lock_timeout()) {
            *tx = None;
        }
        if let Some(mut pending) = self.inner.pending.try_lock_for(self.lock_timeout()) {
            // Dropping the reply sender wakes the waiter.
            pending.take();
        }
        if let Some(mut state) = self.inner.state.try_lock_for(self.lock_timeout()) {
            *state = LinkState::Disconnected;
        }
        log::info!("External radio serial link closed");
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .tx
            .try_lock_for(self.lock_timeout())
            .map(|tx| tx.is_some())
            .unwrap_or(false)
    }

    /// Transmit one frame without waiting for a reply.
    pub fn send_async(&self, command: Command, payload: &[u8]) -> Result<(), LinkError> {
        self.transmit(command.as_byte(), payload)
    }

    /// Transmit a frame and block until the next valid frame arrives or
    /// `timeout` elapses.
    pub fn send_sync(
        &self,
        command: Command,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Frame, LinkError> {
        self.call(command, payload, MAX_PAYLOAD, timeout)
    }

    /// Like [`send_sync`](Self::send_sync) but copies the reply payload into
    /// `buf`, truncating to its length. Returns the number of bytes copied.
    pub fn send_sync_into(
        &self,
        command: Command,
        payload: &[u8],
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, LinkError> {
        let reply = self.call(command, payload, buf.len(), timeout)?;
        let n = reply.payload.len();
        buf[..n].copy_from_slice(&reply.payload);
        Ok(n)
    }

    fn call(
        &self,
        command: Command,
        payload: &[u8],
        max_len: usize,
        timeout: Duration,
    ) -> Result<Frame, LinkError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        if !self.is_open() {
            return Err(LinkError::LinkClosed);
        }

        let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = channel::bounded(1);
        {
            let mut pending = self.lock(&self.inner.pending)?;
            if pending.is_some() {
                return Err(LinkError::Busy);
            }
            *pending = Some(PendingCall { id, reply: reply_tx });
        }

        if let Err(e) = self.transmit(command.as_byte(), payload) {
            self.clear_pending(id);
            return Err(e);
        }

        let mut reply = match reply_rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                if self.clear_pending(id) {
                    log::debug!("Sync call 0x{:02X} timed out", command.as_byte());
                    return Err(LinkError::Timeout);
                }
                // The receive context claimed the slot; its send completed
                // under the pending lock we just acquired.
                reply_rx.try_recv().map_err(|_| LinkError::LinkClosed)?
            }
            Err(RecvTimeoutError::Disconnected) => return Err(LinkError::LinkClosed),
        };
        reply.payload.truncate(max_len);
        Ok(reply)
    }

    /// Clear the pending slot if it still belongs to `id`. Returns `false`
    /// only when the receive context already claimed it. Retries until the
    /// slot lock is free: a timed-out call must not leave its slot behind.
    fn clear_pending(&self, id: u64) -> bool {
        let mut pending = loop {
            match self.inner.pending.try_lock_for(self.lock_timeout()) {
                Some(pending) => break pending,
                None => log::warn!("Pending slot busy, retrying clear of call {}", id),
            }
        };
        match pending.as_ref() {
            Some(call) if call.id == id => {
                pending.take();
                true
            }
            _ => false,
        }
    }

    fn transmit(&self, command: u8, payload: &[u8]) -> Result<(), LinkError> {
        let bytes =
            frame::encode(command, payload).map_err(|_| LinkError::PayloadTooLarge(payload.len()))?;
        let mut tx = self.lock(&self.inner.tx)?;
        let port = tx.as_mut().ok_or(LinkError::LinkClosed)?;
        port.write_all(&bytes)
            .and_then(|_| port.flush())
            .map_err(|e| {
                log::warn!("Serial write failed for command 0x{:02X}: {}", command, e);
                LinkError::LinkClosed
            })?;
        self.inner.frames_sent.fetch_add(1, Ordering::Relaxed);
        log::debug!("TX cmd=0x{:02X} len={}", command, payload.len());
        Ok(())
    }

    /// Receive-context entry point: push raw bytes from the UART.
    ///
    /// Never blocks longer than the configured lock timeout. If the decoder
    /// lock cannot be taken the bytes are dropped and the stream resyncs on
    /// the next start marker.
    pub fn feed(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(mut last) = self.inner.last_rx.try_lock_for(self.lock_timeout()) {
            *last = Some(self.inner.clock.now());
        }

        let mut frames = Vec::new();
        match self.inner.decoder.try_lock_for(self.lock_timeout()) {
            Some(mut decoder) => {
                for &b in bytes {
                    match decoder.feed(b) {
                        Feed::Pending => {}
                        Feed::Frame(f) => frames.push(f),
                        Feed::Dropped(e) => {
                            self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropped frame from external radio: {}", e);
                        }
                    }
                }
            }
            None => {
                log::warn!("Receive state busy, dropped {} bytes", bytes.len());
                return;
            }
        }

        for f in frames {
            self.inner.frames_received.fetch_add(1, Ordering::Relaxed);
            log::debug!("RX cmd=0x{:02X} len={}", f.command, f.payload.len());
            self.dispatch(f);
        }
    }

    fn dispatch(&self, mut f: Frame) {
        match self.inner.pending.try_lock_for(self.lock_timeout()) {
            Some(mut pending) => {
                if let Some(call) = pending.take() {
                    // Capacity 1 and a single send: never blocks.
                    match call.reply.try_send(f) {
                        Ok(()) => {
                            self.inner.sync_delivered.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                        // The caller already gave up; the frame is unsolicited.
                        Err(e) => {
                            log::debug!("Sync call {} abandoned, frame delivered as event", call.id);
                            f = e.into_inner();
                        }
                    }
                }
            }
            None => log::warn!("Pending slot busy, delivering frame asynchronously"),
        }

        self.inner.async_delivered.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.events.try_send(RadioEvent::Detection {
            response: f.command,
            payload: f.payload,
        });
    }

    /// Publish a link-level event to the consumer.
    pub(crate) fn emit(&self, event: RadioEvent) {
        let _ = self.inner.events.try_send(event);
    }

    pub fn state(&self) -> LinkState {
        self.inner
            .state
            .try_lock_for(self.lock_timeout())
            .map(|s| *s)
            .unwrap_or(LinkState::Disconnected)
    }

    pub(crate) fn set_state(&self, new: LinkState) {
        if let Some(mut state) = self.inner.state.try_lock_for(self.lock_timeout()) {
            if *state != new {
                log::info!("External radio link: {} -> {}", state.as_str(), new.as_str());
                *state = new;
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn info(&self) -> Option<RadioInfo> {
        self.inner
            .info
            .try_lock_for(self.lock_timeout())
            .and_then(|i| i.clone())
    }

    pub(crate) fn set_info(&self, info: Option<RadioInfo>) {
        if let Some(mut slot) = self.inner.info.try_lock_for(self.lock_timeout()) {
            *slot = info;
        }
    }

    /// Capability bits of the connected radio, empty when disconnected.
    pub fn capabilities(&self) -> Capabilities {
        if !self.is_connected() {
            return Capabilities::NONE;
        }
        self.info().map(|i| i.capabilities).unwrap_or_default()
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities().has(cap)
    }

    /// Time since any byte was received, `None` if nothing ever arrived.
    pub fn since_last_rx(&self) -> Option<Duration> {
        let last = (*self.inner.last_rx.try_lock_for(self.lock_timeout())?)?;
        Some(self.inner.clock.now().saturating_duration_since(last))
    }

    /// Whether a synchronous call currently occupies the pending slot.
    pub fn has_pending_call(&self) -> bool {
        self.inner
            .pending
            .try_lock_for(self.lock_timeout())
            .map(|p| p.is_some())
            .unwrap_or(true)
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            frames_sent: self.inner.frames_sent.load(Ordering::Relaxed),
            frames_received: self.inner.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.inner.frames_dropped.load(Ordering::Relaxed),
            sync_delivered: self.inner.sync_delivered.load(Ordering::Relaxed),
            async_delivered: self.inner.async_delivered.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    fn lock_timeout(&self) -> Duration {
        self.inner.config.lock_timeout()
    }

    fn lock<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
    ) -> Result<parking_lot::MutexGuard<'a, T>, LinkError> {
        mutex
            .try_lock_for(self.lock_timeout())
            .ok_or(LinkError::LockTimeout)
    }
}
