/// Detection scheduler: time-division control of the scanners.
///
/// Each tick decides what may run:
/// - Sub-GHz hops through [`SUBGHZ_FREQUENCIES`] every dwell interval,
///   mirrored to the external radio when it carries the Sub-GHz source.
/// - BLE runs in bursts. An internal burst borrows the radio core from the
///   serial control link through the [`ResourceArbiter`]; an external burst
///   is a `BleScanStart` to the co-processor.
/// - WiFi passes are requested from the external radio periodically; each
///   completed pass goes to the WIPS engine as one unit.
/// - IR runs continuously while USB is idle, otherwise in bursts that
///   borrow the USB timer/DMA.
/// - NFC listens passively; a slow cleanup cycle recreates receivers.
///
/// All state lives behind one lock with a bounded acquisition time.
/// Detection and alert delivery (serializer, uplink, user callbacks, WIPS)
/// happens outside that lock, serialized per scan kind. A slow consumer
/// delays later items of its kind; nothing is dropped, and an item is
/// counted only once it has been delivered. Callbacks must not report back
/// into the scheduler.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard};

use crate::arbiter::{Holder, PairingStats, ResourceArbiter, ResourceParticipant, ScanResource};
use crate::clock::{millis_since, Clock};
use crate::comm::{Report, ResultSerializer, StatusReport, Uplink};
use crate::config::{SchedulerConfig, WipsConfig};
use crate::defaults::SUBGHZ_FREQUENCIES;
use crate::error::SchedulerError;
use crate::frame::{Command, Response};
use crate::link::{LinkManager, LinkState, RadioEvent};
use crate::protocol::MAX_MSG_LEN;
use crate::radio::{self, Capabilities, Capability};
use crate::scanner::{Detection, ScanKind, Scanner, WifiNetwork};
use crate::wips::{Alert, WipsEngine, WipsStats};

pub use crate::config::RadioSource;

/// Networks buffered for one WiFi pass.
const MAX_PASS_NETWORKS: usize = 128;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub subghz_detections: u32,
    pub ble_detections: u32,
    pub wifi_detections: u32,
    pub ir_detections: u32,
    pub nfc_detections: u32,
    pub wips_alerts: u32,
    pub ble_scans_completed: u32,
    pub ir_bursts_completed: u32,
    pub subghz_frequencies_scanned: u32,
    pub wifi_scans_completed: u32,
    pub cleanups: u32,
    pub uptime_secs: u32,
}

impl SchedulerStats {
    pub fn total_detections(&self) -> u32 {
        self.subghz_detections
            + self.ble_detections
            + self.wifi_detections
            + self.ir_detections
            + self.nfc_detections
    }

}

/// Counts of items that reached the reporter and callbacks.
#[derive(Default)]
struct Delivered {
    detections: [AtomicU32; 5],
    alerts: AtomicU32,
}

impl Delivered {
    fn reset(&self) {
        for counter in &self.detections {
            counter.store(0, Ordering::Relaxed);
        }
        self.alerts.store(0, Ordering::Relaxed);
    }

    fn fill(&self, stats: &mut SchedulerStats) {
        let get = |kind: ScanKind| self.detections[kind.index()].load(Ordering::Relaxed);
        stats.subghz_detections = get(ScanKind::SubGhz);
        stats.ble_detections = get(ScanKind::Ble);
        stats.wifi_detections = get(ScanKind::Wifi);
        stats.ir_detections = get(ScanKind::Ir);
        stats.nfc_detections = get(ScanKind::Nfc);
        stats.wips_alerts = self.alerts.load(Ordering::Relaxed);
    }
}

/// Which radios currently back each shared scan kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveSources {
    pub subghz_internal: bool,
    pub subghz_external: bool,
    pub ble_internal: bool,
    pub ble_external: bool,
    pub wifi_internal: bool,
    pub wifi_external: bool,
}

impl ActiveSources {
    fn resolve(config: &SchedulerConfig, caps: Capabilities, has_scanner: [bool; 5]) -> Self {
        let subghz_ext = caps.has(Capability::SubGhzRx);
        let ble_ext = caps.has(Capability::BleScan);
        let wifi_ext = caps.has(Capability::WifiScan);
        Self {
            subghz_internal: has_scanner[ScanKind::SubGhz.index()]
                && config.subghz_source.use_internal(subghz_ext),
            subghz_external: config.subghz_source.use_external(subghz_ext),
            ble_internal: has_scanner[ScanKind::Ble.index()]
                && config.ble_source.use_internal(ble_ext),
            ble_external: config.ble_source.use_external(ble_ext),
            wifi_internal: has_scanner[ScanKind::Wifi.index()]
                && config.wifi_source.use_internal(wifi_ext),
            wifi_external: config.wifi_source.use_external(wifi_ext),
        }
    }
}

pub type DetectionCallback = Box<dyn Fn(&Detection) + Send + Sync>;
pub type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

/// Commands for the external radio, sent after the state lock is released.
type Outbox = Vec<(Command, Vec<u8>)>;

struct State {
    config: SchedulerConfig,
    running: bool,
    scanners: [Option<Box<dyn Scanner>>; 5],
    arbiter: ResourceArbiter,
    paused: [bool; 5],
    external: Capabilities,
    sources: ActiveSources,
    stats: SchedulerStats,
    started_at: Instant,
    subghz_index: usize,
    last_hop: Instant,
    ble_burst: Option<Instant>,
    ble_ext_burst: Option<Instant>,
    last_ble: Instant,
    ir_burst: Option<Instant>,
    last_ir: Instant,
    last_wifi: Instant,
    last_cleanup: Instant,
    wifi_pass: Vec<WifiNetwork>,
}

impl State {
    fn scanner(&mut self, kind: ScanKind) -> Option<&mut Box<dyn Scanner>> {
        self.scanners[kind.index()].as_mut()
    }

    fn active(&self, kind: ScanKind) -> bool {
        let enabled = match kind {
            ScanKind::SubGhz => self.config.enable_subghz,
            ScanKind::Ble => self.config.enable_ble,
            ScanKind::Wifi => self.config.enable_wifi,
            ScanKind::Ir => self.config.enable_ir,
            ScanKind::Nfc => self.config.enable_nfc,
        };
        self.running && enabled && !self.paused[kind.index()]
    }

    fn has_scanners(&self) -> [bool; 5] {
        let mut has = [false; 5];
        for kind in ScanKind::ALL {
            has[kind.index()] = self.scanners[kind.index()].is_some();
        }
        has
    }

    fn frequency(&self) -> u32 {
        SUBGHZ_FREQUENCIES[self.subghz_index % SUBGHZ_FREQUENCIES.len()]
    }

    fn start_scanner(&mut self, kind: ScanKind) {
        if let Some(s) = self.scanner(kind) {
            if s.is_running() {
                return;
            }
            if let Err(e) = s.start_scan() {
                log::warn!("Failed to start {} scanner: {}", kind.as_str(), e);
            }
        }
    }

    fn stop_scanner(&mut self, kind: ScanKind) {
        if let Some(s) = self.scanner(kind) {
            if s.is_running() {
                s.stop_scan();
            }
        }
    }

    fn start_subghz_internal(&mut self) {
        let freq = self.frequency();
        if let Some(s) = self.scanner(ScanKind::SubGhz) {
            if let Err(e) = s.set_frequency(freq) {
                log::warn!("Sub-GHz tune to {} Hz failed: {}", freq, e);
            }
        }
        self.start_scanner(ScanKind::SubGhz);
    }

    fn start_subghz_external(&self, outbox: &mut Outbox) {
        outbox.push((Command::SubGhzSetFreq, self.frequency().to_be_bytes().to_vec()));
        outbox.push((Command::SubGhzRxStart, Vec::new()));
    }

    fn end_ble_burst(&mut self, now: Instant) {
        if self.ble_burst.take().is_some() {
            self.stop_scanner(ScanKind::Ble);
            self.arbiter.end_burst(ScanResource::InternalRadioCore, now);
            self.stats.ble_scans_completed += 1;
            self.last_ble = now;
        }
    }

    fn end_ble_external_burst(&mut self, now: Instant, outbox: &mut Outbox) {
        if self.ble_ext_burst.take().is_some() {
            outbox.push((Command::BleScanStop, Vec::new()));
            self.last_ble = now;
        }
    }

    fn end_ir_burst(&mut self, now: Instant) {
        if self.ir_burst.take().is_some() {
            self.stop_scanner(ScanKind::Ir);
            self.arbiter.end_burst(ScanResource::UsbDmaTimer, now);
            self.stats.ir_bursts_completed += 1;
            self.last_ir = now;
        }
    }

    /// Move from the current source selection to `next`, starting and
    /// stopping whatever changed.
    fn apply_sources(&mut self, next: ActiveSources, now: Instant, outbox: &mut Outbox) {
        let prev = self.sources;
        self.sources = next;
        if prev == next {
            return;
        }
        log::info!("Scan sources: {:?}", next);

        if self.active(ScanKind::SubGhz) {
            match (prev.subghz_internal, next.subghz_internal) {
                (false, true) => self.start_subghz_internal(),
                (true, false) => self.stop_scanner(ScanKind::SubGhz),
                _ => {}
            }
            match (prev.subghz_external, next.subghz_external) {
                (false, true) => self.start_subghz_external(outbox),
                (true, false) => outbox.push((Command::SubGhzRxStop, Vec::new())),
                _ => {}
            }
        }

        if prev.ble_internal && !next.ble_internal {
            self.end_ble_burst(now);
        }
        if prev.ble_external && !next.ble_external {
            self.ble_ext_burst = None;
            outbox.push((Command::BleScanStop, Vec::new()));
        }

        if self.active(ScanKind::Wifi) {
            match (prev.wifi_internal, next.wifi_internal) {
                (false, true) => self.start_scanner(ScanKind::Wifi),
                (true, false) => self.stop_scanner(ScanKind::Wifi),
                _ => {}
            }
            match (prev.wifi_external, next.wifi_external) {
                (false, true) => {
                    outbox.push((Command::WifiScanStart, Vec::new()));
                    self.last_wifi = now;
                }
                (true, false) => outbox.push((Command::WifiScanStop, Vec::new())),
                _ => {}
            }
        }
    }

    fn start(&mut self, now: Instant, outbox: &mut Outbox) {
        self.running = true;
        self.stats = SchedulerStats::default();
        self.started_at = now;
        self.last_hop = now;
        self.last_ble = now;
        self.last_ir = now;
        self.last_wifi = now;
        self.last_cleanup = now;
        self.ble_burst = None;
        self.ble_ext_burst = None;
        self.ir_burst = None;
        self.wifi_pass.clear();

        if self.active(ScanKind::Nfc) {
            self.start_scanner(ScanKind::Nfc);
        }
        if self.active(ScanKind::Ir)
            && !self.arbiter.default_holder_active(ScanResource::UsbDmaTimer)
        {
            log::info!("IR: continuous mode");
            self.start_scanner(ScanKind::Ir);
        }

        self.sources = ActiveSources::default();
        let next = ActiveSources::resolve(&self.config, self.external, self.has_scanners());
        self.apply_sources(next, now, outbox);
    }

    fn stop(&mut self, now: Instant, outbox: &mut Outbox, link_up: bool) {
        self.running = false;
        self.ble_burst = None;
        self.ble_ext_burst = None;
        self.ir_burst = None;
        for kind in ScanKind::ALL {
            self.stop_scanner(kind);
        }
        self.arbiter.release_all(now);
        if link_up {
            outbox.push((Command::SubGhzRxStop, Vec::new()));
            outbox.push((Command::BleScanStop, Vec::new()));
            outbox.push((Command::WifiScanStop, Vec::new()));
        }
        self.sources = ActiveSources::default();
        self.wifi_pass.clear();
    }

    fn pause(&mut self, kind: ScanKind, now: Instant, outbox: &mut Outbox) {
        self.paused[kind.index()] = true;
        match kind {
            ScanKind::SubGhz => {
                self.stop_scanner(kind);
                if self.sources.subghz_external {
                    outbox.push((Command::SubGhzRxStop, Vec::new()));
                }
            }
            ScanKind::Ble => {
                self.end_ble_burst(now);
                self.ble_ext_burst = None;
                if self.sources.ble_external {
                    outbox.push((Command::BleScanStop, Vec::new()));
                }
            }
            ScanKind::Wifi => {
                self.stop_scanner(kind);
                if self.sources.wifi_external {
                    outbox.push((Command::WifiScanStop, Vec::new()));
                }
            }
            ScanKind::Ir => {
                self.end_ir_burst(now);
                self.stop_scanner(kind);
            }
            ScanKind::Nfc => self.stop_scanner(kind),
        }
    }

    fn resume(&mut self, kind: ScanKind, now: Instant, outbox: &mut Outbox) {
        self.paused[kind.index()] = false;
        if !self.active(kind) {
            return;
        }
        match kind {
            ScanKind::SubGhz => {
                if self.sources.subghz_internal {
                    self.start_subghz_internal();
                }
                if self.sources.subghz_external {
                    self.start_subghz_external(outbox);
                }
                self.last_hop = now;
            }
            // Next burst comes from the tick.
            ScanKind::Ble | ScanKind::Ir => {}
            ScanKind::Wifi => {
                if self.sources.wifi_internal {
                    self.start_scanner(kind);
                }
                if self.sources.wifi_external {
                    outbox.push((Command::WifiScanStart, Vec::new()));
                    self.last_wifi = now;
                }
            }
            ScanKind::Nfc => self.start_scanner(kind),
        }
    }

    /// One scheduling step. Returns a completed internal WiFi pass, if any.
    fn tick(&mut self, now: Instant, outbox: &mut Outbox) -> Option<Vec<WifiNetwork>> {
        if !self.running {
            return None;
        }
        self.tick_subghz(now, outbox);
        self.tick_ble(now, outbox);
        let pass = self.tick_wifi(now, outbox);
        self.tick_ir(now);
        self.tick_cleanup(now);
        self.stats.uptime_secs = millis_since(self.started_at, now) / 1000;
        pass
    }

    fn tick_subghz(&mut self, now: Instant, outbox: &mut Outbox) {
        let sources = self.sources;
        if !self.active(ScanKind::SubGhz)
            || !self.config.subghz_continuous
            || !(sources.subghz_internal || sources.subghz_external)
            || (millis_since(self.last_hop, now) as u64) < self.config.subghz_hop_interval_ms
        {
            return;
        }

        if sources.subghz_internal {
            if let Some(s) = self.scanner(ScanKind::SubGhz) {
                if s.is_decoding() {
                    log::debug!("Sub-GHz decode in progress, deferring hop");
                    return;
                }
            }
        }

        self.subghz_index = (self.subghz_index + 1) % SUBGHZ_FREQUENCIES.len();
        let freq = self.frequency();
        let wrapped = self.subghz_index == 0;
        if sources.subghz_internal {
            if let Some(s) = self.scanner(ScanKind::SubGhz) {
                // A full sweep moves the receiver to its next preset.
                if wrapped {
                    if let Err(e) = s.reset() {
                        log::warn!("Sub-GHz preset cycle failed: {}", e);
                    }
                }
                if let Err(e) = s.set_frequency(freq) {
                    log::warn!("Sub-GHz tune to {} Hz failed: {}", freq, e);
                }
            }
        }
        if sources.subghz_external {
            outbox.push((Command::SubGhzSetFreq, freq.to_be_bytes().to_vec()));
        }
        self.stats.subghz_frequencies_scanned += 1;
        self.last_hop = now;
        log::debug!("Sub-GHz hop to {} Hz", freq);
    }

    fn tick_ble(&mut self, now: Instant, outbox: &mut Outbox) {
        if !self.active(ScanKind::Ble) {
            return;
        }

        let duration = self.config.ble_scan_duration_ms;
        if let Some(started) = self.ble_ext_burst {
            if millis_since(started, now) as u64 >= duration {
                self.end_ble_external_burst(now, outbox);
            }
        }
        if let Some(started) = self.ble_burst {
            let finished = self
                .scanner(ScanKind::Ble)
                .map(|s| !s.is_running())
                .unwrap_or(true);
            if finished || millis_since(started, now) as u64 >= duration {
                self.end_ble_burst(now);
            }
        }
        if self.ble_burst.is_some()
            || self.ble_ext_burst.is_some()
            || (millis_since(self.last_ble, now) as u64) < self.config.ble_scan_interval_ms
        {
            return;
        }
        self.last_ble = now;

        if self.sources.ble_external {
            outbox.push((Command::BleScanStart, Vec::new()));
            self.ble_ext_burst = Some(now);
        }
        if self.sources.ble_internal {
            if !self.arbiter.begin_burst(ScanResource::InternalRadioCore, now) {
                return;
            }
            let started = match self.scanner(ScanKind::Ble) {
                Some(s) => s.start_scan(),
                None => Ok(()),
            };
            match started {
                Ok(()) => self.ble_burst = Some(now),
                Err(e) => {
                    log::warn!("BLE burst failed to start: {}", e);
                    self.arbiter.end_burst(ScanResource::InternalRadioCore, now);
                }
            }
        }
    }

    fn tick_wifi(&mut self, now: Instant, outbox: &mut Outbox) -> Option<Vec<WifiNetwork>> {
        if !self.active(ScanKind::Wifi)
            || (millis_since(self.last_wifi, now) as u64) < self.config.wifi_scan_interval_ms
        {
            return None;
        }
        self.last_wifi = now;

        if self.sources.wifi_external {
            outbox.push((Command::WifiScanStart, Vec::new()));
        }
        if self.sources.wifi_internal {
            // Internal sniffers have no pass boundary of their own.
            self.stats.wifi_scans_completed += 1;
            return Some(std::mem::take(&mut self.wifi_pass));
        }
        None
    }

    fn tick_ir(&mut self, now: Instant) {
        if !self.active(ScanKind::Ir) || self.scanners[ScanKind::Ir.index()].is_none() {
            return;
        }

        if let Some(started) = self.ir_burst {
            if millis_since(started, now) as u64 >= self.config.ir_scan_duration_ms {
                self.end_ir_burst(now);
            }
            return;
        }

        if !self.arbiter.default_holder_active(ScanResource::UsbDmaTimer) {
            // USB idle: IR owns the timer continuously.
            self.start_scanner(ScanKind::Ir);
            return;
        }

        // USB came up under a continuous capture.
        self.stop_scanner(ScanKind::Ir);

        if (millis_since(self.last_ir, now) as u64) < self.config.ir_scan_interval_ms {
            return;
        }
        self.last_ir = now;
        if !self.arbiter.begin_burst(ScanResource::UsbDmaTimer, now) {
            return;
        }
        let started = match self.scanner(ScanKind::Ir) {
            Some(s) => s.start_scan(),
            None => Ok(()),
        };
        match started {
            Ok(()) => self.ir_burst = Some(now),
            Err(e) => {
                log::warn!("IR burst failed to start: {}", e);
                self.arbiter.end_burst(ScanResource::UsbDmaTimer, now);
            }
        }
    }

    fn tick_cleanup(&mut self, now: Instant) {
        if (millis_since(self.last_cleanup, now) as u64) < self.config.cleanup_interval_ms {
            return;
        }
        let subghz_internal = self.sources.subghz_internal && self.active(ScanKind::SubGhz);
        if subghz_internal {
            if let Some(s) = self.scanner(ScanKind::SubGhz) {
                if s.is_decoding() {
                    return;
                }
                if let Err(e) = s.reset() {
                    log::warn!("Sub-GHz receiver reset failed: {}", e);
                }
            }
        }
        if let Some(s) = self.scanner(ScanKind::Nfc) {
            if s.is_running() {
                s.stop_scan();
                if let Err(e) = s.start_scan() {
                    log::warn!("NFC restart failed: {}", e);
                }
            }
        }
        self.stats.cleanups += 1;
        self.last_cleanup = now;
        log::debug!("Periodic receiver cleanup done");
    }
}

struct Inner {
    state: Mutex<State>,
    wips: Mutex<WipsEngine>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    link: Option<LinkManager>,
    events: Option<Receiver<RadioEvent>>,
    serializer: Option<Box<dyn ResultSerializer>>,
    uplink: Option<Box<dyn Uplink>>,
    on_detection: Option<DetectionCallback>,
    on_alert: Option<AlertCallback>,
    gates: [Mutex<()>; 5],
    alert_gate: Mutex<()>,
    delivered: Delivered,
}

/// Assembles a [`DetectionScheduler`] from its collaborators.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    wips_config: WipsConfig,
    clock: Arc<dyn Clock>,
    scanners: [Option<Box<dyn Scanner>>; 5],
    participants: Vec<(ScanResource, Box<dyn ResourceParticipant>)>,
    link: Option<(LinkManager, Receiver<RadioEvent>)>,
    serializer: Option<Box<dyn ResultSerializer>>,
    uplink: Option<Box<dyn Uplink>>,
    on_detection: Option<DetectionCallback>,
    on_alert: Option<AlertCallback>,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            wips_config: WipsConfig::default(),
            clock,
            scanners: Default::default(),
            participants: Vec::new(),
            link: None,
            serializer: None,
            uplink: None,
            on_detection: None,
            on_alert: None,
        }
    }

    pub fn wips_config(mut self, config: WipsConfig) -> Self {
        self.wips_config = config;
        self
    }

    /// Internal scanner driver for one scan kind.
    pub fn scanner(mut self, kind: ScanKind, scanner: Box<dyn Scanner>) -> Self {
        self.scanners[kind.index()] = Some(scanner);
        self
    }

    /// Default holder of a shared resource (BT serial, USB CDC).
    pub fn participant(
        mut self,
        resource: ScanResource,
        participant: Box<dyn ResourceParticipant>,
    ) -> Self {
        self.participants.push((resource, participant));
        self
    }

    /// External radio link and its event stream.
    pub fn link(mut self, link: LinkManager, events: Receiver<RadioEvent>) -> Self {
        self.link = Some((link, events));
        self
    }

    pub fn reporter(
        mut self,
        serializer: Box<dyn ResultSerializer>,
        uplink: Box<dyn Uplink>,
    ) -> Self {
        self.serializer = Some(serializer);
        self.uplink = Some(uplink);
        self
    }

    pub fn on_detection<F>(mut self, f: F) -> Self
    where
        F: Fn(&Detection) + Send + Sync + 'static,
    {
        self.on_detection = Some(Box::new(f));
        self
    }

    pub fn on_alert<F>(mut self, f: F) -> Self
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.on_alert = Some(Box::new(f));
        self
    }

    pub fn build(self) -> DetectionScheduler {
        let now = self.clock.now();
        let mut arbiter = ResourceArbiter::new(now);
        for (resource, participant) in self.participants {
            arbiter.attach(resource, participant);
        }
        let (link, events) = match self.link {
            Some((link, events)) => (Some(link), Some(events)),
            None => (None, None),
        };

        let state = State {
            config: self.config,
            running: false,
            scanners: self.scanners,
            arbiter,
            paused: [false; 5],
            external: Capabilities::NONE,
            sources: ActiveSources::default(),
            stats: SchedulerStats::default(),
            started_at: now,
            subghz_index: 0,
            last_hop: now,
            ble_burst: None,
            ble_ext_burst: None,
            last_ble: now,
            ir_burst: None,
            last_ir: now,
            last_wifi: now,
            last_cleanup: now,
            wifi_pass: Vec::new(),
        };

        DetectionScheduler {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                wips: Mutex::new(WipsEngine::new(self.wips_config, Arc::clone(&self.clock))),
                clock: self.clock,
                lock_timeout: self.config.lock_timeout(),
                link,
                events,
                serializer: self.serializer,
                uplink: self.uplink,
                on_detection: self.on_detection,
                on_alert: self.on_alert,
                gates: Default::default(),
                alert_gate: Mutex::new(()),
                delivered: Delivered::default(),
            }),
        }
    }
}

/// Cloneable handle to the scheduler.
#[derive(Clone)]
pub struct DetectionScheduler {
    inner: Arc<Inner>,
}

impl DetectionScheduler {
    pub fn builder(config: SchedulerConfig, clock: Arc<dyn Clock>) -> SchedulerBuilder {
        SchedulerBuilder::new(config, clock)
    }

    /// Start scanning. Statistics reset here. Starting a running scheduler
    /// is a no-op.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let now = self.inner.clock.now();
        let caps = self.external_capabilities();
        let mut outbox = Outbox::new();
        {
            let mut st = self.lock_state()?;
            if st.running {
                return Ok(());
            }
            st.external = caps;
            st.start(now, &mut outbox);
            self.inner.delivered.reset();
            log::info!(
                "Detection scheduler started (external radio: {})",
                if caps == Capabilities::NONE { "none" } else { "present" }
            );
        }
        self.flush(outbox);
        Ok(())
    }

    /// Stop every scanner and hand shared resources back to their default
    /// holders. Stopping a stopped scheduler is a no-op.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let now = self.inner.clock.now();
        let link_up = self.inner.link.as_ref().is_some_and(|l| l.is_connected());
        let mut outbox = Outbox::new();
        {
            let mut st = self.lock_state()?;
            if !st.running {
                return Ok(());
            }
            st.stop(now, &mut outbox, link_up);
        }
        self.flush(outbox);
        log::info!("Detection scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().map(|st| st.running).unwrap_or(false)
    }

    /// Pause one scan kind. Pausing a paused kind succeeds.
    pub fn pause(&self, kind: ScanKind) -> Result<(), SchedulerError> {
        let now = self.inner.clock.now();
        let mut outbox = Outbox::new();
        {
            let mut st = self.lock_state()?;
            if st.paused[kind.index()] {
                return Ok(());
            }
            st.pause(kind, now, &mut outbox);
        }
        log::info!("Paused {} scanning", kind.as_str());
        self.flush(outbox);
        Ok(())
    }

    /// Resume one scan kind. Resuming a running kind succeeds.
    pub fn resume(&self, kind: ScanKind) -> Result<(), SchedulerError> {
        let now = self.inner.clock.now();
        let mut outbox = Outbox::new();
        {
            let mut st = self.lock_state()?;
            if !st.paused[kind.index()] {
                return Ok(());
            }
            st.resume(kind, now, &mut outbox);
        }
        log::info!("Resumed {} scanning", kind.as_str());
        self.flush(outbox);
        Ok(())
    }

    pub fn is_paused(&self, kind: ScanKind) -> bool {
        self.lock_state()
            .map(|st| st.paused[kind.index()])
            .unwrap_or(false)
    }

    pub fn get_stats(&self) -> Result<SchedulerStats, SchedulerError> {
        let now = self.inner.clock.now();
        let mut stats = {
            let mut st = self.lock_state()?;
            if st.running {
                st.stats.uptime_secs = millis_since(st.started_at, now) / 1000;
            }
            st.stats
        };
        self.inner.delivered.fill(&mut stats);
        Ok(stats)
    }

    pub fn wips_stats(&self) -> Result<WipsStats, SchedulerError> {
        self.inner
            .wips
            .try_lock_for(self.inner.lock_timeout)
            .map(|w| w.stats())
            .ok_or(SchedulerError::LockTimeout)
    }

    pub fn sources(&self) -> Result<ActiveSources, SchedulerError> {
        Ok(self.lock_state()?.sources)
    }

    /// Current holder of a shared resource.
    pub fn holder(&self, resource: ScanResource) -> Result<Holder, SchedulerError> {
        Ok(self.lock_state()?.arbiter.holder(resource))
    }

    pub fn pairing_stats(&self, resource: ScanResource) -> Result<PairingStats, SchedulerError> {
        Ok(self.lock_state()?.arbiter.stats(resource))
    }

    pub fn config(&self) -> Result<SchedulerConfig, SchedulerError> {
        Ok(self.lock_state()?.config)
    }

    /// Replace the configuration. Source selection is re-evaluated at once;
    /// intervals apply from the next tick.
    pub fn set_config(&self, config: SchedulerConfig) -> Result<(), SchedulerError> {
        let now = self.inner.clock.now();
        let mut outbox = Outbox::new();
        {
            let mut st = self.lock_state()?;
            st.config = config;
            if st.running {
                let next = ActiveSources::resolve(&st.config, st.external, st.has_scanners());
                st.apply_sources(next, now, &mut outbox);
            }
        }
        self.flush(outbox);
        Ok(())
    }

    pub fn set_wips_config(&self, config: WipsConfig) -> Result<(), SchedulerError> {
        self.inner
            .wips
            .try_lock_for(self.inner.lock_timeout)
            .map(|mut w| w.set_config(config))
            .ok_or(SchedulerError::LockTimeout)
    }

    /// Run one scheduling step.
    pub fn tick(&self) {
        let now = self.inner.clock.now();
        let mut outbox = Outbox::new();
        let pass = match self.lock_state() {
            Ok(mut st) => st.tick(now, &mut outbox),
            Err(e) => {
                log::warn!("Scheduler tick skipped: {}", e);
                return;
            }
        };
        self.flush(outbox);
        if let Some(pass) = pass {
            self.analyze_pass(pass);
        }
    }

    /// Entry point for scanner drivers. Reports the detection, feeds the
    /// windowed WIPS detectors and counts it. Detections arriving while the
    /// scheduler is stopped are dropped.
    pub fn report(&self, detection: Detection) {
        let kind = detection.kind();
        let now = self.inner.clock.now();
        let ts = match self.lock_state() {
            Ok(mut st) => {
                if !st.running {
                    log::debug!("Dropping {} detection while stopped", kind.as_str());
                    return;
                }
                if let Detection::Wifi(net) = &detection {
                    if st.wifi_pass.len() < MAX_PASS_NETWORKS {
                        st.wifi_pass.push(net.clone());
                    }
                }
                millis_since(st.started_at, now)
            }
            Err(e) => {
                log::warn!("Dropping {} detection: {}", kind.as_str(), e);
                return;
            }
        };

        let alert = {
            let _gate = self.inner.gates[kind.index()].lock();
            self.publish(&Report::Detection {
                detection: &detection,
                ts,
            });
            if let Some(cb) = &self.inner.on_detection {
                cb(&detection);
            }
            let alert = match &detection {
                Detection::Deauth(ev) => self.with_wips(|w| w.record_deauth(ev)),
                Detection::ProbeResponse { bssid, ssid } => {
                    self.with_wips(|w| w.record_probe_response(bssid, ssid))
                }
                _ => None,
            };
            self.inner.delivered.detections[kind.index()].fetch_add(1, Ordering::Relaxed);
            alert
        };

        if let Some(alert) = alert {
            self.raise_alert(alert);
        }
    }

    /// Consume one event from the external radio.
    pub fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Detection { response, payload } => {
                self.handle_radio_frame(response, &payload)
            }
            RadioEvent::LinkConnected(info) => {
                let caps = info.map(|i| i.capabilities).unwrap_or_default();
                log::info!("External radio available, capabilities 0x{:08X}", caps.0);
                self.set_external(caps);
            }
            RadioEvent::LinkDisconnected => {
                log::info!("External radio gone, internal scanning only");
                self.set_external(Capabilities::NONE);
            }
        }
    }

    fn handle_radio_frame(&self, response: u8, payload: &[u8]) {
        let detection = match Response::from_byte(response) {
            Some(Response::WifiNetwork) => radio::parse_wifi_network(payload).map(Detection::Wifi),
            Some(Response::WifiDeauth) => radio::parse_wifi_deauth(payload).map(Detection::Deauth),
            Some(Response::WifiProbe) => radio::parse_wifi_probe(payload),
            Some(Response::BleDevice) => radio::parse_ble_device(payload).map(Detection::Ble),
            Some(Response::SubGhzSignal) => {
                radio::parse_subghz_signal(payload).map(Detection::SubGhz)
            }
            Some(Response::WifiScanDone) => {
                let pass = match self.lock_state() {
                    Ok(mut st) => {
                        st.stats.wifi_scans_completed += 1;
                        std::mem::take(&mut st.wifi_pass)
                    }
                    Err(_) => return,
                };
                self.analyze_pass(pass);
                return;
            }
            Some(Response::BleScanDone) => {
                if let Ok(mut st) = self.lock_state() {
                    st.stats.ble_scans_completed += 1;
                }
                return;
            }
            other => {
                log::debug!("Ignoring radio frame 0x{:02X} ({:?})", response, other);
                return;
            }
        };

        match detection {
            Some(d) => self.report(d),
            None => log::warn!(
                "Malformed payload for radio frame 0x{:02X} ({} bytes)",
                response,
                payload.len()
            ),
        }
    }

    fn set_external(&self, caps: Capabilities) {
        let now = self.inner.clock.now();
        let mut outbox = Outbox::new();
        {
            let Ok(mut st) = self.lock_state() else {
                log::warn!("Scheduler busy, radio change deferred to next start");
                return;
            };
            st.external = caps;
            if st.running {
                let next = ActiveSources::resolve(&st.config, caps, st.has_scanners());
                st.apply_sources(next, now, &mut outbox);
            }
        }
        self.flush(outbox);
    }

    /// Publish a status report through the reporter.
    pub fn publish_status(&self) -> Result<(), SchedulerError> {
        let stats = self.get_stats()?;
        let status = StatusReport {
            scanning: self.is_running(),
            uptime_secs: stats.uptime_secs,
            radio: self
                .inner
                .link
                .as_ref()
                .map(|l| l.state())
                .unwrap_or(LinkState::Disconnected),
            detections: stats.total_detections(),
            alerts: stats.wips_alerts,
        };
        self.publish(&Report::Status(status));
        Ok(())
    }

    /// Report a failed request to the companion.
    pub fn publish_error(&self, code: &'static str, msg: &str) {
        self.publish(&Report::Error { code, msg });
    }

    /// Run the scheduler loop on its own thread: radio events are drained
    /// and one step is taken every tick until the handle is stopped.
    pub fn spawn(&self) -> Result<SchedulerHandle, SchedulerError> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let tick = self.lock_state()?.config.tick();
        let scheduler = self.clone();

        let thread = thread::Builder::new()
            .name("detection-scheduler".into())
            .spawn(move || {
                log::info!("Scheduler worker started");
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {
                            scheduler.drain_radio_events();
                            scheduler.tick();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::info!("Scheduler worker stopped");
            })
            .map_err(|e| {
                log::error!("Failed to spawn scheduler worker: {}", e);
                SchedulerError::SpawnFailed
            })?;

        Ok(SchedulerHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Handle every queued radio event.
    pub fn drain_radio_events(&self) {
        if let Some(events) = &self.inner.events {
            while let Ok(event) = events.try_recv() {
                self.handle_radio_event(event);
            }
        }
    }

    fn analyze_pass(&self, pass: Vec<WifiNetwork>) {
        if pass.is_empty() {
            return;
        }
        let alerts = match self.inner.wips.try_lock_for(self.inner.lock_timeout) {
            Some(mut wips) => wips.analyze_scan(&pass),
            None => {
                log::warn!("WIPS busy, skipped pass of {} networks", pass.len());
                return;
            }
        };
        for alert in alerts {
            self.raise_alert(alert);
        }
    }

    fn with_wips<R>(&self, f: impl FnOnce(&mut WipsEngine) -> Option<R>) -> Option<R> {
        match self.inner.wips.try_lock_for(self.inner.lock_timeout) {
            Some(mut wips) => f(&mut wips),
            None => {
                log::warn!("WIPS busy, event not correlated");
                None
            }
        }
    }

    fn raise_alert(&self, alert: Alert) {
        let _gate = self.inner.alert_gate.lock();
        log::info!(
            "WIPS alert {} ({}): {}",
            alert.alert_type.as_str(),
            alert.severity.as_str(),
            alert.description
        );
        self.publish(&Report::Alert(&alert));
        if let Some(cb) = &self.inner.on_alert {
            cb(&alert);
        }
        self.inner.delivered.alerts.fetch_add(1, Ordering::Relaxed);
    }

    fn publish(&self, report: &Report) {
        let (Some(serializer), Some(uplink)) = (&self.inner.serializer, &self.inner.uplink) else {
            return;
        };
        let mut buf = [0u8; MAX_MSG_LEN];
        match serializer.serialize(report, &mut buf) {
            Some(len) => {
                if let Err(e) = uplink.send(&buf[..len]) {
                    log::warn!("Uplink send failed: {}", e);
                }
            }
            None => log::warn!("Report did not fit in {} bytes", MAX_MSG_LEN),
        }
    }

    fn flush(&self, outbox: Outbox) {
        let Some(link) = &self.inner.link else {
            return;
        };
        for (command, payload) in outbox {
            if let Err(e) = link.send_async(command, &payload) {
                log::debug!("External radio command {:?} not sent: {}", command, e);
            }
        }
    }

    fn external_capabilities(&self) -> Capabilities {
        self.inner
            .link
            .as_ref()
            .map(|l| l.capabilities())
            .unwrap_or(Capabilities::NONE)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>, SchedulerError> {
        self.inner
            .state
            .try_lock_for(self.inner.lock_timeout)
            .ok_or(SchedulerError::LockTimeout)
    }
}

/// Owner of a running scheduler worker. Dropping it stops the worker; the
/// scanners keep their state until [`DetectionScheduler::stop`].
pub struct SchedulerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::comm::NdjsonSerializer;
    use crate::config::LinkConfig;
    use crate::error::ScanError;
    use crate::frame::{Feed, FrameDecoder};
    use crate::protocol::NameString;
    use crate::radio::{RadioInfo, RadioType, EXT_WIFI_NETWORK_LEN};
    use crate::scanner::{DeauthEvent, SecurityType, SubGhzSignal};
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct ScannerProbe {
        running: AtomicBool,
        decoding: AtomicBool,
        fail_start: AtomicBool,
        starts: AtomicU32,
        stops: AtomicU32,
        resets: AtomicU32,
        frequency: AtomicU32,
    }

    struct FakeScanner(Arc<ScannerProbe>);

    impl Scanner for FakeScanner {
        fn start_scan(&mut self) -> Result<(), ScanError> {
            if self.0.fail_start.load(Ordering::SeqCst) {
                return Err(ScanError::StartFailed);
            }
            self.0.starts.fetch_add(1, Ordering::SeqCst);
            self.0.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop_scan(&mut self) {
            self.0.stops.fetch_add(1, Ordering::SeqCst);
            self.0.running.store(false, Ordering::SeqCst);
        }
        fn is_running(&self) -> bool {
            self.0.running.load(Ordering::SeqCst)
        }
        fn set_frequency(&mut self, hz: u32) -> Result<(), ScanError> {
            self.0.frequency.store(hz, Ordering::SeqCst);
            Ok(())
        }
        fn reset(&mut self) -> Result<(), ScanError> {
            self.0.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn is_decoding(&self) -> bool {
            self.0.decoding.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct HolderProbe {
        active: AtomicBool,
        pauses: AtomicU32,
        resumes: AtomicU32,
    }

    struct FakeHolder(Arc<HolderProbe>);

    impl ResourceParticipant for FakeHolder {
        fn pause(&mut self) -> bool {
            self.0.pauses.fetch_add(1, Ordering::SeqCst);
            self.0.active.store(false, Ordering::SeqCst);
            true
        }
        fn resume(&mut self) -> bool {
            self.0.resumes.fetch_add(1, Ordering::SeqCst);
            self.0.active.store(true, Ordering::SeqCst);
            true
        }
        fn is_active(&self) -> bool {
            self.0.active.load(Ordering::SeqCst)
        }
    }

    struct Rig {
        scheduler: DetectionScheduler,
        clock: Arc<ManualClock>,
        probes: Vec<Arc<ScannerProbe>>,
    }

    impl Rig {
        fn probe(&self, kind: ScanKind) -> &ScannerProbe {
            &self.probes[kind.index()]
        }

        fn advance(&self, ms: u64) {
            self.clock.advance_ms(ms);
            self.scheduler.tick();
        }
    }

    fn rig_with(
        config: SchedulerConfig,
        extra: impl FnOnce(SchedulerBuilder) -> SchedulerBuilder,
    ) -> Rig {
        let clock = Arc::new(ManualClock::new());
        let mut builder = DetectionScheduler::builder(config, clock.clone());
        let mut probes = Vec::new();
        for kind in ScanKind::ALL {
            let probe = Arc::new(ScannerProbe::default());
            builder = builder.scanner(kind, Box::new(FakeScanner(probe.clone())));
            probes.push(probe);
        }
        Rig {
            scheduler: extra(builder).build(),
            clock,
            probes,
        }
    }

    fn internal_config() -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.wifi_source = RadioSource::Internal;
        config
    }

    #[test]
    fn start_brings_up_passive_scanners() {
        let rig = rig_with(internal_config(), |b| b);
        rig.scheduler.start().unwrap();
        assert!(rig.scheduler.is_running());
        assert!(rig.probe(ScanKind::Nfc).running.load(Ordering::SeqCst));
        assert!(rig.probe(ScanKind::Ir).running.load(Ordering::SeqCst));
        assert!(rig.probe(ScanKind::SubGhz).running.load(Ordering::SeqCst));
        assert!(rig.probe(ScanKind::Wifi).running.load(Ordering::SeqCst));
        assert_eq!(
            rig.probe(ScanKind::SubGhz).frequency.load(Ordering::SeqCst),
            315_000_000
        );
        // BLE only runs in bursts.
        assert!(!rig.probe(ScanKind::Ble).running.load(Ordering::SeqCst));

        let sources = rig.scheduler.sources().unwrap();
        assert!(sources.subghz_internal && !sources.subghz_external);

        // Second start is a no-op.
        rig.scheduler.start().unwrap();
        assert_eq!(rig.probe(ScanKind::Nfc).starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subghz_hops_and_cycles_preset() {
        let rig = rig_with(internal_config(), |b| b);
        rig.scheduler.start().unwrap();
        rig.advance(2500);
        let subghz = rig.probe(ScanKind::SubGhz);
        assert_eq!(subghz.frequency.load(Ordering::SeqCst), 433_920_000);
        assert_eq!(rig.scheduler.get_stats().unwrap().subghz_frequencies_scanned, 1);

        // Not yet due.
        rig.advance(1000);
        assert_eq!(rig.scheduler.get_stats().unwrap().subghz_frequencies_scanned, 1);

        for _ in 0..9 {
            rig.advance(2500);
        }
        assert_eq!(subghz.frequency.load(Ordering::SeqCst), 315_000_000);
        assert_eq!(subghz.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hop_deferred_while_decoding() {
        let rig = rig_with(internal_config(), |b| b);
        rig.scheduler.start().unwrap();
        rig.probe(ScanKind::SubGhz).decoding.store(true, Ordering::SeqCst);
        rig.advance(5000);
        assert_eq!(rig.scheduler.get_stats().unwrap().subghz_frequencies_scanned, 0);

        rig.probe(ScanKind::SubGhz).decoding.store(false, Ordering::SeqCst);
        rig.advance(100);
        assert_eq!(rig.scheduler.get_stats().unwrap().subghz_frequencies_scanned, 1);
    }

    #[test]
    fn ble_burst_pauses_and_resumes_serial_link() {
        let serial = Arc::new(HolderProbe::default());
        serial.active.store(true, Ordering::SeqCst);
        let s = serial.clone();
        let rig = rig_with(internal_config(), move |b| {
            b.participant(ScanResource::InternalRadioCore, Box::new(FakeHolder(s)))
        });
        rig.scheduler.start().unwrap();

        rig.advance(5000);
        assert!(rig.probe(ScanKind::Ble).running.load(Ordering::SeqCst));
        assert_eq!(
            rig.scheduler.holder(ScanResource::InternalRadioCore).unwrap(),
            Holder::BleScan
        );
        assert!(!serial.active.load(Ordering::SeqCst));

        rig.advance(2000);
        assert!(!rig.probe(ScanKind::Ble).running.load(Ordering::SeqCst));
        assert_eq!(
            rig.scheduler.holder(ScanResource::InternalRadioCore).unwrap(),
            Holder::SerialControlLink
        );
        assert!(serial.active.load(Ordering::SeqCst));
        assert_eq!(serial.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(serial.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(rig.scheduler.get_stats().unwrap().ble_scans_completed, 1);
    }

    #[test]
    fn pausing_ble_mid_burst_keeps_pairing() {
        let serial = Arc::new(HolderProbe::default());
        serial.active.store(true, Ordering::SeqCst);
        let s = serial.clone();
        let rig = rig_with(internal_config(), move |b| {
            b.participant(ScanResource::InternalRadioCore, Box::new(FakeHolder(s)))
        });
        rig.scheduler.start().unwrap();
        rig.advance(5000);
        assert_eq!(serial.pauses.load(Ordering::SeqCst), 1);

        rig.scheduler.pause(ScanKind::Ble).unwrap();
        rig.scheduler.pause(ScanKind::Ble).unwrap();
        assert_eq!(serial.resumes.load(Ordering::SeqCst), 1);

        // No bursts while paused.
        rig.advance(10_000);
        assert_eq!(serial.pauses.load(Ordering::SeqCst), 1);

        rig.scheduler.resume(ScanKind::Ble).unwrap();
        rig.advance(100);
        assert_eq!(serial.pauses.load(Ordering::SeqCst), 2);
        let stats = rig
            .scheduler
            .pairing_stats(ScanResource::InternalRadioCore)
            .unwrap();
        assert_eq!(stats.pauses, 2);
        assert_eq!(stats.resumes, 1);
    }

    #[test]
    fn pause_subghz_is_idempotent_and_resume_retunes() {
        let rig = rig_with(internal_config(), |b| b);
        rig.scheduler.start().unwrap();
        rig.advance(2500);

        rig.scheduler.pause(ScanKind::SubGhz).unwrap();
        rig.scheduler.pause(ScanKind::SubGhz).unwrap();
        assert!(rig.scheduler.is_paused(ScanKind::SubGhz));
        let subghz = rig.probe(ScanKind::SubGhz);
        assert!(!subghz.running.load(Ordering::SeqCst));
        assert_eq!(subghz.stops.load(Ordering::SeqCst), 1);

        rig.advance(10_000);
        assert_eq!(rig.scheduler.get_stats().unwrap().subghz_frequencies_scanned, 1);

        rig.scheduler.resume(ScanKind::SubGhz).unwrap();
        rig.scheduler.resume(ScanKind::SubGhz).unwrap();
        assert!(subghz.running.load(Ordering::SeqCst));
        assert_eq!(subghz.frequency.load(Ordering::SeqCst), 433_920_000);
        assert_eq!(subghz.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ir_bursts_while_usb_active() {
        let usb = Arc::new(HolderProbe::default());
        usb.active.store(true, Ordering::SeqCst);
        let u = usb.clone();
        let rig = rig_with(internal_config(), move |b| {
            b.participant(ScanResource::UsbDmaTimer, Box::new(FakeHolder(u)))
        });
        rig.scheduler.start().unwrap();
        let ir = rig.probe(ScanKind::Ir);
        assert!(!ir.running.load(Ordering::SeqCst));

        rig.advance(10_000);
        assert!(ir.running.load(Ordering::SeqCst));
        assert!(!usb.active.load(Ordering::SeqCst));

        rig.advance(3000);
        assert!(!ir.running.load(Ordering::SeqCst));
        assert!(usb.active.load(Ordering::SeqCst));
        assert_eq!(rig.scheduler.get_stats().unwrap().ir_bursts_completed, 1);
    }

    #[test]
    fn ir_restarts_when_usb_idle() {
        let rig = rig_with(internal_config(), |b| b);
        rig.scheduler.start().unwrap();
        let ir = rig.probe(ScanKind::Ir);
        ir.running.store(false, Ordering::SeqCst);
        rig.advance(100);
        assert!(ir.running.load(Ordering::SeqCst));
        assert_eq!(ir.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cleanup_waits_for_decode() {
        let rig = rig_with(internal_config(), |b| b);
        rig.scheduler.start().unwrap();
        let subghz = rig.probe(ScanKind::SubGhz);
        subghz.decoding.store(true, Ordering::SeqCst);
        rig.advance(60_000);
        assert_eq!(rig.scheduler.get_stats().unwrap().cleanups, 0);

        subghz.decoding.store(false, Ordering::SeqCst);
        rig.advance(100);
        let stats = rig.scheduler.get_stats().unwrap();
        assert_eq!(stats.cleanups, 1);
        assert_eq!(rig.probe(ScanKind::Nfc).starts.load(Ordering::SeqCst), 2);
        assert_eq!(stats.uptime_secs, 60);
    }

    #[test]
    fn stop_releases_everything() {
        let serial = Arc::new(HolderProbe::default());
        serial.active.store(true, Ordering::SeqCst);
        let s = serial.clone();
        let rig = rig_with(internal_config(), move |b| {
            b.participant(ScanResource::InternalRadioCore, Box::new(FakeHolder(s)))
        });
        rig.scheduler.start().unwrap();
        rig.advance(5000);
        rig.scheduler.stop().unwrap();
        rig.scheduler.stop().unwrap();

        assert!(!rig.scheduler.is_running());
        for kind in ScanKind::ALL {
            assert!(!rig.probe(kind).running.load(Ordering::SeqCst), "{kind:?}");
        }
        assert!(serial.active.load(Ordering::SeqCst));
        assert_eq!(serial.pauses.load(Ordering::SeqCst), serial.resumes.load(Ordering::SeqCst));
    }

    #[test]
    fn detections_counted_and_delivered_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let rig = rig_with(internal_config(), move |b| {
            b.on_detection(move |d| sink.lock().push(d.kind()))
        });

        // Dropped while stopped.
        rig.scheduler.report(Detection::SubGhz(SubGhzSignal {
            frequency: 433_920_000,
            rssi: -60,
            modulation: 0,
            duration_ms: 10,
            protocol: Default::default(),
        }));
        assert!(seen.lock().is_empty());

        rig.scheduler.start().unwrap();
        rig.scheduler.report(Detection::SubGhz(SubGhzSignal {
            frequency: 433_920_000,
            rssi: -60,
            modulation: 0,
            duration_ms: 10,
            protocol: Default::default(),
        }));
        rig.scheduler.report(Detection::Deauth(DeauthEvent {
            bssid: [1; 6],
            target: [2; 6],
            reason: 7,
            rssi: -50,
            count: 1,
        }));
        let stats = rig.scheduler.get_stats().unwrap();
        assert_eq!(stats.subghz_detections, 1);
        assert_eq!(stats.wifi_detections, 1);
        assert_eq!(stats.total_detections(), 2);
        assert_eq!(*seen.lock(), vec![ScanKind::SubGhz, ScanKind::Wifi]);
    }

    fn subghz_hit() -> Detection {
        Detection::SubGhz(SubGhzSignal {
            frequency: 433_920_000,
            rssi: -60,
            modulation: 0,
            duration_ms: 10,
            protocol: Default::default(),
        })
    }

    #[test]
    fn slow_consumer_delays_but_never_loses_detections() {
        let mut config = internal_config();
        config.lock_timeout_ms = 20;
        let delivered = Arc::new(AtomicU32::new(0));
        let sink = delivered.clone();
        let rig = rig_with(config, move |b| {
            b.on_detection(move |_| {
                if sink.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(150));
                }
            })
        });
        rig.scheduler.start().unwrap();

        let scheduler = rig.scheduler.clone();
        let first = thread::spawn(move || scheduler.report(subghz_hit()));
        let deadline = Instant::now() + Duration::from_secs(2);
        while delivered.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "first detection never delivered");
            thread::sleep(Duration::from_millis(1));
        }

        // Waits well past the lock timeout behind the first callback.
        rig.scheduler.report(subghz_hit());
        first.join().unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(rig.scheduler.get_stats().unwrap().subghz_detections, 2);
    }

    #[test]
    fn internal_wifi_pass_goes_to_wips() {
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = alerts.clone();
        let rig = rig_with(internal_config(), move |b| {
            b.on_alert(move |a| sink.lock().push(a.alert_type))
        });
        rig.scheduler.start().unwrap();
        for last in [1u8, 2] {
            rig.scheduler.report(Detection::Wifi(WifiNetwork {
                ssid: NameString::try_from("Corp").unwrap(),
                bssid: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last],
                rssi: -60,
                channel: 6,
                security: SecurityType::Wpa2,
                hidden: false,
            }));
        }
        assert!(alerts.lock().is_empty());

        rig.advance(10_000);
        assert_eq!(*alerts.lock(), vec![crate::wips::AlertType::EvilTwin]);
        let stats = rig.scheduler.get_stats().unwrap();
        assert_eq!(stats.wifi_scans_completed, 1);
        assert_eq!(stats.wips_alerts, 1);
        assert_eq!(rig.scheduler.wips_stats().unwrap().evil_twin_count, 1);
    }

    struct WireWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for WireWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sent_commands(wire: &Mutex<Vec<u8>>) -> Vec<(u8, Vec<u8>)> {
        let bytes = std::mem::take(&mut *wire.lock());
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for b in bytes {
            if let Feed::Frame(f) = decoder.feed(b) {
                out.push((f.command, f.payload));
            }
        }
        out
    }

    fn external_info() -> RadioInfo {
        RadioInfo {
            radio_type: RadioType::MultiBoard,
            name: heapless::String::try_from("Multi").unwrap(),
            version: (1, 0, 0),
            capabilities: Capabilities::NONE
                .with(Capability::SubGhzRx)
                .with(Capability::BleScan)
                .with(Capability::WifiScan),
        }
    }

    #[test]
    fn external_radio_takes_over_and_returns() {
        let clock = Arc::new(ManualClock::new());
        let (link, events) = LinkManager::new(LinkConfig::default(), clock.clone());
        let wire = Arc::new(Mutex::new(Vec::new()));
        link.open(Box::new(WireWriter(wire.clone()))).unwrap();

        let subghz = Arc::new(ScannerProbe::default());
        let scheduler = DetectionScheduler::builder(SchedulerConfig::default(), clock.clone())
            .scanner(ScanKind::SubGhz, Box::new(FakeScanner(subghz.clone())))
            .link(link.clone(), events)
            .build();
        scheduler.start().unwrap();
        assert!(subghz.running.load(Ordering::SeqCst));
        assert!(sent_commands(&wire).is_empty());

        scheduler.handle_radio_event(RadioEvent::LinkConnected(Some(external_info())));
        let sources = scheduler.sources().unwrap();
        assert!(sources.subghz_external && !sources.subghz_internal);
        assert!(sources.wifi_external);
        assert!(!subghz.running.load(Ordering::SeqCst));
        let sent = sent_commands(&wire);
        assert_eq!(
            sent,
            vec![
                (Command::SubGhzSetFreq.as_byte(), 315_000_000u32.to_be_bytes().to_vec()),
                (Command::SubGhzRxStart.as_byte(), vec![]),
                (Command::WifiScanStart.as_byte(), vec![]),
            ]
        );

        clock.advance_ms(2500);
        scheduler.tick();
        let sent = sent_commands(&wire);
        assert!(sent.contains(&(
            Command::SubGhzSetFreq.as_byte(),
            433_920_000u32.to_be_bytes().to_vec()
        )));

        clock.advance_ms(2500);
        scheduler.tick();
        let sent = sent_commands(&wire);
        assert!(sent.contains(&(Command::BleScanStart.as_byte(), vec![])));

        scheduler.handle_radio_event(RadioEvent::LinkDisconnected);
        assert!(subghz.running.load(Ordering::SeqCst));
        assert_eq!(subghz.frequency.load(Ordering::SeqCst), 868_350_000);
    }

    #[test]
    fn external_ble_bursts_are_started_and_stopped() {
        let clock = Arc::new(ManualClock::new());
        let (link, events) = LinkManager::new(LinkConfig::default(), clock.clone());
        let wire = Arc::new(Mutex::new(Vec::new()));
        link.open(Box::new(WireWriter(wire.clone()))).unwrap();
        let scheduler = DetectionScheduler::builder(SchedulerConfig::default(), clock.clone())
            .link(link, events)
            .build();
        scheduler.start().unwrap();
        scheduler.handle_radio_event(RadioEvent::LinkConnected(Some(external_info())));
        assert!(scheduler.sources().unwrap().ble_external);
        sent_commands(&wire);

        let mut ble = Vec::new();
        for _ in 0..140 {
            clock.advance_ms(100);
            scheduler.tick();
            ble.extend(sent_commands(&wire).into_iter().filter_map(|(cmd, _)| {
                if cmd == Command::BleScanStart.as_byte() {
                    Some("start")
                } else if cmd == Command::BleScanStop.as_byte() {
                    Some("stop")
                } else {
                    None
                }
            }));
        }
        // Start at 5 s, stop 2 s later, next start 5 s after that.
        assert_eq!(ble, vec!["start", "stop", "start", "stop"]);
    }

    #[test]
    fn external_scan_pass_and_counters() {
        let clock = Arc::new(ManualClock::new());
        let (link, events) = LinkManager::new(LinkConfig::default(), clock.clone());
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = alerts.clone();
        let scheduler = DetectionScheduler::builder(SchedulerConfig::default(), clock.clone())
            .link(link, events)
            .on_alert(move |a| sink.lock().push(a.clone()))
            .build();
        scheduler.start().unwrap();

        let record = |last: u8| {
            let mut rec = vec![0u8; EXT_WIFI_NETWORK_LEN];
            rec[..4].copy_from_slice(b"Corp");
            rec[33..39].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]);
            rec[39] = (-50i8) as u8;
            rec[40] = 1;
            rec[41] = 3;
            rec
        };
        for last in [1u8, 2, 1] {
            scheduler.handle_radio_event(RadioEvent::Detection {
                response: Response::WifiNetwork.as_byte(),
                payload: record(last),
            });
        }
        scheduler.handle_radio_event(RadioEvent::Detection {
            response: Response::WifiScanDone.as_byte(),
            payload: vec![],
        });
        scheduler.handle_radio_event(RadioEvent::Detection {
            response: Response::BleScanDone.as_byte(),
            payload: vec![],
        });
        // Heartbeat acks are not detections.
        scheduler.handle_radio_event(RadioEvent::Detection {
            response: Response::Ack.as_byte(),
            payload: vec![],
        });

        let alerts = alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].bssids.len(), 2);
        let stats = scheduler.get_stats().unwrap();
        assert_eq!(stats.wifi_detections, 3);
        assert_eq!(stats.wifi_scans_completed, 1);
        assert_eq!(stats.ble_scans_completed, 1);
    }

    struct Lines(Arc<Mutex<Vec<String>>>);

    impl Uplink for Lines {
        fn send(&self, bytes: &[u8]) -> io::Result<()> {
            self.0
                .lock()
                .push(String::from_utf8_lossy(bytes).into_owned());
            Ok(())
        }
    }

    #[test]
    fn deauth_flood_reported_once() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let up = lines.clone();
        let rig = rig_with(internal_config(), move |b| {
            b.reporter(Box::new(NdjsonSerializer), Box::new(Lines(up)))
        });
        rig.scheduler.start().unwrap();
        for _ in 0..15 {
            rig.clock.advance_ms(50);
            rig.scheduler.report(Detection::Deauth(DeauthEvent {
                bssid: [0x10; 6],
                target: [0xFF; 6],
                reason: 7,
                rssi: -40,
                count: 1,
            }));
        }
        let lines = lines.lock();
        let deauths = lines.iter().filter(|l| l.contains(r#""type":"deauth""#)).count();
        let alerts: Vec<_> = lines
            .iter()
            .filter(|l| l.contains(r#""alert":"deauth_attack""#))
            .collect();
        assert_eq!(deauths, 15);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains(r#""severity":"critical""#));
        assert_eq!(rig.scheduler.get_stats().unwrap().wips_alerts, 1);
    }

    #[test]
    fn status_report_published() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let up = lines.clone();
        let rig = rig_with(internal_config(), move |b| {
            b.reporter(Box::new(NdjsonSerializer), Box::new(Lines(up)))
        });
        rig.scheduler.start().unwrap();
        rig.advance(3000);
        rig.scheduler.publish_status().unwrap();
        let lines = lines.lock();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(r#""type":"status""#));
        assert!(lines[0].contains(r#""uptime":3"#));
        assert!(lines[0].contains(r#""radio":"disconnected""#));
    }

    #[test]
    fn spawned_worker_ticks_until_stopped() {
        let mut config = internal_config();
        config.tick_ms = 5;
        let rig = rig_with(config, |b| b);
        rig.scheduler.start().unwrap();
        let mut handle = rig.scheduler.spawn().unwrap();
        rig.clock.advance_ms(2500);
        let deadline = Instant::now() + Duration::from_secs(2);
        while rig.scheduler.get_stats().unwrap().subghz_frequencies_scanned == 0 {
            assert!(Instant::now() < deadline, "worker never ticked");
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert!(rig.scheduler.is_running());
    }
}
