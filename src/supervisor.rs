/// Discovery, heartbeat and reconnect policy for the external radio.
///
/// ```text
/// Detecting --ping ok--> Connected --silence / send failures--> Disconnected
///     |                      ^                                      |
///     +--3 failed pings------+----------------------------+         |
///                            |                            v         v
///                            +------ping ok------- Reconnecting <---+ (every retry interval)
/// ```
///
/// Absence of the radio is a normal operating mode: losing it emits one
/// [`RadioEvent::LinkDisconnected`] so consumers stop issuing external-radio
/// commands, and internal-only scanning carries on.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, RecvTimeoutError, Sender};

use crate::config::SupervisorConfig;
use crate::frame::Command;
use crate::link::{LinkManager, LinkState, RadioEvent};
use crate::radio::RadioInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Detecting = 0,
    Connected = 1,
    Disconnected = 2,
    Reconnecting = 3,
}

impl SupervisorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SupervisorState::Connected,
            2 => SupervisorState::Disconnected,
            3 => SupervisorState::Reconnecting,
            _ => SupervisorState::Detecting,
        }
    }
}

/// State cell shared between the worker and its handle. Readers never wait
/// on the worker, even while it blocks in a ping.
#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new(state: SupervisorState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    fn get(&self) -> SupervisorState {
        SupervisorState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `new`, returning the previous state.
    fn replace(&self, new: SupervisorState) -> SupervisorState {
        SupervisorState::from_u8(self.0.swap(new as u8, Ordering::AcqRel))
    }
}

pub struct LinkSupervisor {
    link: LinkManager,
    config: SupervisorConfig,
    state: SharedState,
    detect_failures: u8,
    consecutive_failures: u8,
    last_heartbeat: Option<Instant>,
    last_reconnect: Option<Instant>,
}

impl LinkSupervisor {
    pub fn new(link: LinkManager, config: SupervisorConfig) -> Self {
        Self {
            link,
            config,
            state: SharedState::new(SupervisorState::Detecting),
            detect_failures: 0,
            consecutive_failures: 0,
            last_heartbeat: None,
            last_reconnect: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state.get()
    }

    pub fn consecutive_failures(&self) -> u8 {
        self.consecutive_failures
    }

    /// Run one step of the state machine. A detection or reconnect step
    /// blocks for at most one ping timeout (plus one info timeout on success).
    pub fn poll(&mut self) -> SupervisorState {
        let now = self.link.clock().now();
        match self.state() {
            SupervisorState::Detecting => {
                self.link.set_state(LinkState::Connecting);
                if self.ping() {
                    self.on_connected();
                } else {
                    self.detect_failures += 1;
                    log::debug!(
                        "External radio ping {}/{} unanswered",
                        self.detect_failures,
                        self.config.detect_attempts
                    );
                    if self.detect_failures >= self.config.detect_attempts {
                        log::info!("No external radio detected, continuing with internal radios");
                        self.on_disconnected(now);
                    }
                }
            }
            SupervisorState::Connected => {
                if self
                    .last_heartbeat
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.config.heartbeat_interval())
                {
                    self.last_heartbeat = Some(now);
                    match self.link.send_async(Command::Ping, &[]) {
                        Ok(()) => self.consecutive_failures = 0,
                        Err(e) => {
                            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                            log::warn!(
                                "Heartbeat failed ({}/{}): {}",
                                self.consecutive_failures,
                                self.config.max_consecutive_failures,
                                e
                            );
                        }
                    }
                }

                let silent = self
                    .link
                    .since_last_rx()
                    .map_or(true, |d| d > self.config.rx_silence_limit());
                if self.consecutive_failures >= self.config.max_consecutive_failures || silent {
                    log::warn!(
                        "External radio lost (failures={}, silent={})",
                        self.consecutive_failures,
                        silent
                    );
                    self.on_disconnected(now);
                }
            }
            SupervisorState::Disconnected => {
                let due = self
                    .last_reconnect
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.config.reconnect_interval());
                if due {
                    self.set_state(SupervisorState::Reconnecting);
                    self.reconnect(now);
                }
            }
            SupervisorState::Reconnecting => self.reconnect(now),
        }
        self.state()
    }

    fn reconnect(&mut self, now: Instant) {
        log::debug!("Attempting to reconnect to external radio");
        self.last_reconnect = Some(now);
        if self.ping() {
            self.on_connected();
        } else {
            self.set_state(SupervisorState::Disconnected);
        }
    }

    fn ping(&self) -> bool {
        self.link
            .send_sync(Command::Ping, &[], self.config.ping_timeout())
            .is_ok()
    }

    fn on_connected(&mut self) {
        let info = match self
            .link
            .send_sync(Command::GetInfo, &[], self.config.ping_timeout())
        {
            Ok(reply) => RadioInfo::parse(&reply.payload),
            Err(e) => {
                log::warn!("External radio info request failed: {}", e);
                None
            }
        };
        match &info {
            Some(i) => log::info!(
                "External radio connected: {} ({}) v{}.{}.{} caps=0x{:08X}",
                i.name,
                i.radio_type.name(),
                i.version.0,
                i.version.1,
                i.version.2,
                i.capabilities.0
            ),
            None => log::info!("External radio connected (no info)"),
        }

        self.link.set_info(info.clone());
        self.link.set_state(LinkState::Connected);
        self.detect_failures = 0;
        self.consecutive_failures = 0;
        self.last_heartbeat = Some(self.link.clock().now());
        self.set_state(SupervisorState::Connected);
        self.link.emit(RadioEvent::LinkConnected(info));
    }

    fn on_disconnected(&mut self, now: Instant) {
        self.link.set_state(LinkState::Disconnected);
        self.link.set_info(None);
        self.consecutive_failures = 0;
        self.last_reconnect = Some(now);
        self.set_state(SupervisorState::Disconnected);
        self.link.emit(RadioEvent::LinkDisconnected);
    }

    fn set_state(&self, new: SupervisorState) {
        let old = self.state.replace(new);
        if old != new {
            log::debug!("Supervisor {:?} -> {:?}", old, new);
        }
    }

    /// Run the supervisor on its own thread until the handle is stopped.
    pub fn spawn(mut self) -> std::io::Result<SupervisorHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let state = self.state.clone();
        let boot_delay = self.config.boot_delay();
        let tick = self.config.tick();

        let thread = thread::Builder::new()
            .name("radio-supervisor".into())
            .spawn(move || {
                // Let the radio finish booting.
                if stop_rx.recv_timeout(boot_delay).is_ok() {
                    return;
                }
                log::info!("External radio supervisor started");
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {
                            self.poll();
                        }
                        // Stop requested or handle dropped.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::info!("External radio supervisor stopped");
            })?;

        Ok(SupervisorHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
            state,
        })
    }
}

/// Owner of a running supervisor thread. Dropping it stops the thread.
pub struct SupervisorHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    state: SharedState,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        self.state.get()
    }

    /// Signal the worker and wait for it to observe the stop at its next tick.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Supervisor thread panicked");
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
