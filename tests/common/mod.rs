//! Shared fixtures: a serial wire backed by a channel and a scripted
//! co-processor that answers the discovery handshake.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use flockbridge::clock::Clock;
use flockbridge::config::LinkConfig;
use flockbridge::frame::{encode, Command, Feed, FrameDecoder, Response};
use flockbridge::link::{LinkManager, RadioEvent};
use flockbridge::radio::{Capabilities, Capability, RadioInfo, RadioType};

pub struct WireWriter(Sender<Vec<u8>>);

impl std::io::Write for WireWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.0.send(buf.to_vec());
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Fake external radio: answers `Ping` with `Ack` and `GetInfo` with its
/// identity, records every command it sees.
pub struct CoProcessor {
    seen: Arc<Mutex<Vec<u8>>>,
    muted: Arc<AtomicBool>,
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl CoProcessor {
    pub fn spawn(link: &LinkManager, wire: Receiver<Vec<u8>>, info: RadioInfo) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let muted = Arc::new(AtomicBool::new(false));
        let (stop, stop_rx) = channel::bounded::<()>(1);
        let link = link.clone();
        let (s, m) = (seen.clone(), muted.clone());

        let thread = thread::spawn(move || {
            let mut decoder = FrameDecoder::new();
            loop {
                let bytes = match wire.recv_timeout(Duration::from_millis(10)) {
                    Ok(bytes) => bytes,
                    Err(RecvTimeoutError::Timeout) => {
                        if stop_rx.try_recv().is_ok() {
                            break;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                for b in bytes {
                    let Feed::Frame(frame) = decoder.feed(b) else {
                        continue;
                    };
                    s.lock().push(frame.command);
                    if m.load(Ordering::SeqCst) {
                        continue;
                    }
                    let reply = if frame.command == Command::Ping.as_byte() {
                        encode(Response::Ack.as_byte(), &[])
                    } else if frame.command == Command::GetInfo.as_byte() {
                        encode(Response::Info.as_byte(), &info.encode())
                    } else {
                        continue;
                    };
                    link.feed(&reply.unwrap());
                }
            }
        });

        Self {
            seen,
            muted,
            stop,
            thread: Some(thread),
        }
    }

    pub fn mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn seen(&self) -> Vec<u8> {
        self.seen.lock().clone()
    }
}

impl Drop for CoProcessor {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

pub fn multi_radio() -> RadioInfo {
    RadioInfo {
        radio_type: RadioType::Esp32,
        name: heapless::String::try_from("wifi-board").unwrap(),
        version: (2, 1, 0),
        capabilities: Capabilities::NONE
            .with(Capability::WifiScan)
            .with(Capability::WifiInject)
            .with(Capability::BleScan),
    }
}

pub fn open_link(clock: Arc<dyn Clock>) -> (LinkManager, Receiver<RadioEvent>, Receiver<Vec<u8>>) {
    let (link, events) = LinkManager::new(LinkConfig::new(), clock);
    let (tx, rx) = channel::unbounded();
    link.open(Box::new(WireWriter(tx))).unwrap();
    (link, events, rx)
}
