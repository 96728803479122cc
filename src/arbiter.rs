/// Ownership of the physically shared scan resources.
///
/// Two contention domains exist:
/// - `InternalRadioCore`: the BLE controller, normally carrying the serial
///   control link to the companion, borrowed for BLE scan bursts.
/// - `UsbDmaTimer`: the timer/DMA pair used by USB bulk transfer, borrowed
///   for IR capture bursts.
///
/// Each resource has a default holder and one alternate. A burst pauses the
/// default holder, hands the resource to the alternate, and on completion
/// resumes the default holder. Every successful pause is matched by exactly
/// one resume.
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanResource {
    InternalRadioCore,
    UsbDmaTimer,
}

impl ScanResource {
    pub const ALL: [ScanResource; 2] = [ScanResource::InternalRadioCore, ScanResource::UsbDmaTimer];

    fn index(self) -> usize {
        match self {
            ScanResource::InternalRadioCore => 0,
            ScanResource::UsbDmaTimer => 1,
        }
    }

    pub fn default_holder(self) -> Holder {
        match self {
            ScanResource::InternalRadioCore => Holder::SerialControlLink,
            ScanResource::UsbDmaTimer => Holder::UsbBulkTransfer,
        }
    }

    pub fn alternate(self) -> Holder {
        match self {
            ScanResource::InternalRadioCore => Holder::BleScan,
            ScanResource::UsbDmaTimer => Holder::IrScan,
        }
    }
}

/// Logical user of a shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    SerialControlLink,
    BleScan,
    UsbBulkTransfer,
    IrScan,
}

/// A subsystem that can yield its resource for a burst (the companion
/// transport over BLE, the USB CDC endpoint).
pub trait ResourceParticipant: Send {
    /// Suspend use of the resource. Returns `false` if it refused.
    fn pause(&mut self) -> bool;

    /// Resume after a burst. Returns `false` if it failed to come back.
    fn resume(&mut self) -> bool;

    /// Whether the participant is currently using the resource.
    fn is_active(&self) -> bool;
}

/// Pause/resume bookkeeping for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairingStats {
    pub pauses: u32,
    pub resumes: u32,
    pub bursts: u32,
    pub refused: u32,
}

struct Slot {
    holder: Holder,
    since: Instant,
    participant: Option<Box<dyn ResourceParticipant>>,
    paused_by_us: bool,
    stats: PairingStats,
}

pub struct ResourceArbiter {
    slots: [Slot; 2],
}

impl ResourceArbiter {
    pub fn new(now: Instant) -> Self {
        let slot = |r: ScanResource| Slot {
            holder: r.default_holder(),
            since: now,
            participant: None,
            paused_by_us: false,
            stats: PairingStats::default(),
        };
        Self {
            slots: [
                slot(ScanResource::InternalRadioCore),
                slot(ScanResource::UsbDmaTimer),
            ],
        }
    }

    /// Register the default holder's pause/resume interface.
    pub fn attach(&mut self, resource: ScanResource, participant: Box<dyn ResourceParticipant>) {
        self.slots[resource.index()].participant = Some(participant);
    }

    pub fn holder(&self, resource: ScanResource) -> Holder {
        self.slots[resource.index()].holder
    }

    pub fn held_since(&self, resource: ScanResource) -> Instant {
        self.slots[resource.index()].since
    }

    pub fn stats(&self, resource: ScanResource) -> PairingStats {
        self.slots[resource.index()].stats
    }

    /// Whether the default holder is present and using the resource. When
    /// it is not, the alternate may run without bursting.
    pub fn default_holder_active(&self, resource: ScanResource) -> bool {
        self.slots[resource.index()]
            .participant
            .as_ref()
            .is_some_and(|p| p.is_active())
    }

    /// Hand the resource to its alternate holder, pausing the default holder
    /// if it is active. Returns `false` if the default holder refused to
    /// pause; the burst must then be skipped.
    pub fn begin_burst(&mut self, resource: ScanResource, now: Instant) -> bool {
        let slot = &mut self.slots[resource.index()];
        let alternate = resource.alternate();
        if slot.holder == alternate {
            return true;
        }

        if let Some(p) = slot.participant.as_mut() {
            if p.is_active() {
                if !p.pause() {
                    slot.stats.refused += 1;
                    log::warn!(
                        "{:?} refused to pause, skipping {:?} burst",
                        resource.default_holder(),
                        alternate
                    );
                    return false;
                }
                slot.paused_by_us = true;
                slot.stats.pauses += 1;
                log::info!("Paused {:?} for {:?} burst", resource.default_holder(), alternate);
            }
        }

        slot.holder = alternate;
        slot.since = now;
        slot.stats.bursts += 1;
        true
    }

    /// Return the resource to its default holder, resuming it if this
    /// arbiter paused it. No-op if no burst is in progress.
    pub fn end_burst(&mut self, resource: ScanResource, now: Instant) {
        let slot = &mut self.slots[resource.index()];
        if slot.holder != resource.alternate() {
            return;
        }
        Self::resume_default(resource, slot);
        slot.holder = resource.default_holder();
        slot.since = now;
    }

    /// End every burst in progress (scheduler shutdown).
    pub fn release_all(&mut self, now: Instant) {
        for r in ScanResource::ALL {
            self.end_burst(r, now);
            // A resume that failed earlier gets one more attempt.
            let slot = &mut self.slots[r.index()];
            Self::resume_default(r, slot);
        }
    }

    fn resume_default(resource: ScanResource, slot: &mut Slot) {
        if !slot.paused_by_us {
            return;
        }
        let Some(p) = slot.participant.as_mut() else {
            slot.paused_by_us = false;
            return;
        };
        if p.resume() {
            slot.paused_by_us = false;
            slot.stats.resumes += 1;
            log::info!("Resumed {:?}", resource.default_holder());
        } else {
            log::error!("Failed to resume {:?}", resource.default_holder());
        }
    }
}
