/// Wireless intrusion correlation over the live WiFi detection stream.
///
/// Per-pass detectors (evil twin, rogue AP, weak encryption, suspicious open
/// network, strong hidden network) run over one complete scan pass. The
/// windowed detectors (deauth flood, karma) consume individual events and
/// keep their history in [`RecordRing`]s. A known-network cache remembers
/// every BSSID seen so far so a later pass can tell new access points from
/// familiar ones.
///
/// The engine is not internally synchronized; the scheduler owns it behind
/// its own lock.
use core::fmt::Write;
use std::sync::Arc;
use std::time::Instant;

use heapless::Vec;

use crate::clock::{millis_since, Clock};
use crate::config::WipsConfig;
use crate::defaults::{is_suspicious_open_ssid, HIDDEN_SSID_LABEL};
use crate::protocol::{DescString, NameString};
use crate::ring::RecordRing;
use crate::scanner::{DeauthEvent, Mac, SecurityType, WifiNetwork};

/// Known-network cache size.
pub const KNOWN_NETWORK_CAPACITY: usize = 64;

/// Ring capacity for deauth and probe-response history.
pub const RECORD_CAPACITY: usize = 32;

/// BSSIDs carried by a single alert.
pub const MAX_ALERT_BSSIDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertType {
    EvilTwin,
    DeauthAttack,
    KarmaAttack,
    HiddenStrong,
    SuspiciousOpen,
    WeakEncryption,
    RogueAp,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::EvilTwin => "evil_twin",
            AlertType::DeauthAttack => "deauth_attack",
            AlertType::KarmaAttack => "karma_attack",
            AlertType::HiddenStrong => "hidden_strong",
            AlertType::SuspiciousOpen => "suspicious_open",
            AlertType::WeakEncryption => "weak_encryption",
            AlertType::RogueAp => "rogue_ap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

/// An emitted alert. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: Severity,
    /// Milliseconds since the engine was created
    pub timestamp_ms: u32,
    /// Subject network name (empty for deauth floods)
    pub ssid: NameString,
    pub bssids: Vec<Mac, MAX_ALERT_BSSIDS>,
    pub description: DescString,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WipsStats {
    pub evil_twin_count: u32,
    pub deauth_count: u32,
    pub karma_count: u32,
    pub rogue_ap_count: u32,
    pub total_alerts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownNetwork {
    pub bssid: Mac,
    pub ssid: NameString,
    pub last_rssi: i8,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy)]
struct DeauthRecord {
    bssid: Mac,
    seen: Instant,
}

#[derive(Debug, Clone)]
struct ProbeResponseRecord {
    bssid: Mac,
    ssid: NameString,
    seen: Instant,
}

pub struct WipsEngine {
    config: WipsConfig,
    clock: Arc<dyn Clock>,
    epoch: Instant,
    known: Vec<KnownNetwork, KNOWN_NETWORK_CAPACITY>,
    deauths: RecordRing<DeauthRecord, RECORD_CAPACITY>,
    probe_responses: RecordRing<ProbeResponseRecord, RECORD_CAPACITY>,
    stats: WipsStats,
}

impl WipsEngine {
    pub fn new(config: WipsConfig, clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now();
        Self {
            config,
            clock,
            epoch,
            known: Vec::new(),
            deauths: RecordRing::new(),
            probe_responses: RecordRing::new(),
            stats: WipsStats::default(),
        }
    }

    pub fn config(&self) -> &WipsConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: WipsConfig) {
        self.config = config;
    }

    pub fn stats(&self) -> WipsStats {
        self.stats
    }

    pub fn known_networks(&self) -> &[KnownNetwork] {
        &self.known
    }

    /// Forget all history and zero the statistics.
    pub fn reset(&mut self) {
        self.known.clear();
        self.deauths.clear();
        self.probe_responses.clear();
        self.stats = WipsStats::default();
    }

    /// Run the per-pass detectors over one complete scan pass, then fold the
    /// pass into the known-network cache.
    pub fn analyze_scan(&mut self, networks: &[WifiNetwork]) -> std::vec::Vec<Alert> {
        let now = self.clock.now();
        let mut alerts = std::vec::Vec::new();
        let mut reported_twins: std::vec::Vec<&str> = std::vec::Vec::new();
        let mut reported_rogues: std::vec::Vec<Mac> = std::vec::Vec::new();

        for (i, net) in networks.iter().enumerate() {
            if net.ssid.is_empty() {
                if self.config.detect_hidden_strong && net.rssi > self.config.hidden_strong_rssi {
                    let mut desc = DescString::new();
                    let _ = write!(desc, "Strong hidden network ({} dBm)", net.rssi);
                    alerts.push(self.alert(
                        now,
                        AlertType::HiddenStrong,
                        Severity::Medium,
                        HIDDEN_SSID_LABEL,
                        &[net.bssid],
                        desc,
                    ));
                }
                continue;
            }

            if self.config.detect_evil_twin && !reported_twins.contains(&net.ssid.as_str()) {
                let bssids = distinct_bssids_for(&networks[i..], &net.ssid);
                if bssids.len() > 1 {
                    reported_twins.push(net.ssid.as_str());
                    let mut desc = DescString::new();
                    let _ = write!(desc, "Multiple APs ({}) with same SSID", bssids.len());
                    let shown = &bssids[..bssids.len().min(MAX_ALERT_BSSIDS)];
                    alerts.push(self.alert(
                        now,
                        AlertType::EvilTwin,
                        Severity::High,
                        &net.ssid,
                        shown,
                        desc,
                    ));
                    self.stats.evil_twin_count += 1;
                }
            }

            if self.config.detect_rogue_ap
                && !reported_rogues.contains(&net.bssid)
                && !self.is_known_bssid(&net.bssid)
                && self.is_known_ssid(&net.ssid)
            {
                reported_rogues.push(net.bssid);
                let desc = DescString::try_from("New AP advertising a known SSID").unwrap_or_default();
                alerts.push(self.alert(
                    now,
                    AlertType::RogueAp,
                    Severity::High,
                    &net.ssid,
                    &[net.bssid],
                    desc,
                ));
                self.stats.rogue_ap_count += 1;
            }

            if self.config.detect_weak_encryption && net.security.is_weak() {
                let desc = DescString::try_from("Using deprecated WEP encryption").unwrap_or_default();
                alerts.push(self.alert(
                    now,
                    AlertType::WeakEncryption,
                    Severity::Low,
                    &net.ssid,
                    &[net.bssid],
                    desc,
                ));
            }

            if self.config.detect_suspicious_open
                && net.security == SecurityType::Open
                && is_suspicious_open_ssid(&net.ssid)
            {
                let desc = DescString::try_from("Suspicious open network - possible honeypot")
                    .unwrap_or_default();
                alerts.push(self.alert(
                    now,
                    AlertType::SuspiciousOpen,
                    Severity::Medium,
                    &net.ssid,
                    &[net.bssid],
                    desc,
                ));
            }
        }

        for net in networks.iter().filter(|n| !n.ssid.is_empty()) {
            self.remember(net, now);
        }

        if !alerts.is_empty() {
            log::info!("WIPS: {} alert(s) from {} networks", alerts.len(), networks.len());
        }
        alerts
    }

    /// Record deauthentication activity. Returns a flood alert when the
    /// number of frames inside the window reaches the threshold; the window
    /// is then cleared so one flood yields one alert.
    pub fn record_deauth(&mut self, event: &DeauthEvent) -> Option<Alert> {
        let now = self.clock.now();
        let frames = event.count.clamp(1, RECORD_CAPACITY as u32);
        for _ in 0..frames {
            self.deauths.push(DeauthRecord {
                bssid: event.bssid,
                seen: now,
            });
        }

        if !self.config.detect_deauth {
            return None;
        }

        let window = self.config.deauth_window_ms;
        // Thresholds beyond the ring could never be reached.
        let threshold = self.config.deauth_threshold.clamp(1, RECORD_CAPACITY as u32);
        let count = self
            .deauths
            .count_where(|r| millis_since(r.seen, now) < window) as u32;
        if count < threshold {
            return None;
        }

        // Triggering BSSID first, then any others active in the window.
        let mut sources = std::vec![event.bssid];
        for r in self.deauths.iter() {
            if millis_since(r.seen, now) < window && !sources.contains(&r.bssid) {
                sources.push(r.bssid);
            }
        }

        let mut desc = DescString::new();
        let _ = write!(desc, "Deauth flood: {} frames in {}ms", count, window);
        let alert = self.alert(
            now,
            AlertType::DeauthAttack,
            Severity::Critical,
            "",
            &sources,
            desc,
        );
        self.stats.deauth_count += 1;
        self.deauths.invalidate_all();
        log::warn!("WIPS: deauth flood from {:02X?}", event.bssid);
        Some(alert)
    }

    /// Record a probe response. Returns a karma alert when one BSSID has
    /// answered for `karma_threshold` distinct SSIDs inside the window; that
    /// BSSID's history is then dropped.
    pub fn record_probe_response(&mut self, bssid: &Mac, ssid: &str) -> Option<Alert> {
        let now = self.clock.now();
        let window = self.config.karma_window_ms;
        self.probe_responses
            .retain(|r| millis_since(r.seen, now) < window);

        if self.config.detect_karma {
            let mut distinct: std::vec::Vec<&str> = std::vec::Vec::new();
            distinct.push(ssid);
            for r in self.probe_responses.iter().filter(|r| r.bssid == *bssid) {
                if !distinct.contains(&r.ssid.as_str()) {
                    distinct.push(r.ssid.as_str());
                }
            }

            let answered = distinct.len();
            if answered >= usize::from(self.config.karma_threshold.max(2)) {
                let mut desc = DescString::new();
                let _ = write!(desc, "AP responding to {}+ different probe requests", answered);
                let alert = self.alert(
                    now,
                    AlertType::KarmaAttack,
                    Severity::High,
                    ssid,
                    &[*bssid],
                    desc,
                );
                self.stats.karma_count += 1;
                self.probe_responses.retain(|r| r.bssid != *bssid);
                log::warn!("WIPS: karma behaviour from {:02X?}", bssid);
                return Some(alert);
            }
        }

        self.probe_responses.push(ProbeResponseRecord {
            bssid: *bssid,
            ssid: truncated(ssid),
            seen: now,
        });
        None
    }

    fn alert(
        &mut self,
        now: Instant,
        alert_type: AlertType,
        severity: Severity,
        ssid: &str,
        bssids: &[Mac],
        description: DescString,
    ) -> Alert {
        self.stats.total_alerts += 1;
        let mut list = Vec::new();
        for b in bssids.iter().take(MAX_ALERT_BSSIDS) {
            let _ = list.push(*b);
        }
        Alert {
            alert_type,
            severity,
            timestamp_ms: millis_since(self.epoch, now),
            ssid: truncated(ssid),
            bssids: list,
            description,
        }
    }

    fn is_known_bssid(&self, bssid: &Mac) -> bool {
        self.known.iter().any(|k| k.bssid == *bssid)
    }

    fn is_known_ssid(&self, ssid: &str) -> bool {
        self.known.iter().any(|k| k.ssid.as_str() == ssid)
    }

    /// Update a BSSID in place, or insert it, evicting the least recently
    /// seen entry when the cache is full.
    fn remember(&mut self, net: &WifiNetwork, now: Instant) {
        if let Some(k) = self.known.iter_mut().find(|k| k.bssid == net.bssid) {
            k.ssid = net.ssid.clone();
            k.last_rssi = net.rssi;
            k.last_seen = now;
            return;
        }
        let entry = KnownNetwork {
            bssid: net.bssid,
            ssid: net.ssid.clone(),
            last_rssi: net.rssi,
            last_seen: now,
        };
        match self.known.push(entry) {
            Ok(()) => {}
            Err(entry) => {
                if let Some(slot) = evict_known_slot(&self.known) {
                    self.known[slot] = entry;
                }
            }
        }
    }
}

/// Index of the least recently seen known network.
pub fn evict_known_slot(known: &[KnownNetwork]) -> Option<usize> {
    known
        .iter()
        .enumerate()
        .min_by_key(|(_, k)| k.last_seen)
        .map(|(i, _)| i)
}

fn distinct_bssids_for(networks: &[WifiNetwork], ssid: &str) -> std::vec::Vec<Mac> {
    let mut bssids: std::vec::Vec<Mac> = std::vec::Vec::new();
    for n in networks.iter().filter(|n| n.ssid.as_str() == ssid) {
        if !bssids.contains(&n.bssid) {
            bssids.push(n.bssid);
        }
    }
    bssids
}

fn truncated(s: &str) -> NameString {
    let mut out = NameString::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn net(ssid: &str, last: u8, security: SecurityType, rssi: i8) -> WifiNetwork {
        WifiNetwork {
            ssid: NameString::try_from(ssid).unwrap(),
            bssid: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last],
            rssi,
            channel: 6,
            security,
            hidden: ssid.is_empty(),
        }
    }

    fn engine() -> (WipsEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (WipsEngine::new(WipsConfig::default(), clock.clone()), clock)
    }

    fn deauth(count: u32) -> DeauthEvent {
        DeauthEvent {
            bssid: [0x10, 0x20, 0x30, 0x40, 0x50, 0x60],
            target: [0xFF; 6],
            reason: 7,
            rssi: -50,
            count,
        }
    }

    #[test]
    fn evil_twin_once_per_ssid_per_pass() {
        let (mut wips, _) = engine();
        let pass = [
            net("Corp", 1, SecurityType::Wpa2, -60),
            net("Corp", 2, SecurityType::Wpa2, -62),
            net("Corp", 1, SecurityType::Wpa2, -61),
        ];
        let alerts = wips.analyze_scan(&pass);
        let twins: std::vec::Vec<_> = alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::EvilTwin)
            .collect();
        assert_eq!(twins.len(), 1);
        assert_eq!(twins[0].severity, Severity::High);
        assert_eq!(twins[0].ssid.as_str(), "Corp");
        assert_eq!(twins[0].bssids.len(), 2);
        assert!(twins[0].bssids.contains(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 1]));
        assert!(twins[0].bssids.contains(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 2]));
        assert_eq!(twins[0].description.as_str(), "Multiple APs (2) with same SSID");
        assert_eq!(wips.stats().evil_twin_count, 1);
    }

    #[test]
    fn evil_twin_caps_bssid_list() {
        let (mut wips, _) = engine();
        let pass: std::vec::Vec<_> = (1..=6)
            .map(|i| net("Mall", i, SecurityType::Wpa2, -70))
            .collect();
        let alerts = wips.analyze_scan(&pass);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].bssids.len(), MAX_ALERT_BSSIDS);
        assert_eq!(alerts[0].description.as_str(), "Multiple APs (6) with same SSID");
    }

    #[test]
    fn single_ap_is_quiet() {
        let (mut wips, _) = engine();
        let alerts = wips.analyze_scan(&[net("Home", 1, SecurityType::Wpa3, -40)]);
        assert!(alerts.is_empty());
        assert_eq!(wips.known_networks().len(), 1);
    }

    #[test]
    fn rogue_ap_on_new_bssid_for_known_ssid() {
        let (mut wips, clock) = engine();
        assert!(wips
            .analyze_scan(&[net("Office", 1, SecurityType::Wpa2, -50)])
            .is_empty());
        clock.advance_ms(10_000);

        let alerts = wips.analyze_scan(&[net("Office", 9, SecurityType::Wpa2, -45)]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::RogueAp);
        assert_eq!(alerts[0].bssids[0], [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 9]);

        // Now known; no repeat.
        assert!(wips
            .analyze_scan(&[net("Office", 9, SecurityType::Wpa2, -45)])
            .is_empty());
        assert_eq!(wips.stats().rogue_ap_count, 1);
    }

    #[test]
    fn weak_and_suspicious_open() {
        let (mut wips, _) = engine();
        let alerts = wips.analyze_scan(&[
            net("OldRouter", 1, SecurityType::Wep, -70),
            net("Free Airport WiFi", 2, SecurityType::Open, -70),
            net("Free but locked", 3, SecurityType::Wpa2, -70),
        ]);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_type, AlertType::WeakEncryption);
        assert_eq!(alerts[0].severity, Severity::Low);
        assert_eq!(alerts[1].alert_type, AlertType::SuspiciousOpen);
        assert_eq!(alerts[1].severity, Severity::Medium);
        assert_eq!(
            alerts[1].description.as_str(),
            "Suspicious open network - possible honeypot"
        );
    }

    #[test]
    fn hidden_strong_threshold() {
        let (mut wips, _) = engine();
        let alerts = wips.analyze_scan(&[
            net("", 1, SecurityType::Wpa2, -40),
            net("", 2, SecurityType::Wpa2, -55),
        ]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::HiddenStrong);
        assert_eq!(alerts[0].ssid.as_str(), "[Hidden]");
        assert_eq!(alerts[0].description.as_str(), "Strong hidden network (-40 dBm)");
        // Hidden networks stay out of the cache.
        assert!(wips.known_networks().is_empty());
    }

    #[test]
    fn disabled_detectors_stay_quiet() {
        let (mut wips, _) = engine();
        let mut cfg = WipsConfig::default();
        cfg.detect_evil_twin = false;
        cfg.detect_weak_encryption = false;
        wips.set_config(cfg);
        let alerts = wips.analyze_scan(&[
            net("Corp", 1, SecurityType::Wep, -60),
            net("Corp", 2, SecurityType::Wep, -60),
        ]);
        assert!(alerts.is_empty());
    }

    #[test]
    fn deauth_flood_alerts_once_then_clears() {
        let (mut wips, clock) = engine();
        for i in 0..9 {
            assert!(wips.record_deauth(&deauth(1)).is_none(), "frame {i}");
            clock.advance_ms(100);
        }
        let alert = wips.record_deauth(&deauth(1)).expect("flood");
        assert_eq!(alert.alert_type, AlertType::DeauthAttack);
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.description.as_str(), "Deauth flood: 10 frames in 5000ms");
        assert!(alert.ssid.is_empty());
        assert_eq!(alert.bssids.as_slice(), &[[0x10, 0x20, 0x30, 0x40, 0x50, 0x60]]);

        // A sub-threshold burst inside the original window stays quiet.
        for _ in 0..5 {
            clock.advance_ms(100);
            assert!(wips.record_deauth(&deauth(1)).is_none());
        }
        assert_eq!(wips.stats().deauth_count, 1);
        assert_eq!(wips.stats().total_alerts, 1);
    }

    #[test]
    fn deauth_outside_window_does_not_accumulate() {
        let (mut wips, clock) = engine();
        for _ in 0..20 {
            assert!(wips.record_deauth(&deauth(1)).is_none());
            clock.advance_ms(1000);
        }
    }

    #[test]
    fn aggregated_deauth_event_counts_frames() {
        let (mut wips, _) = engine();
        let alert = wips.record_deauth(&deauth(12)).expect("flood");
        assert_eq!(alert.description.as_str(), "Deauth flood: 12 frames in 5000ms");
    }

    #[test]
    fn karma_needs_distinct_ssids() {
        let (mut wips, _) = engine();
        let ap = [0x02, 0, 0, 0, 0, 1];
        assert!(wips.record_probe_response(&ap, "HomeNet").is_none());
        assert!(wips.record_probe_response(&ap, "HomeNet").is_none());
        assert!(wips.record_probe_response(&ap, "CoffeeShop").is_none());
        let alert = wips.record_probe_response(&ap, "Airport").expect("karma");
        assert_eq!(alert.alert_type, AlertType::KarmaAttack);
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(
            alert.description.as_str(),
            "AP responding to 3+ different probe requests"
        );

        // History for this AP was dropped.
        assert!(wips.record_probe_response(&ap, "Hotel").is_none());
        assert_eq!(wips.stats().karma_count, 1);
    }

    #[test]
    fn karma_window_expires_old_responses() {
        let (mut wips, clock) = engine();
        let ap = [0x02, 0, 0, 0, 0, 2];
        assert!(wips.record_probe_response(&ap, "A").is_none());
        assert!(wips.record_probe_response(&ap, "B").is_none());
        clock.advance_ms(61_000);
        assert!(wips.record_probe_response(&ap, "C").is_none());
    }

    #[test]
    fn karma_separates_bssids() {
        let (mut wips, _) = engine();
        assert!(wips.record_probe_response(&[1; 6], "A").is_none());
        assert!(wips.record_probe_response(&[2; 6], "B").is_none());
        assert!(wips.record_probe_response(&[3; 6], "C").is_none());
    }

    #[test]
    fn known_cache_evicts_least_recently_seen() {
        let (mut wips, clock) = engine();
        for i in 0..KNOWN_NETWORK_CAPACITY {
            let mut n = net("Net", 0, SecurityType::Wpa2, -80);
            n.ssid = truncated(&format!("Net{i}"));
            n.bssid = [0, 0, 0, 0, (i >> 8) as u8, i as u8];
            wips.analyze_scan(&[n]);
            clock.advance_ms(10);
        }
        assert_eq!(wips.known_networks().len(), KNOWN_NETWORK_CAPACITY);

        // Refresh the first entry so the second becomes the oldest.
        let mut first = net("Net0", 0, SecurityType::Wpa2, -80);
        first.bssid = [0, 0, 0, 0, 0, 0];
        wips.analyze_scan(&[first]);
        clock.advance_ms(10);

        let newcomer = net("Fresh", 0xEE, SecurityType::Wpa2, -70);
        wips.analyze_scan(&[newcomer.clone()]);
        let known = wips.known_networks();
        assert_eq!(known.len(), KNOWN_NETWORK_CAPACITY);
        assert!(known.iter().any(|k| k.bssid == newcomer.bssid));
        assert!(known.iter().any(|k| k.bssid == [0, 0, 0, 0, 0, 0]));
        assert!(!known.iter().any(|k| k.bssid == [0, 0, 0, 0, 0, 1]));
    }

    #[test]
    fn reset_clears_everything() {
        let (mut wips, _) = engine();
        wips.analyze_scan(&[
            net("Corp", 1, SecurityType::Wpa2, -60),
            net("Corp", 2, SecurityType::Wpa2, -60),
        ]);
        wips.record_deauth(&deauth(3));
        wips.reset();
        assert_eq!(wips.stats(), WipsStats::default());
        assert!(wips.known_networks().is_empty());
        assert!(wips.record_deauth(&deauth(9)).is_none());
    }
}
