/// Default tables: Sub-GHz hop plan and the honeypot SSID list used by the
/// suspicious-open-network detector.

/// Sub-GHz frequencies visited by the hop loop, in order (Hz).
///
/// Common ISM/SRD allocations first (US 315, EU 433.92, EU 868.35, US 915),
/// then the less crowded garage-door and sensor bands.
pub static SUBGHZ_FREQUENCIES: &[u32] = &[
    315_000_000,
    433_920_000,
    868_350_000,
    915_000_000,
    300_000_000,
    390_000_000,
    418_000_000,
    426_000_000,
    445_000_000,
    925_000_000,
];

/// SSID fragments typical of open honeypot networks.
///
/// Matching is a case-sensitive substring search, so the common casings are
/// listed explicitly.
pub static SUSPICIOUS_OPEN_SSID_PATTERNS: &[&str] = &[
    "free", "FREE", "Free",
    "public", "PUBLIC", "Public",
    "guest", "GUEST", "Guest",
    "wifi", "WiFi", "WIFI",
    "open", "OPEN", "Open",
    "hotspot", "Hotspot", "HOTSPOT",
    "starbucks", "Starbucks",
    "mcdonalds", "McDonald",
    "airport", "Airport",
    "hotel", "Hotel",
];

/// SSID shown in alerts about networks that do not broadcast one.
pub const HIDDEN_SSID_LABEL: &str = "[Hidden]";

/// Check whether an SSID looks like a honeypot lure.
pub fn is_suspicious_open_ssid(ssid: &str) -> bool {
    SUSPICIOUS_OPEN_SSID_PATTERNS
        .iter()
        .any(|pattern| ssid.contains(pattern))
}
