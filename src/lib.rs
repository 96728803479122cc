//! flockbridge: the coordination core of a multi-radio sensing device.
//!
//! The crate owns three concerns and leaves radio drivers, UI and
//! persistence to the host:
//! - **External radio link**: `frame` (byte framing), `link` (send/receive
//!   with at most one synchronous call in flight) and `supervisor`
//!   (discovery, heartbeat, reconnect).
//! - **Detection scheduling**: `scheduler` time-slices the internal
//!   scanners and the external radio, with `arbiter` lending the two
//!   exclusive resources (radio core, USB timer/DMA) for bursts.
//! - **Wireless intrusion prevention**: `wips` correlates WiFi passes,
//!   deauth frames and probe responses into alerts, using `ring` for its
//!   windowed records.
//!
//! `scanner`, `radio`, `protocol` and `comm` describe what flows in and out;
//! `probes` issues active transmissions on the external radio. Time is
//! injected through `clock`, so every state machine runs under a fake clock
//! in tests. Diagnostics go through the `log` facade; the host installs the
//! logger.

pub mod arbiter;
pub mod clock;
pub mod comm;
pub mod config;
pub mod defaults;
pub mod error;
pub mod frame;
pub mod link;
pub mod probes;
pub mod protocol;
pub mod radio;
pub mod ring;
pub mod scanner;
pub mod scheduler;
pub mod supervisor;
pub mod wips;
