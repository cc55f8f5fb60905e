//! Trellis worker - device runtime for one connector instance
//!
//! Runs inside the isolation unit the hub creates per instance:
//! - announces presence with a broker-side last-will safety net
//! - polls devices and publishes retained state with per-property fan-out
//! - executes commands with staleness and duplicate protection
//! - optionally runs in parasite mode, extending foreign device namespaces

pub mod config;
pub mod connector;
pub mod error;
pub mod parasite;
pub mod runtime;
pub mod supervisor;
pub mod virtual_connector;
