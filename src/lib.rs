//! relay-compass - rank Mullvad VPN relays by round-trip latency
//!
//! This library reads the Mullvad relay list, measures ICMP round-trip
//! latency to each relay from the current location using a shared
//! unprivileged ICMP socket, and exposes helpers for filtering by
//! geographic distance and rendering the results.

pub mod api;
pub mod distance;
pub mod format;
pub mod ping;
pub mod relays;
#[macro_use]
mod trace;

// Re-export core types for library users
pub use ping::{
    scan_locations, scan_locations_with_factory, DefaultPingerFactory, Pinger, PingerFactory,
    ScanConfig, ScanError,
};
pub use relays::{IpVersion, Location};
