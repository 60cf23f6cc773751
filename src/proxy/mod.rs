//! Streaming HTTP forwarder
//!
//! A [`Forwarder`] relays each request it receives to one fixed target and
//! streams the answer back, reporting what it saw as [`ForwarderEvent`]s.

mod forwarder;

pub use forwarder::{Forwarder, ForwarderEvent};
