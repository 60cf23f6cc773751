//! Steno - bidirectional HTTP record/replay proxy
//!
//! Records the traffic between an application and an external service in
//! both directions, then replays it: answering the application's requests
//! from the recording and re-sending the service's own requests to the
//! application in causal order.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod hooks;
pub mod interaction;
pub mod network;
pub mod proxy;
pub mod recording;
pub mod replay;
pub mod storage;

pub use error::{Result, StenoError};
