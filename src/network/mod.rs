//! Network layer for Steno
//!
//! Listener binding and accept loops with bounded concurrency, the upstream
//! client, and body plumbing shared by the forwarder and the replayer.

mod client;
mod connection_pool;
mod http;
mod listener;
mod tap;

pub use client::HttpClient;
pub use connection_pool::{ConnectionGuard, ConnectionPool};
pub use http::{
    check_content_length, error_response, full, json_response, read_body, recorded_response,
    request_info, response_info, text_response, ProxyBody,
};
pub use listener::{bind, serve, Listener, ServerHandle};
pub use tap::TapBody;

/// Idle upstream connections kept per host
pub const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Idle upstream connection timeout
pub const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
