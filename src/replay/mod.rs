//! Replay mode: serve a recorded scenario without the external service

mod catalog;
mod history;
mod replayer;

pub use catalog::{headers_match, request_matches, InteractionCatalog, Trigger};
pub use history::{History, HistoryEntry, HistoryMeta, HistoryRequest, HistoryResponse, UnmatchedCount};
pub use replayer::Replayer;
