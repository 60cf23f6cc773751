//! Replay history report

use std::collections::BTreeMap;

use serde::Serialize;

use crate::interaction::{Headers, Interaction};
use crate::Result;

/// Loaded interactions never matched or triggered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnmatchedCount {
    /// Incoming interactions never sent to the application
    pub incoming: usize,
    /// Outgoing interactions never requested by the application
    pub outgoing: usize,
}

/// Request half of a history entry
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRequest {
    /// HTTP method
    pub method: String,
    /// Path and query
    pub url: String,
    /// Headers, lists joined with a space
    pub headers: BTreeMap<String, String>,
    /// Body as text
    pub body: String,
    /// When the request was replayed
    pub timestamp: Option<u64>,
}

/// Response half of a history entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    /// Status code
    pub status_code: u16,
    /// Headers as recorded or received
    pub headers: Headers,
    /// Body decoded to text
    pub body: Option<String>,
    /// When the response completed
    pub timestamp: Option<u64>,
}

/// One exchange that happened during replay
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// The request as sent
    pub request: HistoryRequest,
    /// The response to it
    pub response: HistoryResponse,
}

/// Summary of a replay
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMeta {
    /// Latest response minus earliest request, if both exist and are ordered
    pub duration_ms: Option<u64>,
    /// Interactions left over from the scenario
    pub unmatched_count: UnmatchedCount,
}

/// What happened during a replay, as returned when it stops
#[derive(Debug, Clone, Serialize)]
pub struct History {
    /// Exchanges in the order they happened
    pub interactions: Vec<HistoryEntry>,
    /// Summary
    pub meta: HistoryMeta,
}

impl History {
    /// Build the report from catalog history
    ///
    /// # Errors
    ///
    /// Returns [`crate::StenoError::InvalidHeader`] if a request header has no value
    pub fn build(history: &[Interaction], unmatched_count: UnmatchedCount) -> Result<Self> {
        let interactions = history
            .iter()
            .map(|interaction| {
                let request = &interaction.request;
                let response = &interaction.response;
                Ok(HistoryEntry {
                    request: HistoryRequest {
                        method: request.method.clone(),
                        url: request.url.clone(),
                        headers: request.headers.flatten()?,
                        body: request.body_text(),
                        timestamp: interaction.request_timestamp,
                    },
                    response: HistoryResponse {
                        status_code: response.status_code,
                        headers: response.headers.clone(),
                        body: response.display_body(),
                        timestamp: interaction.response_timestamp,
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let earliest = interactions
            .iter()
            .filter_map(|entry| entry.request.timestamp)
            .min();
        let latest = interactions
            .iter()
            .filter_map(|entry| entry.response.timestamp)
            .max();
        let duration_ms = match (earliest, latest) {
            (Some(earliest), Some(latest)) => latest.checked_sub(earliest),
            _ => None,
        };

        Ok(Self {
            interactions,
            meta: HistoryMeta {
                duration_ms,
                unmatched_count,
            },
        })
    }
}
