//! Interaction catalog
//!
//! Holds the interactions of one scenario and decides, for each live outgoing
//! request, which recorded interaction answers it. Incoming interactions are
//! released as triggers once everything recorded before them has happened.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::hooks::REDACTED;
use crate::interaction::{
    now_millis, Direction, HeaderValue, Headers, Interaction, RequestId, RequestInfo,
    ResponseInfo,
};
use crate::storage::load_dir;
use crate::{Result, StenoError};

use super::history::UnmatchedCount;

/// Headers never compared when matching
const IGNORED_HEADERS: &[&str] = &["host"];

/// An incoming interaction released for replay
#[derive(Debug, Clone)]
pub struct Trigger {
    /// Replay run the trigger belongs to
    pub generation: u64,
    /// The recorded incoming interaction
    pub interaction: Interaction,
}

/// Loaded interactions plus the state of the current replay
pub struct InteractionCatalog {
    storage_path: PathBuf,
    interactions: Vec<Interaction>,
    previously_matched: HashSet<RequestId>,
    history: Vec<Interaction>,
    generation: u64,
    triggers: UnboundedSender<Trigger>,
}

impl InteractionCatalog {
    /// Create an empty catalog and the receiver for its triggers
    #[must_use]
    pub fn new(storage_path: PathBuf) -> (Self, UnboundedReceiver<Trigger>) {
        let (triggers, rx) = unbounded_channel();
        let catalog = Self {
            storage_path,
            interactions: Vec::new(),
            previously_matched: HashSet::new(),
            history: Vec::new(),
            generation: 0,
            triggers,
        };
        (catalog, rx)
    }

    /// Load the scenario at `path`, replacing everything loaded before
    ///
    /// A missing directory leaves the catalog empty.
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::ScenarioNotFound`] if the directory does not
    /// exist, or the error from listing it
    pub async fn load_path(&mut self, path: PathBuf) -> Result<()> {
        self.storage_path = path;
        match load_dir(&self.storage_path).await {
            Ok(interactions) => {
                info!(
                    "Loaded {} interactions from {}",
                    interactions.len(),
                    self.storage_path.display()
                );
                self.replace(interactions);
                Ok(())
            }
            Err(e @ StenoError::ScenarioNotFound(_)) => {
                self.replace(Vec::new());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Install an already loaded set of interactions, sorted by timestamp
    pub fn replace(&mut self, mut interactions: Vec<Interaction>) {
        interactions.sort_by_key(|i| i.timestamp);
        self.interactions = interactions;
        self.reset();
        self.check_triggers();
    }

    /// Forget all matches and history, keeping the loaded interactions
    ///
    /// Triggers still in flight from before the reset are discarded when they
    /// complete.
    pub fn reset(&mut self) {
        self.previously_matched.clear();
        self.history.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Current replay run, bumped by every load and reset
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Find the recorded interaction answering a live outgoing request
    ///
    /// Among equal candidates the most recently recorded wins. A match is
    /// consumed, logged to history and may release triggers.
    pub fn find_matching_interaction(&mut self, request: &RequestInfo) -> Option<Interaction> {
        let matched = self
            .interactions
            .iter()
            .filter(|i| i.direction == Direction::Outgoing)
            .filter(|i| !self.previously_matched.contains(&i.request.id))
            .filter(|i| request_matches(&i.request, request))
            .max_by_key(|i| i.timestamp)
            .cloned();

        let Some(matched) = matched else {
            debug!("No interaction matches {} {}", request.method, request.url);
            return None;
        };
        debug!(
            "{} {} matched interaction recorded at {}",
            request.method, request.url, matched.timestamp
        );

        self.previously_matched.insert(matched.request.id);
        let now = now_millis();
        self.history.push(Interaction {
            request: RequestInfo {
                id: matched.request.id,
                ..request.clone()
            },
            response: matched.response.clone(),
            direction: Direction::Outgoing,
            timestamp: now,
            request_timestamp: Some(now),
            response_timestamp: None,
        });

        self.check_triggers();
        Some(matched)
    }

    /// Release every incoming interaction whose predecessors have all happened
    ///
    /// An incoming interaction fires once every interaction recorded strictly
    /// before it is incoming or already matched. Eligible ones fire together,
    /// in timestamp order.
    pub fn check_triggers(&mut self) {
        let eligible: Vec<Interaction> = self
            .interactions
            .iter()
            .filter(|i| i.direction == Direction::Incoming)
            .filter(|i| !self.previously_matched.contains(&i.request.id))
            .filter(|candidate| {
                self.interactions
                    .iter()
                    .filter(|earlier| earlier.timestamp < candidate.timestamp)
                    .all(|earlier| {
                        earlier.direction == Direction::Incoming
                            || self.previously_matched.contains(&earlier.request.id)
                    })
            })
            .cloned()
            .collect();

        for interaction in eligible {
            debug!(
                "Triggering {} {} recorded at {}",
                interaction.request.method, interaction.request.url, interaction.timestamp
            );
            self.previously_matched.insert(interaction.request.id);
            let trigger = Trigger {
                generation: self.generation,
                interaction,
            };
            if self.triggers.send(trigger).is_err() {
                warn!("Trigger dropped: no receiver");
            }
        }
    }

    /// Stamp the completion of a matched outgoing reply
    pub fn on_outgoing_response(&mut self, request_id: RequestId) {
        let entry = self.history.iter_mut().rev().find(|i| {
            i.direction == Direction::Outgoing
                && i.request.id == request_id
                && i.response_timestamp.is_none()
        });

        match entry {
            Some(entry) => entry.response_timestamp = Some(now_millis()),
            None => warn!("No history entry for outgoing response {}", request_id),
        }
    }

    /// Record the application's answer to a triggered incoming request
    ///
    /// Answers to triggers from an earlier run are dropped; returns whether
    /// the answer was kept.
    pub fn on_incoming_response(
        &mut self,
        trigger: &Trigger,
        request_timestamp: u64,
        response: ResponseInfo,
    ) -> bool {
        if trigger.generation != self.generation {
            debug!(
                "Dropping answer to {} {} from an earlier replay",
                trigger.interaction.request.method, trigger.interaction.request.url
            );
            return false;
        }

        let now = now_millis();
        self.history.push(Interaction {
            request: trigger.interaction.request.clone(),
            response,
            direction: Direction::Incoming,
            timestamp: request_timestamp,
            request_timestamp: Some(request_timestamp),
            response_timestamp: Some(now),
        });
        true
    }

    /// Loaded interactions, in timestamp order
    #[must_use]
    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    /// What happened during this replay, in order
    #[must_use]
    pub fn history(&self) -> &[Interaction] {
        &self.history
    }

    /// Directory the interactions were loaded from
    #[must_use]
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Whether an interaction has been matched or triggered
    #[must_use]
    pub fn is_matched(&self, request_id: &RequestId) -> bool {
        self.previously_matched.contains(request_id)
    }

    /// Loaded interactions never matched or triggered, by direction
    #[must_use]
    pub fn unmatched_count(&self) -> UnmatchedCount {
        self.interactions
            .iter()
            .filter(|i| !self.previously_matched.contains(&i.request.id))
            .fold(UnmatchedCount::default(), |mut count, i| {
                match i.direction {
                    Direction::Incoming => count.incoming += 1,
                    Direction::Outgoing => count.outgoing += 1,
                }
                count
            })
    }
}

/// Whether a live request satisfies a recorded one
#[must_use]
pub fn request_matches(pattern: &RequestInfo, actual: &RequestInfo) -> bool {
    pattern.method == actual.method
        && pattern.url == actual.url
        && headers_match(&pattern.headers, &actual.headers)
        && pattern.body_bytes() == actual.body_bytes()
}

/// Every recorded header must be present in the live request.
///
/// A recorded list must have each of its values in the live header, which may
/// be a list or one `", "` joined string. A recorded single value only requires
/// presence, except `set-cookie`, which is compared as a one-element list.
/// Values carrying redacted data match anything.
#[must_use]
pub fn headers_match(pattern: &Headers, actual: &Headers) -> bool {
    pattern.iter().all(|(name, expected)| {
        if IGNORED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            return true;
        }
        let Some(found) = actual.get(name) else {
            return false;
        };

        let is_list = matches!(expected, HeaderValue::Multi(_))
            || name.eq_ignore_ascii_case("set-cookie");
        if !is_list {
            return true;
        }

        let mut candidates = found.values();
        candidates.extend(found.split_values());
        expected
            .values()
            .into_iter()
            .filter(|value| !value.contains(REDACTED))
            .all(|value| candidates.contains(&value))
    })
}
