//! Typed wrappers over the manager's SSE feeds.
//!
//! Each stream yields decoded events until the server closes the feed
//! (`next` returns `None`) or the transport fails (`next` returns an error
//! and the stream is closed). Undecodable event payloads are dropped with a
//! warning; they must never tear down the subscription.

use futures::StreamExt;
use reqwest_eventsource::{Error as SseError, Event, EventSource};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::{ControllerPairingEvent, ManagerError, StateDiff};

pub(crate) struct SseFeed {
    source: EventSource,
    event_name: &'static str,
    label: String,
}

impl SseFeed {
    pub(crate) fn new(source: EventSource, event_name: &'static str, label: String) -> Self {
        Self {
            source,
            event_name,
            label,
        }
    }

    async fn next_decoded<T: DeserializeOwned>(&mut self) -> Option<Result<T, ManagerError>> {
        while let Some(event) = self.source.next().await {
            match event {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => {
                    if message.event != self.event_name && message.event != "message" {
                        continue;
                    }
                    if message.data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<T>(&message.data) {
                        Ok(decoded) => return Some(Ok(decoded)),
                        Err(err) => {
                            warn!(
                                target = "manager.sse",
                                feed = %self.label,
                                error = %err,
                                "dropping undecodable event payload"
                            );
                            continue;
                        }
                    }
                }
                Err(SseError::StreamEnded) => return None,
                Err(err) => {
                    self.source.close();
                    return Some(Err(ManagerError::Stream(err.to_string())));
                }
            }
        }
        None
    }
}

/// Live feed of state diffs for one session.
pub struct StateStream {
    feed: SseFeed,
}

impl StateStream {
    pub(crate) fn new(feed: SseFeed) -> Self {
        Self { feed }
    }

    /// Next state diff; `None` once the server ends the stream cleanly.
    pub async fn next(&mut self) -> Option<Result<StateDiff, ManagerError>> {
        self.feed.next_decoded().await
    }
}

/// Live feed of controller pairing changes for one controller session.
pub struct PairingStream {
    feed: SseFeed,
}

impl PairingStream {
    pub(crate) fn new(feed: SseFeed) -> Self {
        Self { feed }
    }

    pub async fn next(&mut self) -> Option<Result<ControllerPairingEvent, ManagerError>> {
        self.feed.next_decoded().await
    }
}
