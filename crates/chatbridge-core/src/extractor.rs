//! Streaming a reply out of a DOM node that keeps changing underneath us.
//!
//! The chat page never says "done". A reply is considered complete once its
//! text has stopped growing for more than `stable_ticks` consecutive polls
//! while no stop-generation control is visible. Every growth is emitted as
//! the suffix since the previous observation, so concatenating the deltas in
//! order reproduces the final text.

use async_stream::stream;
use chatbridge_browser::{ElementHandle, UiSurface};
use futures::Stream;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::{Selectors, Timings};

/// One unit of extracted output. `is_final` marks the single, empty,
/// end-of-reply chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub id: String,
    pub delta_text: String,
    pub is_final: bool,
}

/// Observation state for the reply being extracted.
#[derive(Debug, Clone)]
pub struct ResponseCursor {
    pub target: ElementHandle,
    pub last_text: String,
    pub stable_ticks: u32,
}

impl ResponseCursor {
    pub fn new(target: ElementHandle) -> Self {
        Self {
            target,
            last_text: String::new(),
            stable_ticks: 0,
        }
    }

    /// Record a fresh observation. Returns the new suffix when the text grew.
    pub fn advance(&mut self, current: &str) -> Option<String> {
        let seen = self.last_text.chars().count();
        if current.chars().count() <= seen {
            return None;
        }
        let delta: String = current.chars().skip(seen).collect();
        self.last_text = current.to_string();
        self.stable_ticks = 0;
        Some(delta)
    }

    /// A tick without growth. A visible stop control means the reply is
    /// still being generated, so quiescence starts over.
    pub fn quiet_tick(&mut self, generating: bool) {
        if generating {
            self.stable_ticks = 0;
        } else {
            self.stable_ticks += 1;
        }
    }

    pub fn is_settled(&self, threshold: u32) -> bool {
        !self.last_text.is_empty() && self.stable_ticks > threshold
    }
}

/// Reply containers currently on the page, from the first selector that
/// matches anything.
pub async fn response_elements(
    surface: &dyn UiSurface,
    selectors: &Selectors,
    timeout: Duration,
) -> Vec<ElementHandle> {
    for locator in &selectors.responses {
        match surface.locate_all(locator, timeout).await {
            Ok(found) if !found.is_empty() => return found,
            Ok(_) => {}
            Err(e) => debug!("Response lookup via {} failed: {}", locator, e),
        }
    }
    Vec::new()
}

/// Poll `cursor.target` until the reply settles or the extraction ceiling
/// passes, yielding deltas and then one final chunk. Finite and not
/// restartable; dropping the stream simply stops observing.
pub fn extract<'a>(
    surface: &'a dyn UiSurface,
    mut cursor: ResponseCursor,
    selectors: &'a Selectors,
    timings: &'a Timings,
    id: String,
) -> impl Stream<Item = StreamChunk> + Send + 'a {
    stream! {
        let deadline = Instant::now() + timings.extraction_timeout();

        loop {
            if Instant::now() >= deadline {
                warn!(
                    "Extraction ceiling of {}s reached with {} chars",
                    timings.extraction_timeout().as_secs(),
                    cursor.last_text.chars().count()
                );
                break;
            }

            let current = match surface.text(&cursor.target).await {
                Ok(text) => text,
                Err(e) => {
                    debug!("Reply node unreadable ({}), re-resolving", e);
                    if let Some(latest) = response_elements(surface, selectors, Duration::ZERO)
                        .await
                        .pop()
                    {
                        cursor.target = latest;
                    }
                    cursor.last_text.clone()
                }
            };

            match cursor.advance(&current) {
                Some(delta) => {
                    yield StreamChunk {
                        id: id.clone(),
                        delta_text: delta,
                        is_final: false,
                    };
                }
                None => {
                    let generating = matches!(
                        surface
                            .locate(&selectors.stop_button, timings.probe_timeout())
                            .await,
                        Ok(Some(_))
                    );
                    cursor.quiet_tick(generating);
                }
            }

            if cursor.is_settled(timings.stable_ticks) {
                debug!(
                    "Reply settled after {} quiet ticks ({} chars)",
                    cursor.stable_ticks,
                    cursor.last_text.chars().count()
                );
                break;
            }
            sleep(timings.poll_interval()).await;
        }

        yield StreamChunk {
            id,
            delta_text: String::new(),
            is_final: true,
        };
    }
}
