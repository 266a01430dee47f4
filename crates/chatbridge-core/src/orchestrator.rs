//! One turn against the chat page, from navigation to the last delta.
//!
//! Phases run strictly in order:
//!
//! 1. `Navigating` - temporary chats always start from a fresh load of the
//!    target page; persistent chats only navigate when the page has wandered
//!    off the target host.
//! 2. `AwaitingReady` - find the input box, reloading once if needed.
//! 3. `VerifyingMode` - see [`ModeController`].
//! 4. `Snapshotting` - count the replies already on the page.
//! 5. `Composing` - see [`InputComposer`].
//! 6. `Submitting` - click send, or press Enter when there is no button.
//! 7. `AwaitingArrival` - wait for an error indicator or a new reply.
//! 8. `Streaming` - hand the new reply to [`extract`].
//!
//! Element handles from earlier turns are released before navigation, again
//! on every arrival tick, and once the reply settles.
//!
//! A failure in any phase ends the turn; nothing is retried here.

use async_stream::try_stream;
use chatbridge_browser::{ElementHandle, UiSurface};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use url::Url;

use crate::composer::InputComposer;
use crate::config::{BridgeSettings, ChatMode};
use crate::error::{BridgeError, Result};
use crate::extractor::{ResponseCursor, StreamChunk, extract, response_elements};
use crate::gate::SessionLease;
use crate::mode::ModeController;
use crate::normalizer::completion_id;
use crate::projector::ProjectedPrompt;

/// Chunks of one turn. The stream owns the session lease; dropping it stops
/// observation and frees the session.
pub type TurnStream = BoxStream<'static, Result<StreamChunk>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Navigating,
    AwaitingReady,
    VerifyingMode,
    Snapshotting,
    Composing,
    Submitting,
    AwaitingArrival,
    Streaming,
}

pub struct TurnOrchestrator {
    settings: Arc<BridgeSettings>,
}

impl TurnOrchestrator {
    pub fn new(settings: Arc<BridgeSettings>) -> Self {
        Self { settings }
    }

    /// Run a turn for `prompt` on the leased session. Nothing happens until
    /// the returned stream is polled.
    pub fn run_turn(&self, lease: SessionLease, prompt: ProjectedPrompt) -> TurnStream {
        let settings = self.settings.clone();
        Box::pin(try_stream! {
            let turn = Turn {
                surface: lease.surface(),
                settings: &settings,
            };

            turn.enter(TurnPhase::Navigating);
            turn.release_handles().await;
            turn.navigate().await?;

            turn.enter(TurnPhase::AwaitingReady);
            let input = turn.await_input().await?;

            turn.enter(TurnPhase::VerifyingMode);
            ModeController::new(&settings.selectors, &settings.timings)
                .ensure_mode(turn.surface, settings.mode)
                .await;
            let input = turn.reacquire_input(input).await?;

            turn.enter(TurnPhase::Snapshotting);
            let prev_count = turn.snapshot().await;

            turn.enter(TurnPhase::Composing);
            InputComposer::new(&settings.selectors, &settings.timings)
                .compose(turn.surface, &input, &prompt)
                .await?;

            turn.enter(TurnPhase::Submitting);
            turn.submit(&input).await?;

            turn.enter(TurnPhase::AwaitingArrival);
            let reply = turn.await_arrival(prev_count).await?;

            turn.enter(TurnPhase::Streaming);
            let chunks = extract(
                turn.surface,
                ResponseCursor::new(reply),
                &settings.selectors,
                &settings.timings,
                completion_id(),
            );
            futures::pin_mut!(chunks);
            while let Some(chunk) = chunks.next().await {
                yield chunk;
            }
            turn.release_handles().await;
            info!("Turn completed");
        })
    }
}

struct Turn<'a> {
    surface: &'a dyn UiSurface,
    settings: &'a BridgeSettings,
}

impl Turn<'_> {
    fn enter(&self, phase: TurnPhase) {
        debug!("Turn phase: {:?}", phase);
    }

    async fn navigate(&self) -> Result<()> {
        let target = &self.settings.target_url;
        match self.settings.mode {
            ChatMode::Temporary => self.surface.navigate(target).await?,
            ChatMode::Persistent => {
                let current = self.surface.current_url().await.unwrap_or_default();
                if !same_host(&current, target) {
                    info!("Page is at {:?}, returning to {}", current, target);
                    self.surface.navigate(target).await?;
                }
            }
        }
        Ok(())
    }

    async fn await_input(&self) -> Result<ElementHandle> {
        let timings = &self.settings.timings;
        let locator = &self.settings.selectors.input;
        if let Some(input) = self.surface.locate(locator, timings.input_timeout()).await? {
            return Ok(input);
        }

        warn!("Input box missing, reloading once");
        self.surface.reload().await?;
        self.surface
            .locate(locator, timings.input_timeout())
            .await?
            .ok_or(BridgeError::InputNotFound)
    }

    /// Switching modes can re-render the composer, invalidating `previous`.
    async fn reacquire_input(&self, previous: ElementHandle) -> Result<ElementHandle> {
        let timings = &self.settings.timings;
        let locator = &self.settings.selectors.input;
        if let Some(input) = self.surface.locate(locator, timings.input_reacquire()).await? {
            return Ok(input);
        }
        match self.surface.locate(locator, timings.input_timeout()).await? {
            Some(input) => Ok(input),
            None => {
                debug!("Input box not re-found, keeping the earlier handle");
                Ok(previous)
            }
        }
    }

    async fn snapshot(&self) -> usize {
        let prev_count = response_elements(
            self.surface,
            &self.settings.selectors,
            self.settings.timings.snapshot_timeout(),
        )
        .await
        .len();
        debug!("{} replies already on the page", prev_count);
        prev_count
    }

    async fn submit(&self, input: &ElementHandle) -> Result<()> {
        let send = self
            .surface
            .locate(
                &self.settings.selectors.send_button,
                self.settings.timings.send_button_timeout(),
            )
            .await?;
        match send {
            Some(button) => self.surface.click(&button).await?,
            None => {
                debug!("No send button, submitting with Enter");
                self.surface.press_enter(input).await?;
            }
        }
        Ok(())
    }

    /// Wait for a reply past the snapshot. A zero snapshot accepts any reply
    /// on the page, which includes stale history the snapshot failed to see.
    async fn await_arrival(&self, prev_count: usize) -> Result<ElementHandle> {
        let timings = &self.settings.timings;
        let deadline = Instant::now() + timings.arrival_timeout();

        loop {
            // Nothing located before submission is needed past this point.
            self.release_handles().await;
            if let Some(message) = self.upstream_error().await {
                return Err(BridgeError::UpstreamError(message));
            }

            let mut replies =
                response_elements(self.surface, &self.settings.selectors, timings.probe_timeout())
                    .await;
            if replies.len() > prev_count
                && let Some(reply) = replies.pop()
            {
                debug!("Reply arrived ({} on page)", replies.len() + 1);
                return Ok(reply);
            }

            if Instant::now() >= deadline {
                return Err(BridgeError::ArrivalTimeout);
            }
            sleep(timings.poll_interval()).await;
        }
    }

    async fn release_handles(&self) {
        if let Err(e) = self.surface.release_handles().await {
            debug!("Failed to release element handles: {}", e);
        }
    }

    async fn upstream_error(&self) -> Option<String> {
        for locator in &self.settings.selectors.error_indicators {
            let found = self
                .surface
                .locate(locator, self.settings.timings.probe_timeout())
                .await;
            if let Ok(Some(indicator)) = found {
                let text = self.surface.text(&indicator).await.unwrap_or_default();
                warn!("Chat page reported an error: {}", text.trim());
                return Some(text.trim().to_string());
            }
        }
        None
    }
}

/// Whether `current` is on the same host as `target`.
fn same_host(current: &str, target: &str) -> bool {
    match (Url::parse(current), Url::parse(target)) {
        (Ok(current), Ok(target)) => {
            current.host_str().is_some() && current.host_str() == target.host_str()
        }
        _ => false,
    }
}
