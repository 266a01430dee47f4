//! The session manager: one value owning the shared session and everything a
//! request needs to drive it.

use chatbridge_browser::UiSurface;
use futures::stream::{self, BoxStream};
use std::sync::Arc;
use tracing::info;

use crate::config::BridgeSettings;
use crate::error::{BridgeError, Result};
use crate::gate::SessionGate;
use crate::images::ImageResolver;
use crate::message::ChatCompletionRequest;
use crate::mode::ModeController;
use crate::normalizer::{ChatCompletion, OutputPolicy, ResponseNormalizer, completion_id};
use crate::orchestrator::TurnOrchestrator;
use crate::projector::{project, project_text};

pub const RESET_CONFIRMATION: &str = "对话已重置 / Chat Reset";

/// A successful reply in the shape the caller asked for.
pub enum BridgeReply {
    Completion(ChatCompletion),
    /// SSE `data:` payloads, produced lazily as the turn runs.
    Stream(BoxStream<'static, String>),
}

impl std::fmt::Debug for BridgeReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeReply::Completion(completion) => f.debug_tuple("Completion").field(completion).finish(),
            BridgeReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

pub struct ChatBridge {
    settings: Arc<BridgeSettings>,
    gate: SessionGate,
    resolver: Arc<dyn ImageResolver>,
    orchestrator: TurnOrchestrator,
    normalizer: ResponseNormalizer,
}

impl ChatBridge {
    pub fn new(
        settings: BridgeSettings,
        surface: Arc<dyn UiSurface>,
        resolver: Arc<dyn ImageResolver>,
    ) -> Self {
        let settings = Arc::new(settings);
        Self {
            gate: SessionGate::new(surface),
            orchestrator: TurnOrchestrator::new(settings.clone()),
            normalizer: ResponseNormalizer::new(settings.model_name.clone()),
            resolver,
            settings,
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Serve one completion request.
    ///
    /// Buffered replies are complete when this returns. Streaming replies
    /// hold the session until the returned stream finishes or is dropped.
    pub async fn complete(&self, request: ChatCompletionRequest) -> Result<BridgeReply> {
        if request.messages.is_empty() {
            return Err(BridgeError::invalid_request("No messages"));
        }
        info!(
            "Request received | stream: {} | clean_json: {} | mode: {:?}",
            request.stream, request.clean_json, self.settings.mode
        );

        let policy = self.settings.mode.history_policy();
        if project_text(&request.messages, policy) == self.settings.reset_token {
            return self.reset(request.stream).await;
        }

        let prompt = project(&request.messages, policy, self.resolver.as_ref()).await;
        let lease = self
            .gate
            .acquire(self.settings.timings.acquire_timeout())
            .await?;
        let turn = self.orchestrator.run_turn(lease, prompt);

        if request.stream {
            return Ok(BridgeReply::Stream(Box::pin(
                self.normalizer.stream_payloads(turn),
            )));
        }

        info!("Buffering full reply");
        let completion = self
            .normalizer
            .collect(turn, OutputPolicy::from_clean_json(request.clean_json))
            .await?;
        Ok(BridgeReply::Completion(completion))
    }

    /// Re-apply the configured chat mode and confirm, without running a turn.
    async fn reset(&self, stream: bool) -> Result<BridgeReply> {
        let lease = self
            .gate
            .acquire(self.settings.timings.acquire_timeout())
            .await?;
        let state = ModeController::new(&self.settings.selectors, &self.settings.timings)
            .ensure_mode(lease.surface(), self.settings.mode)
            .await;
        drop(lease);
        info!("Chat mode reset ({:?})", state);

        if stream {
            let payloads = self.normalizer.canned_payloads(RESET_CONFIRMATION);
            Ok(BridgeReply::Stream(Box::pin(stream::iter(payloads))))
        } else {
            Ok(BridgeReply::Completion(self.normalizer.completion(
                completion_id(),
                RESET_CONFIRMATION.to_string(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChatMode, Selectors};
    use crate::message::{ConversationTurn, Role};
    use crate::testing::{OfflineResolver, ScriptedReply, ScriptedSurface, SurfaceCall};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::Instant;

    fn bridge(mode: ChatMode, surface: Arc<ScriptedSurface>) -> ChatBridge {
        ChatBridge::new(
            BridgeSettings {
                mode,
                ..BridgeSettings::default()
            },
            surface,
            Arc::new(OfflineResolver),
        )
    }

    fn request(prompt: &str, stream: bool, clean_json: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            messages: vec![ConversationTurn::new(Role::User, prompt)],
            stream,
            clean_json,
            model: None,
        }
    }

    fn content(reply: BridgeReply) -> String {
        match reply {
            BridgeReply::Completion(completion) => completion.choices[0].message.content.clone(),
            other => panic!("expected a completion, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn raw_reply_round_trip() {
        let surface = Arc::new(
            ScriptedSurface::new(Selectors::default())
                .with_reply(ScriptedReply::new(["Hello", "Hello there"])),
        );
        let bridge = bridge(ChatMode::Persistent, surface);

        let reply = bridge.complete(request("hi", false, false)).await.unwrap();

        assert_eq!(content(reply), "Hello there");
        assert!(!bridge.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_skips_the_turn() {
        let surface = Arc::new(ScriptedSurface::new(Selectors::default()));
        let bridge = bridge(ChatMode::Persistent, surface.clone());

        let reply = bridge.complete(request("/reset", false, true)).await.unwrap();

        assert_eq!(content(reply), RESET_CONFIRMATION);
        assert!(surface.calls().iter().all(|call| !matches!(
            call,
            SurfaceCall::Navigate(_)
                | SurfaceCall::Reload
                | SurfaceCall::Type(_)
                | SurfaceCall::Enter
        )));
        assert!(
            !surface
                .calls()
                .contains(&SurfaceCall::Click(Selectors::default().send_button))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_reset_is_canned() {
        let surface = Arc::new(ScriptedSurface::new(Selectors::default()));
        let bridge = bridge(ChatMode::Persistent, surface);

        let BridgeReply::Stream(payloads) = bridge.complete(request("/reset", true, true)).await.unwrap()
        else {
            panic!("expected a stream");
        };
        let payloads: Vec<String> = payloads.collect().await;

        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].contains(RESET_CONFIRMATION));
        assert_eq!(payloads[2], "[DONE]");
    }

    #[tokio::test(start_paused = true)]
    async fn busy_after_the_acquire_timeout() {
        let surface = Arc::new(
            ScriptedSurface::new(Selectors::default())
                .with_reply(ScriptedReply::new(["slow"]).with_stop_probes(usize::MAX)),
        );
        let bridge = bridge(ChatMode::Persistent, surface);

        // An unpolled stream keeps its lease.
        let held = bridge.complete(request("first", true, true)).await.unwrap();
        assert!(bridge.is_busy());

        let started = Instant::now();
        let err = bridge.complete(request("second", false, true)).await.unwrap_err();

        assert!(matches!(err, BridgeError::SessionBusy));
        assert_eq!(err.to_string(), "Browser Busy");
        assert!(started.elapsed() >= Duration::from_secs(300));

        drop(held);
        assert!(!bridge.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_turn_leaves_the_session_usable() {
        let surface = Arc::new(ScriptedSurface::new(Selectors::default()).with_missing_input(1));
        let bridge = bridge(ChatMode::Persistent, surface.clone());

        let err = bridge.complete(request("hi", false, true)).await;
        // The reload re-reveals the input, so the turn proceeds to arrival and times out.
        assert!(matches!(err, Err(BridgeError::ArrivalTimeout)));
        assert!(!bridge.is_busy());
    }

    #[tokio::test]
    async fn empty_messages_are_rejected() {
        let surface = Arc::new(ScriptedSurface::new(Selectors::default()));
        let bridge = bridge(ChatMode::Temporary, surface.clone());

        let err = bridge
            .complete(ChatCompletionRequest {
                messages: Vec::new(),
                stream: false,
                clean_json: true,
                model: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "No messages");
        assert!(surface.calls().is_empty());
    }
}
