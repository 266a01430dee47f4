//! ChatBridge core: serves chat completions by driving a chat web UI.
//!
//! A request is projected into one prompt, granted the single shared browser
//! session by [`SessionGate`], played out as a turn by [`TurnOrchestrator`],
//! and shaped into OpenAI wire objects by [`ResponseNormalizer`].
//! [`ChatBridge`] ties these together.

pub mod bridge;
pub mod composer;
pub mod config;
pub mod error;
pub mod extractor;
pub mod gate;
pub mod images;
pub mod message;
pub mod mode;
pub mod normalizer;
pub mod orchestrator;
pub mod projector;
pub mod repair;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use bridge::{BridgeReply, ChatBridge, RESET_CONFIRMATION};
pub use config::{BridgeSettings, ChatMode, Selectors, Timings};
pub use error::{BridgeError, Result};
pub use extractor::{ResponseCursor, StreamChunk};
pub use gate::{SessionGate, SessionLease};
pub use images::{HttpImageResolver, ImagePayload, ImageResolver};
pub use message::{ChatCompletionRequest, ConversationTurn, Role};
pub use mode::{ModeController, ModeState};
pub use normalizer::{ChatCompletion, ChatCompletionChunk, ErrorBody, OutputPolicy, ResponseNormalizer};
pub use orchestrator::{TurnOrchestrator, TurnPhase, TurnStream};
pub use projector::{HistoryPolicy, ProjectedPrompt};
