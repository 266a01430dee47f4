use chatbridge_core::ChatBridge;
use std::sync::Arc;

/// Shared by every handler. The bridge owns the one browser session.
pub type AppState = Arc<ChatBridge>;
