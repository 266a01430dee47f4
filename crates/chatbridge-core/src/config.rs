//! Tunables for the turn engine: target page, selectors, and timing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::projector::HistoryPolicy;

/// Conversation-persistence mode the chat UI should be kept in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    /// Standard chat; history is kept by the UI between turns.
    Persistent,
    /// Temporary chat; the page is reloaded before every turn.
    Temporary,
}

impl ChatMode {
    pub fn from_temporary_flag(use_temporary_chat: bool) -> Self {
        if use_temporary_chat {
            ChatMode::Temporary
        } else {
            ChatMode::Persistent
        }
    }

    /// A fresh temporary chat has no memory, so the whole conversation must be
    /// re-sent; a persistent chat already holds it.
    pub fn history_policy(self) -> HistoryPolicy {
        match self {
            ChatMode::Temporary => HistoryPolicy::FullHistory,
            ChatMode::Persistent => HistoryPolicy::LastTurnOnly,
        }
    }
}

/// Locators for the chat page. See [`chatbridge_browser::Locator`] for syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    pub input: String,
    /// Element that receives synthetic paste events.
    pub paste_target: String,
    /// Assistant reply containers, tried in order until one matches.
    pub responses: Vec<String>,
    pub send_button: String,
    /// Visible only while the assistant is still generating.
    pub stop_button: String,
    pub error_indicators: Vec<String>,
    pub temp_chat_button: String,
    /// Class present on the temp-chat button while temporary mode is on.
    pub temp_chat_active_class: String,
    pub side_menu_button: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            input: r#"div[contenteditable="true"][role="textbox"]"#.to_string(),
            paste_target: r#"div[contenteditable="true"]"#.to_string(),
            responses: vec![
                ".model-response-text".to_string(),
                "[data-message-id]".to_string(),
            ],
            send_button: r#"button[aria-label*="Send"]"#.to_string(),
            stop_button: r#"button[aria-label="Stop responding"]"#.to_string(),
            error_indicators: vec![
                ".error-message".to_string(),
                "text:出现了点问题".to_string(),
            ],
            temp_chat_button: r#"button[data-test-id="temp-chat-button"]"#.to_string(),
            temp_chat_active_class: "temp-chat-on".to_string(),
            side_menu_button: r#"button[data-test-id="side-nav-menu-button"]"#.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub poll_interval_ms: u64,
    pub arrival_timeout_secs: u64,
    pub extraction_timeout_secs: u64,
    /// Quiescent ticks that must be exceeded before a reply counts as done.
    pub stable_ticks: u32,
    pub image_settle_ms: u64,
    pub text_settle_ms: u64,
    pub input_timeout_ms: u64,
    pub input_reacquire_ms: u64,
    pub snapshot_timeout_ms: u64,
    pub send_button_timeout_ms: u64,
    pub toggle_probe_ms: u64,
    /// Wait for the side menu button, and for the toggle once the menu is open.
    pub menu_timeout_ms: u64,
    pub toggle_settle_ms: u64,
    pub menu_close_settle_ms: u64,
    /// Lookup budget for the per-tick stop/error probes.
    pub probe_timeout_ms: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            arrival_timeout_secs: 120,
            extraction_timeout_secs: 130,
            stable_ticks: 15,
            image_settle_ms: 2500,
            text_settle_ms: 100,
            input_timeout_ms: 10_000,
            input_reacquire_ms: 2000,
            snapshot_timeout_ms: 500,
            send_button_timeout_ms: 2000,
            toggle_probe_ms: 500,
            menu_timeout_ms: 2000,
            toggle_settle_ms: 500,
            menu_close_settle_ms: 200,
            probe_timeout_ms: 10,
            acquire_timeout_secs: 300,
        }
    }
}

impl Timings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn arrival_timeout(&self) -> Duration {
        Duration::from_secs(self.arrival_timeout_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn image_settle(&self) -> Duration {
        Duration::from_millis(self.image_settle_ms)
    }

    pub fn text_settle(&self) -> Duration {
        Duration::from_millis(self.text_settle_ms)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }

    pub fn input_reacquire(&self) -> Duration {
        Duration::from_millis(self.input_reacquire_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn send_button_timeout(&self) -> Duration {
        Duration::from_millis(self.send_button_timeout_ms)
    }

    pub fn toggle_probe(&self) -> Duration {
        Duration::from_millis(self.toggle_probe_ms)
    }

    pub fn menu_timeout(&self) -> Duration {
        Duration::from_millis(self.menu_timeout_ms)
    }

    pub fn toggle_settle(&self) -> Duration {
        Duration::from_millis(self.toggle_settle_ms)
    }

    pub fn menu_close_settle(&self) -> Duration {
        Duration::from_millis(self.menu_close_settle_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Everything [`crate::ChatBridge`] needs besides the session itself.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub target_url: String,
    pub mode: ChatMode,
    /// Model name reported on the wire.
    pub model_name: String,
    /// Prompt that re-applies the chat mode instead of running a turn.
    pub reset_token: String,
    pub selectors: Selectors,
    pub timings: Timings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            target_url: "https://gemini.google.com/app".to_string(),
            mode: ChatMode::Temporary,
            model_name: "gemini-web-agent".to_string(),
            reset_token: "/reset".to_string(),
            selectors: Selectors::default(),
            timings: Timings::default(),
        }
    }
}
