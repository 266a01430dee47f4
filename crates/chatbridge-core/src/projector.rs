//! Flattening a structured conversation into one prompt plus images.

use tracing::warn;

use crate::images::{ImagePayload, ImageResolver};
use crate::message::{ConversationTurn, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPolicy {
    /// Every turn, labelled by role, in order.
    FullHistory,
    /// Only the final turn.
    LastTurnOnly,
}

/// Flat prompt text and the images to attach with it, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectedPrompt {
    pub text: String,
    pub images: Vec<ImagePayload>,
}

impl ProjectedPrompt {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.images.is_empty()
    }
}

fn section_label(role: Role) -> Option<&'static str> {
    match role {
        Role::System => Some("【System Instruction】"),
        Role::User => Some("【User Input】"),
        Role::Assistant => Some("【Model Output History】"),
        Role::Other => None,
    }
}

/// Prompt text for `turns` under `policy`, without touching images.
pub fn project_text(turns: &[ConversationTurn], policy: HistoryPolicy) -> String {
    match policy {
        HistoryPolicy::FullHistory => {
            let mut text = String::new();
            for turn in turns {
                if let Some(label) = section_label(turn.role) {
                    text.push_str(&format!("{}:\n{}\n\n", label, turn.text()));
                }
            }
            text.trim().to_string()
        }
        HistoryPolicy::LastTurnOnly => turns
            .last()
            .map(|turn| turn.text().trim().to_string())
            .unwrap_or_default(),
    }
}

/// Image references for `turns` under `policy`, in turn order.
pub fn image_references(turns: &[ConversationTurn], policy: HistoryPolicy) -> Vec<&str> {
    match policy {
        HistoryPolicy::FullHistory => turns.iter().flat_map(|turn| turn.image_urls()).collect(),
        HistoryPolicy::LastTurnOnly => turns
            .last()
            .map(|turn| turn.image_urls())
            .unwrap_or_default(),
    }
}

/// Build the prompt, resolving images through `resolver`. An image that
/// fails to resolve is dropped and logged; it never fails the request.
pub async fn project(
    turns: &[ConversationTurn],
    policy: HistoryPolicy,
    resolver: &dyn ImageResolver,
) -> ProjectedPrompt {
    let text = project_text(turns, policy);

    let mut images = Vec::new();
    for reference in image_references(turns, policy) {
        match resolver.resolve(reference).await {
            Ok(payload) => images.push(payload),
            Err(e) => warn!("Dropping image {}: {}", abbreviate(reference), e),
        }
    }

    ProjectedPrompt { text, images }
}

fn abbreviate(reference: &str) -> String {
    const MAX: usize = 64;
    match reference.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &reference[..cut]),
        None => reference.to_string(),
    }
}
