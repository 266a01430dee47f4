//! Wire shapes for completions and the conversion of a turn into them.

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::extractor::StreamChunk;
use crate::orchestrator::TurnStream;
use crate::repair::clean_json_output;

pub const DONE_SENTINEL: &str = "[DONE]";

/// How buffered content is post-processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPolicy {
    /// Content exactly as the UI displayed it.
    Raw,
    /// Content run through the JSON repair pass.
    Repaired,
}

impl OutputPolicy {
    pub fn from_clean_json(clean_json: bool) -> Self {
        if clean_json {
            OutputPolicy::Repaired
        } else {
            OutputPolicy::Raw
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// In-band error object. Errors are reported with a success status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// `chatcmpl-<unix seconds>`
pub fn completion_id() -> String {
    format!("chatcmpl-{}", unix_now())
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        serde_json::json!({ "error": format!("failed to encode frame: {}", e) }).to_string()
    })
}

/// Turns extracted chunks into completion objects tagged with one model name.
#[derive(Debug, Clone)]
pub struct ResponseNormalizer {
    model: String,
}

impl ResponseNormalizer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    pub fn completion(&self, id: String, content: String) -> ChatCompletion {
        ChatCompletion {
            id,
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "stop".to_string(),
            }],
        }
    }

    /// Content delta for a regular chunk; empty delta plus `stop` for the
    /// final one.
    pub fn chunk(&self, chunk: &StreamChunk) -> ChatCompletionChunk {
        let (delta, finish_reason) = if chunk.is_final {
            (ChunkDelta::default(), Some("stop".to_string()))
        } else {
            (
                ChunkDelta {
                    content: Some(chunk.delta_text.clone()),
                },
                None,
            )
        };
        ChatCompletionChunk {
            id: chunk.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: unix_now(),
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// SSE `data:` payloads for a streaming reply: one per chunk as it is
    /// produced, the finish chunk, then [`DONE_SENTINEL`]. A failed turn
    /// ends with a single error payload instead.
    pub fn stream_payloads(&self, mut turn: TurnStream) -> impl Stream<Item = String> + Send + 'static {
        let normalizer = self.clone();
        stream! {
            while let Some(item) = turn.next().await {
                match item {
                    Ok(chunk) => {
                        yield encode(&normalizer.chunk(&chunk));
                        if chunk.is_final {
                            yield DONE_SENTINEL.to_string();
                            break;
                        }
                    }
                    Err(e) => {
                        info!("Turn failed mid-stream: {}", e);
                        yield encode(&ErrorBody::new(e.to_string()));
                        break;
                    }
                }
            }
        }
    }

    /// Payloads for a reply that is known up front (the reset confirmation).
    pub fn canned_payloads(&self, content: &str) -> Vec<String> {
        let id = completion_id();
        let delta = StreamChunk {
            id: id.clone(),
            delta_text: content.to_string(),
            is_final: false,
        };
        let finish = StreamChunk {
            id,
            delta_text: String::new(),
            is_final: true,
        };
        vec![
            encode(&self.chunk(&delta)),
            encode(&self.chunk(&finish)),
            DONE_SENTINEL.to_string(),
        ]
    }

    /// Drain the turn into one completion, applying `policy` to the text.
    pub async fn collect(&self, mut turn: TurnStream, policy: OutputPolicy) -> Result<ChatCompletion> {
        let mut id = None;
        let mut raw = String::new();
        while let Some(chunk) = turn.next().await {
            let chunk = chunk?;
            raw.push_str(&chunk.delta_text);
            id.get_or_insert(chunk.id);
        }

        info!("Buffered reply: {} chars raw", raw.chars().count());
        let content = match policy {
            OutputPolicy::Raw => {
                debug!("Returning raw reply");
                raw
            }
            OutputPolicy::Repaired => clean_json_output(&raw),
        };
        Ok(self.completion(id.unwrap_or_else(completion_id), content))
    }
}
