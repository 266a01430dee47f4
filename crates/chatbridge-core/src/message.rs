//! OpenAI-style request body and conversation turns.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Chat message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Any other role (tool, function, developer...). Carried but not labelled.
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        #[serde(default)]
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One turn of the caller's conversation. Fields other than role and
/// content are accepted and ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConversationTurn {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(text.into())),
        }
    }

    pub fn with_parts(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Parts(parts)),
        }
    }

    /// All text parts concatenated in order.
    pub fn text(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
            None => String::new(),
        }
    }

    /// Non-empty image references in order.
    pub fn image_urls(&self) -> Vec<&str> {
        match &self.content {
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::ImageUrl { image_url } if !image_url.url.is_empty() => {
                        Some(image_url.url.as_str())
                    }
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn default_clean_json() -> bool {
    true
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<ConversationTurn>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stream: bool,
    /// Run the JSON repair pass on buffered replies.
    #[serde(default = "default_clean_json")]
    pub clean_json: bool,
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatCompletionRequest {
    /// Parse and validate a raw request body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|_| BridgeError::invalid_request("Invalid JSON body"))?;
        let request: Self = serde_json::from_value(value)
            .map_err(|e| BridgeError::invalid_request(format!("Invalid request body: {}", e)))?;

        if request.messages.is_empty() {
            return Err(BridgeError::invalid_request("No messages"));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let request =
            ChatCompletionRequest::parse(br#"{"messages":[{"role":"user","content":"hi"}]}"#)
                .unwrap();
        assert!(!request.stream);
        assert!(request.clean_json);
        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.messages[0].text(), "hi");
    }

    #[test]
    fn malformed_body_is_rejected() {
        let err = ChatCompletionRequest::parse(b"{not json").unwrap_err();
        assert_eq!(err.to_string(), "Invalid JSON body");
    }

    #[test]
    fn missing_messages_is_rejected() {
        let err = ChatCompletionRequest::parse(br#"{"stream": true}"#).unwrap_err();
        assert_eq!(err.to_string(), "No messages");

        let err = ChatCompletionRequest::parse(br#"{"messages": null}"#).unwrap_err();
        assert_eq!(err.to_string(), "No messages");
    }

    #[test]
    fn null_stream_means_buffered() {
        let request = ChatCompletionRequest::parse(
            br#"{"messages":[{"role":"user","content":"hi"}],"stream":null}"#,
        )
        .unwrap();
        assert!(!request.stream);
    }

    #[test]
    fn multipart_content_splits_text_and_images() {
        let request = ChatCompletionRequest::parse(
            br#"{"messages":[{"role":"user","content":[
                {"type":"text","text":"look at "},
                {"type":"image_url","image_url":{"url":"data:image/png;base64,AAAA"}},
                {"type":"input_audio","input_audio":{}},
                {"type":"text","text":"this"},
                {"type":"image_url","image_url":{"url":""}}
            ]}]}"#,
        )
        .unwrap();
        let turn = &request.messages[0];
        assert_eq!(turn.text(), "look at this");
        assert_eq!(turn.image_urls(), vec!["data:image/png;base64,AAAA"]);
    }

    #[test]
    fn unknown_roles_and_null_content_are_tolerated() {
        let request = ChatCompletionRequest::parse(
            br#"{"messages":[{"role":"tool","content":null,"tool_call_id":"x"}]}"#,
        )
        .unwrap();
        assert_eq!(request.messages[0].role, Role::Other);
        assert_eq!(request.messages[0].text(), "");
    }
}
