use serde::{Deserialize, Serialize};

/// Payload some providers send as the last event of a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Body POSTed to the completion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub stream: bool,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One `data:` payload of an OpenAI-style streaming completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Delta,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl Delta {
    pub fn is_assistant(&self) -> bool {
        self.role.as_deref() == Some("assistant")
    }

    /// Content of the delta, if any non-empty text was sent.
    pub fn text(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    /// Explicit end-of-stream sentinel.
    Done,
    Delta(Delta),
    /// Chunk without choices (content-filter annotations and the like).
    Skip,
}

impl StreamPayload {
    /// A stream ends on the sentinel, or on a delta that carries no content
    /// and does not open an assistant turn.
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamPayload::Done => true,
            StreamPayload::Delta(delta) => delta.text().is_none() && !delta.is_assistant(),
            StreamPayload::Skip => false,
        }
    }
}

pub fn parse_stream_payload(data: &str) -> Result<StreamPayload, serde_json::Error> {
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Ok(StreamPayload::Done);
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    Ok(match chunk.choices.into_iter().next() {
        Some(choice) => StreamPayload::Delta(choice.delta),
        None => StreamPayload::Skip,
    })
}
