use streamchat_shared::{ChatMessage, ChatRequest, MessageRole};

use crate::config::Config;

/// Shown in place of the assistant reply once the stream has opened but
/// before the first token arrives.
pub const PLACEHOLDER: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    /// Request sent, no tokens yet.
    Waiting,
    /// Tokens arriving.
    Streaming,
}

impl Status {
    pub fn label(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Waiting => "waiting",
            Status::Streaming => "streaming",
        }
    }
}

/// The assistant reply being accumulated for the current turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InProgressMessage {
    buffer: String,
    opened: bool,
}

impl InProgressMessage {
    pub fn mark_opened(&mut self) {
        self.opened = true;
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn push_str(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_text(self) -> String {
        self.buffer
    }

    pub fn display(&self) -> &str {
        if self.buffer.is_empty() && self.opened {
            PLACEHOLDER
        } else {
            &self.buffer
        }
    }
}

/// History, in-progress reply and lifecycle status of a single conversation.
///
/// `in_progress` is `Some` exactly when `status` is `Waiting` or `Streaming`;
/// every mutation below keeps the two in step.
#[derive(Debug, Clone)]
pub struct Conversation {
    history: Vec<ChatMessage>,
    in_progress: Option<InProgressMessage>,
    status: Status,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            in_progress: None,
            status: Status::Idle,
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn in_progress(&self) -> Option<&InProgressMessage> {
        self.in_progress.as_ref()
    }

    pub fn in_progress_mut(&mut self) -> Option<&mut InProgressMessage> {
        self.in_progress.as_mut()
    }

    /// Replaces the history with `prior` followed by the user's message and
    /// starts waiting for a reply.
    pub fn begin_turn(&mut self, prior: Vec<ChatMessage>, message: ChatMessage) {
        self.history = prior;
        self.history.push(message);
        self.in_progress = Some(InProgressMessage::default());
        self.status = Status::Waiting;
    }

    pub fn mark_streaming(&mut self) {
        if self.in_progress.is_some() {
            self.status = Status::Streaming;
        }
    }

    /// Moves the in-progress text into history under `role` and goes idle.
    /// Returns the committed message, if a turn was in progress.
    pub fn commit(&mut self, role: MessageRole) -> Option<&ChatMessage> {
        let message = self.in_progress.take()?;
        self.status = Status::Idle;
        self.history.push(ChatMessage::new(role, message.into_text()));
        self.history.last()
    }

    /// Drops any in-progress text and goes idle. Returns the discarded text.
    pub fn discard(&mut self) -> Option<String> {
        self.status = Status::Idle;
        self.in_progress.take().map(InProgressMessage::into_text)
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

/// Most recent `max` messages of `history`.
pub fn truncate_history(history: &[ChatMessage], max: usize) -> &[ChatMessage] {
    let start = history.len().saturating_sub(max);
    &history[start..]
}

/// Builds the outbound request: one system instruction followed by the
/// truncated history.
pub fn build_request(config: &Config, history: &[ChatMessage]) -> ChatRequest {
    let recent = truncate_history(history, config.history_length);

    let mut messages = Vec::with_capacity(1 + recent.len());
    messages.push(ChatMessage::system(config.instructions.clone()));
    messages.extend(recent.iter().cloned());

    ChatRequest {
        stream: true,
        messages,
        model: config.model.clone(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    }
}
