//! Drives one conversation: opens a stream per user turn, folds the streamed
//! deltas into the in-progress reply and commits it when the stream ends.
//!
//! All transport events arrive on a single channel and are handled one at a
//! time through [`StreamController::handle_event`]. Events that belong to a
//! stream other than the one currently held are ignored, which is what makes
//! superseding a stream safe.

use streamchat_shared::{parse_stream_payload, ChatMessage, MessageRole, StreamPayload};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::{StreamEvent, StreamEventKind, StreamHandle, StreamId, Transport};
use crate::config::Config;
use crate::conversation::{build_request, Conversation, Status};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message is empty")]
    EmptyMessage,
}

pub struct StreamController<T: Transport> {
    config: Config,
    transport: T,
    conversation: Conversation,
    active: Option<StreamHandle>,
    next_stream: u64,
    events: mpsc::UnboundedSender<StreamEvent>,
    last_error: Option<String>,
    dropped_events: u64,
}

impl<T: Transport> StreamController<T> {
    pub fn new(config: Config, transport: T) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            transport,
            conversation: Conversation::new(),
            active: None,
            next_stream: 1,
            events,
            last_error: None,
            dropped_events: 0,
        };
        (controller, events_rx)
    }

    pub fn history(&self) -> &[ChatMessage] {
        self.conversation.history()
    }

    pub fn status(&self) -> Status {
        self.conversation.status()
    }

    /// The reply being streamed, or the placeholder once the connection has
    /// opened and no text has arrived yet.
    pub fn current_partial_message(&self) -> Option<&str> {
        self.conversation.in_progress().map(|m| m.display())
    }

    /// Most recent transport failure, cleared by the next send.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of stream payloads that could not be parsed and were skipped.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a turn on top of `prior_history`. Any stream still open is
    /// cancelled first.
    pub fn send(&mut self, message: &str, prior_history: Vec<ChatMessage>) -> Result<StreamId, SendError> {
        if message.is_empty() {
            return Err(SendError::EmptyMessage);
        }

        if self.active.is_some() {
            info!("New message supersedes the open stream");
            self.cancel();
        }

        self.last_error = None;
        self.conversation.begin_turn(prior_history, ChatMessage::user(message));

        let request = build_request(&self.config, self.conversation.history());
        let stream = StreamId(self.next_stream);
        self.next_stream += 1;

        info!(
            stream = stream.0,
            history = self.conversation.history().len(),
            sent = request.messages.len(),
            "Sending message"
        );
        self.active = Some(self.transport.open(stream, request, self.events.clone()));
        Ok(stream)
    }

    /// Same as [`send`](Self::send), continuing from the current history.
    pub fn send_turn(&mut self, message: &str) -> Result<StreamId, SendError> {
        if message.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if self.active.is_some() {
            self.cancel();
        }
        let prior = self.conversation.history().to_vec();
        self.send(message, prior)
    }

    pub fn handle_event(&mut self, event: StreamEvent) {
        let current = self.active.as_ref().map(StreamHandle::id);
        if current != Some(event.stream) {
            debug!(stream = event.stream.0, "Ignoring event from stale stream");
            return;
        }

        match event.kind {
            StreamEventKind::Open => self.on_open(),
            StreamEventKind::Message(data) => self.on_message(&data),
            StreamEventKind::Error(message) => self.on_error(message),
            StreamEventKind::Close => self.on_close(),
        }
    }

    fn on_open(&mut self) {
        debug!("Stream open, waiting for first token");
        if let Some(message) = self.conversation.in_progress_mut() {
            message.mark_opened();
        }
    }

    fn on_message(&mut self, data: &str) {
        let payload = match parse_stream_payload(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping malformed stream payload: {} (data: {:?})", e, data);
                self.dropped_events += 1;
                return;
            }
        };

        if payload.is_terminal() {
            self.finish_turn();
            return;
        }

        let StreamPayload::Delta(delta) = payload else {
            return;
        };

        self.conversation.mark_streaming();
        if let Some(message) = self.conversation.in_progress_mut() {
            if delta.is_assistant() {
                message.reset();
            }
            if let Some(text) = delta.text() {
                message.push_str(text);
            }
        }
    }

    fn on_error(&mut self, message: String) {
        error!("Stream failed: {}", message);
        self.last_error = Some(message);
        self.release();
        if let Some(partial) = self.conversation.discard() {
            debug!(chars = partial.len(), "Discarded partial reply after error");
        }
    }

    fn on_close(&mut self) {
        self.release();
        if let Some(partial) = self.conversation.discard() {
            debug!(chars = partial.len(), "Stream closed before completion");
        }
    }

    fn finish_turn(&mut self) {
        self.release();
        if let Some(message) = self.conversation.commit(MessageRole::Assistant) {
            info!(chars = message.content.len(), "Assistant reply committed");
        }
    }

    /// Aborts the open stream. Text received so far is kept in history as a
    /// user-role entry; the placeholder is never committed.
    pub fn cancel(&mut self) {
        self.release();
        let has_text = self
            .conversation
            .in_progress()
            .is_some_and(|message| !message.is_empty());

        if has_text {
            info!("Cancelled; keeping partial reply");
            self.conversation.commit(MessageRole::User);
        } else if self.conversation.discard().is_some() {
            info!("Cancelled before any text arrived");
        }
    }

    /// Empties the history. An open stream keeps running.
    pub fn clear(&mut self) {
        debug!(messages = self.conversation.history().len(), "Clearing history");
        self.conversation.clear_history();
    }

    fn release(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.abort();
        }
    }
}
