use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use streamchat_shared::ChatRequest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ApiKeyHeader, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    Open,
    /// Raw `data` of one server-sent event.
    Message(String),
    Error(String),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub stream: StreamId,
    pub kind: StreamEventKind,
}

/// Ownership of one open connection. Dropping the handle aborts it.
#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn new(id: StreamId, task: JoinHandle<()>) -> Self {
        Self { id, task: Some(task) }
    }

    /// A handle with no task behind it.
    #[cfg(test)]
    pub fn detached(id: StreamId) -> Self {
        Self { id, task: None }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn abort(mut self) {
        if let Some(task) = self.task.take() {
            debug!(stream = self.id.0, "aborting stream");
            task.abort();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub trait Transport {
    /// Issues `request` and reports its lifecycle on `events`, every event
    /// tagged with `stream`.
    fn open(
        &self,
        stream: StreamId,
        request: ChatRequest,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> StreamHandle;
}

/// POSTs chat requests and relays the server-sent event stream.
#[derive(Clone)]
pub struct SseClient {
    http: reqwest::Client,
    endpoint: url::Url,
    api_key: String,
    api_key_header: ApiKeyHeader,
}

impl SseClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            api_key_header: config.api_key_header.clone(),
        }
    }

    fn request_builder(&self, request: &ChatRequest) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .json(request);

        match &self.api_key_header {
            ApiKeyHeader::Bearer => builder.bearer_auth(&self.api_key),
            ApiKeyHeader::Custom(name) => builder.header(name.as_str(), self.api_key.as_str()),
        }
    }

    async fn run(
        builder: reqwest::RequestBuilder,
        emit: impl Fn(StreamEventKind) -> bool,
    ) {
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to send request: {}", e);
                emit(StreamEventKind::Error(e.to_string()));
                emit(StreamEventKind::Close);
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Completion endpoint returned {}", status);
            emit(StreamEventKind::Error(format!("API error {}: {}", status, body)));
            emit(StreamEventKind::Close);
            return;
        }

        info!("Stream opened ({})", status);
        if !emit(StreamEventKind::Open) {
            return;
        }

        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    if !emit(StreamEventKind::Message(event.data)) {
                        debug!("Event receiver dropped, stopping stream");
                        return;
                    }
                }
                Err(e) => {
                    warn!("SSE stream error: {}", e);
                    emit(StreamEventKind::Error(e.to_string()));
                    break;
                }
            }
        }

        debug!("Stream closed");
        emit(StreamEventKind::Close);
    }
}

impl Transport for SseClient {
    fn open(
        &self,
        stream: StreamId,
        request: ChatRequest,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> StreamHandle {
        debug!(
            stream = stream.0,
            messages = request.messages.len(),
            "Opening stream to {}",
            self.endpoint
        );
        let builder = self.request_builder(&request);

        let task = tokio::spawn(async move {
            let emit = |kind| events.send(StreamEvent { stream, kind }).is_ok();
            SseClient::run(builder, emit).await;
        });

        StreamHandle::new(stream, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use streamchat_shared::ChatMessage;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: &str, api_key_header: ApiKeyHeader) -> Config {
        Config {
            endpoint: endpoint.parse().unwrap(),
            api_key: "sk-test".to_string(),
            api_key_header,
            instructions: "instructions".to_string(),
            history_length: 10,
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            stream: true,
            messages: vec![
                ChatMessage::system("instructions"),
                ChatMessage::user("What's a good 90s movie?"),
            ],
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEventKind> {
        let mut kinds = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                assert_eq!(event.stream, StreamId(7));
                let done = event.kind == StreamEventKind::Close;
                kinds.push(event.kind);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("stream did not close in time");
        kinds
    }

    #[tokio::test]
    async fn relays_server_sent_events() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Pulp\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" Fiction.\"}}]}\n\n",
            "data: [DONE]\n\n",
        );

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("accept", "text/event-stream"))
            .and(body_json(serde_json::to_value(request()).unwrap()))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = SseClient::new(&config(
            &format!("{}/v1/chat/completions", server.uri()),
            ApiKeyHeader::Bearer,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = client.open(StreamId(7), request(), tx);

        let kinds = collect(rx).await;
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::Open,
                StreamEventKind::Message(
                    r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#.to_string()
                ),
                StreamEventKind::Message(r#"{"choices":[{"delta":{"content":"Pulp"}}]}"#.to_string()),
                StreamEventKind::Message(
                    r#"{"choices":[{"delta":{"content":" Fiction."}}]}"#.to_string()
                ),
                StreamEventKind::Message("[DONE]".to_string()),
                StreamEventKind::Close,
            ]
        );
    }

    #[tokio::test]
    async fn sends_key_in_custom_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("api-key", "sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("data: [DONE]\n\n", "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = SseClient::new(&config(
            &format!("{}/chat", server.uri()),
            ApiKeyHeader::Custom("api-key".to_string()),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = client.open(StreamId(7), request(), tx);

        let kinds = collect(rx).await;
        assert_eq!(kinds.first(), Some(&StreamEventKind::Open));
        assert_eq!(kinds.last(), Some(&StreamEventKind::Close));
    }

    #[tokio::test]
    async fn non_success_status_reports_error_then_close() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let client = SseClient::new(&config(&format!("{}/chat", server.uri()), ApiKeyHeader::Bearer));
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = client.open(StreamId(7), request(), tx);

        let kinds = collect(rx).await;
        assert_eq!(kinds.len(), 2);
        match &kinds[0] {
            StreamEventKind::Error(message) => {
                assert!(message.starts_with("API error 401"), "{}", message);
                assert!(message.contains("invalid api key"), "{}", message);
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(kinds[1], StreamEventKind::Close);
    }

    #[tokio::test]
    async fn broken_stream_reports_error_then_close() {
        let server = MockServer::start().await;
        let body = b"data: {\"choices\":[{\"delta\":{\"content\":\"Pulp\"}}]}\n\ndata: \xff\xfe\n\n".to_vec();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = SseClient::new(&config(&format!("{}/chat", server.uri()), ApiKeyHeader::Bearer));
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = client.open(StreamId(7), request(), tx);

        let kinds = collect(rx).await;
        assert_eq!(kinds.len(), 4, "{:?}", kinds);
        assert_eq!(kinds[0], StreamEventKind::Open);
        assert_eq!(
            kinds[1],
            StreamEventKind::Message(r#"{"choices":[{"delta":{"content":"Pulp"}}]}"#.to_string())
        );
        assert!(matches!(kinds[2], StreamEventKind::Error(_)), "{:?}", kinds[2]);
        assert_eq!(kinds[3], StreamEventKind::Close);
    }

    #[tokio::test]
    async fn connection_failure_reports_error_then_close() {
        let client = SseClient::new(&config("http://127.0.0.1:9/chat", ApiKeyHeader::Bearer));
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = client.open(StreamId(7), request(), tx);

        let kinds = collect(rx).await;
        assert_eq!(kinds.len(), 2);
        assert!(matches!(kinds[0], StreamEventKind::Error(_)));
        assert_eq!(kinds[1], StreamEventKind::Close);
    }

    #[tokio::test]
    async fn aborted_stream_stops_emitting() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: [DONE]\n\n", "text/event-stream")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let client = SseClient::new(&config(&format!("{}/chat", server.uri()), ApiKeyHeader::Bearer));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = client.open(StreamId(7), request(), tx);
        handle.abort();

        // The aborted task drops its sender, so the channel closes without
        // delivering anything.
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("channel did not close after abort");
        assert!(next.is_none());
    }
}
