use std::time::Duration;

use base64::Engine;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::memory::{Block, Content, ImageSource, Role};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DROP_RETRIES: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<(Role, Content)>,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Single result shape for both the buffered and the streaming path.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub text: String,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Messages-endpoint client. One instance per request cycle is fine; the key
/// is whatever the caller read from disk most recently.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            timeout,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Client with certificate verification off. Built only when the normal
    /// client failed a TLS handshake, used for exactly one retry. Some
    /// deployment targets ship incomplete trust stores; this is the narrow
    /// escape hatch for those, not a policy.
    fn relaxed_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default()
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.api_url.trim_end_matches('/'))
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let messages: Vec<Value> = repair_roles(request.messages.clone())
            .into_iter()
            .map(|(role, content)| json!({ "role": role.as_str(), "content": content }))
            .collect();
        let mut body = json!({
            "model": request.model,
            "system": request.system,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = self.endpoint();
        let mut tls_retried = false;
        let mut drops = 0u32;
        loop {
            let client = if tls_retried {
                self.relaxed_client()
            } else {
                self.client.clone()
            };
            let result = client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(body)
                .send()
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) if !tls_retried && is_tls_failure(&e) => {
                    tracing::warn!(
                        "TLS handshake failed, retrying once with relaxed verification: {}",
                        e
                    );
                    tls_retried = true;
                }
                Err(e) if drops < DROP_RETRIES && is_connection_drop(&e) => {
                    drops += 1;
                    let delay = Duration::from_secs(2 * u64::from(drops));
                    tracing::warn!(
                        "Connection dropped ({}), retry {}/{} in {}s",
                        e,
                        drops,
                        DROP_RETRIES,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(LlmError::Network(e.to_string())),
            }
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::error!("API error {}: {}", status, body);
        Err(LlmError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// Buffered completion. Text blocks of the response are concatenated;
    /// any other block kind is ignored.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult, LlmError> {
        let body = self.request_body(request, false);
        let response = Self::check(self.post(&body).await?).await?;
        let envelope: ResponseEnvelope = response
            .json()
            .await
            .map_err(|e| LlmError::Network(format!("invalid response body: {}", e)))?;
        let text = envelope
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        Ok(CompletionResult {
            text,
            stop_reason: envelope.stop_reason,
            usage: envelope.usage,
        })
    }

    /// Streamed completion. The HTTP status is checked before the receiver
    /// is handed out, so auth and API failures surface here rather than as
    /// an empty stream. Dropping the receiver cancels the transfer.
    pub async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<String>, LlmError> {
        let body = self.request_body(request, true);
        let response = Self::check(self.post(&body).await?).await?;

        let (tx, rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!("Stream read error: {}", e);
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    match parse_stream_event(data) {
                        StreamEvent::Delta(text) => {
                            if tx.send(text).await.is_err() {
                                return;
                            }
                        }
                        StreamEvent::Stop => return,
                        StreamEvent::Ignore => {}
                    }
                }
            }
        });
        Ok(rx)
    }

    /// One image plus an optional caption, sent as a multipart user turn.
    pub async fn complete_with_image(
        &self,
        model: &str,
        image: &[u8],
        media_type: &str,
        text: &str,
        system: &str,
        max_tokens: u32,
    ) -> Result<CompletionResult, LlmError> {
        let content = image_content(image, media_type, text);
        let request = CompletionRequest {
            model: model.to_string(),
            system: system.to_string(),
            messages: vec![(Role::User, content)],
            max_tokens,
            temperature: 1.0,
        };
        self.complete(&request).await
    }
}

pub fn image_content(image: &[u8], media_type: &str, text: &str) -> Content {
    let data = base64::engine::general_purpose::STANDARD.encode(image);
    let mut blocks = vec![Block::Image {
        source: ImageSource::base64(media_type, data),
    }];
    if !text.is_empty() {
        blocks.push(Block::Text {
            text: text.to_string(),
        });
    }
    Content::Multipart(blocks)
}

enum StreamEvent {
    Delta(String),
    Stop,
    Ignore,
}

/// Parse one SSE data payload. Anything malformed or irrelevant is skipped
/// so a single bad event never kills the stream.
fn parse_stream_event(data: &str) -> StreamEvent {
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        return StreamEvent::Ignore;
    };
    match v["type"].as_str() {
        Some("content_block_delta") if v["delta"]["type"] == "text_delta" => v["delta"]["text"]
            .as_str()
            .map(|s| StreamEvent::Delta(s.to_string()))
            .unwrap_or(StreamEvent::Ignore),
        Some("message_stop") => StreamEvent::Stop,
        _ => StreamEvent::Ignore,
    }
}

/// Normalize a turn list into what the endpoint accepts: drop a leading
/// assistant message, merge consecutive same-role turns, and never send an
/// empty list.
pub fn repair_roles(messages: Vec<(Role, Content)>) -> Vec<(Role, Content)> {
    let mut out: Vec<(Role, Content)> = Vec::new();
    for (role, content) in messages {
        if out.is_empty() && role == Role::Assistant {
            continue;
        }
        match out.last_mut() {
            Some((last_role, last_content)) if *last_role == role => {
                merge_content(last_content, content);
            }
            _ => out.push((role, content)),
        }
    }
    if out.is_empty() {
        out.push((Role::User, Content::text("...")));
    }
    out
}

fn merge_content(target: &mut Content, incoming: Content) {
    match (&mut *target, incoming) {
        (Content::Text(a), Content::Text(b)) => {
            a.push('\n');
            a.push_str(&b);
        }
        (Content::Multipart(blocks), Content::Text(b)) => {
            blocks.push(Block::Text { text: b });
        }
        (Content::Multipart(blocks), Content::Multipart(more)) => {
            blocks.extend(more);
        }
        (Content::Text(a), Content::Multipart(more)) => {
            let mut blocks = vec![Block::Text { text: a.clone() }];
            blocks.extend(more);
            *target = Content::Multipart(blocks);
        }
    }
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut out = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out.to_lowercase()
}

fn is_tls_failure(e: &reqwest::Error) -> bool {
    let chain = error_chain(e);
    chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl")
}

fn is_connection_drop(e: &reqwest::Error) -> bool {
    if e.is_timeout() {
        return false;
    }
    let chain = error_chain(e);
    e.is_connect()
        || chain.contains("connection reset")
        || chain.contains("connection aborted")
        || chain.contains("broken pipe")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Content {
        Content::text(s)
    }

    #[test]
    fn repair_drops_leading_assistant_and_merges_runs() {
        let repaired = repair_roles(vec![
            (Role::Assistant, text("hi")),
            (Role::User, text("a")),
            (Role::User, text("b")),
            (Role::Assistant, text("c")),
        ]);
        assert_eq!(
            repaired,
            vec![(Role::User, text("a\nb")), (Role::Assistant, text("c"))]
        );
    }

    #[test]
    fn repair_never_yields_an_empty_list() {
        let repaired = repair_roles(vec![(Role::Assistant, text("orphan"))]);
        assert_eq!(repaired, vec![(Role::User, text("..."))]);
        assert_eq!(repair_roles(vec![]), vec![(Role::User, text("..."))]);
    }

    #[test]
    fn repair_merges_text_into_multipart() {
        let repaired = repair_roles(vec![
            (
                Role::User,
                Content::Multipart(vec![Block::Text {
                    text: "look".to_string(),
                }]),
            ),
            (Role::User, text("again")),
        ]);
        assert_eq!(
            repaired,
            vec![(
                Role::User,
                Content::Multipart(vec![
                    Block::Text {
                        text: "look".to_string()
                    },
                    Block::Text {
                        text: "again".to_string()
                    },
                ])
            )]
        );
    }

    #[test]
    fn stream_events_reconstruct_text_and_skip_garbage() {
        let events = [
            r#"{"type":"message_start","message":{}}"#,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}"#,
            "this is not json at all",
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}"#,
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let mut out = String::new();
        let mut stopped = false;
        for e in events {
            match parse_stream_event(e) {
                StreamEvent::Delta(t) => out.push_str(&t),
                StreamEvent::Stop => stopped = true,
                StreamEvent::Ignore => {}
            }
        }
        assert_eq!(out, "Hello");
        assert!(stopped);
    }

    #[test]
    fn image_content_orders_image_before_caption() {
        let content = image_content(b"png-bytes", "image/png", "what is this?");
        let Content::Multipart(blocks) = content else {
            panic!("expected multipart");
        };
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], Block::Image { source } if source.media_type == "image/png"));
        assert!(matches!(&blocks[1], Block::Text { text } if text == "what is this?"));
    }

    #[test]
    fn image_content_without_caption_is_single_block() {
        let content = image_content(b"bytes", "image/jpeg", "");
        let Content::Multipart(blocks) = content else {
            panic!("expected multipart");
        };
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn request_body_carries_stream_flag_only_when_streaming() {
        let client = LlmClient::new("https://api.example.com", "k", Duration::from_secs(5));
        let request = CompletionRequest {
            model: "m".to_string(),
            system: "s".to_string(),
            messages: vec![(Role::User, text("hi"))],
            max_tokens: 64,
            temperature: 0.3,
        };
        let buffered = client.request_body(&request, false);
        assert!(buffered.get("stream").is_none());
        let streamed = client.request_body(&request, true);
        assert_eq!(streamed["stream"], serde_json::json!(true));
        assert_eq!(streamed["messages"][0]["content"], serde_json::json!("hi"));
    }
}
