//! Minimal chat-completions client.
//!
//! Speaks the OpenAI-compatible `POST {base_url}/chat/completions` protocol
//! and returns the first choice's message content. The same shape serves
//! the abstract model, the digest bot endpoint and the report model.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use newsdigest_shared::{DigestError, Result};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Chat-completions client bound to one endpoint and key.
#[derive(Clone)]
pub struct ChatClient {
    http_client: Client,
    base_url: String,
    api_key: String,
}

impl ChatClient {
    /// Create a client for `base_url` (without the `/chat/completions` suffix).
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DigestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one completion request and return the reply text.
    ///
    /// Transport failures, non-2xx statuses and empty replies are all errors
    /// the caller may retry.
    pub async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let start = Instant::now();

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, model = %request.model, "chat request failed");
                DigestError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(%status, error = %error_text, model = %request.model, "chat API error");
            return Err(DigestError::Api(format!("HTTP {status}: {error_text}")));
        }

        let raw: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| DigestError::parse(format!("malformed completion: {e}")))?;

        let content = raw
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| DigestError::Api("completion contained no content".into()))?;

        debug!(
            model = %request.model,
            duration_ms = start.elapsed().as_millis() as u64,
            chars = content.chars().count(),
            "chat completion"
        );

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "cmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        })
    }

    fn client(server: &MockServer) -> ChatClient {
        ChatClient::new(server.uri(), "sk-test", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "abstract-model",
                "messages": [
                    { "role": "system", "content": "Summarise." },
                    { "role": "user", "content": "article body" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("# Title\n\nBody")))
            .expect(1)
            .mount(&server)
            .await;

        let request = ChatRequest::new(
            "abstract-model",
            vec![ChatMessage::system("Summarise."), ChatMessage::user("article body")],
        );
        let reply = client(&server).complete(&request).await.unwrap();
        assert_eq!(reply, "# Title\n\nBody");
    }

    #[tokio::test]
    async fn temperature_is_sent_only_when_set() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "temperature": 0.5 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let request = ChatRequest::new("m", vec![ChatMessage::user("x")]).with_temperature(0.5);
        assert_eq!(client(&server).complete(&request).await.unwrap(), "ok");

        let plain = serde_json::to_value(ChatRequest::new("m", vec![])).unwrap();
        assert!(plain.get("temperature").is_none());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = client(&server)
            .complete(&ChatRequest::new("m", vec![ChatMessage::user("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, DigestError::Api(ref m) if m.contains("429")));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .complete(&ChatRequest::new("m", vec![ChatMessage::user("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, DigestError::Api(_)));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = ChatClient::new("https://api.example.com/v3/", "k", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "https://api.example.com/v3");
    }
}
