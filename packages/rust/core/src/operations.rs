//! Remote-model operations run by the abstract, digest and report stages.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use newsdigest_engine::{Operation, OperationError};
use newsdigest_shared::{ApiConfig, DigestError, SourceKind, WorkItem};

use crate::llm::{ChatClient, ChatMessage, ChatRequest};

// ---------------------------------------------------------------------------
// Abstract
// ---------------------------------------------------------------------------

/// Reads a fetched article and asks the abstract model to summarise it.
pub struct AbstractWriter {
    client: Arc<ChatClient>,
    model: String,
    system_prompt: String,
}

impl AbstractWriter {
    pub fn new(client: Arc<ChatClient>, model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

impl Operation for AbstractWriter {
    async fn process(&self, item: &WorkItem) -> Result<String, OperationError> {
        let path = Path::new(&item.payload);
        let article = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DigestError::io(path, e))?;

        debug!(index = item.index, chars = article.chars().count(), "abstracting article");

        let request = ChatRequest::new(
            self.model.as_str(),
            vec![
                ChatMessage::system(self.system_prompt.as_str()),
                ChatMessage::user(article),
            ],
        );
        Ok(self.client.complete(&request).await?)
    }
}

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// Bot model ids per source kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestModels {
    pub default: String,
    pub wechat: Option<String>,
    pub techcrunch: Option<String>,
}

impl DigestModels {
    /// Models from the `[api]` section; `default_override` replaces `digest_model`.
    pub fn from_api(api: &ApiConfig, default_override: Option<&str>) -> newsdigest_shared::Result<Self> {
        let default = match default_override {
            Some(model) => model.to_string(),
            None => newsdigest_shared::require_model(&api.digest_model, "digest_model")?.to_string(),
        };

        let models = Self {
            default,
            wechat: api.digest_model_wechat.clone().filter(|m| !m.trim().is_empty()),
            techcrunch: api.digest_model_techcrunch.clone().filter(|m| !m.trim().is_empty()),
        };

        if models.wechat.is_none() {
            warn!(model = %models.default, "digest_model_wechat not set, using the default model for WeChat URLs");
        }
        if models.techcrunch.is_none() {
            warn!(model = %models.default, "digest_model_techcrunch not set, using the default model for TechCrunch URLs");
        }

        Ok(models)
    }

    pub fn for_kind(&self, kind: SourceKind) -> &str {
        let specific = match kind {
            SourceKind::WeChat => self.wechat.as_deref(),
            SourceKind::TechCrunch => self.techcrunch.as_deref(),
            SourceKind::Generic => None,
        };
        specific.unwrap_or(&self.default)
    }
}

/// Sends a URL to the bot endpoint, which fetches and abstracts it remotely.
pub struct DigestOperation {
    client: Arc<ChatClient>,
    models: DigestModels,
}

impl DigestOperation {
    pub fn new(client: Arc<ChatClient>, models: DigestModels) -> Self {
        Self { client, models }
    }
}

impl Operation for DigestOperation {
    async fn process(&self, item: &WorkItem) -> Result<String, OperationError> {
        let kind = item.source_kind();
        let model = self.models.for_kind(kind);
        debug!(index = item.index, %kind, %model, "digesting URL");

        let request = ChatRequest::new(model, vec![ChatMessage::user(item.payload.as_str())]);
        Ok(self.client.complete(&request).await?)
    }
}

// ---------------------------------------------------------------------------
// Report summary
// ---------------------------------------------------------------------------

/// Produces the overall summary of a combined abstracts document.
///
/// The document is held here rather than in the work item so that progress
/// events only carry a short label.
pub struct ReportSummarizer {
    client: Arc<ChatClient>,
    model: String,
    system_prompt: String,
    temperature: f32,
    document: String,
}

impl ReportSummarizer {
    pub fn new(
        client: Arc<ChatClient>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        temperature: f32,
        document: impl Into<String>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt: system_prompt.into(),
            temperature,
            document: document.into(),
        }
    }
}

impl Operation for ReportSummarizer {
    async fn process(&self, _item: &WorkItem) -> Result<String, OperationError> {
        let request = ChatRequest::new(
            self.model.as_str(),
            vec![
                ChatMessage::system(self.system_prompt.as_str()),
                ChatMessage::user(self.document.as_str()),
            ],
        )
        .with_temperature(self.temperature);
        Ok(self.client.complete(&request).await?)
    }
}
