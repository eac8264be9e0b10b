//! Semantic analysis providers.
//!
//! `HttpAnalyzer` posts transcript chunks to an analysis service that
//! answers with a context document. Without a configured service the
//! pipeline runs with `NoopAnalyzer` and simply has no topics or tangents.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::{AnalysisChunk, ProviderError, SemanticAnalyzer};
use crate::domain::context::ContextDocument;

const NAME: &str = "http-analyzer";
const USER_AGENT: &str = concat!("podflow/", env!("CARGO_PKG_VERSION"));

/// Client for a `POST {base}/analyze` endpoint
pub struct HttpAnalyzer {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpAnalyzer {
    pub fn new(base_url: String) -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/analyze", self.base_url)
    }
}

/// Map an HTTP status to retryable or not
fn status_error(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::transient(NAME, message)
    } else if status.is_client_error() {
        ProviderError::invalid_input(NAME, message)
    } else {
        ProviderError::permanent(NAME, message)
    }
}

fn request_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ProviderError::transient(NAME, e.to_string())
    } else if e.is_decode() {
        ProviderError::permanent(NAME, format!("malformed response: {}", e))
    } else {
        ProviderError::permanent(NAME, e.to_string())
    }
}

#[async_trait]
impl SemanticAnalyzer for HttpAnalyzer {
    fn name(&self) -> &str {
        NAME
    }

    async fn analyze(
        &self,
        chunk: &AnalysisChunk,
        timeout: Duration,
    ) -> Result<ContextDocument, ProviderError> {
        debug!(
            chunk = chunk.index,
            start = chunk.start_seconds,
            end = chunk.end_seconds,
            "Posting transcript chunk for analysis"
        );

        let response = self
            .http_client
            .post(self.endpoint())
            .timeout(timeout)
            .json(chunk)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        response.json::<ContextDocument>().await.map_err(request_error)
    }
}

/// Analyzer used when no service is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnalyzer;

#[async_trait]
impl SemanticAnalyzer for NoopAnalyzer {
    fn name(&self) -> &str {
        "none"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn analyze(
        &self,
        _chunk: &AnalysisChunk,
        _timeout: Duration,
    ) -> Result<ContextDocument, ProviderError> {
        Ok(ContextDocument::default())
    }
}
