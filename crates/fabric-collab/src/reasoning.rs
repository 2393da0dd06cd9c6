use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::error::CollabError;

/// Facade over the generative reasoning backend. `select_model` delegates to
/// a remote selector when available; on any failure of either call the
/// caller falls back to the first configured candidate.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn generate(&self, prompt: &str, model: Option<&str>) -> Result<String, CollabError>;

    /// Ask the backend to pick the best candidate model for `prompt`. Falls
    /// back to `candidates[0]` on any backend failure or empty response.
    async fn select_model(&self, candidates: &[String], prompt: &str) -> String {
        if candidates.is_empty() {
            return String::new();
        }
        match self.generate(prompt, Some(&format!("selector:{}", candidates.join(",")))).await {
            Ok(choice) if candidates.iter().any(|c| c == &choice) => choice,
            _ => candidates[0].clone(),
        }
    }

    /// Models the backend currently reports as loaded/available.
    async fn list_models(&self) -> Result<Vec<String>, CollabError>;
}

pub struct HttpReasoningBackend {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpReasoningBackend {
    pub fn new(base_url: String, api_key: Option<String>, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_secs(timeout_secs),
            client: reqwest::Client::new(),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[derive(serde::Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

#[derive(Deserialize)]
struct ModelsResponse {
    models: Vec<String>,
}

#[async_trait]
impl ReasoningBackend for HttpReasoningBackend {
    async fn generate(&self, prompt: &str, model: Option<&str>) -> Result<String, CollabError> {
        let resp = self
            .authed(self.client.post(format!("{}/generate", self.base_url)))
            .timeout(self.timeout)
            .json(&GenerateRequest { prompt, model })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CollabError::Http(format!(
                "reasoning backend returned {}",
                resp.status()
            )));
        }
        Ok(resp.json::<GenerateResponse>().await?.text)
    }

    async fn list_models(&self) -> Result<Vec<String>, CollabError> {
        let resp = self
            .authed(self.client.get(format!("{}/models", self.base_url)))
            .timeout(self.timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "reasoning backend model list unavailable");
            return Ok(Vec::new());
        }
        Ok(resp.json::<ModelsResponse>().await?.models)
    }
}

/// Deterministic reasoning backend used by engine tests: returns a canned
/// response (optionally containing an escalation keyword) and a fixed model
/// catalog.
pub struct MockReasoningBackend {
    pub response: String,
    pub available_models: Vec<String>,
}

impl MockReasoningBackend {
    pub fn new(response: impl Into<String>, available_models: Vec<String>) -> Self {
        Self {
            response: response.into(),
            available_models,
        }
    }
}

#[async_trait]
impl ReasoningBackend for MockReasoningBackend {
    async fn generate(&self, _prompt: &str, _model: Option<&str>) -> Result<String, CollabError> {
        Ok(self.response.clone())
    }

    async fn list_models(&self) -> Result<Vec<String>, CollabError> {
        Ok(self.available_models.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;

    #[async_trait]
    impl ReasoningBackend for AlwaysFails {
        async fn generate(&self, _prompt: &str, _model: Option<&str>) -> Result<String, CollabError> {
            Err(CollabError::Http("unreachable".into()))
        }
        async fn list_models(&self) -> Result<Vec<String>, CollabError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn select_model_falls_back_to_first_candidate_on_backend_failure() {
        let backend = AlwaysFails;
        let candidates = vec!["gpt-a".to_string(), "gpt-b".to_string()];
        let chosen = backend.select_model(&candidates, "pick one").await;
        assert_eq!(chosen, "gpt-a");
    }

    #[tokio::test]
    async fn select_model_falls_back_when_response_is_not_a_candidate() {
        let backend = MockReasoningBackend::new("not-a-real-model", vec![]);
        let candidates = vec!["gpt-a".to_string()];
        let chosen = backend.select_model(&candidates, "pick one").await;
        assert_eq!(chosen, "gpt-a");
    }
}
