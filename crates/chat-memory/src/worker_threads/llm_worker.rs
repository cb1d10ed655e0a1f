//! LLM service contract and its OpenAI-compatible HTTP implementation.
//!
//! Completions go to `/v1/chat/completions`, embeddings to `/v1/embeddings`.
//! Transient failures (transport errors, 429, 5xx) are retried with backoff;
//! "prompt too long / bad request" responses are never retried.
use crate::call_context::CallContext;
use crate::config::Config;
use crate::error::{MemoryError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn call(&self, ctx: &CallContext, prompt: &str) -> Result<String>;
    async fn embed_texts(&self, ctx: &CallContext, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Outcome of one HTTP attempt
enum Attempt<T> {
    Done(T),
    Retry(MemoryError),
}

pub struct LlmWorker {
    backend_url: String,
    model: String,
    embedding_model: String,
    max_attempts: u32,
    initial_backoff: Duration,
    http_client: reqwest::Client,
}

impl LlmWorker {
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::build(
            config.llm_base_url.clone(),
            config.llm_model.clone(),
            config.embedding_model.clone(),
            config.llm_max_attempts,
            Duration::from_secs(config.llm_timeout_seconds),
        )
    }

    pub fn new_with_backend(backend_url: impl Into<String>) -> Result<Self> {
        Self::build(
            backend_url.into(),
            "local-llm".to_string(),
            "local-embedding".to_string(),
            3,
            Duration::from_secs(120),
        )
    }

    fn build(
        backend_url: String,
        model: String,
        embedding_model: String,
        max_attempts: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemoryError::Config(format!("failed to build HTTP client: {}", e)))?;
        info!("LLM worker initialized with backend: {}", backend_url);
        Ok(Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            model,
            embedding_model,
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(250),
            http_client,
        })
    }

    /// Shorter backoff for tests against a local mock server
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.backend_url)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(Duration::from_secs(5))
    }

    async fn post_with_retry<B, R>(&self, ctx: &CallContext, url: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let mut last_error = MemoryError::Llm("no attempt made".to_string());
        for attempt in 1..=self.max_attempts {
            match ctx.run(self.post_once(url, body)).await? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(e) => {
                    warn!("LLM request to {} failed (attempt {}/{}): {}", url, attempt, self.max_attempts, e);
                    last_error = e;
                }
            }
            if attempt < self.max_attempts {
                let delay = self.backoff(attempt);
                ctx.run(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
        }
        Err(last_error)
    }

    async fn post_once<B, R>(&self, url: &str, body: &B) -> Result<Attempt<R>>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let response = match self.http_client.post(url).json(body).send().await {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Retry(MemoryError::Llm(format!("LLM backend request failed: {}", e)))),
        };

        let status = response.status();
        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map(Attempt::Done)
                .map_err(|e| MemoryError::Llm(format!("failed to parse LLM response: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            400 | 413 | 422 => Err(MemoryError::BadRequest(format!("LLM rejected the request ({}): {}", status, body))),
            429 | 500..=599 => Ok(Attempt::Retry(MemoryError::Llm(format!("LLM backend returned {}: {}", status, body)))),
            _ => Err(MemoryError::Llm(format!("LLM backend returned {}: {}", status, body))),
        }
    }
}

#[async_trait]
impl LlmService for LlmWorker {
    async fn call(&self, ctx: &CallContext, prompt: &str) -> Result<String> {
        debug!("LLM worker generating response ({} prompt chars)", prompt.len());
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.0,
            stream: false,
        };
        let completion: ChatCompletionResponse =
            self.post_with_retry(ctx, &self.completions_url(), &request).await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or_else(|| MemoryError::Llm("LLM response contained no choices".to_string()))
    }

    async fn embed_texts(&self, ctx: &CallContext, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts,
        };
        let response: EmbeddingResponse = self.post_with_retry(ctx, &self.embeddings_url(), &request).await?;
        if response.data.len() != texts.len() {
            return Err(MemoryError::Llm(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.data.len()
            )));
        }
        let mut data = response.data;
        data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn worker(server: &mockito::ServerGuard, attempts: u32) -> LlmWorker {
        LlmWorker::build(
            server.url(),
            "test-model".into(),
            "test-embed".into(),
            attempts,
            Duration::from_secs(5),
        )
        .unwrap()
        .with_initial_backoff(Duration::from_millis(1))
    }

    fn completion(text: &str) -> String {
        json!({"choices": [{"message": {"role": "assistant", "content": text}}]}).to_string()
    }

    #[tokio::test]
    async fn test_call_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion("hello"))
            .create_async()
            .await;

        let text = worker(&server, 3).call(&CallContext::new(), "hi").await.unwrap();
        assert_eq!(text, "hello");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = worker(&server, 3).call(&CallContext::new(), "hi").await.unwrap_err();
        assert!(matches!(err, MemoryError::Llm(_)));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/v1/chat/completions")
            .with_status(413)
            .with_body("prompt too long")
            .expect(1)
            .create_async()
            .await;

        let err = worker(&server, 5).call(&CallContext::new(), "hi").await.unwrap_err();
        assert!(matches!(err, MemoryError::BadRequest(_)));
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn test_embeddings_follow_index_order() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let vectors = worker(&server, 1)
            .embed_texts(&CallContext::new(), &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts() {
        let server = mockito::Server::new_async().await;
        let ctx = CallContext::new();
        ctx.cancel();
        let err = worker(&server, 3).call(&ctx, "hi").await.unwrap_err();
        assert!(matches!(err, MemoryError::Cancelled));
    }
}
