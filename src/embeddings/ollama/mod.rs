
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{EmbedIntent, EmbeddingProvider, GenerationProvider};
use crate::config::OllamaConfig;
use crate::{RagError, Result};

pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 768;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u64 = 2;

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    embedding_model: String,
    generation_model: String,
    embedding_dimension: usize,
    document_prefix: String,
    query_prefix: String,
    temperature: f32,
    agent: ureq::Agent,
    retry_attempts: u32,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

/// Which operation a request belongs to, for error classification
#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Embedding,
    Generation,
}

impl RequestKind {
    fn error(self, message: String) -> RagError {
        match self {
            Self::Embedding => RagError::EmbeddingProvider(message),
            Self::Generation => RagError::Generation(message),
        }
    }
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let base_url = config.ollama_url()?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .build()
            .into();

        Ok(Self {
            base_url,
            embedding_model: config.embedding_model.clone(),
            generation_model: config.generation_model.clone(),
            embedding_dimension: config.embedding_dimension as usize,
            document_prefix: config.document_prefix.clone(),
            query_prefix: config.query_prefix.clone(),
            temperature: config.temperature,
            agent,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Test connection to Ollama and verify both configured models are installed
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);

        let models = self.list_models()?;
        for model in [&self.embedding_model, &self.generation_model] {
            if !models.iter().any(|m| &m.name == model) {
                let available: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
                warn!(
                    "Model {} not found. Available models: {:?}",
                    model, available
                );
                return Err(RagError::Config(format!(
                    "Model '{}' is not available. Available models: {:?}",
                    model, available
                )));
            }
        }

        info!(
            "Health check passed for Ollama at {} ({} / {})",
            self.base_url, self.embedding_model, self.generation_model
        );
        Ok(())
    }

    /// Ping the Ollama server to check if it's responsive
    #[inline]
    pub fn ping(&self) -> Result<()> {
        self.list_models().map(|_| ())
    }

    /// List all installed models
    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("/api/tags")?;
        debug!("Fetching available models from {}", url);

        let response_text = self.make_request_with_retry(RequestKind::Embedding, || {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let models_response: ModelsResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::EmbeddingProvider(format!("Invalid models response: {}", e)))?;

        debug!("Found {} models", models_response.models.len());
        Ok(models_response.models)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RagError::Config(format!("Failed to build URL for {}: {}", path, e)))
    }

    fn post_json<T: Serialize>(&self, kind: RequestKind, path: &str, body: &T) -> Result<String> {
        let url = self.endpoint(path)?;
        let request_json = serde_json::to_string(body)
            .map_err(|e| kind.error(format!("Failed to serialize request: {}", e)))?;

        self.make_request_with_retry(kind, || {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
    }

    fn make_request_with_retry<F>(&self, kind: RequestKind, mut request_fn: F) -> Result<String>
    where
        F: FnMut() -> std::result::Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("HTTP request attempt {}/{}", attempt, self.retry_attempts);

            match request_fn() {
                Ok(response_text) => {
                    debug!("Request succeeded on attempt {}", attempt);
                    return Ok(response_text);
                }
                Err(ureq::Error::StatusCode(status)) if status == 401 || status == 403 => {
                    warn!("Ollama rejected credentials (status {})", status);
                    return Err(RagError::ProviderAuth(format!("HTTP {}", status)));
                }
                Err(ureq::Error::StatusCode(status)) if status < 500 => {
                    warn!("Client error (status {}), not retrying", status);
                    return Err(kind.error(format!("Client error: HTTP {}", status)));
                }
                Err(error) => {
                    let should_retry = matches!(
                        error,
                        ureq::Error::StatusCode(_)
                            | ureq::Error::ConnectionFailed
                            | ureq::Error::HostNotFound
                            | ureq::Error::Timeout(_)
                            | ureq::Error::Io(_)
                    );

                    if !should_retry {
                        warn!("Non-retryable error: {}", error);
                        return Err(kind.error(format!("Non-retryable error: {}", error)));
                    }

                    warn!(
                        "Request error: {}, attempt {}/{}",
                        error, attempt, self.retry_attempts
                    );
                    last_error = Some(format!("Request error: {}", error));

                    if attempt < self.retry_attempts {
                        let delay_ms = EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1) * 1000;
                        let delay = Duration::from_millis(delay_ms);
                        debug!("Waiting {:?} before retry", delay);
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        error!("All retry attempts failed for request to {}", self.base_url);

        Err(kind.error(
            last_error.unwrap_or_else(|| "Request failed after retries".to_string()),
        ))
    }
}

impl EmbeddingProvider for OllamaClient {
    fn embed(&self, text: &str, intent: EmbedIntent) -> Result<Vec<f32>> {
        let prefix = match intent {
            EmbedIntent::Document => &self.document_prefix,
            EmbedIntent::Query => &self.query_prefix,
        };
        debug!(
            "Generating {:?} embedding for text (length: {})",
            intent,
            text.len()
        );

        let request = EmbedRequest {
            model: &self.embedding_model,
            input: format!("{}{}", prefix, text),
        };
        let response_text = self.post_json(RequestKind::Embedding, "/api/embed", &request)?;

        let embed_response: EmbedResponse = serde_json::from_str(&response_text).map_err(|e| {
            RagError::EmbeddingProvider(format!("Failed to parse embedding response: {}", e))
        })?;

        embed_response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RagError::EmbeddingProvider("Response contained no embedding".into()))
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }
}

impl GenerationProvider for OllamaClient {
    fn generate(&self, prompt: &str) -> Result<String> {
        debug!(
            "Generating answer with {} (prompt length: {})",
            self.generation_model,
            prompt.len()
        );

        let request = GenerateRequest {
            model: &self.generation_model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };
        let response_text = self.post_json(RequestKind::Generation, "/api/generate", &request)?;

        let generate_response: GenerateResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::Generation(format!("Failed to parse generation response: {}", e)))?;

        Ok(generate_response.response.trim().to_string())
    }
}
