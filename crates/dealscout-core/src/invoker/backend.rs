//! Model backends
//!
//! [`ModelBackend`] is the single call capability the invoker needs. The
//! HTTP implementation dispatches on the descriptor's provider variant:
//! - Ollama: `POST {base_url}/api/generate`
//! - OpenAI-compatible: `POST {base_url}/chat/completions` with a bearer key
//!   read from the environment variable named in the descriptor

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::retry::extract_retry_after;
use super::types::InvocationRequest;
use crate::error::{Error, Result};
use crate::registry::{ModelDescriptor, Provider};

/// Something that can run one generation call against a model
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Run a single attempt; retries and timeouts belong to the caller
    async fn generate(&self, model: &ModelDescriptor, request: &InvocationRequest)
    -> Result<String>;
}

/// HTTP backend for Ollama and OpenAI-compatible endpoints
#[derive(Clone)]
pub struct HttpBackend {
    http_client: HttpClient,
    /// Keys supplied directly, by environment variable name
    api_keys: HashMap<String, String>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("api_keys", &self.api_keys.len())
            .finish()
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpBackend {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let http_client = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(Error::NetworkError)?;
        Ok(Self {
            http_client,
            api_keys: HashMap::new(),
        })
    }

    /// Supply a key for an environment variable name, taking precedence over the environment
    pub fn with_api_key(mut self, env_name: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_keys.insert(env_name.into(), key.into());
        self
    }

    fn api_key(&self, env_name: &str) -> Result<String> {
        if let Some(key) = self.api_keys.get(env_name) {
            return Ok(key.clone());
        }
        std::env::var(env_name).map_err(|_| {
            Error::ConfigError(format!(
                "API key environment variable {} is not set",
                env_name
            ))
        })
    }

    async fn ollama(
        &self,
        base_url: &str,
        model: &str,
        request: &InvocationRequest,
    ) -> Result<String> {
        let url = format!("{}/api/generate", base_url.trim_end_matches('/'));
        let mut options = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            options.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }
        let body = json!({
            "model": model,
            "prompt": request.prompt,
            "system": request.system,
            "stream": false,
            "options": options,
        });

        debug!(model, url = %url, "Sending Ollama generate request");
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return handle_error_response(status, response).await;
        }

        let text = response.text().await.map_err(Error::NetworkError)?;
        let parsed: OllamaResponse = serde_json::from_str(&text)
            .map_err(|e| Error::MalformedResponse(format!("Failed to parse response: {}", e)))?;
        Ok(parsed.response)
    }

    async fn chat_completion(
        &self,
        base_url: &str,
        model: &str,
        api_key_env: &str,
        request: &InvocationRequest,
    ) -> Result<String> {
        let api_key = self.api_key(api_key_env)?;
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({ "model": model, "messages": messages });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        debug!(model, url = %url, "Sending chat completion request");
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return handle_error_response(status, response).await;
        }

        let text = response.text().await.map_err(Error::NetworkError)?;
        let parsed: ChatCompletion = serde_json::from_str(&text)
            .map_err(|e| Error::MalformedResponse(format!("Failed to parse response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::MalformedResponse("Empty response from API".to_string()))
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn generate(
        &self,
        model: &ModelDescriptor,
        request: &InvocationRequest,
    ) -> Result<String> {
        match &model.provider {
            Provider::Ollama { base_url, model } => self.ollama(base_url, model, request).await,
            Provider::OpenAiCompatible {
                base_url,
                model,
                api_key_env,
            } => {
                self.chat_completion(base_url, model, api_key_env, request)
                    .await
            }
        }
    }
}

/// Map an unsuccessful HTTP status to an error
async fn handle_error_response<T>(
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> Result<T> {
    let header_wait = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    match status.as_u16() {
        429 => {
            let wait_secs = extract_retry_after(&body).or(header_wait).unwrap_or(0);
            Err(Error::RateLimited(wait_secs))
        }
        500..=599 => Err(Error::BackendStatus {
            status: status.as_u16(),
            body,
        }),
        code => Err(Error::BackendRejected { status: code, body }),
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn backend() -> HttpBackend {
        HttpBackend::new(Duration::from_secs(5)).unwrap()
    }

    fn ollama_model(base_url: String) -> ModelDescriptor {
        ModelDescriptor::new(
            "mistral-7b",
            Provider::Ollama {
                base_url,
                model: "mistral".to_string(),
            },
        )
        .with_capabilities(["comps"])
    }

    fn cloud_model(base_url: String, api_key_env: &str) -> ModelDescriptor {
        ModelDescriptor::new(
            "gpt-4o",
            Provider::OpenAiCompatible {
                base_url,
                model: "gpt-4o".to_string(),
                api_key_env: api_key_env.to_string(),
            },
        )
        .with_capabilities(["classify"])
    }

    #[tokio::test]
    async fn test_ollama_generate() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"model": "mistral", "stream": false}"#);
            then.status(200)
                .json_body(json!({ "model": "mistral", "response": "three comps found", "done": true }));
        });

        let output = backend()
            .generate(
                &ollama_model(server.url("")),
                &InvocationRequest::new("find comps"),
            )
            .await
            .unwrap();

        mock.assert();
        assert_eq!(output, "three comps found");
    }

    #[tokio::test]
    async fn test_chat_completion_sends_bearer_key() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer sk-test");
            then.status(200).json_body(json!({
                "choices": [{ "message": { "role": "assistant", "content": "hot lead" } }]
            }));
        });

        let output = backend()
            .with_api_key("DEALSCOUT_TEST_OPENAI_KEY", "sk-test")
            .generate(
                &cloud_model(server.url(""), "DEALSCOUT_TEST_OPENAI_KEY"),
                &InvocationRequest::new("classify this lead").with_system("You classify leads"),
            )
            .await
            .unwrap();

        mock.assert();
        assert_eq!(output, "hot lead");
    }

    #[tokio::test]
    async fn test_missing_api_key_is_config_error() {
        let err = backend()
            .generate(
                &cloud_model("http://127.0.0.1:9".to_string(), "DEALSCOUT_UNSET_KEY_FOR_TESTS"),
                &InvocationRequest::new("hello"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/busy/api/generate");
            then.status(503).body("overloaded");
        });
        server.mock(|when, then| {
            when.method(POST).path("/limited/api/generate");
            then.status(429).json_body(json!({ "retry_after": 7 }));
        });
        server.mock(|when, then| {
            when.method(POST).path("/denied/api/generate");
            then.status(404).body("no such model");
        });

        let backend = backend();
        let request = InvocationRequest::new("hi");

        let busy = backend
            .generate(&ollama_model(server.url("/busy")), &request)
            .await
            .unwrap_err();
        assert!(matches!(busy, Error::BackendStatus { status: 503, .. }));
        assert!(busy.is_transient());

        let limited = backend
            .generate(&ollama_model(server.url("/limited")), &request)
            .await
            .unwrap_err();
        assert!(matches!(limited, Error::RateLimited(7)));

        let denied = backend
            .generate(&ollama_model(server.url("/denied")), &request)
            .await
            .unwrap_err();
        assert!(matches!(denied, Error::BackendRejected { status: 404, .. }));
        assert!(!denied.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({ "choices": [] }));
        });

        let err = backend()
            .with_api_key("DEALSCOUT_TEST_OPENAI_KEY", "sk-test")
            .generate(
                &cloud_model(server.url(""), "DEALSCOUT_TEST_OPENAI_KEY"),
                &InvocationRequest::new("hi"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }
}
