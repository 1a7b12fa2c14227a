//! HTTP client for a remote inference service
//!
//! Embeddings use the OpenAI-compatible `POST /embeddings` route. Summaries use
//! either `POST /chat/completions` or a plain `POST /generate` completion
//! endpoint, selected by `inference.generation_api`. Retrying is left to
//! `RetryPolicy`; this client only classifies each failure.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{GenerationApi, InferenceConfig};
use crate::error::{EngramError, Result};
use crate::inference::prompts::{SUMMARY_SYSTEM_PROMPT, summary_prompt};
use crate::inference::{Embedder, Summarizer};

#[derive(Debug, Clone)]
pub struct RemoteInference {
    client: Client,
    config: InferenceConfig,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    max_tokens: usize,
    temperature: f32,
    stop: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

impl RemoteInference {
    /// Build a client from configuration.
    ///
    /// The bearer token is read from the environment variable named by
    /// `api_key_env`; when it is unset requests are sent without one.
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(EngramError::Config("inference.api_url is empty".to_string()));
        }

        let api_key = env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        let request_timeout = config.embed_timeout_secs.max(config.summarize_timeout_secs);

        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .map_err(|e| EngramError::Config(format!("Failed to build HTTP client: {e}")))?;

        info!(
            "RemoteInference initialized: api_url={}, generation_api={:?}",
            config.api_url, config.generation_api
        );

        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{route}", self.config.api_url.trim_end_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post_json<B, R>(&self, route: &str, body: &B, timeout_secs: u64) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(route);
        debug!("POST {url}");

        let response = self
            .authorize(self.client.post(&url))
            .timeout(Duration::from_secs(timeout_secs))
            .json(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let response = check_status(response).await?;
        response
            .json::<R>()
            .await
            .map_err(|e| EngramError::Serialization(format!("Malformed response from {url}: {e}")))
    }

    async fn chat_summary(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.config.generation_model,
            messages: vec![
                Message {
                    role: "system",
                    content: SUMMARY_SYSTEM_PROMPT,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens,
        };

        let completion: ChatCompletionResponse = self
            .post_json("chat/completions", &request, self.config.summarize_timeout_secs)
            .await?;

        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn generate_summary(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let request = GenerateRequest {
            prompt,
            max_tokens,
            temperature: self.config.temperature,
            stop: &["\n\n"],
        };

        let generated: GenerateResponse = self
            .post_json("generate", &request, self.config.summarize_timeout_secs)
            .await?;

        Ok(generated.text)
    }
}

fn classify_transport_error(err: reqwest::Error) -> EngramError {
    if err.is_timeout() {
        EngramError::Timeout(format!("inference request timed out: {err}"))
    } else {
        EngramError::TransientInfra(format!("inference request failed: {err}"))
    }
}

/// Map a non-success HTTP status onto the error taxonomy
pub(crate) fn classify_status(status: StatusCode, body: &str) -> EngramError {
    let detail = format!("inference service returned {status}: {body}");
    match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            EngramError::ContentRejected(detail)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => EngramError::Timeout(detail),
        StatusCode::TOO_MANY_REQUESTS => EngramError::TransientInfra(detail),
        s if s.is_server_error() => EngramError::TransientInfra(detail),
        _ => EngramError::Fatal(detail),
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(classify_status(status, &body))
}

#[async_trait]
impl Embedder for RemoteInference {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: text,
        };
        let response: EmbeddingResponse = self
            .post_json("embeddings", &request, self.config.embed_timeout_secs)
            .await?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EngramError::Serialization("Empty embedding response".to_string()))
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[async_trait]
impl Summarizer for RemoteInference {
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String> {
        let prompt = summary_prompt(texts);
        let summary = match self.config.generation_api {
            GenerationApi::ChatCompletions => self.chat_summary(&prompt, max_tokens).await?,
            GenerationApi::Generate => self.generate_summary(&prompt, max_tokens).await?,
        };

        let summary = summary.trim();
        if summary.is_empty() {
            return Err(EngramError::ContentRejected(
                "inference service returned an empty summary".to_string(),
            ));
        }
        Ok(summary.to_string())
    }

    /// Probes `GET /health` for `/generate` servers, `GET /models` otherwise
    async fn is_available(&self) -> bool {
        let route = match self.config.generation_api {
            GenerationApi::Generate => "health",
            GenerationApi::ChatCompletions => "models",
        };
        match self
            .authorize(self.client.get(self.url(route)))
            .timeout(Duration::from_secs(self.config.embed_timeout_secs))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Inference health probe failed: {e}");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(api_url: String, generation_api: GenerationApi) -> InferenceConfig {
        InferenceConfig {
            api_url,
            api_key_env: "ENGRAM_TEST_REMOTE_KEY".to_string(),
            generation_api,
            embed_timeout_secs: 2,
            summarize_timeout_secs: 2,
            ..InferenceConfig::default()
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            EngramError::ContentRejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, ""),
            EngramError::ContentRejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            EngramError::TransientInfra(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            EngramError::TransientInfra(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, ""),
            EngramError::Timeout(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            EngramError::Fatal(_)
        ));
    }

    #[test]
    fn test_empty_api_url_rejected() {
        let config = create_test_config(String::new(), GenerationApi::ChatCompletions);
        assert!(matches!(RemoteInference::new(&config), Err(EngramError::Config(_))));
    }

    #[tokio::test]
    async fn test_embed_parses_vector() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(serde_json::json!({"input": "I like tea"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3]}]
            })))
            .mount(&mock_server)
            .await;

        let config = create_test_config(mock_server.uri(), GenerationApi::ChatCompletions);
        let client = RemoteInference::new(&config).unwrap();

        let vector = client.embed("I like tea").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_chat_summary_sends_bearer_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer remote-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "  The user likes tea.  "}}]
            })))
            .mount(&mock_server)
            .await;

        unsafe { env::set_var("ENGRAM_TEST_REMOTE_KEY", "remote-key") };
        let config = create_test_config(mock_server.uri(), GenerationApi::ChatCompletions);
        let client = RemoteInference::new(&config).unwrap();
        unsafe { env::remove_var("ENGRAM_TEST_REMOTE_KEY") };

        let summary = client
            .summarize(&["user: I like tea".to_string()], 100)
            .await
            .unwrap();
        assert_eq!(summary, "The user likes tea.");
    }

    #[tokio::test]
    async fn test_generate_api_shape() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .and(body_partial_json(serde_json::json!({
                "max_tokens": 250,
                "stop": ["\n\n"]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": "Ana likes tea."})),
            )
            .mount(&mock_server)
            .await;

        let config = create_test_config(mock_server.uri(), GenerationApi::Generate);
        let client = RemoteInference::new(&config).unwrap();

        let summary = client
            .summarize(&["user: my name is Ana".to_string()], 250)
            .await
            .unwrap();
        assert_eq!(summary, "Ana likes tea.");
    }

    #[tokio::test]
    async fn test_rejection_and_overload_are_distinct() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(422).set_body_string("input too long"))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let config = create_test_config(mock_server.uri(), GenerationApi::Generate);
        let client = RemoteInference::new(&config).unwrap();

        let err = client.embed("x").await.unwrap_err();
        assert!(matches!(err, EngramError::ContentRejected(_)));
        assert!(err.to_string().contains("input too long"));

        let err = client.summarize(&["user: x".to_string()], 10).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_slow_response_is_timeout() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": [{"embedding": [1.0]}]}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let mut config = create_test_config(mock_server.uri(), GenerationApi::ChatCompletions);
        config.embed_timeout_secs = 1;
        let client = RemoteInference::new(&config).unwrap();

        let err = client.embed("x").await.unwrap_err();
        assert!(matches!(err, EngramError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_empty_summary_is_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": "  "})))
            .mount(&mock_server)
            .await;

        let config = create_test_config(mock_server.uri(), GenerationApi::Generate);
        let client = RemoteInference::new(&config).unwrap();

        let err = client.summarize(&["user: x".to_string()], 10).await.unwrap_err();
        assert!(matches!(err, EngramError::ContentRejected(_)));
    }

    #[tokio::test]
    async fn test_health_probe() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "healthy", "model_loaded": true
            })))
            .mount(&mock_server)
            .await;

        let config = create_test_config(mock_server.uri(), GenerationApi::Generate);
        let client = RemoteInference::new(&config).unwrap();
        assert!(client.is_available().await);

        let config = create_test_config(mock_server.uri(), GenerationApi::ChatCompletions);
        let client = RemoteInference::new(&config).unwrap();
        assert!(!client.is_available().await);
    }
}
