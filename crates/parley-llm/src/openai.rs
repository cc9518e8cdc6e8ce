//! OpenAI-compatible chat completions and embeddings over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parley_core::{ChatChunk, FinishReason, GenerationRequest, Role};
use reqwest::{header, Client};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{LLMError, Result};
use crate::generator::{ChatStream, Embedder, Generator};

/// Connection settings shared by the generator and the embedder
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub embedding_model: String,
    pub timeout: Duration,
    pub headers: HashMap<String, String>,
}

impl OpenAiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            timeout: Duration::from_secs(60),
            headers: HashMap::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// HTTP client with transient-failure retry
#[derive(Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    http_client: ClientWithMiddleware,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let retry_policy = ExponentialBackoff::builder()
            .base(2)
            .build_with_max_retries(3);

        let http_client = reqwest_middleware::ClientBuilder::new(
            Client::builder()
                .timeout(config.timeout)
                .build()
                .map_err(|e| LLMError::Config(e.to_string()))?,
        )
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    /// Build request headers
    fn build_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        if let Some(ref key) = self.config.api_key {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| LLMError::Config(format!("Invalid API key: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        for (key, value) in &self.config.headers {
            let header_name = header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| LLMError::Config(format!("Invalid header name: {}", e)))?;
            let header_value = header::HeaderValue::from_str(value)
                .map_err(|e| LLMError::Config(format!("Invalid header value: {}", e)))?;
            headers.insert(header_name, header_value);
        }

        Ok(headers)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .http_client
            .post(self.config.endpoint(path))
            .headers(self.build_headers()?)
            .json(body)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::from_status(status.as_u16(), error_text));
        }
        Ok(response)
    }
}

/// Streaming chat completions
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: OpenAiClient,
}

impl OpenAiGenerator {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref prompt) = request.system_prompt {
            messages.push(json!({"role": Role::System.as_str(), "content": prompt}));
        }
        for message in &request.messages {
            messages.push(json!({"role": message.role.as_str(), "content": message.content}));
        }

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.client.config.model.clone());

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(temperature) = request.options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn default_model(&self) -> &str {
        &self.client.config.model
    }

    async fn generate(&self, request: GenerationRequest) -> Result<ChatStream> {
        let body = self.request_body(&request);
        debug!(model = %body["model"], messages = request.messages.len(), "Starting completion stream");

        let response = self.client.post("chat/completions", &body).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
                futures::future::ready(!done)
            })
            .flat_map(|event| {
                let chunks = match event {
                    Ok(event) => match parse_stream_data(&event.data) {
                        Ok(chunks) => chunks.into_iter().map(Ok).collect(),
                        Err(e) => vec![Err(e)],
                    },
                    Err(e) => vec![Err(LLMError::Stream(e.to_string()))],
                };
                futures::stream::iter(chunks)
            });

        Ok(Box::pin(stream))
    }
}

/// Parse one SSE `data:` payload of a chat completion stream.
pub fn parse_stream_data(data: &str) -> Result<Vec<ChatChunk>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(data)?;
    let mut chunks = Vec::new();

    if let Some(error) = value.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown provider error");
        chunks.push(ChatChunk::error(message));
        return Ok(chunks);
    }

    let choice = value["choices"].get(0);

    if let Some(content) = choice.and_then(|c| c["delta"]["content"].as_str()) {
        if !content.is_empty() {
            chunks.push(ChatChunk::content(content));
        }
    }

    if let Some(reason) = choice.and_then(|c| c["finish_reason"].as_str()) {
        chunks.push(ChatChunk::finish(FinishReason::parse(reason)));
    }

    if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
        let input = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let output = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
        chunks.push(ChatChunk::usage(input, output));
    }

    Ok(chunks)
}

/// `/embeddings` endpoint client
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: OpenAiClient,
}

impl OpenAiEmbedder {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": self.client.config.embedding_model,
            "input": text,
        });
        let response = self.client.post("embeddings", &body).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;
        parse_embedding(&value)
    }
}

fn parse_embedding(value: &Value) -> Result<Vec<f32>> {
    let vector = value["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| LLMError::InvalidResponse("missing data[0].embedding".to_string()))?;

    vector
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| LLMError::InvalidResponse("non-numeric embedding value".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{GenerationOptions, Message};

    #[test]
    fn test_parse_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        assert_eq!(parse_stream_data(data).unwrap(), vec![ChatChunk::content("Hi")]);
    }

    #[test]
    fn test_parse_finish_and_usage() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":3}}"#;
        assert_eq!(
            parse_stream_data(data).unwrap(),
            vec![ChatChunk::finish(FinishReason::Stop), ChatChunk::usage(5, 3)]
        );
    }

    #[test]
    fn test_parse_usage_only_chunk() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":2}}"#;
        assert_eq!(parse_stream_data(data).unwrap(), vec![ChatChunk::usage(7, 2)]);
    }

    #[test]
    fn test_parse_error_payload_and_done() {
        let data = r#"{"error":{"message":"overloaded"}}"#;
        assert_eq!(parse_stream_data(data).unwrap(), vec![ChatChunk::error("overloaded")]);
        assert!(parse_stream_data("[DONE]").unwrap().is_empty());
        assert!(parse_stream_data("{broken").is_err());
    }

    #[test]
    fn test_request_body() {
        let client = OpenAiClient::new(OpenAiConfig::new("http://localhost:1/v1").with_model("m1")).unwrap();
        let generator = OpenAiGenerator::new(client);
        let request = GenerationRequest::new()
            .with_system_prompt("be brief")
            .with_message(Message::user("Hello"))
            .with_options(GenerationOptions::default().with_temperature(0.7).with_max_tokens(4000));

        let body = generator.request_body(&request);
        assert_eq!(body["model"], "m1");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert_eq!(body["max_tokens"], 4000);
        assert!(body["stream"].as_bool().unwrap());
    }

    #[test]
    fn test_parse_embedding() {
        let value = json!({"data": [{"embedding": [0.5, -0.25, 1.0]}]});
        assert_eq!(parse_embedding(&value).unwrap(), vec![0.5, -0.25, 1.0]);
        assert!(parse_embedding(&json!({"data": []})).is_err());
    }

    #[test]
    fn test_endpoint_join() {
        let config = OpenAiConfig::new("https://api.example.com/v1/");
        assert_eq!(config.endpoint("embeddings"), "https://api.example.com/v1/embeddings");
    }
}
