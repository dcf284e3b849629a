//! Client for OpenAI-compatible vision-language chat completions.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("API error {0}: {1}")]
    ApiError(StatusCode, String),
    #[error("Max retries exceeded after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),
}

impl ModelError {
    /// Network failures, 5xx and 429 are worth another attempt.
    fn is_retryable(&self) -> bool {
        match self {
            ModelError::RequestFailed(_) => true,
            ModelError::ApiError(status, _) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ModelError::ParseError(_) | ModelError::MaxRetriesExceeded(_, _) => false,
        }
    }
}

/// Configuration for the model endpoint.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub extra_body: HashMap<String, Value>,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let mut extra_body = HashMap::new();
        extra_body.insert("skip_special_tokens".to_string(), json!(false));

        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "autoglm-phone-9b".to_string(),
            max_tokens: 3000,
            temperature: 0.0,
            top_p: 0.85,
            frequency_penalty: 0.2,
            extra_body,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl ModelConfig {
    /// Create a new ModelConfig with custom base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a new ModelConfig with custom API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Create a new ModelConfig with custom model name.
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }

    /// Set the HTTP timeout applied to each request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Parsed model reply.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub thinking: String,
    pub action: String,
    pub raw_content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

/// Client for OpenAI-compatible vision-language models.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
}

impl ModelClient {
    /// Create a new ModelClient with the given configuration.
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { config, client })
    }

    /// Configuration this client was built with.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Send `messages` to `/chat/completions`, retrying transient failures.
    pub async fn request(&self, messages: &[Value]) -> Result<ModelResponse, ModelError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut body = json!({
            "messages": messages,
            "model": self.config.model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "frequency_penalty": self.config.frequency_penalty,
        });
        if let Value::Object(ref mut map) = body {
            for (key, value) in &self.config.extra_body {
                map.insert(key.clone(), value.clone());
            }
        }

        let max_attempts = self.config.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.send_request(&url, &body).await {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt < max_attempts {
                        tracing::warn!(
                            attempt,
                            max_attempts,
                            "Model request failed, retrying in {}s: {}",
                            self.config.retry_delay_secs,
                            e
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(ModelError::MaxRetriesExceeded(
            max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn send_request(&self, url: &str, body: &Value) -> Result<ModelResponse, ModelError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError(status, error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ModelError::ParseError(e.to_string()))?;

        let raw_content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ModelError::ParseError("No choices in response".to_string()))?;

        let (thinking, action) = parse_response(&raw_content);
        Ok(ModelResponse {
            thinking,
            action,
            raw_content,
        })
    }
}

/// Split `<think>…</think><answer>…</answer>` into (thinking, action).
pub(crate) fn parse_response(content: &str) -> (String, String) {
    let Some((head, answer)) = content.split_once("<answer>") else {
        return (String::new(), content.trim().to_string());
    };

    let thinking = head
        .replace("<think>", "")
        .replace("</think>", "")
        .trim()
        .to_string();
    let action = answer.replace("</answer>", "").trim().to_string();
    (thinking, action)
}

/// Builders for chat messages.
pub struct MessageBuilder;

impl MessageBuilder {
    pub fn create_system_message(content: &str) -> Value {
        json!({ "role": "system", "content": content })
    }

    /// User message with an optional base64 PNG attached.
    pub fn create_user_message(text: &str, image_base64: Option<&str>) -> Value {
        let mut content = Vec::new();
        if let Some(img_data) = image_base64 {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{}", img_data) }
            }));
        }
        content.push(json!({ "type": "text", "text": text }));

        json!({ "role": "user", "content": content })
    }

    pub fn create_assistant_message(content: &str) -> Value {
        json!({ "role": "assistant", "content": content })
    }

    /// Drop image parts from a message to save context space.
    pub fn remove_images_from_message(message: &mut Value) {
        if let Some(Value::Array(parts)) = message.get_mut("content") {
            parts.retain(|item| item.get("type").and_then(Value::as_str) == Some("text"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion(content: &str) -> Value {
        json!({ "choices": [{ "message": { "content": content } }] })
    }

    #[test]
    fn test_model_config_default() {
        let config = ModelConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000/v1");
        assert_eq!(config.model_name, "autoglm-phone-9b");
    }

    #[test]
    fn test_parse_response() {
        let content = "<think>I need to tap the button</think><answer>do(action=\"Tap\", element=[100, 200])</answer>";
        let (thinking, action) = parse_response(content);
        assert_eq!(thinking, "I need to tap the button");
        assert_eq!(action, "do(action=\"Tap\", element=[100, 200])");
    }

    #[test]
    fn test_parse_response_no_answer() {
        let (thinking, action) = parse_response("some raw content");
        assert_eq!(thinking, "");
        assert_eq!(action, "some raw content");
    }

    #[test]
    fn test_message_builder() {
        let mut user_msg = MessageBuilder::create_user_message("Look at this", Some("base64data"));
        assert_eq!(user_msg["content"][0]["type"], "image_url");

        MessageBuilder::remove_images_from_message(&mut user_msg);
        assert_eq!(user_msg["content"].as_array().unwrap().len(), 1);
        assert_eq!(user_msg["content"][0]["text"], "Look at this");
    }

    #[tokio::test]
    async fn test_request_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                "<think>home</think><answer>do(action=\"Home\")</answer>",
            )))
            .mount(&server)
            .await;

        let client = ModelClient::new(
            ModelConfig::default()
                .with_base_url(format!("{}/v1", server.uri()))
                .with_api_key("secret"),
        )
        .unwrap();

        let response = client
            .request(&[MessageBuilder::create_user_message("go home", None)])
            .await
            .unwrap();
        assert_eq!(response.thinking, "home");
        assert_eq!(response.action, "do(action=\"Home\")");
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(3)
            .mount(&server)
            .await;

        let client = ModelClient::new(
            ModelConfig::default()
                .with_base_url(server.uri())
                .with_max_retries(2)
                .with_retry_delay(0),
        )
        .unwrap();

        let err = client.request(&[]).await.unwrap_err();
        assert!(matches!(err, ModelError::MaxRetriesExceeded(3, _)));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ModelClient::new(
            ModelConfig::default()
                .with_base_url(server.uri())
                .with_retry_delay(0),
        )
        .unwrap();

        let err = client.request(&[]).await.unwrap_err();
        assert!(matches!(err, ModelError::ApiError(StatusCode::UNAUTHORIZED, _)));
    }
}
