//! Remote workflow decision over a chat-style workflow engine.
//!
//! Each turn posts one blocking `chat-messages` request carrying the task (first
//! turn) or the outcome of the previous action (later turns), with the current
//! screenshot in `inputs`. The engine answers with a JSON object, either in a
//! ```` ```json ```` fence or inline.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ActionDecision, DecisionBackend, DecisionContext, DecisionError, DecisionKind};

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid fence pattern"));
static BARE_OBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)\{[^{}]*"(?:action|instruction|completed)"[^{}]*\}"#)
        .expect("valid object pattern")
});

const DEFAULT_WAIT_SECS: f64 = 2.0;

/// Connection settings for the workflow engine.
#[derive(Debug, Clone)]
pub struct RemoteWorkflowConfig {
    /// API root, e.g. `https://api.dify.ai/v1`.
    pub base_url: String,
    pub api_key: String,
    /// End-user id reported to the engine.
    pub user_id: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RemoteWorkflowConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dify.ai/v1".to_string(),
            api_key: String::new(),
            user_id: "phone-orchestrator".to_string(),
            request_timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RemoteWorkflowConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

/// The decision object the workflow is asked to produce.
#[derive(Debug, Default, Deserialize)]
struct WorkflowAnswer {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default, alias = "action")]
    instruction: Option<String>,
    #[serde(default)]
    wait: Option<f64>,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

/// Workflow-engine backed [`DecisionBackend`].
pub struct RemoteWorkflowDecision {
    config: RemoteWorkflowConfig,
    client: Client,
    /// Conversation ids keyed by (item id, device id).
    conversations: Mutex<HashMap<(String, String), String>>,
}

impl RemoteWorkflowDecision {
    pub fn new(config: RemoteWorkflowConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            config,
            client,
            conversations: Mutex::new(HashMap::new()),
        })
    }

    fn conversation_id(&self, item_id: &str, device_id: &str) -> Option<String> {
        self.conversations
            .lock()
            .get(&(item_id.to_string(), device_id.to_string()))
            .cloned()
    }

    async fn post_once(&self, payload: &Value) -> Result<ChatMessageResponse, String> {
        let url = format!("{}/chat-messages", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{}: {}", status, body));
        }
        response.json().await.map_err(|e| e.to_string())
    }

    async fn post(&self, payload: &Value) -> Result<ChatMessageResponse, DecisionError> {
        let attempts = self.config.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.post_once(payload).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(attempt, attempts, "Workflow request failed: {}", e);
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(DecisionError::Unavailable(last_error))
    }
}

/// First-turn message.
fn initial_message(task: &str, device_id: &str) -> String {
    format!(
        "## 任务\n{task}\n\n## 设备信息\n设备 ID: {device_id}\n\n## 当前屏幕\n\
         截图以 base64 PNG 形式附在 inputs.screenshot 中，请分析屏幕内容并给出第一步操作。\n\n\
         {RESPONSE_FORMAT}"
    )
}

/// Later-turn message reporting the previous action.
fn feedback_message(ctx: &DecisionContext<'_>) -> String {
    let (action, status, error) = match ctx.history.last() {
        Some(last) => (
            last.instruction.as_str(),
            if last.success { "成功" } else { "失败" },
            last.error.as_deref().unwrap_or(""),
        ),
        None => ("(无)", "未执行", ""),
    };
    format!(
        "## 执行结果\n操作: {action}\n状态: {status}\n反馈: {error}\n已执行步数: {}\n\n\
         ## 当前屏幕\n执行后的截图在 inputs.screenshot 中，请分析并给出下一步操作。\n\n\
         {RESPONSE_FORMAT}",
        ctx.history.len()
    )
}

const RESPONSE_FORMAT: &str = r#"## 响应格式
请用 JSON 格式回复：
```json
{
    "thinking": "分析思考过程",
    "action": "do(action=\"Tap\", element=[x,y]) 形式的操作指令，坐标范围 0-999",
    "wait": 2,
    "completed": false
}
```
如果任务已完成，设置 completed 为 true 并提供 summary。"#;

/// Extract the decision object from the engine's free-form answer.
fn parse_answer(answer: &str) -> Result<ActionDecision, DecisionError> {
    let candidate = JSON_FENCE
        .captures(answer)
        .and_then(|c| c.get(1))
        .and_then(|m| serde_json::from_str::<WorkflowAnswer>(m.as_str()).ok())
        .or_else(|| {
            BARE_OBJECT
                .find(answer)
                .and_then(|m| serde_json::from_str::<WorkflowAnswer>(m.as_str()).ok())
        });

    let Some(parsed) = candidate else {
        return Err(DecisionError::Malformed(format!(
            "no decision object in answer: {}",
            answer.chars().take(120).collect::<String>()
        )));
    };

    let thinking = parsed.thinking.unwrap_or_default();
    if parsed.completed {
        let summary = parsed.summary.unwrap_or_else(|| "任务完成".to_string());
        return Ok(ActionDecision::complete(summary).with_thinking(thinking));
    }

    match parsed.instruction.map(|s| s.trim().to_string()) {
        Some(instruction) if !instruction.is_empty() => Ok(ActionDecision::act(
            instruction,
            parsed.wait.unwrap_or(DEFAULT_WAIT_SECS).max(0.0),
        )
        .with_thinking(thinking)),
        _ => Err(DecisionError::Malformed(
            "decision has neither an instruction nor completed=true".to_string(),
        )),
    }
}

#[async_trait]
impl DecisionBackend for RemoteWorkflowDecision {
    fn kind(&self) -> DecisionKind {
        DecisionKind::RemoteWorkflow
    }

    async fn next_action(&self, ctx: &DecisionContext<'_>) -> Result<ActionDecision, DecisionError> {
        let conversation = self.conversation_id(ctx.item_id, ctx.device_id);
        let query = match conversation {
            Some(_) => feedback_message(ctx),
            None => initial_message(ctx.task, ctx.device_id),
        };

        let mut payload = json!({
            "inputs": {
                "device_id": ctx.device_id,
                "task_id": ctx.item_id,
                "screenshot": ctx.screenshot.base64_data,
            },
            "query": query,
            "response_mode": "blocking",
            "user": self.config.user_id,
        });
        if let Some(id) = conversation {
            payload["conversation_id"] = json!(id);
        }

        let response = self.post(&payload).await?;
        if let Some(id) = response.conversation_id.filter(|id| !id.is_empty()) {
            self.conversations
                .lock()
                .insert((ctx.item_id.to_string(), ctx.device_id.to_string()), id);
        }

        let decision = parse_answer(&response.answer)?;
        tracing::debug!(
            device = ctx.device_id,
            item = ctx.item_id,
            completed = decision.completed,
            "Workflow decision: {}",
            decision.instruction
        );
        Ok(decision)
    }

    async fn finish_run(&self, item_id: &str, device_id: &str) {
        self.conversations
            .lock()
            .remove(&(item_id.to_string(), device_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::StepOutcome;
    use crate::transport::Screenshot;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn screenshot() -> Screenshot {
        Screenshot::new("aGVsbG8=".to_string(), 1080, 2400, false)
    }

    #[test]
    fn test_parse_fenced_answer() {
        let answer = "好的\n```json\n{\"thinking\": \"t\", \"action\": \"do(action=\\\"Home\\\")\", \"wait\": 1.5, \"completed\": false}\n```";
        let decision = parse_answer(answer).unwrap();
        assert_eq!(decision.instruction, "do(action=\"Home\")");
        assert_eq!(decision.wait_seconds, 1.5);
        assert_eq!(decision.thinking.as_deref(), Some("t"));
    }

    #[test]
    fn test_parse_bare_object_with_instruction_field() {
        let answer = r#"next: {"device_id": "d1", "instruction": "do(action=\"Back\")", "completed": false}"#;
        let decision = parse_answer(answer).unwrap();
        assert_eq!(decision.instruction, "do(action=\"Back\")");
        assert_eq!(decision.wait_seconds, DEFAULT_WAIT_SECS);
    }

    #[test]
    fn test_parse_completed() {
        let decision = parse_answer(r#"{"completed": true, "summary": "已发送"}"#).unwrap();
        assert!(decision.completed);
        assert_eq!(decision.summary.as_deref(), Some("已发送"));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_answer("I am thinking about it"),
            Err(DecisionError::Malformed(_))
        ));
        assert!(matches!(
            parse_answer(r#"{"action": "", "completed": false}"#),
            Err(DecisionError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_conversation_is_kept_per_run() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .and(body_partial_json(json!({ "conversation_id": "conv-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "answer": "{\"completed\": true, \"summary\": \"done\"}",
                "conversation_id": "conv-1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .and(body_partial_json(json!({ "response_mode": "blocking" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "answer": "{\"action\": \"do(action=\\\"Home\\\")\", \"wait\": 0, \"completed\": false}",
                "conversation_id": "conv-1"
            })))
            .mount(&server)
            .await;

        let backend = RemoteWorkflowDecision::new(RemoteWorkflowConfig::new(server.uri(), "key"))
            .unwrap();
        let shot = screenshot();
        let mut history = Vec::new();

        let ctx = DecisionContext {
            item_id: "p1/s1",
            device_id: "d1",
            task: "回到桌面",
            history: &history,
            screenshot: &shot,
        };
        let first = backend.next_action(&ctx).await.unwrap();
        assert_eq!(first.instruction, "do(action=\"Home\")");

        history.push(StepOutcome {
            step: 1,
            instruction: first.instruction.clone(),
            success: true,
            error: None,
        });
        let ctx = DecisionContext {
            item_id: "p1/s1",
            device_id: "d1",
            task: "回到桌面",
            history: &history,
            screenshot: &shot,
        };
        let second = backend.next_action(&ctx).await.unwrap();
        assert!(second.completed);

        backend.finish_run("p1/s1", "d1").await;
        assert!(backend.conversation_id("p1/s1", "d1").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;

        let backend = RemoteWorkflowDecision::new(
            RemoteWorkflowConfig::new(server.uri(), "key")
                .with_max_retries(1)
                .with_retry_delay(Duration::ZERO),
        )
        .unwrap();
        let shot = screenshot();
        let ctx = DecisionContext {
            item_id: "p1/s1",
            device_id: "d1",
            task: "t",
            history: &[],
            screenshot: &shot,
        };
        assert!(matches!(
            backend.next_action(&ctx).await,
            Err(DecisionError::Unavailable(_))
        ));
    }
}
