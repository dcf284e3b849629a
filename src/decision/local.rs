//! Local step decision: a vision-language model queried once per step.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::actions::{parse_action, Action};
use crate::config::get_system_prompt;
use crate::model::{MessageBuilder, ModelClient};

use super::{ActionDecision, DecisionBackend, DecisionContext, DecisionError, DecisionKind};

/// Settle delay after ordinary actions.
const DEFAULT_SETTLE_SECS: f64 = 1.0;

/// [`DecisionBackend`] over an OpenAI-compatible model.
///
/// Keeps one chat context per running item. Screenshots are stripped from
/// older turns so the context only ever carries the current screen.
pub struct LocalStepDecision {
    client: ModelClient,
    lang: String,
    contexts: Mutex<HashMap<String, Vec<Value>>>,
}

impl LocalStepDecision {
    pub fn new(client: ModelClient, lang: impl Into<String>) -> Self {
        Self {
            client,
            lang: lang.into(),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Append this turn's user message and return the full request.
    fn begin_turn(&self, ctx: &DecisionContext<'_>) -> Vec<Value> {
        let mut contexts = self.contexts.lock();
        let messages = contexts.entry(ctx.item_id.to_string()).or_default();

        let screen_info = json!({
            "device_id": ctx.device_id,
            "steps_executed": ctx.history.len(),
            "sensitive_screen": ctx.screenshot.is_sensitive,
        })
        .to_string();

        if messages.is_empty() {
            messages.push(MessageBuilder::create_system_message(&get_system_prompt(
                &self.lang,
            )));
            messages.push(MessageBuilder::create_user_message(
                &format!("{}\n\n{}", ctx.task, screen_info),
                Some(&ctx.screenshot.base64_data),
            ));
        } else {
            let feedback = match ctx.history.last() {
                Some(last) if !last.success => format!(
                    "Previous action failed: {}\n\n",
                    last.error.as_deref().unwrap_or("unknown error")
                ),
                _ => String::new(),
            };
            messages.push(MessageBuilder::create_user_message(
                &format!("{}** Screen Info **\n\n{}", feedback, screen_info),
                Some(&ctx.screenshot.base64_data),
            ));
        }

        messages.clone()
    }

    /// Record the model turn, or drop the pending user message on failure.
    fn end_turn(&self, item_id: &str, assistant: Option<&str>) {
        let mut contexts = self.contexts.lock();
        let Some(messages) = contexts.get_mut(item_id) else {
            return;
        };

        match assistant {
            Some(content) => {
                if let Some(last) = messages.last_mut() {
                    MessageBuilder::remove_images_from_message(last);
                }
                messages.push(MessageBuilder::create_assistant_message(content));
            }
            None => {
                messages.pop();
                if messages.len() == 1 {
                    messages.clear();
                }
            }
        }
    }
}

/// Map a parsed action onto the decision contract.
fn to_decision(action: Action, raw: &str) -> ActionDecision {
    match action {
        Action::Finish { message } => {
            ActionDecision::complete(message.unwrap_or_else(|| "Task completed".to_string()))
        }
        Action::Wait { seconds } => ActionDecision::act(raw, seconds),
        _ => ActionDecision::act(raw, DEFAULT_SETTLE_SECS),
    }
}

#[async_trait]
impl DecisionBackend for LocalStepDecision {
    fn kind(&self) -> DecisionKind {
        DecisionKind::LocalStep
    }

    async fn next_action(&self, ctx: &DecisionContext<'_>) -> Result<ActionDecision, DecisionError> {
        let messages = self.begin_turn(ctx);

        let response = match self.client.request(&messages).await {
            Ok(response) => response,
            Err(e) => {
                self.end_turn(ctx.item_id, None);
                return Err(DecisionError::Unavailable(e.to_string()));
            }
        };

        let action = match parse_action(&response.action) {
            Ok(action) => action,
            Err(e) => {
                self.end_turn(ctx.item_id, None);
                return Err(DecisionError::Malformed(format!(
                    "{} ({})",
                    e, response.action
                )));
            }
        };

        self.end_turn(
            ctx.item_id,
            Some(&format!(
                "<think>{}</think><answer>{}</answer>",
                response.thinking, response.action
            )),
        );

        tracing::debug!(device = ctx.device_id, item = ctx.item_id, action = action.name(), "Model decision");
        Ok(to_decision(action, &response.action).with_thinking(response.thinking))
    }

    async fn finish_run(&self, item_id: &str, _device_id: &str) {
        self.contexts.lock().remove(item_id);
    }
}
