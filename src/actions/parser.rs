//! Parser for the `do(...)` / `finish(...)` action language.
//!
//! Vision models answer with one call per turn, e.g.
//! `do(action="Tap", element=[500, 320])` or `finish(message="done")`.
//! The same text is used as the instruction handed to the device transport.

use serde_json::{json, Map, Value};
use thiserror::Error;

/// Action parsing errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),
}

/// A point in the model's relative coordinate space (0..=999 on both axes).
pub type RelativePoint = (i64, i64);

/// A typed device action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Launch { app: String },
    Tap { element: RelativePoint },
    Type { text: String },
    Swipe { start: RelativePoint, end: RelativePoint },
    Back,
    Home,
    DoubleTap { element: RelativePoint },
    LongPress { element: RelativePoint },
    Wait { seconds: f64 },
    /// Manual intervention requested (login, captcha).
    TakeOver { message: String },
    /// Actions with no device effect (`Note`, `Call_API`, `Interact`).
    NoOp { name: String },
    Finish { message: Option<String> },
}

impl Action {
    /// Whether this action terminates the task.
    pub fn is_finish(&self) -> bool {
        matches!(self, Action::Finish { .. })
    }

    /// Short action name for logs.
    pub fn name(&self) -> &str {
        match self {
            Action::Launch { .. } => "Launch",
            Action::Tap { .. } => "Tap",
            Action::Type { .. } => "Type",
            Action::Swipe { .. } => "Swipe",
            Action::Back => "Back",
            Action::Home => "Home",
            Action::DoubleTap { .. } => "Double Tap",
            Action::LongPress { .. } => "Long Press",
            Action::Wait { .. } => "Wait",
            Action::TakeOver { .. } => "Take_over",
            Action::NoOp { name } => name,
            Action::Finish { .. } => "finish",
        }
    }
}

/// Parse an action string produced by the model.
pub fn parse_action(response: &str) -> Result<Action, ActionError> {
    let response = response.trim();

    if let Some(body) = strip_call(response, "do") {
        let params = parse_params(body)?;
        return action_from_params(&params);
    }

    if let Some(body) = strip_call(response, "finish") {
        return Ok(Action::Finish {
            message: parse_finish_message(body),
        });
    }

    Err(ActionError::ParseError(format!(
        "Failed to parse action: {}",
        response
    )))
}

fn strip_call<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.strip_prefix(name)
        .and_then(|s| s.strip_prefix('('))
        .and_then(|s| s.strip_suffix(')'))
}

/// Split `key=value, key=[1, 2], key="a, b"` into a JSON object.
fn parse_params(content: &str) -> Result<Map<String, Value>, ActionError> {
    let mut result = Map::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_string = false;
    let mut string_char = '"';
    let mut list_depth = 0usize;
    let mut parsing_key = true;

    for c in content.chars() {
        if in_string {
            if c == string_char {
                in_string = false;
            } else {
                value.push(c);
            }
            continue;
        }

        if list_depth > 0 {
            value.push(c);
            match c {
                '[' => list_depth += 1,
                ']' => list_depth -= 1,
                _ => {}
            }
            continue;
        }

        match c {
            '"' | '\'' if !parsing_key => {
                in_string = true;
                string_char = c;
            }
            '[' if !parsing_key => {
                list_depth = 1;
                value.push(c);
            }
            '=' if parsing_key => parsing_key = false,
            ',' => {
                push_param(&mut result, &key, &value)?;
                key.clear();
                value.clear();
                parsing_key = true;
            }
            _ if c.is_whitespace() && parsing_key => {}
            _ => {
                if parsing_key {
                    key.push(c);
                } else {
                    value.push(c);
                }
            }
        }
    }

    if in_string || list_depth > 0 {
        return Err(ActionError::ParseError(format!(
            "Unterminated value in: {}",
            content
        )));
    }

    push_param(&mut result, &key, &value)?;
    Ok(result)
}

fn push_param(map: &mut Map<String, Value>, key: &str, value: &str) -> Result<(), ActionError> {
    let key = key.trim();
    if key.is_empty() {
        return Ok(());
    }
    map.insert(key.to_string(), parse_value(value.trim()));
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    if let Some(inner) = raw.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let items: Vec<Value> = inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_value)
            .collect();
        return json!(items);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return json!(f);
    }
    json!(raw)
}

fn parse_finish_message(body: &str) -> Option<String> {
    let start = body.find("message=")? + "message=".len();
    let remaining = body[start..].trim_start();
    let mut chars = remaining.chars();
    match chars.next() {
        Some(quote @ ('"' | '\'')) => {
            let inner = &remaining[1..];
            let end = inner.rfind(quote).unwrap_or(inner.len());
            Some(inner[..end].to_string())
        }
        Some(_) => Some(remaining.split(',').next().unwrap_or(remaining).trim().to_string()),
        None => None,
    }
}

fn action_from_params(params: &Map<String, Value>) -> Result<Action, ActionError> {
    let name = params
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::MissingParameter("action".to_string()))?;

    let action = match name {
        "Launch" => Action::Launch {
            app: string_param(params, "app")?,
        },
        "Tap" => Action::Tap {
            element: point_param(params, "element")?,
        },
        "Type" | "Type_Name" => Action::Type {
            text: params
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "Swipe" => Action::Swipe {
            start: point_param(params, "start")?,
            end: point_param(params, "end")?,
        },
        "Back" => Action::Back,
        "Home" => Action::Home,
        "Double Tap" => Action::DoubleTap {
            element: point_param(params, "element")?,
        },
        "Long Press" => Action::LongPress {
            element: point_param(params, "element")?,
        },
        "Wait" => Action::Wait {
            seconds: wait_seconds(params.get("duration")),
        },
        "Take_over" => Action::TakeOver {
            message: params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("User intervention required")
                .to_string(),
        },
        "Note" | "Call_API" | "Interact" => Action::NoOp {
            name: name.to_string(),
        },
        other => return Err(ActionError::UnknownAction(other.to_string())),
    };

    Ok(action)
}

fn string_param(params: &Map<String, Value>, key: &str) -> Result<String, ActionError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ActionError::MissingParameter(key.to_string()))
}

fn point_param(params: &Map<String, Value>, key: &str) -> Result<RelativePoint, ActionError> {
    let coords: Vec<i64> = params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| ActionError::MissingParameter(key.to_string()))?
        .iter()
        .filter_map(Value::as_i64)
        .collect();

    match coords.as_slice() {
        [x, y, ..] => Ok((*x, *y)),
        _ => Err(ActionError::ParseError(format!(
            "Invalid coordinates for {}",
            key
        ))),
    }
}

/// `duration` arrives as `"2 seconds"`, `"2"` or a bare number.
/// Non-finite or negative values fall back to one second.
fn wait_seconds(value: Option<&Value>) -> f64 {
    let seconds = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.replace("seconds", "").trim().parse().ok(),
        _ => None,
    };
    seconds
        .filter(|s: &f64| s.is_finite() && *s >= 0.0)
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tap() {
        let action = parse_action(r#"do(action="Tap", element=[100, 200])"#).unwrap();
        assert_eq!(action, Action::Tap { element: (100, 200) });
    }

    #[test]
    fn test_parse_type_keeps_commas_in_strings() {
        let action = parse_action(r#"do(action="Type", text="hello, world")"#).unwrap();
        assert_eq!(
            action,
            Action::Type {
                text: "hello, world".to_string()
            }
        );
    }

    #[test]
    fn test_parse_swipe() {
        let action =
            parse_action(r#"do(action="Swipe", start=[500, 800], end=[500, 200])"#).unwrap();
        assert_eq!(
            action,
            Action::Swipe {
                start: (500, 800),
                end: (500, 200)
            }
        );
    }

    #[test]
    fn test_parse_wait_duration() {
        let action = parse_action(r#"do(action="Wait", duration="3 seconds")"#).unwrap();
        assert_eq!(action, Action::Wait { seconds: 3.0 });
    }

    #[test]
    fn test_parse_wait_rejects_non_finite_duration() {
        for raw in [
            r#"do(action="Wait", duration="NaN seconds")"#,
            r#"do(action="Wait", duration="inf seconds")"#,
            r#"do(action="Wait", duration="-2 seconds")"#,
        ] {
            assert_eq!(parse_action(raw).unwrap(), Action::Wait { seconds: 1.0 }, "{}", raw);
        }
    }

    #[test]
    fn test_parse_finish() {
        let action = parse_action(r#"finish(message="Task completed")"#).unwrap();
        assert_eq!(
            action,
            Action::Finish {
                message: Some("Task completed".to_string())
            }
        );
        assert!(action.is_finish());
    }

    #[test]
    fn test_unknown_action() {
        let err = parse_action(r#"do(action="Teleport")"#).unwrap_err();
        assert_eq!(err, ActionError::UnknownAction("Teleport".to_string()));
    }

    #[test]
    fn test_free_text_is_rejected() {
        assert!(parse_action("点击搜索框").is_err());
        assert!(parse_action(r#"do(action="Tap", element=[1, 2"#).is_err());
    }

    #[test]
    fn test_missing_coordinates() {
        let err = parse_action(r#"do(action="Tap")"#).unwrap_err();
        assert_eq!(err, ActionError::MissingParameter("element".to_string()));
    }
}
