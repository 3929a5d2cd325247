use crate::{TaskError, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a task parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterType {
    String,
    /// Multi-line string.
    Text,
    Boolean,
    Choice { choices: Vec<String> },
    Password,
}

impl ParameterType {
    pub fn name(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Text => "text",
            ParameterType::Boolean => "boolean",
            ParameterType::Choice { .. } => "choice",
            ParameterType::Password => "password",
        }
    }
}

/// One input a human task asks for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Pre-filled value offered by the form; never applied automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            default: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParameterType::String)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ParameterType::Text)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParameterType::Boolean)
    }

    pub fn password(name: impl Into<String>) -> Self {
        Self::new(name, ParameterType::Password)
    }

    pub fn choice<I, S>(name: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            ParameterType::Choice {
                choices: choices.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<serde_json::Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Coerce a raw submitted value into a typed answer for this parameter.
    pub fn create_answer(&self, raw: &serde_json::Value) -> Result<Answer, TaskError> {
        let value = match &self.kind {
            ParameterType::String | ParameterType::Text => {
                AnswerValue::String(self.coerce_string(raw)?)
            }
            ParameterType::Password => AnswerValue::Password(Secret(self.coerce_string(raw)?)),
            ParameterType::Boolean => AnswerValue::Boolean(self.coerce_bool(raw)?),
            ParameterType::Choice { choices } => {
                let choice = self.coerce_string(raw)?;
                if !choices.contains(&choice) {
                    return Err(self.invalid(format!(
                        "'{}' is not one of [{}]",
                        choice,
                        choices.join(", ")
                    )));
                }
                AnswerValue::String(choice)
            }
        };

        Ok(Answer {
            name: self.name.clone(),
            value,
        })
    }

    fn coerce_string(&self, raw: &serde_json::Value) -> Result<String, TaskError> {
        match raw {
            serde_json::Value::String(s) => Ok(s.clone()),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Err(self.invalid(format!("got {}", json_kind(other)))),
        }
    }

    fn coerce_bool(&self, raw: &serde_json::Value) -> Result<bool, TaskError> {
        match raw {
            serde_json::Value::Bool(b) => Ok(*b),
            // HTML checkboxes submit "on"
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" => Ok(true),
                "false" | "off" => Ok(false),
                _ => Err(self.invalid(format!("got string '{}'", s))),
            },
            other => Err(self.invalid(format!("got {}", json_kind(other)))),
        }
    }

    fn invalid(&self, reason: String) -> TaskError {
        TaskError::InvalidValue {
            name: self.name.clone(),
            expected: self.kind.name().to_string(),
            reason,
        }
    }
}

impl fmt::Display for ParameterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.kind.name())
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// A name/value pair as submitted, before it is checked against the task's parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawAnswer {
    pub name: String,
    pub value: serde_json::Value,
}

impl RawAnswer {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A validated answer recorded on a completed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub name: String,
    pub value: AnswerValue,
}

impl Answer {
    /// The value forwarded to the engine, if this answer's type is one it accepts.
    pub fn engine_value(&self) -> Option<Value> {
        match &self.value {
            AnswerValue::String(s) => Some(Value::String(s.clone())),
            AnswerValue::Boolean(b) => Some(Value::Bool(*b)),
            AnswerValue::Password(_) => None,
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AnswerValue {
    String(String),
    Boolean(bool),
    Password(Secret),
}

impl fmt::Display for AnswerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerValue::String(s) => f.write_str(s),
            AnswerValue::Boolean(b) => write!(f, "{}", b),
            AnswerValue::Password(secret) => write!(f, "{:?}", secret),
        }
    }
}

/// Password answer. Kept in memory only: it serializes as a mask.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub const MASK: &'static str = "********";

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::MASK)
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::MASK)
    }
}
