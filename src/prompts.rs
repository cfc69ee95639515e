//! Extraction prompt schemas for document classes.
//!
//! A class is stored either as a flat `{field: question}` object or as the
//! two-element list `["q", "<question>"]` for a single free-form question.
//! Anything else is normalised into one of those two shapes before it is
//! saved or sent to the AI service.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Keys accepted for a nested question object, in priority order.
const QUESTION_KEYS: [&str; 4] = ["question", "prompt", "q", "text"];

/// Canonical prompt schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSchema {
    /// Field name → question text.
    Fields(BTreeMap<String, String>),
    /// One free-form question.
    Question(String),
}

impl PromptSchema {
    /// Generic schema used when a class has nothing usable stored.
    pub fn fallback(class_name: Option<&str>) -> Self {
        PromptSchema::Question(format!(
            "Extract key facts for class {}.",
            class_name.unwrap_or("")
        ))
    }

    /// Stored / wire representation.
    pub fn to_value(&self) -> Value {
        match self {
            PromptSchema::Fields(fields) => json!(fields),
            PromptSchema::Question(q) => json!(["q", q]),
        }
    }

    /// Compact JSON text, as embedded in queries.
    pub fn to_compact_json(&self) -> String {
        self.to_value().to_string()
    }

    pub fn field_names(&self) -> Vec<&str> {
        match self {
            PromptSchema::Fields(fields) => fields.keys().map(String::as_str).collect(),
            PromptSchema::Question(_) => Vec::new(),
        }
    }
}

/// Normalise any user- or model-supplied prompt object.
///
/// - a list is kept as a single question when it looks like `["q", text]`
/// - `{class: {question: ...}}` for the class itself collapses to a question
/// - string values, or nested objects carrying a question key, become fields
/// - everything else falls back to the generic question
pub fn canonicalize(raw: &Value, class_name: Option<&str>) -> PromptSchema {
    match raw {
        Value::Array(items) => {
            if let Some(question) = question_from_list(items) {
                return PromptSchema::Question(question);
            }
        }
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(nested) = class_name.and_then(|c| map.get(c)) {
                    if let Some(question) = nested_question(nested) {
                        return PromptSchema::Question(question);
                    }
                }
            }

            let fields: BTreeMap<String, String> = map
                .iter()
                .filter_map(|(field, v)| {
                    let question = match v {
                        Value::String(s) => non_blank(s),
                        other => nested_question(other),
                    }?;
                    Some((field.clone(), question))
                })
                .collect();

            if !fields.is_empty() {
                return PromptSchema::Fields(fields);
            }
        }
        _ => {}
    }

    PromptSchema::fallback(class_name)
}

/// Parse stored prompt text. Malformed JSON is treated as an empty schema.
pub fn parse_stored(raw: &str, class_name: Option<&str>) -> PromptSchema {
    let value = serde_json::from_str::<Value>(raw).unwrap_or(Value::Null);
    match value {
        // Some stores hand back JSON text wrapped in a JSON string.
        Value::String(inner) => {
            let nested = serde_json::from_str::<Value>(&inner).unwrap_or(Value::Null);
            canonicalize(&nested, class_name)
        }
        other => canonicalize(&other, class_name),
    }
}

fn question_from_list(items: &[Value]) -> Option<String> {
    match items {
        [Value::String(_tag), Value::String(q)] => non_blank(q),
        [Value::String(q)] => non_blank(q),
        _ => None,
    }
}

fn nested_question(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    QUESTION_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str).and_then(non_blank))
}

fn non_blank(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Serialize for PromptSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PromptSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(canonicalize(&raw, None))
    }
}
