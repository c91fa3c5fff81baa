//! Layered parsing of schema-constrained LLM output.
//!
//! The model is asked for JSON conforming to a schema. Responses that fail
//! to parse or validate are pushed through an ordered fallback chain:
//!
//! 1. `Structured` - parse as-is, validate against the schema.
//! 2. `Normalized` - strip code fences, extract the outermost JSON object,
//!    validate again.
//! 3. `Raw` - give up on structure, return the raw text.
//!
//! The winning parser is recorded so process traces stay truthful about
//! what actually happened.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

/// Which parser in the chain produced the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatOutcome {
    /// Parsed and validated on the first try.
    Structured,
    /// Required regex-driven normalization before validating.
    Normalized,
    /// Unstructured; `value` is absent and callers get the raw text.
    Raw,
}

impl std::fmt::Display for FormatOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::Normalized => write!(f, "normalized"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

/// Parsed output plus the provenance of how it was obtained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredOutput {
    /// Validated JSON value; `None` when the chain fell through to raw.
    pub value: Option<Value>,
    /// The model's verbatim text.
    pub raw: String,
    /// Which parser succeeded.
    pub outcome: FormatOutcome,
}

impl StructuredOutput {
    /// Whether any structured parser succeeded.
    pub fn is_structured(&self) -> bool {
        self.value.is_some()
    }
}

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static regex"));

/// Run the fallback chain over raw model output.
pub fn parse_structured(raw: &str, schema: &Value) -> StructuredOutput {
    // 1. Structured: the text is exactly the JSON we asked for.
    if let Ok(value) = serde_json::from_str::<Value>(raw.trim()) {
        if validate(&value, schema) {
            return StructuredOutput {
                value: Some(value),
                raw: raw.to_string(),
                outcome: FormatOutcome::Structured,
            };
        }
    }

    // 2. Normalized: fish the JSON out of fences or surrounding prose.
    if let Some(candidate) = normalize(raw) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            if validate(&value, schema) {
                debug!("structured output recovered via normalization");
                return StructuredOutput {
                    value: Some(value),
                    raw: raw.to_string(),
                    outcome: FormatOutcome::Normalized,
                };
            }
        }
    }

    // 3. Raw: tagged as unstructured, caller decides what to do.
    debug!("structured output fell through to raw");
    StructuredOutput {
        value: None,
        raw: raw.to_string(),
        outcome: FormatOutcome::Raw,
    }
}

/// Extract a JSON candidate from fenced blocks or the outermost braces.
fn normalize(raw: &str) -> Option<String> {
    if let Some(captures) = FENCE_RE.captures(raw) {
        let inner = captures.get(1)?.as_str().trim();
        if !inner.is_empty() {
            return Some(inner.to_string());
        }
    }

    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Minimal JSON-schema validation: `type`, `required`, `properties`,
/// `items`, and `enum`. Enough to reject shape mismatches without pulling
/// in a full validator.
pub fn validate(value: &Value, schema: &Value) -> bool {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let matches_type = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches_type {
            return false;
        }
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            return false;
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let Some(object) = value.as_object() else {
            return false;
        };
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return false;
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        if let Some(object) = value.as_object() {
            for (key, subschema) in properties {
                if let Some(child) = object.get(key) {
                    if !validate(child, subschema) {
                        return false;
                    }
                }
            }
        }
    }

    if let Some(items) = schema.get("items") {
        if let Some(array) = value.as_array() {
            for child in array {
                if !validate(child, items) {
                    return false;
                }
            }
        }
    }

    true
}
