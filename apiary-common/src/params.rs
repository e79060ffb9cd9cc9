//! Accessors over free-form parameter trees
//!
//! Commands and personas carry open-ended JSON objects. These helpers keep
//! the lookup rules (case-insensitive keys, permissive truthiness) in one
//! place instead of scattering `as_object` chains through callers.

use serde_json::Value;

/// Look up an object field by case-insensitive key name
#[must_use]
pub fn get_ci<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_object()?
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// Look up a string field by case-insensitive key name
#[must_use]
pub fn str_ci<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    get_ci(value, key).and_then(Value::as_str)
}

/// Interpret a value as an affirmative flag
///
/// Recognises booleans, `"true"`/`"false"` strings (any case) and numbers
/// (non-zero is affirmative). Anything else is not.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n
            .as_i64()
            .map(|i| i != 0)
            .or_else(|| n.as_f64().map(|f| f != 0.0))
            .unwrap_or(false),
        _ => false,
    }
}

/// Collect the string values directly under a node
///
/// A string yields itself, an array yields its string elements, anything
/// else yields nothing.
#[must_use]
pub fn string_values(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}
