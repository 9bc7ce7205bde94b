//! Get-or-default accessors over [`serde_json::Value`].
//!
//! EventAPI payloads are parsed leniently: a missing or mistyped key yields
//! an empty string, object or array instead of an error. Each dispatch type
//! then checks the fields it needs in its `validate()` method.

use std::sync::LazyLock;

use serde_json::{Map, Value};

static NULL: Value = Value::Null;
static EMPTY_OBJECT: LazyLock<Map<String, Value>> = LazyLock::new(Map::new);

/// Lenient field access on JSON values.
pub trait JsonExt {
    /// Value of `key`, or [`Value::Null`] if `self` is not an object or the key is absent.
    fn field(&self, key: &str) -> &Value;

    /// String value of `key`, or `""`.
    fn str_or_empty(&self, key: &str) -> &str {
        self.field(key).as_str().unwrap_or_default()
    }

    /// Object value of `key`, or an empty object.
    fn object_or_empty(&self, key: &str) -> &Map<String, Value> {
        self.field(key).as_object().unwrap_or(&EMPTY_OBJECT)
    }

    /// Array value of `key`, or an empty slice.
    fn array_or_empty(&self, key: &str) -> &[Value] {
        self.field(key).as_array().map(Vec::as_slice).unwrap_or_default()
    }

    /// Integer value of `key`, or `0`.
    fn i64_or_zero(&self, key: &str) -> i64 {
        self.field(key).as_i64().unwrap_or_default()
    }

    /// Whether `key` is present (with any value, including `null`).
    fn has(&self, key: &str) -> bool;
}

impl JsonExt for Value {
    fn field(&self, key: &str) -> &Value {
        self.get(key).unwrap_or(&NULL)
    }

    fn has(&self, key: &str) -> bool {
        self.as_object().is_some_and(|o| o.contains_key(key))
    }
}

impl JsonExt for Map<String, Value> {
    fn field(&self, key: &str) -> &Value {
        self.get(key).unwrap_or(&NULL)
    }

    fn has(&self, key: &str) -> bool {
        self.contains_key(key)
    }
}
