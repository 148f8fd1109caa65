//! Pipeline definition.
//!
//! A pipeline is a named, flat bag of options. Common keys are `driver`,
//! `priority` and `queue`; every driver reads its own keys on top of those.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Pipeline name key.
pub const NAME: &str = "name";
/// Driver key.
pub const DRIVER: &str = "driver";
/// Default priority key.
pub const PRIORITY: &str = "priority";

/// Priority used when a pipeline does not define one.
pub const DEFAULT_PRIORITY: i64 = 10;

/// Named set of driver options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline(Map<String, Value>);

impl Pipeline {
    /// Create a pipeline with a name and driver.
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self::default()
            .with(NAME, Value::String(name.into()))
            .with(DRIVER, Value::String(driver.into()))
    }

    /// Create a pipeline from an existing option map.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Return a copy with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        self.str_ref(NAME).unwrap_or_default()
    }

    /// Driver name (`ephemeral`, `amqp`, ...). The legacy `broker` key is accepted.
    pub fn driver(&self) -> &str {
        self.str_ref(DRIVER)
            .or_else(|| self.str_ref("broker"))
            .unwrap_or_default()
    }

    /// Default priority for jobs pushed without one.
    pub fn priority(&self) -> i64 {
        self.int(PRIORITY, DEFAULT_PRIORITY)
    }

    /// Check if the key is present.
    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Raw value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value or `default`. Numbers and booleans are stringified.
    pub fn string(&self, key: &str, default: &str) -> String {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    /// Integer value or `default`. Numeric strings are parsed.
    pub fn int(&self, key: &str, default: i64) -> i64 {
        match self.0.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Boolean value or `default`. Accepts `"true"`/`"false"` strings.
    pub fn bool(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Duration given in seconds, or `default`.
    pub fn duration(&self, key: &str, default: Duration) -> Duration {
        match self.int(key, -1) {
            v if v >= 0 => Duration::from_secs(v as u64),
            _ => default,
        }
    }

    /// Nested string map (e.g. SQS `attributes`), empty when missing.
    pub fn map(&self, key: &str) -> HashMap<String, String> {
        let Some(Value::Object(obj)) = self.0.get(key) else {
            return HashMap::new();
        };
        obj.iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect()
    }

    fn str_ref(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}
