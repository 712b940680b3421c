use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::BatchError;

/// Key/value state attached to a single job or step execution.
///
/// The context is persisted by the job repository together with the
/// execution that owns it. When an unsuccessful execution is restarted, the
/// new execution starts from the context its predecessor left behind, which
/// is how a step resumes where it stopped.
///
/// Values are stored as JSON so any `serde` type can be put in and read back.
///
/// # Example
///
/// ```
/// use batch_core::core::context::ExecutionContext;
///
/// let mut context = ExecutionContext::new();
/// context.put_long("games.read", 42);
/// context.put("last.team", &"Lions").unwrap();
///
/// assert_eq!(context.get_long("games.read"), Some(42));
/// assert_eq!(context.get::<String>("last.team").unwrap().as_deref(), Some("Lions"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    entries: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes `value` and stores it under `key`, replacing any previous value.
    pub fn put<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), BatchError> {
        let value = serde_json::to_value(value).map_err(|error| {
            BatchError::ExecutionContext(format!("cannot serialize '{}': {}", key, error))
        })?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    /// Reads the value stored under `key`, if any.
    ///
    /// Fails when the stored value cannot be deserialized as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BatchError> {
        match self.entries.get(key) {
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|error| {
                BatchError::ExecutionContext(format!("cannot deserialize '{}': {}", key, error))
            }),
            None => Ok(None),
        }
    }

    pub fn put_string(&mut self, key: &str, value: &str) {
        self.entries
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    pub fn put_long(&mut self, key: &str, value: i64) {
        self.entries.insert(key.to_string(), Value::from(value));
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(Value::as_i64)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialized form used by the persistent repositories.
    pub fn to_json(&self) -> Result<String, BatchError> {
        serde_json::to_string(self)
            .map_err(|error| BatchError::ExecutionContext(error.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        serde_json::from_str(json).map_err(|error| BatchError::ExecutionContext(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::ExecutionContext;
    use crate::BatchError;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Checkpoint {
        game_id: u32,
        team: String,
    }

    #[test]
    fn should_store_and_read_typed_values() {
        let mut context = ExecutionContext::new();
        let checkpoint = Checkpoint {
            game_id: 17,
            team: "Bears".to_string(),
        };

        context.put("checkpoint", &checkpoint).unwrap();
        context.put_string("season", "2023");
        context.put_long("count", 3);

        assert_eq!(context.len(), 3);
        assert_eq!(
            context.get::<Checkpoint>("checkpoint").unwrap(),
            Some(checkpoint)
        );
        assert_eq!(context.get_string("season"), Some("2023"));
        assert_eq!(context.get_long("count"), Some(3));
        assert_eq!(context.get_long("season"), None);
        assert!(context.get::<u32>("missing").unwrap().is_none());
    }

    #[test]
    fn should_fail_on_type_mismatch() {
        let mut context = ExecutionContext::new();
        context.put_string("count", "three");

        let result = context.get::<i64>("count");

        assert!(matches!(result, Err(BatchError::ExecutionContext(_))));
    }

    #[test]
    fn should_survive_json_round_trip() {
        let mut context = ExecutionContext::new();
        context.put_long("read", 10);
        context.put_string("step", "gameLoad");

        let json = context.to_json().unwrap();
        assert_eq!(json, r#"{"read":10,"step":"gameLoad"}"#);

        let restored = ExecutionContext::from_json(&json).unwrap();
        assert_eq!(restored, context);
    }

    #[test]
    fn should_remove_entries() {
        let mut context = ExecutionContext::new();
        context.put_long("read", 10);

        assert!(context.contains_key("read"));
        assert!(context.remove("read").is_some());
        assert!(context.is_empty());
        assert_eq!(context.keys().count(), 0);
    }
}
