use serde_json::{Map, Value};

/// Per virtual user key/value state.
///
/// A session is owned by exactly one worker thread and outlives the iterations of
/// that worker, so it carries no synchronization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    values: Map<String, Value>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Replace the whole content with the state a script left behind.
    pub fn replace(&mut self, values: Map<String, Value>) {
        self.values = values;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_set_remove() {
        let mut session = Session::new();
        assert!(session.get("access_token").is_none());

        session.set("access_token", json!("abc"));
        session.set("count", json!(1));
        assert_eq!(session.get("access_token"), Some(&json!("abc")));
        assert_eq!(session.len(), 2);

        session.set("count", json!(2));
        assert_eq!(session.get("count"), Some(&json!(2)));

        assert_eq!(session.remove("count"), Some(json!(2)));
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn test_replace() {
        let mut session = Session::new();
        session.set("stale", json!(true));

        let mut next = Map::new();
        next.insert("fresh".to_string(), json!({"nested": [1, 2]}));
        session.replace(next);

        assert!(session.get("stale").is_none());
        assert_eq!(session.get("fresh"), Some(&json!({"nested": [1, 2]})));
    }
}
