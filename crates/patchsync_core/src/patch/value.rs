//! Serde adapter for patch values.

/// Values travel as JSON-encoded strings and are decoded exactly once.
///
/// Decoding is lenient: a raw JSON value is taken as-is, and a string that is not
/// itself valid JSON is kept as a string scalar.
pub(super) mod encoded {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(value: &Option<Value>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<Value> = Option::deserialize(deserializer)?;
        Ok(match value {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
                Ok(decoded) => Some(decoded),
                Err(_) => Some(Value::String(s)),
            },
            Some(other) => Some(other),
        })
    }
}
