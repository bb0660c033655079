use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::durable::error::{serialization_error, StorageResult};

/// Versioned, timestamped wrapper persisted for one logical store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub state: Value,
    pub version: String,
    /// Write time in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(state: Value, version: impl Into<String>, timestamp: i64) -> Self {
        Self {
            state,
            version: version.into(),
            timestamp,
        }
    }

    /// Parses a raw stored string. Fails when the payload is not a JSON object, when `state` is
    /// missing or `null`, or when `version` is missing. Numeric versions are accepted and rendered
    /// as strings.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(mut object) = value else {
            return Err(serialization_error("envelope is not a JSON object"));
        };
        Self::from_object(&mut object)
    }

    fn from_object(object: &mut Map<String, Value>) -> StorageResult<Self> {
        let state = object
            .remove("state")
            .filter(|state| !state.is_null())
            .ok_or_else(|| serialization_error("envelope has no state"))?;
        let version = match object.remove("version") {
            Some(Value::String(version)) => version,
            Some(Value::Number(version)) => version.to_string(),
            _ => return Err(serialization_error("envelope has no version")),
        };
        let timestamp = object.get("timestamp").and_then(Value::as_i64).unwrap_or(0);

        Ok(Self {
            state,
            version,
            timestamp,
        })
    }

    pub fn to_json(&self) -> StorageResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn age_millis(&self, now_millis: i64) -> i64 {
        now_millis.saturating_sub(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_complete_envelope() {
        let envelope = Envelope::parse(r#"{"state":{"items":[]},"version":"1.0","timestamp":42}"#).unwrap();
        assert_eq!(envelope, Envelope::new(json!({"items": []}), "1.0", 42));
    }

    #[test]
    fn numeric_version_and_missing_timestamp_are_tolerated() {
        let envelope = Envelope::parse(r#"{"state":{},"version":0}"#).unwrap();
        assert_eq!(envelope.version, "0");
        assert_eq!(envelope.timestamp, 0);
    }

    #[test]
    fn rejects_incomplete_payloads() {
        for raw in [
            "not json",
            "[1,2,3]",
            r#"{"version":"1.0"}"#,
            r#"{"state":null,"version":"1.0"}"#,
            r#"{"state":{}}"#,
            r#"{"state":{},"version":true}"#,
        ] {
            assert!(Envelope::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn age_never_underflows() {
        let envelope = Envelope::new(json!({}), "1.0", i64::MIN);
        assert_eq!(envelope.age_millis(10), i64::MAX);
    }
}
