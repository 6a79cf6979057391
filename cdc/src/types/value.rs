use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Text format of timestamps, both in the replication log and on the wire.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A decoded column value.
///
/// Serialized as a bare JSON scalar. When reading a payload back, strings matching
/// [`TIMESTAMP_FORMAT`] become [`Value::Timestamp`], other strings [`Value::Text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(#[serde(with = "timestamp_text")] NaiveDateTime),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns numeric values as `f64`, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Timestamp(value) => write!(f, "{}", value.format(TIMESTAMP_FORMAT)),
            Value::Text(value) => f.write_str(value),
        }
    }
}

mod timestamp_text {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de};

    use super::TIMESTAMP_FORMAT;

    pub(super) fn serialize<S: Serializer>(
        value: &NaiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn scalars_serialize_without_tags() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(1013),
            Value::Float(21.5),
            Value::Text("clear".to_string()),
        ];

        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,true,1013,21.5,"clear"]"#);
    }

    #[test]
    fn timestamps_use_space_separated_format() {
        let timestamp = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();

        let json = serde_json::to_string(&Value::Timestamp(timestamp)).unwrap();
        assert_eq!(json, r#""2024-03-01 12:30:00""#);

        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Timestamp(timestamp));
    }

    #[test]
    fn integral_json_numbers_stay_integers() {
        let value: Value = serde_json::from_str("42").unwrap();
        assert_eq!(value, Value::Int(42));

        let value: Value = serde_json::from_str("42.0").unwrap();
        assert_eq!(value.as_f64(), Some(42.0));
    }
}
