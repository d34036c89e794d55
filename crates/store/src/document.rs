//! Documents and typed field access.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::r#trait::{StoreError, StoreResult};

/// A stored document: a JSON object.
pub type Document = Map<String, Value>;

/// Encode a timestamp the way every backend stores it.
///
/// RFC 3339 in UTC with a fixed nine-digit fraction, so the string form sorts
/// like the instant it encodes and decodes back to the exact same value.
pub fn datetime_value(at: &DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

pub fn parse_datetime(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Codec(format!("invalid timestamp '{raw}': {e}")))
}

/// Typed getters over [`Document`].
///
/// `require_*` fails with [`StoreError::Codec`] when the field is missing or
/// has the wrong JSON type; `opt_*` treats missing and `null` alike.
pub trait DocumentExt {
    fn require_i64(&self, key: &str) -> StoreResult<i64>;
    fn opt_i64(&self, key: &str) -> StoreResult<Option<i64>>;
    fn require_u64(&self, key: &str) -> StoreResult<u64>;
    fn require_f64(&self, key: &str) -> StoreResult<f64>;
    fn require_str(&self, key: &str) -> StoreResult<&str>;
    fn opt_str(&self, key: &str) -> StoreResult<Option<&str>>;
    fn require_datetime(&self, key: &str) -> StoreResult<DateTime<Utc>>;
    fn opt_datetime(&self, key: &str) -> StoreResult<Option<DateTime<Utc>>>;
}

fn present<'a>(doc: &'a Document, key: &str) -> Option<&'a Value> {
    doc.get(key).filter(|v| !v.is_null())
}

fn missing(key: &str) -> StoreError {
    StoreError::Codec(format!("missing field '{key}'"))
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> StoreError {
    StoreError::Codec(format!("field '{key}' is not {expected}: {found}"))
}

impl DocumentExt for Document {
    fn require_i64(&self, key: &str) -> StoreResult<i64> {
        self.opt_i64(key)?.ok_or_else(|| missing(key))
    }

    fn opt_i64(&self, key: &str) -> StoreResult<Option<i64>> {
        match present(self, key) {
            None => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| wrong_type(key, "an integer", v)),
        }
    }

    fn require_u64(&self, key: &str) -> StoreResult<u64> {
        let v = present(self, key).ok_or_else(|| missing(key))?;
        v.as_u64().ok_or_else(|| wrong_type(key, "a non-negative integer", v))
    }

    fn require_f64(&self, key: &str) -> StoreResult<f64> {
        let v = present(self, key).ok_or_else(|| missing(key))?;
        v.as_f64().ok_or_else(|| wrong_type(key, "a number", v))
    }

    fn require_str(&self, key: &str) -> StoreResult<&str> {
        self.opt_str(key)?.ok_or_else(|| missing(key))
    }

    fn opt_str(&self, key: &str) -> StoreResult<Option<&str>> {
        match present(self, key) {
            None => Ok(None),
            Some(v) => v.as_str().map(Some).ok_or_else(|| wrong_type(key, "a string", v)),
        }
    }

    fn require_datetime(&self, key: &str) -> StoreResult<DateTime<Utc>> {
        parse_datetime(self.require_str(key)?)
    }

    fn opt_datetime(&self, key: &str) -> StoreResult<Option<DateTime<Utc>>> {
        self.opt_str(key)?.map(parse_datetime).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn datetime_round_trips_with_nanos() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T10:00:00.000000001Z")
            .unwrap()
            .with_timezone(&Utc);
        let value = datetime_value(&at);
        assert_eq!(value, json!("2024-03-01T10:00:00.000000001Z"));
        assert_eq!(parse_datetime(value.as_str().unwrap()).unwrap(), at);
    }

    #[test]
    fn encoded_datetimes_sort_chronologically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1);
        let a = datetime_value(&earlier);
        let b = datetime_value(&later);
        assert!(a.as_str().unwrap() < b.as_str().unwrap());
    }

    #[test]
    fn typed_getters() {
        let d = doc(json!({"id": 3, "name": "job", "end": null, "ratio": 0.5}));
        assert_eq!(d.require_i64("id").unwrap(), 3);
        assert_eq!(d.require_u64("id").unwrap(), 3);
        assert_eq!(d.require_f64("ratio").unwrap(), 0.5);
        assert_eq!(d.require_str("name").unwrap(), "job");
        assert_eq!(d.opt_str("end").unwrap(), None);
        assert_eq!(d.opt_datetime("missing").unwrap(), None);
        assert!(matches!(d.require_i64("name"), Err(StoreError::Codec(_))));
        assert!(matches!(d.require_str("missing"), Err(StoreError::Codec(_))));
    }
}
