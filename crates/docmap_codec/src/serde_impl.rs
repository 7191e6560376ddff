//! serde interop for [`Value`].
//!
//! Dates and object ids use the extended-JSON shapes `{"$date": ms}` and
//! `{"$oid": "hex"}` so documents survive a trip through `serde_json`.

use crate::object_id::ObjectId;
use crate::value::Value;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::Date(ms) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$date", ms)?;
                map.end()
            }
            Value::ObjectId(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$oid", &id.to_hex())?;
                map.end()
            }
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (k, v) in pairs {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a document value")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        i64::try_from(v)
            .map(Value::Integer)
            .map_err(|_| E::custom(format!("integer {v} exceeds i64")))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Text(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Value, E> {
        Ok(Value::Text(v))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut pairs: Vec<(String, Value)> = Vec::new();
        while let Some((k, v)) = access.next_entry::<String, Value>()? {
            pairs.push((k, v));
        }
        if let [(key, inner)] = pairs.as_slice() {
            match (key.as_str(), inner) {
                ("$date", Value::Integer(ms)) => return Ok(Value::Date(*ms)),
                ("$oid", Value::Text(hex)) => {
                    return ObjectId::parse_hex(hex)
                        .map(Value::ObjectId)
                        .map_err(de::Error::custom);
                }
                _ => {}
            }
        }
        Ok(Value::Map(pairs))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_document_roundtrip() {
        let id = ObjectId::new();
        let value = Value::Map(vec![
            ("_id".to_string(), Value::ObjectId(id)),
            ("name".to_string(), Value::from("Alice")),
            ("born".to_string(), Value::Date(86_400_000)),
            ("score".to_string(), Value::Float(2.5)),
            (
                "tags".to_string(),
                Value::Array(vec![Value::from("a"), Value::Null]),
            ),
        ]);

        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["_id"], json!({ "$oid": id.to_hex() }));
        assert_eq!(json["born"], json!({ "$date": 86_400_000 }));

        let back: Value = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn plain_maps_stay_maps() {
        let back: Value = serde_json::from_value(json!({ "$date": "soon" })).unwrap();
        assert_eq!(back, Value::Map(vec![("$date".into(), Value::from("soon"))]));
    }
}
