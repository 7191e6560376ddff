//! Dynamic document value type.

use crate::object_id::ObjectId;
use std::cmp::Ordering;
use std::fmt;

/// A dynamic document value.
///
/// This is the storage representation of every mapped field. Equality is
/// strict: values of different variants are never equal, so `Bool(true)`
/// and `Integer(1)` compare as different. Floats compare by bit pattern,
/// which keeps `Value` reflexive and lets it implement `Eq`.
#[derive(Debug, Clone)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (supports full i64 range).
    Integer(i64),
    /// Double precision float.
    Float(f64),
    /// Text string (UTF-8).
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Point in time as milliseconds since the Unix epoch.
    Date(i64),
    /// Backend-generated identifier.
    ObjectId(ObjectId),
    /// Array of values.
    Array(Vec<Value>),
    /// Map of field names to values.
    Map(Vec<(String, Value)>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::ObjectId(a), Value::ObjectId(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

/// Orders map keys the way the canonical encoder writes them:
/// shorter keys first, then bytewise.
pub(crate) fn cmp_keys(a: &str, b: &str) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.as_bytes().cmp(b.as_bytes()),
        ord => ord,
    }
}

impl Value {
    /// Create a map value with canonically sorted keys.
    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        let mut pairs: Vec<(String, Value)> =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        pairs.sort_by(|a, b| cmp_keys(&a.0, &b.0));
        Value::Map(pairs)
    }

    /// Create an empty map.
    #[must_use]
    pub fn empty_map() -> Self {
        Value::Map(Vec::new())
    }

    /// Returns a short name of this value's type, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "string",
            Value::Bytes(_) => "binary",
            Value::Date(_) => "date",
            Value::ObjectId(_) => "object_id",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a float, if it is one.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as epoch milliseconds, if it is a date.
    pub fn as_date(&self) -> Option<i64> {
        match self {
            Value::Date(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Get this value as an object id, if it is one.
    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectId(id) => Some(*id),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a key in this map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Mutable lookup of a key in this map value.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        match self {
            Value::Map(pairs) => pairs.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Sets a key in this map value, returning the previous value.
    ///
    /// Existing keys keep their position; new keys are appended.
    /// Does nothing and returns `None` if this is not a map.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let Value::Map(pairs) = self else {
            return None;
        };
        let key = key.into();
        if let Some((_, slot)) = pairs.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(slot, value));
        }
        pairs.push((key, value));
        None
    }

    /// Removes a key from this map value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let Value::Map(pairs) = self else {
            return None;
        };
        let pos = pairs.iter().position(|(k, _)| k == key)?;
        Some(pairs.remove(pos).1)
    }

    /// Resolves a dotted path such as `address.city` or `tags.0`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(self, |current, segment| match current {
            Value::Map(_) => current.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// Sets the value at a dotted path, creating intermediate maps.
    ///
    /// Returns `false` when the path crosses a value that is neither a map
    /// nor an array, or an array index is out of range.
    pub fn set_path(&mut self, path: &str, value: Value) -> bool {
        match path.split_once('.') {
            None => self.set_segment(path, value),
            Some((head, rest)) => {
                if matches!(self, Value::Map(_)) && self.get(head).is_none() {
                    self.insert(head, Value::empty_map());
                }
                match self.segment_mut(head) {
                    Some(child) => child.set_path(rest, value),
                    None => false,
                }
            }
        }
    }

    /// Removes the value at a dotted path.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.rsplit_once('.') {
            None => self.remove(path),
            Some((parent, last)) => {
                let mut current = self;
                for segment in parent.split('.') {
                    current = current.segment_mut(segment)?;
                }
                current.remove(last)
            }
        }
    }

    fn segment_mut(&mut self, segment: &str) -> Option<&mut Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter_mut()
                .find(|(k, _)| k == segment)
                .map(|(_, v)| v),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(move |i| items.get_mut(i)),
            _ => None,
        }
    }

    fn set_segment(&mut self, segment: &str, value: Value) -> bool {
        if let Value::Array(items) = self {
            return match segment.parse::<usize>() {
                Ok(i) if i < items.len() => {
                    items[i] = value;
                    true
                }
                Ok(i) if i == items.len() => {
                    items.push(value);
                    true
                }
                _ => false,
            };
        }
        if matches!(self, Value::Map(_)) {
            self.insert(segment, value);
            return true;
        }
        false
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n:?}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(ms) => write!(f, "Date({ms})"),
            Value::ObjectId(id) => write!(f, "ObjectId({id})"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::ObjectId(id)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_keys_are_sorted() {
        let map = Value::map([
            ("abc", Value::Integer(1)),
            ("a", Value::Integer(2)),
            ("ab", Value::Integer(3)),
        ]);

        let keys: Vec<_> = map.as_map().unwrap().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "ab", "abc"]);
    }

    #[test]
    fn equality_is_type_strict() {
        assert_ne!(Value::Bool(true), Value::Integer(1));
        assert_ne!(Value::Integer(1), Value::Float(1.0));
        assert_ne!(Value::Text("1".into()), Value::Integer(1));
        assert_ne!(
            Value::Array(vec![Value::Bool(true)]),
            Value::Array(vec![Value::Integer(1)])
        );
        assert_ne!(Value::Date(0), Value::Integer(0));
    }

    #[test]
    fn floats_compare_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
    }

    #[test]
    fn dates_compare_by_value() {
        assert_eq!(Value::Date(1_700_000_000_000), Value::Date(1_700_000_000_000));
        assert_ne!(Value::Date(1), Value::Date(2));
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut map = Value::Map(vec![
            ("b".into(), Value::Integer(1)),
            ("a".into(), Value::Integer(2)),
        ]);
        assert_eq!(map.insert("b", Value::Integer(9)), Some(Value::Integer(1)));
        assert_eq!(map.insert("c", Value::Null), None);
        let keys: Vec<_> = map.as_map().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn path_access() {
        let mut doc = Value::map([
            ("name", Value::from("Alice")),
            (
                "address",
                Value::map([("city", Value::from("Oslo"))]),
            ),
            ("tags", Value::Array(vec![Value::from("x"), Value::from("y")])),
        ]);

        assert_eq!(doc.get_path("address.city"), Some(&Value::from("Oslo")));
        assert_eq!(doc.get_path("tags.1"), Some(&Value::from("y")));
        assert_eq!(doc.get_path("address.zip"), None);

        assert!(doc.set_path("address.zip", Value::from("0150")));
        assert!(doc.set_path("meta.created", Value::Date(5)));
        assert_eq!(doc.get_path("meta.created"), Some(&Value::Date(5)));
        assert!(doc.set_path("tags.2", Value::from("z")));
        assert!(!doc.set_path("name.first", Value::from("A")));

        assert_eq!(doc.remove_path("address.city"), Some(Value::from("Oslo")));
        assert_eq!(doc.get_path("address.city"), None);
    }

    #[test]
    fn accessors() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(42).as_bool(), None);
        assert_eq!(Value::Float(0.5).as_float(), Some(0.5));
        assert_eq!(Value::Text("hi".into()).as_text(), Some("hi"));
        assert_eq!(Value::Date(7).as_date(), Some(7));
        assert_eq!(Value::Integer(1).type_name(), "int");
    }

    #[test]
    fn display_is_compact() {
        let value = Value::map([
            ("n", Value::Integer(1)),
            ("s", Value::from("x")),
            ("l", Value::Array(vec![Value::Null, Value::Bool(false)])),
        ]);
        assert_eq!(value.to_string(), r#"{"l": [null, false], "n": 1, "s": "x"}"#);
    }

    #[test]
    fn from_impls() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i32), Value::Integer(42));
        assert_eq!(Value::from("hello"), Value::Text("hello".to_string()));
        assert_eq!(Value::from(&[1u8, 2][..]), Value::Bytes(vec![1, 2]));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(()), Value::Null);
    }
}
