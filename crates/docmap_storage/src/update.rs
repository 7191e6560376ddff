//! Update and query commands understood by every backend.
//!
//! An [`UpdateSpec`] is an ordered list of field operators applied to a
//! single stored document, optionally guarded by equality preconditions
//! (used for optimistic locking). A [`Filter`] selects documents by
//! field equality.

use crate::error::{StorageError, StorageResult};
use docmap_codec::Value;

/// A single field operator.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Replace the value at `path`, creating intermediate maps.
    Set {
        /// Dotted field path.
        path: String,
        /// New value.
        value: Value,
    },
    /// Remove the value at `path`. Missing paths are ignored.
    Unset {
        /// Dotted field path.
        path: String,
    },
    /// Add `by` to the integer at `path` (missing counts as zero).
    Inc {
        /// Dotted field path.
        path: String,
        /// Increment.
        by: i64,
    },
    /// Append `values` to the array at `path` (missing creates the array).
    Push {
        /// Dotted field path.
        path: String,
        /// Values to append, in order.
        values: Vec<Value>,
    },
    /// Append each of `values` not already present in the array at `path`.
    AddToSet {
        /// Dotted field path.
        path: String,
        /// Candidate values.
        values: Vec<Value>,
    },
    /// Remove every element equal to one of `values` from the array at `path`.
    Pull {
        /// Dotted field path.
        path: String,
        /// Values to remove.
        values: Vec<Value>,
    },
}

impl UpdateOp {
    /// Returns the field path this operator targets.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Set { path, .. }
            | Self::Unset { path }
            | Self::Inc { path, .. }
            | Self::Push { path, .. }
            | Self::AddToSet { path, .. }
            | Self::Pull { path, .. } => path,
        }
    }

    fn apply(&self, document: &mut Value) -> StorageResult<()> {
        match self {
            Self::Set { path, value } => {
                if !document.set_path(path, value.clone()) {
                    return Err(StorageError::invalid_update(path, "path is not settable"));
                }
            }
            Self::Unset { path } => {
                document.remove_path(path);
            }
            Self::Inc { path, by } => {
                let next = match document.get_path(path) {
                    None | Some(Value::Null) => *by,
                    Some(Value::Integer(n)) => n
                        .checked_add(*by)
                        .ok_or_else(|| StorageError::invalid_update(path, "integer overflow"))?,
                    Some(other) => {
                        return Err(StorageError::invalid_update(
                            path,
                            format!("cannot increment {}", other.type_name()),
                        ))
                    }
                };
                document.set_path(path, Value::Integer(next));
            }
            Self::Push { path, values } => {
                let mut items = array_at(document, path)?;
                items.extend(values.iter().cloned());
                document.set_path(path, Value::Array(items));
            }
            Self::AddToSet { path, values } => {
                let mut items = array_at(document, path)?;
                for value in values {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
                document.set_path(path, Value::Array(items));
            }
            Self::Pull { path, values } => {
                if document.get_path(path).is_none() {
                    return Ok(());
                }
                let mut items = array_at(document, path)?;
                items.retain(|item| !values.contains(item));
                document.set_path(path, Value::Array(items));
            }
        }
        Ok(())
    }
}

fn array_at(document: &Value, path: &str) -> StorageResult<Vec<Value>> {
    match document.get_path(path) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(StorageError::invalid_update(
            path,
            format!("expected an array, found {}", other.type_name()),
        )),
    }
}

/// An ordered set of field operators with optional preconditions.
///
/// At most one operator may touch a path or any of its prefixes, as in
/// MongoDB. Writers that need to pull and push on the same array send the
/// whole array with `Set` instead. [`InMemoryBackend`](crate::InMemoryBackend)
/// applies operators in order and does not enforce this.
///
/// `Pull` removes every element equal to one of its values.
///
/// # Example
///
/// ```rust
/// use docmap_codec::Value;
/// use docmap_storage::UpdateSpec;
///
/// let update = UpdateSpec::new()
///     .set("name", Value::from("Bob"))
///     .inc("version", 1)
///     .expect("version", Value::Integer(1));
///
/// let mut doc = Value::map([("name", Value::from("Al")), ("version", Value::Integer(1))]);
/// assert!(update.matches(&doc));
/// update.apply(&mut doc).unwrap();
/// assert_eq!(doc.get("version"), Some(&Value::Integer(2)));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSpec {
    ops: Vec<UpdateOp>,
    preconditions: Vec<(String, Value)>,
}

impl UpdateSpec {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operator.
    #[must_use]
    pub fn with(mut self, op: UpdateOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Appends a `Set` operator.
    #[must_use]
    pub fn set(self, path: impl Into<String>, value: Value) -> Self {
        self.with(UpdateOp::Set {
            path: path.into(),
            value,
        })
    }

    /// Appends an `Unset` operator.
    #[must_use]
    pub fn unset(self, path: impl Into<String>) -> Self {
        self.with(UpdateOp::Unset { path: path.into() })
    }

    /// Appends an `Inc` operator.
    #[must_use]
    pub fn inc(self, path: impl Into<String>, by: i64) -> Self {
        self.with(UpdateOp::Inc {
            path: path.into(),
            by,
        })
    }

    /// Appends a `Push` operator.
    #[must_use]
    pub fn push(self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(UpdateOp::Push {
            path: path.into(),
            values,
        })
    }

    /// Appends an `AddToSet` operator.
    #[must_use]
    pub fn add_to_set(self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(UpdateOp::AddToSet {
            path: path.into(),
            values,
        })
    }

    /// Appends a `Pull` operator.
    #[must_use]
    pub fn pull(self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(UpdateOp::Pull {
            path: path.into(),
            values,
        })
    }

    /// Requires the stored value at `path` to equal `value`.
    #[must_use]
    pub fn expect(mut self, path: impl Into<String>, value: Value) -> Self {
        self.preconditions.push((path.into(), value));
        self
    }

    /// Returns the operators in application order.
    #[must_use]
    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    /// Returns the preconditions.
    #[must_use]
    pub fn preconditions(&self) -> &[(String, Value)] {
        &self.preconditions
    }

    /// Returns `true` if the update carries no operators.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns `true` if every precondition holds for `document`.
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        self.preconditions
            .iter()
            .all(|(path, expected)| document.get_path(path) == Some(expected))
    }

    /// Applies all operators to `document` in order.
    ///
    /// Preconditions are not checked here; see [`UpdateSpec::matches`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidUpdate`] if an operator does not fit
    /// the stored value (e.g. pushing onto a string). The document may be
    /// partially modified in that case, so callers apply to a copy.
    pub fn apply(&self, document: &mut Value) -> StorageResult<()> {
        for op in &self.ops {
            op.apply(document)?;
        }
        Ok(())
    }
}

/// Equality criteria for selecting documents.
///
/// A clause matches when the value at its path equals the expected value,
/// or when the stored value is an array containing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    /// A filter matching every document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter selecting a single `_id`.
    #[must_use]
    pub fn by_id(id: Value) -> Self {
        Self::all().eq("_id", id)
    }

    /// Adds an equality clause.
    #[must_use]
    pub fn eq(mut self, path: impl Into<String>, value: Value) -> Self {
        self.clauses.push((path.into(), value));
        self
    }

    /// Returns the clauses.
    #[must_use]
    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    /// Returns `true` if `document` satisfies every clause.
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(path, expected)| match document.get_path(path) {
                Some(Value::Array(items)) if !matches!(expected, Value::Array(_)) => {
                    items.contains(expected)
                }
                Some(found) => found == expected,
                None => expected.is_null(),
            })
    }
}
