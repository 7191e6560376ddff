//! # DocMap Storage
//!
//! Document backend trait and implementations for DocMap.
//!
//! This crate is the "wire driver" boundary of DocMap. A backend stores map
//! documents in named collections and understands a small command set:
//! insert, update/upsert with field operators, delete, and equality finds.
//! It knows nothing about mapped classes or change tracking.
//!
//! ## Design Principles
//!
//! - Backends never overwrite on insert; duplicate ids are errors
//! - Updates are expressed as [`UpdateSpec`] operator lists so incremental
//!   collection changes (`push`/`pull`) and full replacement are distinct
//! - Failures are classified transient or fatal ([`StorageError::is_transient`])
//! - Must be `Send + Sync`
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - Canonical-binary document store with transactions
//!
//! ## Example
//!
//! ```rust
//! use docmap_codec::Value;
//! use docmap_storage::{DocumentBackend, Filter, InMemoryBackend, UpdateSpec};
//!
//! let backend = InMemoryBackend::new();
//! let id = backend.insert("users", Value::map([("tags", Value::Array(vec![]))])).unwrap();
//! backend
//!     .update("users", &id, &UpdateSpec::new().push("tags", vec![Value::from("admin")]))
//!     .unwrap();
//! let admins = backend.find("users", &Filter::all().eq("tags", Value::from("admin"))).unwrap();
//! assert_eq!(admins.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;
mod update;

pub use backend::{DocumentBackend, UpdateOutcome};
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryBackend;
pub use update::{Filter, UpdateOp, UpdateSpec};
