//! # DocMap Core
//!
//! Unit of work, change tracking and commit ordering for DocMap.
//!
//! This crate maps in-memory documents onto a [`DocumentBackend`](docmap_storage::DocumentBackend):
//! - [`MetadataRegistry`] - How classes map to collections and fields
//! - [`UnitOfWork`] - Document states, identity and scheduled writes
//! - [`ChangeSetComputer`] - Field-level diffs against the last written state
//! - [`CommitOrderCalculator`] - Class ordering so referenced documents are
//!   written first
//! - [`IdentityMap`] - One instance per stored document
//! - [`DocumentPersister`] - Per-class write and load boundary
//! - [`DocumentManager`] - Session facade with lazy reference resolution
//!
//! ## Design Principles
//!
//! - Nothing is written until a commit; the commit diffs, orders and writes
//! - A document is finalized as soon as its own write succeeds, so a failed
//!   commit leaves exactly the failed work scheduled
//! - Every write reports success or failure explicitly; failures are
//!   collected per document in [`CoreError::CommitFailed`]
//! - Sessions are single-threaded (`&mut self`); shared configuration is
//!   immutable
//!
//! ## Example
//!
//! ```rust
//! use docmap_core::{Cascade, ClassMetadata, Collection, Configuration, DocumentRef, IdStrategy, MetadataRegistry, UnitOfWork};
//! use docmap_storage::InMemoryBackend;
//! use std::sync::Arc;
//!
//! let registry = MetadataRegistry::builder()
//!     .class(
//!         ClassMetadata::document("User")
//!             .collection("users")
//!             .id("id", IdStrategy::Auto)
//!             .field("name")
//!             .reference_many("groups", "Group", Cascade::PERSIST),
//!     )
//!     .class(ClassMetadata::document("Group").collection("groups").id("id", IdStrategy::Auto).field("name"))
//!     .build()
//!     .unwrap();
//! let mut uow = UnitOfWork::new(Arc::new(Configuration::new(registry)), Arc::new(InMemoryBackend::new()));
//!
//! let group = DocumentRef::new("Group").with("name", "admins");
//! let user = DocumentRef::new("User")
//!     .with("name", "alice")
//!     .with("groups", Collection::of([group.clone()]));
//! uow.persist(&user).unwrap();
//!
//! let report = uow.commit().unwrap();
//! assert_eq!(report.inserted, 2);
//! assert!(uow.contains(&group));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod commit_order;
mod config;
mod document;
mod error;
mod event;
mod identity_map;
mod manager;
mod metadata;
mod persister;
mod stats;
mod types;
mod unit_of_work;

pub use changeset::{
    Change, ChangeSet, ChangeSetComputer, CollectionChangeSet, FieldChange, OriginalData, OriginalValue,
};
pub use commit_order::CommitOrderCalculator;
pub use config::{Configuration, FailurePolicy};
pub use document::{Collection, Document, DocumentRef, FieldValue, Link, Proxy, WeakDocumentRef};
pub use error::{CoreError, CoreResult, WriteFailure, WriteOperation};
pub use event::{EventListener, EventManager, EventNotice, FlushEvent, LifecycleEvent};
pub use identity_map::IdentityMap;
pub use manager::DocumentManager;
pub use metadata::{
    Cascade, ClassBuilder, ClassMetadata, CollectionStrategy, DocumentKind, FieldKind, FieldMapping,
    IdGenerator, IdStrategy, MetadataRegistry, RegistryBuilder, ID_DB_NAME,
};
pub use persister::{DocumentPersister, Hydrator, PersistenceBuilder, StoragePersister};
pub use stats::{StatsSnapshot, UnitOfWorkStats};
pub use types::{DocumentState, Oid};
pub use unit_of_work::{FlushReport, UnitOfWork};
