//! Test fixtures and session helpers.
//!
//! Provides a small mapped domain and a [`TestSession`] wired to a
//! [`FaultInjectingBackend`].
//!
//! ```text
//! User ──groups──> Group          (cascade persist)
//!  │ ├─address: Address           (embedded)
//!  │ ├─phones: [Phone]            (embedded)
//!  │ └─best_friend ──> User       (no cascade)
//! Account ──owner──> User         (versioned, uuid ids)
//! Person <── Employee             (single collection, discriminator "type")
//! Tag                             (caller-assigned ids only)
//! ```

use crate::faults::FaultInjectingBackend;
use docmap_codec::Value;
use docmap_core::{
    Cascade, ClassMetadata, Collection, Configuration, DocumentManager, DocumentRef, FieldMapping, IdStrategy,
    MetadataRegistry,
};
use docmap_storage::DocumentBackend;
use std::sync::Arc;

/// Builds the registry of the test domain.
#[must_use]
pub fn domain_registry() -> MetadataRegistry {
    MetadataRegistry::builder()
        .class(
            ClassMetadata::document("User")
                .collection("users")
                .id("id", IdStrategy::Auto)
                .version("version")
                .field("name")
                .mapping(FieldMapping::scalar("email").db_name("mail"))
                .embed_one("address", "Address")
                .embed_many("phones", "Phone")
                .reference_many("groups", "Group", Cascade::PERSIST)
                .reference_one("best_friend", "User", Cascade::NONE),
        )
        .class(
            ClassMetadata::document("Group")
                .collection("groups")
                .id("id", IdStrategy::Auto)
                .field("name"),
        )
        .class(
            ClassMetadata::document("Account")
                .collection("accounts")
                .id("id", IdStrategy::Uuid)
                .version("version")
                .field("balance")
                .reference_one("owner", "User", Cascade::NONE),
        )
        .class(
            ClassMetadata::document("Person")
                .collection("people")
                .id("id", IdStrategy::Auto)
                .discriminator_field("type")
                .discriminator_value("person")
                .field("name"),
        )
        .class(
            ClassMetadata::document("Employee")
                .extends("Person")
                .discriminator_value("employee")
                .field("salary"),
        )
        .class(ClassMetadata::document("Tag").collection("tags").id("label", IdStrategy::None))
        .class(ClassMetadata::embedded("Address").field("city").field("street"))
        .class(ClassMetadata::embedded("Phone").field("number"))
        .build()
        .expect("test domain is valid")
}

/// A NEW user.
#[must_use]
pub fn user(name: &str) -> DocumentRef {
    DocumentRef::new("User").with("name", name)
}

/// A NEW group.
#[must_use]
pub fn group(name: &str) -> DocumentRef {
    DocumentRef::new("Group").with("name", name)
}

/// An address to embed.
#[must_use]
pub fn address(city: &str) -> DocumentRef {
    DocumentRef::new("Address").with("city", city)
}

/// A phone to embed.
#[must_use]
pub fn phone(number: &str) -> DocumentRef {
    DocumentRef::new("Phone").with("number", number)
}

/// A NEW user with an address, two phones and the given groups.
#[must_use]
pub fn full_user(name: &str, groups: &[DocumentRef]) -> DocumentRef {
    user(name)
        .with("email", format!("{name}@example.com"))
        .with("address", address("Oslo"))
        .with("phones", Collection::of([phone("111"), phone("222")]))
        .with("groups", Collection::of(groups.iter().cloned()))
}

/// A document manager over a fault-injecting in-memory backend.
pub struct TestSession {
    /// The session.
    pub dm: DocumentManager,
    /// The backend, for injecting faults and inspecting stored documents.
    pub backend: Arc<FaultInjectingBackend>,
}

impl TestSession {
    /// Creates a session over the test domain with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Creates a session whose configuration is adjusted by `configure`.
    #[must_use]
    pub fn with_config(configure: impl FnOnce(Configuration) -> Configuration) -> Self {
        let config = configure(Configuration::new(domain_registry()));
        let backend = Arc::new(FaultInjectingBackend::new());
        Self {
            dm: DocumentManager::new(config, Arc::clone(&backend) as Arc<dyn DocumentBackend>),
            backend,
        }
    }

    /// Creates a session with transactional flushes.
    #[must_use]
    pub fn transactional() -> Self {
        Self::with_config(|config| config.transactional_flush(true))
    }

    /// Returns the committed form of a document.
    #[must_use]
    pub fn stored(&self, collection: &str, id: &Value) -> Option<Value> {
        self.backend
            .committed(collection)
            .into_iter()
            .find(|doc| doc.get("_id") == Some(id))
    }

    /// Returns the number of committed documents in a collection.
    #[must_use]
    pub fn stored_count(&self, collection: &str) -> usize {
        self.backend.committed(collection).len()
    }
}

impl Default for TestSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestSession {
    type Target = DocumentManager;

    fn deref(&self) -> &Self::Target {
        &self.dm
    }
}

impl std::ops::DerefMut for TestSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dm
    }
}

/// Runs a test with a fresh session.
///
/// # Example
///
/// ```rust
/// use docmap_testkit::{user, with_session};
///
/// with_session(|session| {
///     let alice = user("alice");
///     session.persist(&alice).unwrap();
///     session.flush().unwrap();
///     assert_eq!(session.stored_count("users"), 1);
/// });
/// ```
pub fn with_session<F, R>(f: F) -> R
where
    F: FnOnce(&mut TestSession) -> R,
{
    let mut session = TestSession::new();
    f(&mut session)
}

/// Stores a user directly in the backend, bypassing any session.
pub fn seed_user(backend: &dyn DocumentBackend, id: &str, name: &str) -> Value {
    backend
        .insert(
            "users",
            Value::map([
                ("_id", Value::from(id)),
                ("name", Value::from(name)),
                ("version", Value::Integer(1)),
            ]),
        )
        .expect("seeding a user")
}
