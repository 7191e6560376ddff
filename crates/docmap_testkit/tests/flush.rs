//! Commit behaviour: ordering, partial failures, transactions and locking.

use docmap_codec::Value;
use docmap_core::{Collection, CoreError, DocumentRef, FailurePolicy, WriteOperation};
use docmap_storage::{DocumentBackend, StorageError, UpdateSpec};
use docmap_testkit::prelude::*;

#[test]
fn referenced_classes_are_inserted_first_and_deleted_last() {
    init_test_tracing();
    let mut session = TestSession::new();
    let (log, _) = record_writes(&mut session.dm, &["User", "Account", "Group"]);

    let owner = user("alice");
    let account = DocumentRef::new("Account").with("balance", 10).with("owner", owner.clone());
    session.persist(&account).unwrap();
    session.persist(&owner).unwrap();
    session.flush().unwrap();
    assert_eq!(class_sequence(&log, WriteOperation::Insert), vec!["User", "Account"]);

    session.remove(&owner).unwrap();
    session.remove(&account).unwrap();
    session.flush().unwrap();
    assert_eq!(class_sequence(&log, WriteOperation::Delete), vec!["Account", "User"]);
}

#[test]
fn updates_write_only_changed_fields() {
    let mut session = TestSession::new();
    let (log, _) = record_writes(&mut session.dm, &["User"]);
    let alice = full_user("alice", &[]);
    session.persist(&alice).unwrap();
    session.flush().unwrap();

    alice.set("name", "alicia");
    let report = session.flush().unwrap();
    assert_eq!(report.updated, 1);
    let last = log.lock().last().cloned().unwrap();
    assert_eq!(last.operation, WriteOperation::Update);
    assert_eq!(last.fields, vec!["name".to_string()]);

    let stored = session.stored("users", &alice.scalar("id").unwrap()).unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("alicia")));
    assert_eq!(stored.get("mail"), Some(&Value::from("alice@example.com")));
    assert_eq!(stored.get("version"), Some(&Value::Integer(2)));
}

#[test]
fn embedded_changes_are_written_in_place() {
    let mut session = TestSession::new();
    let alice = full_user("alice", &[]);
    session.persist(&alice).unwrap();
    session.flush().unwrap();

    let home = alice.get("address").unwrap().as_document().unwrap().clone();
    home.set("city", "Bergen");
    let phones = alice.get("phones").unwrap().as_collection().unwrap().documents();
    phones[1].set("number", "333");
    session.flush().unwrap();

    let stored = session.stored("users", &alice.scalar("id").unwrap()).unwrap();
    assert_eq!(stored.get_path("address.city"), Some(&Value::from("Bergen")));
    assert_eq!(stored.get_path("phones.1.number"), Some(&Value::from("333")));
    assert_eq!(stored.get_path("phones.0.number"), Some(&Value::from("111")));
}

#[test]
fn assigned_ids_are_upserted() {
    let mut session = TestSession::new();
    let tag = DocumentRef::new("Tag").with("label", "rust");
    session.persist(&tag).unwrap();
    assert!(session.unit_of_work().is_scheduled_for_upsert(&tag));

    let report = session.flush().unwrap();
    assert_eq!(report.upserted, 1);
    assert!(session.stored("tags", &Value::from("rust")).is_some());
    assert_eq!(session.backend.call_count(FaultPoint::Upsert), 1);
}

#[test]
fn continue_on_error_attempts_every_write() {
    let mut session = TestSession::new();
    let admins = group("admins");
    let alice = full_user("alice", &[admins.clone()]);
    let bob = full_user("bob", &[admins.clone()]);
    session.persist(&alice).unwrap();
    session.persist(&bob).unwrap();
    session.backend.fail_always(FaultPoint::Insert, Some("users"), StorageError::fatal("users offline"));

    let err = session.flush().unwrap_err();
    assert_eq!(err.failures().len(), 2);
    assert!(err.failures().iter().all(|f| f.operation == WriteOperation::Insert && f.class == "User"));
    assert!(err.to_string().contains("users offline"));

    // the group write succeeded and is final
    assert_eq!(session.stored_count("groups"), 1);
    let uow = session.unit_of_work();
    assert!(!uow.is_scheduled_for_insert(&admins));
    assert!(uow.is_scheduled_for_insert(&alice));
    assert!(uow.is_scheduled_for_insert(&bob));
    assert_eq!(uow.stats().failed_writes(), 2);

    session.backend.clear_faults();
    let report = session.flush().unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(session.stored_count("users"), 2);
}

#[test]
fn stop_on_first_error_leaves_the_rest_untouched() {
    let mut session = TestSession::with_config(|c| c.failure_policy(FailurePolicy::StopOnFirstError));
    let alice = user("alice");
    let bob = user("bob");
    session.persist(&alice).unwrap();
    session.persist(&bob).unwrap();
    session.backend.fail_next(FaultPoint::Insert, StorageError::fatal("boom"));

    let err = session.flush().unwrap_err();
    assert_eq!(err.failures().len(), 1);
    assert_eq!(session.backend.call_count(FaultPoint::Insert), 1);
    assert!(session.unit_of_work().is_scheduled_for_insert(&alice));
    assert!(session.unit_of_work().is_scheduled_for_insert(&bob));

    assert_eq!(session.flush().unwrap().inserted, 2);
}

#[test]
fn failed_delete_stays_scheduled() {
    let mut session = TestSession::new();
    let alice = user("alice");
    session.persist(&alice).unwrap();
    session.flush().unwrap();

    session.remove(&alice).unwrap();
    session.backend.fail_next(FaultPoint::Delete, StorageError::fatal("locked"));
    assert!(session.flush().is_err());
    assert!(session.unit_of_work().is_scheduled_for_delete(&alice));
    assert_eq!(session.stored_count("users"), 1);

    session.flush().unwrap();
    assert_eq!(session.stored_count("users"), 0);
}

#[test]
fn transactional_commit_is_all_or_nothing() {
    let mut session = TestSession::transactional();
    let admins = group("admins");
    let alice = full_user("alice", &[admins.clone()]);
    session.persist(&alice).unwrap();
    // the group insert runs first and succeeds inside the transaction
    session.backend.fail_always(FaultPoint::Insert, Some("users"), StorageError::fatal("no"));

    let err = session.flush().unwrap_err();
    assert_eq!(err.failures().len(), 1);
    assert_eq!(session.stored_count("groups"), 0);
    assert_eq!(session.stored_count("users"), 0);
    assert!(!session.backend.inner().in_transaction());

    // the group write was rolled back with the transaction
    let uow = session.unit_of_work();
    assert!(uow.is_scheduled_for_insert(&admins));
    assert!(uow.is_scheduled_for_insert(&alice));
    assert_eq!(admins.scalar("id"), Some(Value::Null));
    assert!(!uow.identity_map().contains(&admins));

    session.backend.clear_faults();
    let report = session.flush().unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.attempts, 1);
    assert_eq!(session.stored_count("groups"), 1);
    assert_eq!(session.stored_count("users"), 1);
}

#[test]
fn transient_failures_are_retried() {
    let mut session = TestSession::transactional();
    let alice = user("alice");
    session.persist(&alice).unwrap();
    session.backend.fail_next(FaultPoint::Insert, StorageError::transient("step down"));

    let report = session.flush().unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(report.inserted, 1);
    assert_eq!(session.unit_of_work().stats().transaction_retries(), 1);
    assert_eq!(session.stored_count("users"), 1);
}

#[test]
fn retries_are_bounded() {
    let mut session = TestSession::with_config(|c| c.transactional_flush(true).max_transaction_retries(1));
    let alice = user("alice");
    session.persist(&alice).unwrap();
    session.backend.fail_always(FaultPoint::Insert, None, StorageError::transient("flapping"));

    let err = session.flush().unwrap_err();
    assert!(err.failures()[0].error.is_transient());
    assert_eq!(session.backend.call_count(FaultPoint::Insert), 2);
    assert!(session.unit_of_work().is_scheduled_for_insert(&alice));
}

#[test]
fn failed_transaction_commit_rolls_back() {
    let mut session = TestSession::transactional();
    let alice = user("alice");
    session.persist(&alice).unwrap();
    session.backend.fail_next(FaultPoint::Commit, StorageError::fatal("commit lost"));

    let err = session.flush().unwrap_err();
    assert!(matches!(err, CoreError::Storage(StorageError::Fatal(_))));
    assert_eq!(session.stored_count("users"), 0);
    assert!(session.unit_of_work().is_scheduled_for_insert(&alice));
    assert_eq!(session.flush().unwrap().inserted, 1);
}

#[test]
fn stale_versions_are_conflicts() {
    let mut session = TestSession::new();
    let alice = user("alice");
    session.persist(&alice).unwrap();
    session.flush().unwrap();
    let id = alice.scalar("id").unwrap();

    // someone else wrote version 2
    session
        .backend
        .update("users", &id, &UpdateSpec::new().set("name", Value::from("eve")).inc("version", 1))
        .unwrap();

    alice.set("name", "alicia");
    let err = session.flush().unwrap_err();
    assert!(matches!(
        *err.failures()[0].error,
        CoreError::Storage(StorageError::VersionConflict { expected: 1, .. })
    ));
    assert!(session.unit_of_work().is_scheduled_for_update(&alice));

    session.refresh(&alice).unwrap();
    assert_eq!(alice.scalar("name"), Some(Value::from("eve")));
    alice.set("name", "alicia");
    session.flush().unwrap();
    let stored = session.stored("users", &id).unwrap();
    assert_eq!(stored.get("version"), Some(&Value::Integer(3)));
}

#[test]
fn references_to_unwritten_documents_are_fixed_up() {
    let mut session = TestSession::new();
    let alice = user("alice");
    let bob = user("bob");
    alice.set("best_friend", bob.clone());
    bob.set("best_friend", alice.clone());
    session.persist(&alice).unwrap();
    session.persist(&bob).unwrap();

    let report = session.flush().unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.updated, 1);

    let alice_id = alice.scalar("id").unwrap();
    let bob_id = bob.scalar("id").unwrap();
    assert_eq!(session.stored("users", &alice_id).unwrap().get("best_friend"), Some(&bob_id));
    assert_eq!(session.stored("users", &bob_id).unwrap().get("best_friend"), Some(&alice_id));
    assert!(!session.unit_of_work().has_pending_writes());
}

#[test]
fn collection_pushes_are_incremental() {
    let mut session = TestSession::new();
    let alice = full_user("alice", &[group("a")]);
    session.persist(&alice).unwrap();
    session.flush().unwrap();

    let groups = alice.get("groups").unwrap().as_collection().unwrap().clone();
    groups.push(group("b"));
    let report = session.flush().unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.updated, 1);

    let stored = session.stored("users", &alice.scalar("id").unwrap()).unwrap();
    let ids: Vec<Value> = groups.documents().iter().map(|g| g.scalar("id").unwrap()).collect();
    assert_eq!(stored.get("groups"), Some(&Value::Array(ids)));
    assert_eq!(session.stored_count("groups"), 2);
}

#[test]
fn new_documents_in_collections_are_persisted_by_cascade() {
    let mut session = TestSession::new();
    let alice = user("alice").with("groups", Collection::new());
    session.persist(&alice).unwrap();
    session.flush().unwrap();

    let fresh = group("fresh");
    alice.get("groups").unwrap().as_collection().unwrap().push(fresh.clone());
    session.flush().unwrap();
    assert!(session.contains(&fresh));
    assert!(fresh.scalar("id").is_some_and(|id| !id.is_null()));
}

#[test]
fn stats_track_writes_and_flushes() {
    let mut session = TestSession::new();
    let alice = user("alice");
    session.persist(&alice).unwrap();
    session.flush().unwrap();
    alice.set("name", "a2");
    session.flush().unwrap();
    session.remove(&alice).unwrap();
    session.flush().unwrap();

    let stats = session.unit_of_work().stats().snapshot();
    assert_eq!(stats.inserts, 1);
    assert_eq!(stats.updates, 1);
    assert_eq!(stats.deletes, 1);
    assert_eq!(stats.flushes, 3);
    assert_eq!(stats.failed_flushes, 0);
}

#[test]
fn removing_a_repeated_reference_keeps_the_other_copy() {
    let mut session = TestSession::new();
    let a = group("a");
    let alice = full_user("alice", &[a.clone(), group("b"), a.clone()]);
    session.persist(&alice).unwrap();
    session.flush().unwrap();

    let groups = alice.get("groups").unwrap().as_collection().unwrap().clone();
    groups.remove(2);
    session.flush().unwrap();

    let ids: Vec<Value> = groups.documents().iter().map(|g| g.scalar("id").unwrap()).collect();
    assert_eq!(ids.len(), 2);
    let stored = session.stored("users", &alice.scalar("id").unwrap()).unwrap();
    assert_eq!(stored.get("groups"), Some(&Value::Array(ids)));

    // nothing left to repair on the next flush
    assert_eq!(session.flush().unwrap().total(), 0);
}

#[test]
fn replacing_an_element_writes_one_operator_per_path() {
    let mut session = TestSession::new();
    let alice = full_user("alice", &[group("a"), group("b")]);
    session.persist(&alice).unwrap();
    session.flush().unwrap();

    let groups = alice.get("groups").unwrap().as_collection().unwrap().clone();
    groups.remove(0);
    groups.push(group("c"));
    session.flush().unwrap();

    let ids: Vec<Value> = groups.documents().iter().map(|g| g.scalar("id").unwrap()).collect();
    let stored = session.stored("users", &alice.scalar("id").unwrap()).unwrap();
    assert_eq!(stored.get("groups"), Some(&Value::Array(ids)));
}
