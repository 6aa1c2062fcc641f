//! In-memory document driver.
//!
//! Documents are JSON objects keyed by their `_id` field. The client can be
//! told to fail opens, fail `request_done`, or go offline, which makes it the
//! driver of choice for exercising the resolver's failure paths.

use crate::driver::{ConnectionFactory, DatabaseHandle, document_id, validate_database_name};
use crate::error::DriverError;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

type Collection = BTreeMap<String, Value>;

#[derive(Default)]
struct ClientState {
    /// database name -> collection name -> documents by `_id`
    databases: Mutex<HashMap<String, HashMap<String, Collection>>>,
    next_handle_id: AtomicU64,
    opened: AtomicUsize,
    requests_done: AtomicUsize,
    fail_next_open: Mutex<Option<DriverError>>,
    fail_request_done: AtomicBool,
    offline: AtomicBool,
}

impl ClientState {
    fn check_online(&self) -> Result<(), DriverError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(DriverError::network("server unreachable"));
        }
        Ok(())
    }
}

/// In-memory document client.
#[derive(Default)]
pub struct MemoryClient {
    state: Arc<ClientState>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles opened so far.
    pub fn opened_count(&self) -> usize {
        self.state.opened.load(Ordering::Acquire)
    }

    /// Number of successful `request_done` calls so far.
    pub fn requests_done(&self) -> usize {
        self.state.requests_done.load(Ordering::Acquire)
    }

    /// Make the next `get_database` call fail with `err`.
    pub fn fail_next_open(&self, err: DriverError) {
        *self
            .state
            .fail_next_open
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    /// Make every `request_done` call fail until reset.
    pub fn set_fail_request_done(&self, fail: bool) {
        self.state.fail_request_done.store(fail, Ordering::Release);
    }

    /// Simulate losing (or regaining) the server.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::Release);
    }
}

impl std::fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClient")
            .field("opened", &self.opened_count())
            .field("requests_done", &self.requests_done())
            .finish()
    }
}

impl ConnectionFactory for MemoryClient {
    type Database = MemoryDatabase;

    fn get_database(&self, name: &str) -> Result<MemoryDatabase, DriverError> {
        validate_database_name(name)?;

        let injected = self
            .state
            .fail_next_open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(err) = injected {
            return Err(err);
        }
        self.state.check_online()?;

        let handle_id = self.state.next_handle_id.fetch_add(1, Ordering::AcqRel);
        self.state.opened.fetch_add(1, Ordering::AcqRel);
        trace!(database = %name, handle_id, "Opened in-memory database handle");

        Ok(MemoryDatabase {
            name: Arc::from(name),
            handle_id,
            state: Arc::clone(&self.state),
        })
    }

    fn description(&self) -> String {
        "memory".to_string()
    }
}

/// Handle to one in-memory database.
#[derive(Clone)]
pub struct MemoryDatabase {
    name: Arc<str>,
    handle_id: u64,
    state: Arc<ClientState>,
}

impl MemoryDatabase {
    /// Identifier unique among handles opened by the same client.
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    /// Insert a document, returning its `_id`.
    ///
    /// A missing `_id` is generated. Inserting an `_id` that already exists in
    /// the collection fails with [`DriverError::DuplicateKey`].
    pub fn insert_one(&self, collection: &str, mut document: Value) -> Result<String, DriverError> {
        self.state.check_online()?;

        let id = document_id(&mut document)?;

        let mut databases = self
            .state
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let docs = databases
            .entry(self.name.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        if docs.contains_key(&id) {
            return Err(DriverError::duplicate_key(format!(
                "duplicate key error collection: {}.{} dup key: {{ _id: \"{}\" }}",
                self.name, collection, id
            )));
        }
        docs.insert(id.clone(), document);

        debug!(database = %self.name, collection = %collection, id = %id, "Inserted document");
        Ok(id)
    }

    /// Find a document by `_id`.
    pub fn find_one(&self, collection: &str, id: &str) -> Result<Option<Value>, DriverError> {
        self.state.check_online()?;
        let databases = self
            .state
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(databases
            .get(self.name.as_ref())
            .and_then(|db| db.get(collection))
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> Result<usize, DriverError> {
        self.state.check_online()?;
        let databases = self
            .state
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(databases
            .get(self.name.as_ref())
            .and_then(|db| db.get(collection))
            .map_or(0, |docs| docs.len()))
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.name)
            .field("handle_id", &self.handle_id)
            .finish()
    }
}

impl DatabaseHandle for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state) && self.handle_id == other.handle_id
    }

    fn request_done(&self) -> Result<(), DriverError> {
        if self.state.fail_request_done.load(Ordering::Acquire) {
            return Err(DriverError::network("failed to end request"));
        }
        self.state.requests_done.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_each_open_is_a_distinct_handle() {
        let client = MemoryClient::new();
        let a = client.get_database("app").unwrap();
        let b = client.get_database("app").unwrap();
        assert!(!a.same_handle(&b));
        assert!(a.same_handle(&a.clone()));
        assert_eq!(client.opened_count(), 2);
    }

    #[test]
    fn test_handles_from_different_clients_differ() {
        let a = MemoryClient::new().get_database("app").unwrap();
        let b = MemoryClient::new().get_database("app").unwrap();
        assert_eq!(a.handle_id(), b.handle_id());
        assert!(!a.same_handle(&b));
    }

    #[test]
    fn test_insert_and_find() {
        let client = MemoryClient::new();
        let db = client.get_database("app").unwrap();
        let id = db
            .insert_one("users", json!({"_id": "u1", "name": "Ada"}))
            .unwrap();
        assert_eq!(id, "u1");
        let found = db.find_one("users", "u1").unwrap().unwrap();
        assert_eq!(found["name"], "Ada");
        assert!(db.find_one("users", "u2").unwrap().is_none());
    }

    #[test]
    fn test_documents_shared_across_handles() {
        let client = MemoryClient::new();
        client
            .get_database("app")
            .unwrap()
            .insert_one("users", json!({"_id": 7}))
            .unwrap();
        let other = client.get_database("app").unwrap();
        assert_eq!(other.count("users").unwrap(), 1);
        assert!(other.find_one("users", "7").unwrap().is_some());
    }

    #[test]
    fn test_generated_id() {
        let db = MemoryClient::new().get_database("app").unwrap();
        let id = db.insert_one("events", json!({"kind": "login"})).unwrap();
        assert_eq!(id.len(), 32);
        let stored = db.find_one("events", &id).unwrap().unwrap();
        assert_eq!(stored["_id"], id.as_str());
    }

    #[test]
    fn test_duplicate_id_is_duplicate_key() {
        let db = MemoryClient::new().get_database("app").unwrap();
        db.insert_one("users", json!({"_id": "u1"})).unwrap();
        let err = db.insert_one("users", json!({"_id": "u1"})).unwrap_err();
        assert!(matches!(err, DriverError::DuplicateKey { .. }));
    }

    #[test]
    fn test_non_object_rejected() {
        let db = MemoryClient::new().get_database("app").unwrap();
        let err = db.insert_one("users", json!([1, 2])).unwrap_err();
        assert!(matches!(err, DriverError::Command { .. }));
    }

    #[test]
    fn test_offline_is_network_error() {
        let client = MemoryClient::new();
        let db = client.get_database("app").unwrap();
        client.set_offline(true);
        assert!(matches!(
            db.count("users").unwrap_err(),
            DriverError::Network { .. }
        ));
        assert!(matches!(
            client.get_database("app").unwrap_err(),
            DriverError::Network { .. }
        ));
    }

    #[test]
    fn test_fail_next_open_applies_once() {
        let client = MemoryClient::new();
        client.fail_next_open(DriverError::command("13", "unauthorized"));
        assert!(client.get_database("app").is_err());
        assert!(client.get_database("app").is_ok());
    }

    #[test]
    fn test_request_done_counts_and_fails() {
        let client = MemoryClient::new();
        let db = client.get_database("app").unwrap();
        db.request_done().unwrap();
        assert_eq!(client.requests_done(), 1);
        client.set_fail_request_done(true);
        assert!(db.request_done().is_err());
        assert_eq!(client.requests_done(), 1);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let client = MemoryClient::new();
        assert!(matches!(
            client.get_database("a.b").unwrap_err(),
            DriverError::InvalidName { .. }
        ));
        assert_eq!(client.opened_count(), 0);
    }
}
