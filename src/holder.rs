//! Transaction-scoped database handle holder.
//!
//! A [`DbHolder`] is bound into the transaction context under the identity of
//! its connection factory. It keeps at most one handle per database name: the
//! first handle it receives is the default one, handles for other databases
//! are kept by name. [`HolderSynchronization`] unbinds the holder and releases
//! every handle when the transaction completes.

use crate::driver::{ConnectionFactory, DatabaseHandle};
use crate::resolver::release_database;
use crate::transaction::{
    CompletionStatus, ResourceKey, TransactionContext, TransactionSynchronization,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Database handles owned by one transaction for one connection factory.
pub struct DbHolder<F: ConnectionFactory> {
    /// Keeps the factory alive so its [`ResourceKey`] stays unique while bound.
    factory: Arc<F>,
    default_db: Option<F::Database>,
    /// Handles for databases other than the default one, by name
    named: HashMap<String, F::Database>,
    synchronized_with_transaction: bool,
    bound_at: DateTime<Utc>,
}

impl<F: ConnectionFactory> DbHolder<F> {
    pub fn new(factory: Arc<F>, db: F::Database) -> Self {
        Self {
            factory,
            default_db: Some(db),
            named: HashMap::new(),
            synchronized_with_transaction: false,
            bound_at: Utc::now(),
        }
    }

    /// Key this holder is bound under.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::of(&self.factory)
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    pub fn default_database(&self) -> Option<&F::Database> {
        self.default_db.as_ref()
    }

    /// Handle held for the database called `name`, default first.
    pub fn database(&self, name: &str) -> Option<&F::Database> {
        self.default_db
            .as_ref()
            .filter(|db| db.name() == name)
            .or_else(|| self.named.get(name))
    }

    /// Add a handle. The first handle becomes the default.
    ///
    /// Returns the handle previously held for the same database name, which
    /// the caller now owns.
    pub fn add_database(&mut self, db: F::Database) -> Option<F::Database> {
        if self.is_empty() {
            self.default_db = Some(db);
            return None;
        }
        if let Some(default) = self.default_db.as_mut() {
            if default.name() == db.name() {
                return Some(std::mem::replace(default, db));
            }
        }
        self.named.insert(db.name().to_string(), db)
    }

    pub fn is_empty(&self) -> bool {
        self.default_db.is_none() && self.named.is_empty()
    }

    pub fn contains(&self, db: &F::Database) -> bool {
        self.database(db.name())
            .is_some_and(|held| held.same_handle(db))
    }

    pub fn len(&self) -> usize {
        usize::from(self.default_db.is_some()) + self.named.len()
    }

    pub fn is_synchronized_with_transaction(&self) -> bool {
        self.synchronized_with_transaction
    }

    pub fn set_synchronized_with_transaction(&mut self, synchronized: bool) {
        self.synchronized_with_transaction = synchronized;
    }

    pub fn bound_at(&self) -> DateTime<Utc> {
        self.bound_at
    }

    /// Remove and return every handle, default first.
    pub fn take_all(&mut self) -> Vec<F::Database> {
        let mut all: Vec<F::Database> = self.default_db.take().into_iter().collect();
        all.extend(self.named.drain().map(|(_, db)| db));
        all
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for DbHolder<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHolder")
            .field("factory", &self.factory.description())
            .field("handles", &self.len())
            .field(
                "synchronized_with_transaction",
                &self.synchronized_with_transaction,
            )
            .field("bound_at", &self.bound_at)
            .finish()
    }
}

/// Completion callback that unbinds a [`DbHolder`] and releases its handles.
pub struct HolderSynchronization<F: ConnectionFactory> {
    key: ResourceKey,
    released: bool,
    _factory: PhantomData<fn() -> F>,
}

impl<F: ConnectionFactory> HolderSynchronization<F> {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            released: false,
            _factory: PhantomData,
        }
    }

    fn unbind_and_release(&mut self, context: &mut TransactionContext) {
        if self.released {
            return;
        }
        self.released = true;

        let Some(mut holder) = context.unbind_resource::<DbHolder<F>>(self.key) else {
            debug!(key = %self.key, "Holder already unbound");
            return;
        };
        holder.set_synchronized_with_transaction(false);
        let handles = holder.take_all();
        debug!(
            key = %self.key,
            factory = %holder.factory().description(),
            handles = handles.len(),
            "Releasing transactional database handles"
        );
        for db in &handles {
            release_database(Some(db));
        }
    }
}

impl<F: ConnectionFactory> TransactionSynchronization for HolderSynchronization<F> {
    fn before_completion(&mut self, context: &mut TransactionContext) {
        self.unbind_and_release(context);
    }

    fn after_completion(&mut self, context: &mut TransactionContext, status: CompletionStatus) {
        self.unbind_and_release(context);
        debug!(key = %self.key, status = %status, "Database holder synchronization completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryClient;

    fn holder() -> (Arc<MemoryClient>, DbHolder<MemoryClient>) {
        let client = Arc::new(MemoryClient::new());
        let db = client.get_database("app").unwrap();
        let holder = DbHolder::new(Arc::clone(&client), db);
        (client, holder)
    }

    #[test]
    fn test_new_holder_holds_default() {
        let (client, holder) = holder();
        assert!(!holder.is_empty());
        assert_eq!(holder.len(), 1);
        assert!(holder.database("app").is_some());
        assert!(holder.database("audit").is_none());
        assert!(!holder.is_synchronized_with_transaction());
        assert_eq!(holder.key(), ResourceKey::of(&client));
    }

    #[test]
    fn test_add_database_keyed_by_name() {
        let (client, mut holder) = holder();
        let audit = client.get_database("audit").unwrap();
        assert!(holder.add_database(audit.clone()).is_none());
        assert!(holder.contains(&audit));
        assert!(holder.database("audit").unwrap().same_handle(&audit));
        assert_eq!(holder.default_database().unwrap().name(), "app");
        assert_eq!(holder.len(), 2);

        // default still resolves by name after another database was added
        let default = holder.default_database().unwrap().clone();
        assert!(holder.database("app").unwrap().same_handle(&default));
    }

    #[test]
    fn test_add_same_name_returns_displaced_handle() {
        let (client, mut holder) = holder();
        let first_audit = client.get_database("audit").unwrap();
        holder.add_database(first_audit.clone());

        let second_audit = client.get_database("audit").unwrap();
        let displaced = holder.add_database(second_audit.clone()).unwrap();
        assert!(displaced.same_handle(&first_audit));
        assert!(holder.contains(&second_audit));
        assert_eq!(holder.len(), 2);

        let old_default = holder.default_database().unwrap().clone();
        let new_default = client.get_database("app").unwrap();
        let displaced = holder.add_database(new_default.clone()).unwrap();
        assert!(displaced.same_handle(&old_default));
        assert!(holder.default_database().unwrap().same_handle(&new_default));
        assert_eq!(holder.len(), 2);
    }

    #[test]
    fn test_contains_uses_handle_identity() {
        let (client, holder) = holder();
        let default = holder.default_database().unwrap().clone();
        let same_name = client.get_database("app").unwrap();
        assert!(holder.contains(&default));
        assert!(!holder.contains(&same_name));
    }

    #[test]
    fn test_take_all_empties_holder() {
        let (client, mut holder) = holder();
        holder.add_database(client.get_database("audit").unwrap());
        let all = holder.take_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name(), "app");
        assert!(holder.is_empty());

        holder.add_database(client.get_database("next").unwrap());
        assert_eq!(holder.default_database().unwrap().name(), "next");
    }

    #[test]
    fn test_synchronization_releases_once() {
        let (client, holder) = holder();
        let key = holder.key();
        let mut context = TransactionContext::new();
        context.bind_resource(key, holder).unwrap();

        let mut sync = HolderSynchronization::<MemoryClient>::new(key);
        sync.before_completion(&mut context);
        sync.after_completion(&mut context, CompletionStatus::Committed);

        assert!(!context.has_resource(key));
        assert_eq!(client.requests_done(), 1);
    }

    #[test]
    fn test_synchronization_after_completion_alone_releases() {
        let (client, holder) = holder();
        let key = holder.key();
        let mut context = TransactionContext::new();
        context.bind_resource(key, holder).unwrap();

        let mut sync = HolderSynchronization::<MemoryClient>::new(key);
        sync.after_completion(&mut context, CompletionStatus::RolledBack);

        assert!(!context.has_resource(key));
        assert_eq!(client.requests_done(), 1);
    }
}
