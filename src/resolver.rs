//! Transactional database handle resolution.
//!
//! Inside an active transaction, the first handle resolved for a connection
//! factory is bound to the transaction and reused by every later call for
//! the same factory; it is released when the transaction completes. Outside a
//! transaction every call opens a fresh handle that the caller owns.

use crate::driver::{ConnectionFactory, DatabaseHandle};
use crate::error::{DataAccessError, DriverError, ResolverError, ResolverResult, TransactionError};
use crate::holder::{DbHolder, HolderSynchronization};
use crate::transaction::{self, ResourceKey, TransactionContext};
use std::error::Error;
use std::sync::Arc;
use tracing::debug;

/// Resolve a handle to `database_name`, creating a non-transactional one if needed.
pub fn get_database<F: ConnectionFactory>(
    factory: &Arc<F>,
    database_name: &str,
) -> ResolverResult<F::Database> {
    do_get_database(factory, database_name, true)
}

/// Resolve a handle to `database_name`.
///
/// With `allow_create == false`, a handle that is not bound to an active
/// transaction is rejected with [`ResolverError::IllegalState`].
pub fn do_get_database<F: ConnectionFactory>(
    factory: &Arc<F>,
    database_name: &str,
    allow_create: bool,
) -> ResolverResult<F::Database> {
    if database_name.is_empty() {
        return Err(ResolverError::precondition("No database name specified"));
    }
    let key = ResourceKey::of(factory);

    match transaction::with_current(|context| reuse_bound::<F>(context, key, database_name)) {
        Ok(Some(db)) => return Ok(db),
        Ok(None) | Err(TransactionError::NoContext) => {}
        Err(e) => {
            debug!(database = %database_name, error = %e, "Transaction context unavailable, not reusing bound handle");
        }
    }

    debug!(database = %database_name, factory = %factory.description(), "Opening database handle");
    let db = factory.get_database(database_name)?;

    // Keep using the same handle for the rest of the transaction; the holder
    // synchronization unbinds and releases it on completion.
    let bound = match transaction::with_current(|context| bind_to_transaction(context, factory, &db)) {
        Ok(bound) => bound,
        Err(TransactionError::NoContext) => false,
        Err(e) => {
            debug!(database = %database_name, error = %e, "Transaction context unavailable, handle not bound");
            false
        }
    };

    if !allow_create && !bound {
        release_database(Some(&db));
        return Err(ResolverError::illegal_state(
            "No database handle bound to the current transaction, and configuration \
             does not allow creation of a non-transactional one here",
        ));
    }

    Ok(db)
}

/// Reuse the handle a bound holder keeps for `database_name`, if allowed.
fn reuse_bound<F: ConnectionFactory>(
    context: &mut TransactionContext,
    key: ResourceKey,
    database_name: &str,
) -> Option<F::Database> {
    if !context.is_synchronization_active() {
        return None;
    }
    let holder = context.resource_mut::<DbHolder<F>>(key)?;
    let db = holder.database(database_name)?.clone();

    if !holder.is_synchronized_with_transaction() {
        debug!(database = %database_name, "Registering transaction synchronization for existing database handle");
        holder.set_synchronized_with_transaction(true);
        register_holder_synchronization::<F>(context, key);
    }

    debug!(database = %database_name, "Reusing transactional database handle");
    Some(db)
}

/// Bind `db` to the active transaction. Returns false if none is active.
fn bind_to_transaction<F: ConnectionFactory>(
    context: &mut TransactionContext,
    factory: &Arc<F>,
    db: &F::Database,
) -> bool {
    if !context.is_synchronization_active() {
        return false;
    }
    let key = ResourceKey::of(factory);

    let newly_synchronized = match context.resource_mut::<DbHolder<F>>(key) {
        Some(holder) => {
            if let Some(displaced) = holder.add_database(db.clone()) {
                release_database(Some(&displaced));
            }
            let first = !holder.is_synchronized_with_transaction();
            holder.set_synchronized_with_transaction(true);
            first
        }
        None => {
            let mut holder = DbHolder::new(Arc::clone(factory), db.clone());
            holder.set_synchronized_with_transaction(true);
            if let Err(e) = context.bind_resource(key, holder) {
                // Something other than a holder is bound under this key.
                debug!(error = %e, "Could not bind database holder");
                return false;
            }
            true
        }
    };

    if newly_synchronized {
        debug!(database = %db.name(), "Registering transaction synchronization for new database handle");
        register_holder_synchronization::<F>(context, key);
    }
    true
}

fn register_holder_synchronization<F: ConnectionFactory>(
    context: &mut TransactionContext,
    key: ResourceKey,
) {
    // Callers only get here with synchronization active.
    if let Err(e) = context.register_synchronization(Box::new(HolderSynchronization::<F>::new(key)))
    {
        debug!(error = %e, "Could not register holder synchronization");
    }
}

/// Whether `db` is bound to the current transaction by `factory`.
///
/// Returns false when `factory` is `None`.
pub fn is_database_transactional<F: ConnectionFactory>(
    db: &F::Database,
    factory: Option<&Arc<F>>,
) -> bool {
    let Some(factory) = factory else {
        return false;
    };
    let key = ResourceKey::of(factory);
    transaction::with_current(|context| {
        context
            .resource::<DbHolder<F>>(key)
            .is_some_and(|holder| holder.contains(db))
    })
    .unwrap_or(false)
}

/// End the current request on `db`, logging and swallowing any failure.
pub fn release_database<D: DatabaseHandle>(db: Option<&D>) {
    let Some(db) = db else {
        return;
    };
    debug!(database = %db.name(), "Releasing database handle");
    if let Err(e) = db.request_done() {
        debug!(database = %db.name(), error = %e, "Unexpected error on releasing database handle");
    }
}

/// Translate a failure into a [`DataAccessError`] if it came from the driver.
///
/// Walks the `source()` chain looking for a [`DriverError`]. Returns `None` for
/// anything else: such failures come from user code and should surface as-is.
pub fn translate_failure(err: &(dyn Error + 'static)) -> Option<DataAccessError> {
    let mut current: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(driver_err) = e.downcast_ref::<DriverError>() {
            return Some(driver_err.clone().into());
        }
        if let Some(translated) = e.downcast_ref::<DataAccessError>() {
            return Some(translated.clone());
        }
        current = e.source();
    }
    None
}
