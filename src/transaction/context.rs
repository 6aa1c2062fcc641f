//! Task-local transaction context.
//!
//! A [`TransactionContext`] carries the resources bound to the current task
//! and, while a transaction is active, the completion callbacks registered
//! against it. It is installed with `tokio::task_local!`, so sync code (via
//! `sync_scope`) and async code (via `scope`) share one mechanism. Contexts are
//! never shared between tasks, so nothing here locks.

use crate::error::{TransactionError, TransactionResult};
use crate::transaction::synchronization::TransactionSynchronization;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

tokio::task_local! {
    pub(crate) static CURRENT: RefCell<TransactionContext>;
}

/// Identity of a shared resource, used as the binding key.
///
/// Two keys are equal iff they were taken from the same allocation. Whoever
/// binds under a key should keep the `Arc` alive while bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey(usize);

impl ResourceKey {
    pub fn of<T: ?Sized>(resource: &Arc<T>) -> Self {
        Self(Arc::as_ptr(resource) as *const () as usize)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "resource@{:#x}", self.0)
    }
}

/// Metadata about the active transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    /// Unique transaction identifier
    pub id: String,
    /// Name given when the transaction was started
    pub name: String,
    /// When the transaction started
    pub started_at: DateTime<Utc>,
}

struct ActiveTransaction {
    info: TransactionInfo,
    synchronizations: Vec<Box<dyn TransactionSynchronization>>,
}

/// Per-task resource and synchronization state.
pub struct TransactionContext {
    resources: HashMap<ResourceKey, Box<dyn Any + Send>>,
    active: Option<ActiveTransaction>,
}

impl TransactionContext {
    /// A context with no active transaction.
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
            active: None,
        }
    }

    /// A context with a freshly started transaction.
    pub(crate) fn with_transaction(name: &str) -> Self {
        let mut context = Self::new();
        context.begin(name);
        context
    }

    /// Start a transaction unless one is already active.
    ///
    /// Returns true if a new transaction was started, false if the caller joins
    /// the active one.
    pub(crate) fn begin(&mut self, name: &str) -> bool {
        if self.active.is_some() {
            return false;
        }
        self.active = Some(ActiveTransaction {
            info: TransactionInfo {
                id: generate_transaction_id(),
                name: name.to_string(),
                started_at: Utc::now(),
            },
            synchronizations: Vec::new(),
        });
        true
    }

    /// End the active transaction, handing back its callbacks in registration order.
    pub(crate) fn end(
        &mut self,
    ) -> Option<(TransactionInfo, Vec<Box<dyn TransactionSynchronization>>)> {
        self.active
            .take()
            .map(|active| (active.info, active.synchronizations))
    }

    pub fn is_synchronization_active(&self) -> bool {
        self.active.is_some()
    }

    /// Metadata of the active transaction, if any.
    pub fn transaction(&self) -> Option<&TransactionInfo> {
        self.active.as_ref().map(|active| &active.info)
    }

    /// Register a callback for the completion of the active transaction.
    pub fn register_synchronization(
        &mut self,
        synchronization: Box<dyn TransactionSynchronization>,
    ) -> TransactionResult<()> {
        let active = self
            .active
            .as_mut()
            .ok_or(TransactionError::SynchronizationInactive)?;
        active.synchronizations.push(synchronization);
        Ok(())
    }

    /// Number of callbacks registered with the active transaction.
    pub fn synchronization_count(&self) -> usize {
        self.active
            .as_ref()
            .map_or(0, |active| active.synchronizations.len())
    }

    pub fn has_resource(&self, key: ResourceKey) -> bool {
        self.resources.contains_key(&key)
    }

    /// Resource bound under `key`, if it is a `T`.
    pub fn resource<T: 'static>(&self, key: ResourceKey) -> Option<&T> {
        self.resources.get(&key)?.downcast_ref::<T>()
    }

    /// Mutable resource bound under `key`, if it is a `T`.
    pub fn resource_mut<T: 'static>(&mut self, key: ResourceKey) -> Option<&mut T> {
        self.resources.get_mut(&key)?.downcast_mut::<T>()
    }

    /// Bind `value` under `key`. Fails if something is already bound there.
    pub fn bind_resource<T: Send + 'static>(
        &mut self,
        key: ResourceKey,
        value: T,
    ) -> TransactionResult<()> {
        if self.resources.contains_key(&key) {
            return Err(TransactionError::ResourceAlreadyBound {
                key: key.to_string(),
            });
        }
        self.resources.insert(key, Box::new(value));
        Ok(())
    }

    /// Remove and return the `T` bound under `key`.
    ///
    /// A resource of another type stays bound and `None` is returned.
    pub fn unbind_resource<T: 'static>(&mut self, key: ResourceKey) -> Option<T> {
        let boxed = self.resources.remove(&key)?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(boxed) => {
                self.resources.insert(key, boxed);
                None
            }
        }
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("resources", &self.resources.len())
            .field("transaction", &self.transaction())
            .field("synchronizations", &self.synchronization_count())
            .finish()
    }
}

/// Run `f` against the context bound to the current task.
///
/// Fails with [`TransactionError::NoContext`] outside any scope, and with
/// [`TransactionError::ContextBusy`] when called from a completion callback.
pub fn with_current<R>(f: impl FnOnce(&mut TransactionContext) -> R) -> TransactionResult<R> {
    CURRENT
        .try_with(|cell| {
            let mut context = cell
                .try_borrow_mut()
                .map_err(|_| TransactionError::ContextBusy)?;
            Ok(f(&mut context))
        })
        .map_err(|_| TransactionError::NoContext)?
}

/// Whether the current task runs inside any context.
pub fn is_context_bound() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}

/// Whether a transaction is active for the current task.
pub fn is_synchronization_active() -> bool {
    with_current(|context| context.is_synchronization_active()).unwrap_or(false)
}

/// Id of the active transaction, if any.
pub fn current_transaction_id() -> Option<String> {
    with_current(|context| context.transaction().map(|info| info.id.clone()))
        .ok()
        .flatten()
}

/// Name of the active transaction, if any.
pub fn current_transaction_name() -> Option<String> {
    with_current(|context| context.transaction().map(|info| info.name.clone()))
        .ok()
        .flatten()
}

/// Whether anything is bound under `key` in the current context.
pub fn has_resource(key: ResourceKey) -> bool {
    with_current(|context| context.has_resource(key)).unwrap_or(false)
}

/// Bind `value` under `key` in the current context.
pub fn bind_resource<T: Send + 'static>(key: ResourceKey, value: T) -> TransactionResult<()> {
    with_current(|context| context.bind_resource(key, value))?
}

/// Remove and return the `T` bound under `key` in the current context.
pub fn unbind_resource<T: 'static>(key: ResourceKey) -> TransactionResult<Option<T>> {
    with_current(|context| context.unbind_resource::<T>(key))
}

/// Register a completion callback with the active transaction.
pub fn register_synchronization(
    synchronization: Box<dyn TransactionSynchronization>,
) -> TransactionResult<()> {
    with_current(|context| context.register_synchronization(synchronization))?
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
