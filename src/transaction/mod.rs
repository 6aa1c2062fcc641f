//! Transaction synchronization.
//!
//! This module provides the task-local transaction context the resolver
//! builds on:
//! - Resource binding keyed by resource identity
//! - Transaction scopes for sync and async code
//! - Completion callbacks fired when a transaction ends

pub mod context;
pub mod scope;
pub mod synchronization;

pub use context::{
    ResourceKey, TransactionContext, TransactionInfo, bind_resource, current_transaction_id,
    current_transaction_name, has_resource, is_context_bound, is_synchronization_active,
    register_synchronization, unbind_resource, with_current,
};
pub use scope::{
    run_in_transaction, run_in_transaction_async, with_resource_context,
    with_resource_context_async,
};
pub use synchronization::{
    AfterCompletion, CompletionStatus, TransactionSynchronization, after_completion,
};
