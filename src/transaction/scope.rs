//! Transaction and resource scopes.
//!
//! A transaction scope activates synchronization for its body and fires the
//! registered callbacks once the body returns: `Committed` for `Ok`,
//! `RolledBack` for `Err`, `Unknown` if the body panicked or its future was
//! dropped. Nested scopes join the outer transaction.

use crate::transaction::context::{CURRENT, TransactionContext, with_current};
use crate::transaction::synchronization::CompletionStatus;
use std::cell::RefCell;
use std::future::Future;
use tracing::{debug, info, warn};

/// Run `f` inside a transaction named `name`.
pub fn run_in_transaction<T, E, F>(name: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
{
    match with_current(|context| context.begin(name)) {
        Ok(false) => {
            debug!(name = %name, "Joining active transaction");
            f()
        }
        Ok(true) => run_activated(f),
        Err(_) => CURRENT.sync_scope(
            RefCell::new(TransactionContext::with_transaction(name)),
            || run_activated(f),
        ),
    }
}

/// Run `fut` inside a transaction named `name`.
pub async fn run_in_transaction_async<T, E, Fut>(name: &str, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    match with_current(|context| context.begin(name)) {
        Ok(false) => {
            debug!(name = %name, "Joining active transaction");
            fut.await
        }
        Ok(true) => run_activated_async(fut).await,
        Err(_) => {
            CURRENT
                .scope(
                    RefCell::new(TransactionContext::with_transaction(name)),
                    run_activated_async(fut),
                )
                .await
        }
    }
}

/// Run `f` with a context bound but no transaction active.
///
/// Resources bound inside stay visible to nested transaction scopes. Reuses the
/// current context if there is one.
pub fn with_resource_context<R>(f: impl FnOnce() -> R) -> R {
    if crate::transaction::context::is_context_bound() {
        return f();
    }
    CURRENT.sync_scope(RefCell::new(TransactionContext::new()), f)
}

/// Async variant of [`with_resource_context`].
pub async fn with_resource_context_async<Fut: Future>(fut: Fut) -> Fut::Output {
    if crate::transaction::context::is_context_bound() {
        return fut.await;
    }
    CURRENT
        .scope(RefCell::new(TransactionContext::new()), fut)
        .await
}

fn run_activated<T, E>(f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
    let guard = CompletionGuard::started();
    let result = f();
    guard.finish(status_of(&result));
    result
}

async fn run_activated_async<T, E>(fut: impl Future<Output = Result<T, E>>) -> Result<T, E> {
    let guard = CompletionGuard::started();
    let result = fut.await;
    guard.finish(status_of(&result));
    result
}

fn status_of<T, E>(result: &Result<T, E>) -> CompletionStatus {
    if result.is_ok() {
        CompletionStatus::Committed
    } else {
        CompletionStatus::RolledBack
    }
}

/// Completes the transaction with `Unknown` if dropped before `finish`.
struct CompletionGuard {
    armed: bool,
}

impl CompletionGuard {
    fn started() -> Self {
        if let Ok(Some(info)) = with_current(|context| context.transaction().cloned()) {
            info!(transaction_id = %info.id, name = %info.name, "Transaction started");
        }
        Self { armed: true }
    }

    fn finish(mut self, status: CompletionStatus) {
        self.armed = false;
        complete(status);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("Transaction scope left without completing");
            complete(CompletionStatus::Unknown);
        }
    }
}

/// End the active transaction and fire its callbacks.
fn complete(status: CompletionStatus) {
    let outcome = with_current(|context| {
        let Some((info, mut synchronizations)) = context.end() else {
            return;
        };
        for synchronization in synchronizations.iter_mut() {
            synchronization.before_completion(context);
        }
        for synchronization in synchronizations.iter_mut() {
            synchronization.after_completion(context, status);
        }
        let elapsed_ms = (chrono::Utc::now() - info.started_at).num_milliseconds();
        info!(
            transaction_id = %info.id,
            name = %info.name,
            status = %status,
            callbacks = synchronizations.len(),
            elapsed_ms,
            "Transaction completed"
        );
    });

    if let Err(e) = outcome {
        warn!(error = %e, status = %status, "Could not complete transaction");
    }
}
