//! Completion callbacks for transactions.

use crate::transaction::context::TransactionContext;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Committed,
    RolledBack,
    /// The scope was left by a panic or by dropping its future.
    Unknown,
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Callback fired when the transaction it was registered with completes.
///
/// Callbacks receive the context directly and must use it instead of the
/// free functions in [`crate::transaction`], which report
/// [`ContextBusy`](crate::error::TransactionError::ContextBusy) while
/// callbacks run.
pub trait TransactionSynchronization: Send {
    /// Runs before any `after_completion`, for every registered callback.
    fn before_completion(&mut self, _context: &mut TransactionContext) {}

    fn after_completion(&mut self, _context: &mut TransactionContext, _status: CompletionStatus) {}
}

/// Adapter turning a closure into an `after_completion` callback.
pub struct AfterCompletion<F>(F);

/// Wrap a closure as a [`TransactionSynchronization`].
pub fn after_completion<F>(f: F) -> AfterCompletion<F>
where
    F: FnMut(&mut TransactionContext, CompletionStatus) + Send,
{
    AfterCompletion(f)
}

impl<F> TransactionSynchronization for AfterCompletion<F>
where
    F: FnMut(&mut TransactionContext, CompletionStatus) + Send,
{
    fn after_completion(&mut self, context: &mut TransactionContext, status: CompletionStatus) {
        (self.0)(context, status)
    }
}
