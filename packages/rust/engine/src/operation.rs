//! The seam between the engine and a pipeline stage.

use std::future::Future;
use std::path::PathBuf;

use newsdigest_shared::{DigestError, WorkItem};

/// Failure of a single attempt, as seen by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// Worth another attempt after backoff.
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help; the item fails immediately.
    #[error("{0}")]
    Permanent(String),
}

impl From<DigestError> for OperationError {
    fn from(err: DigestError) -> Self {
        if err.is_permanent() {
            Self::Permanent(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

/// The unreliable external step applied to each work item.
///
/// Implementations must be safe to call repeatedly for the same item.
pub trait Operation: Send + Sync + 'static {
    /// Process one item, returning its output text.
    fn process(
        &self,
        item: &WorkItem,
    ) -> impl Future<Output = Result<String, OperationError>> + Send;

    /// Where this operation keeps the artifact for `item`, if it writes one.
    ///
    /// Returning `Some` enables the idempotency guard for the item.
    fn artifact_path(&self, _item: &WorkItem) -> Option<PathBuf> {
        None
    }
}
