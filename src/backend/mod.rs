//! Execution backends.
//!
//! A [`Backend`] serves [`IndexPlan`]s: it accepts encoded rows and answers
//! ranked queries. Two implementations exist:
//!
//! - [`InProcessBackend`](memory::InProcessBackend): rows are embedded and
//!   scored in this process; state lives as long as the process.
//! - [`OutOfProcessBackend`](remote::OutOfProcessBackend): a framework server
//!   subprocess owns the indexes; rows and queries travel over HTTP.

pub mod memory;
pub mod remote;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{BackendKind, Config};
use crate::error::RagResult;
use crate::models::{IngestSummary, QueryHit, QueryRequest, Row};
use crate::query::IndexPlan;

pub use memory::InProcessBackend;
pub use remote::OutOfProcessBackend;

/// Rows between ingest progress log lines.
pub const PROGRESS_EVERY: usize = 10;

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Make `plans` (every known index) servable.
    ///
    /// With `restart`, the backend reloads its configuration even when it is
    /// already serving (an index was added or replaced). Returns the names of
    /// indexes whose rows are not present and must be ingested again.
    async fn deploy(&self, plans: &[IndexPlan], restart: bool) -> RagResult<Vec<String>>;

    /// Ingest rows into one index. Row failures are counted, not fatal.
    async fn ingest(&self, plan: &IndexPlan, rows: &[Row]) -> RagResult<IngestSummary>;

    /// Ranked results for one query, best first, at most `request.limit`.
    async fn query(&self, plan: &IndexPlan, request: &QueryRequest) -> RagResult<Vec<QueryHit>>;

    /// Forget an index's rows held by this backend.
    async fn remove(&self, index_name: &str) -> RagResult<()>;
}

/// Construct the configured backend.
pub fn create_backend(config: &Config) -> Arc<dyn Backend> {
    match config.backend.kind {
        BackendKind::InProcess => Arc::new(InProcessBackend::new(config.embedding.clone())),
        BackendKind::OutOfProcess => Arc::new(OutOfProcessBackend::new(config)),
    }
}
