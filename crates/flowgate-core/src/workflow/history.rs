//! Append-only step history of one running execution.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::models::execution::{record_latest, StepOutcome, StepResults};
use crate::store::Storage;

/// Serialises outcome appends for one execution.
///
/// An outcome is written to storage first; the in-memory `step_results`
/// view only changes once that write succeeded, so readers never see an
/// outcome that is not durable.
pub struct ExecutionHistory {
    execution_id: String,
    storage: Arc<dyn Storage>,
    results: Mutex<StepResults>,
}

impl ExecutionHistory {
    pub fn new(execution_id: &str, storage: Arc<dyn Storage>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            storage,
            results: Mutex::new(StepResults::new()),
        }
    }

    pub async fn append(&self, outcome: StepOutcome) -> Result<(), EngineError> {
        let mut results = self.results.lock().await;
        self.storage
            .append_step_outcome(&self.execution_id, &outcome)
            .await?;
        tracing::debug!(
            "[Scheduler:{}] {} -> {} (attempt {})",
            self.execution_id,
            outcome.step_id,
            outcome.status.as_str(),
            outcome.attempt
        );
        record_latest(&mut results, outcome);
        Ok(())
    }

    /// Latest outcome per step, in append order.
    pub async fn results(&self) -> StepResults {
        self.results.lock().await.clone()
    }
}
