//! One-statement extraction across every file of a stage.

use crate::ai::AiService;
use crate::prompts::PromptSchema;
use crate::retry::{run_with_policy, RetryError, RetryPolicy};
use crate::table::ResultTable;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub table: ResultTable,
    /// Files that returned at least one answer.
    pub answered: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SweepSummary {
    pub files: usize,
    pub answered: usize,
    pub columns: usize,
}

impl SweepOutcome {
    pub fn summary(&self) -> SweepSummary {
        SweepSummary {
            files: self.table.len(),
            answered: self.answered,
            columns: self.table.columns().len(),
        }
    }
}

/// Extract every file of `stage` in a single call and fold the answers into
/// a table, rows in the order the service listed them.
pub async fn sweep_stage(
    ai: &dyn AiService,
    stage: &str,
    prompts: &PromptSchema,
    policy: &RetryPolicy,
) -> Result<SweepOutcome, RetryError> {
    let results = run_with_policy("stage sweep", policy, |_| ai.extract_stage(stage, prompts)).await?;

    let mut table = ResultTable::new(results.iter().map(|(path, _)| path.as_str()));
    let mut answered = 0;
    for (path, output) in &results {
        if !output.answers.is_empty() {
            answered += 1;
        }
        table.merge(path, &output.answers);
    }

    info!(
        "Swept @{}: {} files, {} with answers, {} columns",
        stage,
        table.len(),
        answered,
        table.columns().len()
    );
    Ok(SweepOutcome { table, answered })
}
