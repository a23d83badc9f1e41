use super::{Executor, RunContext};
use crate::config::FailurePolicy;
use crate::error::{CrmError, Result};
use crate::record::{ExecutedAction, ExecutionRecord, RollbackData};
use tracing::Instrument;

impl Executor {
    /// Undo the reversible successes of `record`, newest first.
    ///
    /// Produces a new record with `rollback_of` set; `record` itself is left
    /// untouched. Each step is recorded under the original action id and is
    /// not itself reversible. A failed step does not stop the others.
    pub async fn rollback_execution(&mut self, record: &ExecutionRecord) -> Result<ExecutionRecord> {
        let steps: Vec<(String, RollbackData)> = record
            .reversible_successes()
            .rev()
            .map(|(executed, data)| (executed.action_id.clone(), data.clone()))
            .collect();
        if steps.is_empty() {
            return Err(CrmError::NothingToRollback(format!(
                "execution '{}' has no reversible successes",
                record.id
            )));
        }

        let mut rollback =
            ExecutionRecord::start(&record.plan_id, &self.ctx.portal_id, FailurePolicy::Continue);
        rollback.rollback_of = Some(record.id.clone());
        let span = tracing::info_span!(
            "rollback",
            execution_id = %rollback.id,
            rollback_of = %record.id
        );

        let _guard = self.lock.hold(&rollback.id)?;
        self.ctx.run_rollback(rollback, steps).instrument(span).await
    }
}

impl RunContext {
    async fn run_rollback(
        &self,
        mut record: ExecutionRecord,
        steps: Vec<(String, RollbackData)>,
    ) -> Result<ExecutionRecord> {
        tracing::info!(steps = steps.len(), "rollback started");
        self.store.save(&record)?;

        if let Err(e) = self.check_access().await {
            tracing::error!(error = %e, "access check failed; nothing rolled back");
            record.error = Some(e.to_string());
            for (action_id, _) in &steps {
                record.push(ExecutedAction::pending(action_id, false));
            }
            return self.finish(record, true);
        }

        let mut interrupted = false;
        for (action_id, data) in &steps {
            if !interrupted && self.cancel.is_cancelled() {
                tracing::warn!(%action_id, "rollback cancelled by operator");
                record.error = Some("cancelled by operator".into());
                interrupted = true;
            }
            if interrupted {
                record.push(ExecutedAction::pending(action_id, false));
                continue;
            }

            let result = self
                .call(|| {
                    self.client.write_property(
                        &data.object_type,
                        &data.object_id,
                        &data.property,
                        &data.original_value,
                    )
                })
                .await;
            let executed = match result {
                Ok(()) => {
                    tracing::info!(
                        %action_id,
                        object_id = %data.object_id,
                        property = %data.property,
                        "restored original value"
                    );
                    ExecutedAction::success(action_id, false, None)
                }
                Err(CrmError::Remote(e)) if !e.is_fatal() => {
                    tracing::warn!(
                        %action_id,
                        kind = e.kind(),
                        error = %e,
                        "rollback step failed"
                    );
                    ExecutedAction::failed(action_id, false, e.to_string())
                }
                Err(e) => {
                    tracing::error!(%action_id, error = %e, "rollback aborted");
                    record.error = Some(format!("rollback aborted at action '{action_id}': {e}"));
                    interrupted = true;
                    ExecutedAction::failed(action_id, false, e.to_string())
                }
            };
            record.push(executed);
            self.store.save(&record)?;
        }

        self.finish(record, interrupted)
    }
}
