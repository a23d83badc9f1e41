//! Plan execution: the per-action state machine that drives a run.
//!
//! An [`Executor`] owns the run-scoped resources (the execution lock, a
//! handle to the shared rate limiter and schema cache, the record store) and
//! applies an [`ActionPlan`] in plan order. Every run holds the lock for its
//! whole duration, checks credentials once before the first mutation, and
//! persists its [`ExecutionRecord`] at start, after every action, and when it
//! finishes.
//!
//! Per-action remote failures are folded into the record and never returned
//! as `Err`. Only conditions that prevent the run from starting (lock held,
//! lock I/O, a malformed plan) or from persisting its record are errors.

mod rollback;

use crate::cache::{CacheStats, ResultCache};
use crate::config::{Config, FailurePolicy};
use crate::error::{CrmError, Result};
use crate::lock::{ExecutionLock, LockRecord};
use crate::plan::{Action, ActionPlan};
use crate::rate_limiter::{LimiterStatus, RateLimiter};
use crate::record::{
    ActionStatus, ExecutedAction, ExecutionRecord, ExecutionStatus, RecordStore, RollbackData,
};
use crate::remote::{PropertyInfo, RecordClient, RemoteError};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Instrument;

// ---------------------------------------------------------------------------
// CancelFlag
// ---------------------------------------------------------------------------

/// Operator interrupt, checked between actions.
///
/// Setting it never preempts a remote call already issued; the run stops
/// before the next action and persists what it has.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    ctx: RunContext,
    lock: ExecutionLock,
}

/// Everything a run reads while the lock is held.
struct RunContext {
    client: Arc<dyn RecordClient>,
    limiter: Arc<RateLimiter>,
    schemas: Arc<ResultCache<Vec<PropertyInfo>>>,
    store: RecordStore,
    portal_id: String,
    skip_unconfirmed: bool,
    cancel: CancelFlag,
}

impl Executor {
    pub fn new(
        client: Arc<dyn RecordClient>,
        limiter: Arc<RateLimiter>,
        schemas: Arc<ResultCache<Vec<PropertyInfo>>>,
        lock: ExecutionLock,
        store: RecordStore,
        portal_id: impl Into<String>,
    ) -> Self {
        Self {
            ctx: RunContext {
                client,
                limiter,
                schemas,
                store,
                portal_id: portal_id.into(),
                skip_unconfirmed: false,
                cancel: CancelFlag::new(),
            },
            lock,
        }
    }

    /// Build an executor from loaded config. Starts the limiter's refill
    /// timer, so this must run inside a Tokio runtime.
    pub fn from_config(config: &Config, root: &Path, client: Arc<dyn RecordClient>) -> Result<Self> {
        let reports = config.reports_path(root);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone())?);
        let schemas = Arc::new(ResultCache::new(config.cache.ttl()));
        let lock = ExecutionLock::with_expiry(&reports, &config.portal_id, config.lock.expiry());
        Ok(Self::new(
            client,
            limiter,
            schemas,
            lock,
            RecordStore::new(reports),
            &config.portal_id,
        )
        .with_skip_unconfirmed(config.execution.skip_unconfirmed))
    }

    /// Record actions flagged `requires_confirmation` as skipped instead of
    /// running them.
    pub fn with_skip_unconfirmed(mut self, skip: bool) -> Self {
        self.ctx.skip_unconfirmed = skip;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.ctx.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.ctx.cancel.clone()
    }

    pub fn store(&self) -> &RecordStore {
        &self.ctx.store
    }

    pub fn portal_id(&self) -> &str {
        &self.ctx.portal_id
    }

    // -- Lock -------------------------------------------------------------

    /// Take the portal lock outside of a run. Runs take it themselves; this
    /// is for callers that need to hold the portal across several steps.
    pub fn acquire_lock(&mut self, execution_id: &str) -> Result<LockRecord> {
        self.lock.acquire(execution_id)
    }

    pub fn release_lock(&mut self) -> Result<()> {
        self.lock.release()
    }

    pub fn current_lock(&self) -> Result<Option<LockRecord>> {
        self.lock.current_lock()
    }

    // -- Runs -------------------------------------------------------------

    /// Apply `plan` from the first action.
    pub async fn execute_plan(
        &mut self,
        plan: &ActionPlan,
        policy: FailurePolicy,
    ) -> Result<ExecutionRecord> {
        plan.validate()?;
        let record = ExecutionRecord::start(&plan.id, &self.ctx.portal_id, policy);
        let span = tracing::info_span!("execution", execution_id = %record.id, plan_id = %plan.id);

        let _guard = self.lock.hold(&record.id)?;
        self.ctx
            .run(plan, record, 0)
            .instrument(span)
            .await
    }

    /// Continue an interrupted run after its checkpoint.
    ///
    /// The new record holds only the actions this run emits. Actions that
    /// succeeded anywhere in `prior`'s resume chain are never emitted again,
    /// and count as satisfied dependencies.
    pub async fn resume_execution(
        &mut self,
        prior: &ExecutionRecord,
        plan: &ActionPlan,
    ) -> Result<ExecutionRecord> {
        if prior.plan_id != plan.id {
            return Err(CrmError::PlanMismatch {
                expected: plan.id.clone(),
                found: prior.plan_id.clone(),
            });
        }
        if prior.rollback_of.is_some() {
            return Err(CrmError::NothingToResume(format!(
                "execution '{}' is a rollback run",
                prior.id
            )));
        }
        if prior.status == ExecutionStatus::Completed {
            return Err(CrmError::NothingToResume(format!(
                "execution '{}' already completed",
                prior.id
            )));
        }
        plan.validate()?;

        let start = match prior.resume_from.as_deref() {
            Some(checkpoint) => {
                plan.position(checkpoint)
                    .ok_or_else(|| CrmError::UnknownCheckpoint(checkpoint.to_string()))?
                    + 1
            }
            None => 0,
        };

        let record = ExecutionRecord::resume_of(prior, &self.ctx.portal_id);
        let span = tracing::info_span!(
            "execution",
            execution_id = %record.id,
            plan_id = %plan.id,
            resumed_from = %prior.id
        );

        let _guard = self.lock.hold(&record.id)?;
        self.ctx
            .run(plan, record, start)
            .instrument(span)
            .await
    }

    // -- Probes -----------------------------------------------------------

    pub fn rate_limiter_status(&self) -> LimiterStatus {
        self.ctx.limiter.status()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.ctx.schemas.stats()
    }

    /// Tear down the rate limiter, rejecting any queued callers.
    pub fn shutdown(&self) {
        self.ctx.limiter.destroy();
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

impl RunContext {
    async fn run(
        &self,
        plan: &ActionPlan,
        mut record: ExecutionRecord,
        start: usize,
    ) -> Result<ExecutionRecord> {
        tracing::info!(
            actions = plan.actions.len().saturating_sub(start),
            policy = %record.failure_policy,
            "execution started"
        );
        self.store.save(&record)?;

        if let Err(e) = self.check_access().await {
            tracing::error!(error = %e, "access check failed; no actions attempted");
            record.error = Some(e.to_string());
            for action in plan.actions.iter().skip(start) {
                if !record.is_done(&action.id) {
                    record.push(ExecutedAction::pending(&action.id, action.reversible));
                }
            }
            return self.finish(record, true);
        }

        let mut interrupted = false;
        for action in plan.actions.iter().skip(start) {
            if record.is_done(&action.id) {
                tracing::debug!(action_id = %action.id, "already succeeded in an earlier run");
                continue;
            }
            if !interrupted && self.cancel.is_cancelled() {
                tracing::warn!(action_id = %action.id, "execution cancelled by operator");
                record.error = Some("cancelled by operator".into());
                interrupted = true;
            }
            if interrupted {
                record.push(ExecutedAction::pending(&action.id, action.reversible));
                continue;
            }

            let executed = match self.blocked_reason(action, &record) {
                Some(reason) => {
                    tracing::info!(action_id = %action.id, %reason, "action skipped");
                    ExecutedAction::skipped(&action.id, action.reversible, reason)
                }
                None => match self.run_action(action).await {
                    Ok(executed) => executed,
                    Err(e) => {
                        tracing::error!(action_id = %action.id, error = %e, "run aborted");
                        record.error = Some(format!("run aborted at action '{}': {e}", action.id));
                        interrupted = true;
                        ExecutedAction::failed(&action.id, action.reversible, e.to_string())
                    }
                },
            };

            let failed = executed.status == ActionStatus::Failed;
            record.push(executed);
            if failed && !interrupted && record.failure_policy == FailurePolicy::Abort {
                tracing::warn!(action_id = %action.id, "aborting after failed action");
                record.error = Some(format!("aborted after action '{}' failed", action.id));
                interrupted = true;
            }
            self.store.save(&record)?;
        }

        self.finish(record, interrupted)
    }

    fn finish(&self, mut record: ExecutionRecord, interrupted: bool) -> Result<ExecutionRecord> {
        record.finalize(interrupted);
        let path = self.store.save(&record)?;
        tracing::info!(
            status = %record.status,
            successful = record.results.successful,
            failed = record.results.failed,
            skipped = record.results.skipped,
            record = %path.display(),
            "execution finished"
        );
        Ok(record)
    }

    /// Why `action` may not run, if anything blocks it.
    fn blocked_reason(
        &self,
        action: &Action,
        record: &ExecutionRecord,
    ) -> Option<String> {
        if self.skip_unconfirmed && action.requires_confirmation {
            return Some("requires confirmation".into());
        }
        action
            .dependencies
            .iter()
            .find(|dep| !record.is_done(dep))
            .map(|dep| format!("dependency '{dep}' did not succeed"))
    }

    /// Run one eligible action. `Ok` carries the per-action outcome, success
    /// or failure; `Err` is a condition that ends the whole run.
    async fn run_action(&self, action: &Action) -> Result<ExecutedAction> {
        match self.apply(action).await {
            Ok(rollback) => {
                tracing::info!(
                    action_id = %action.id,
                    action_type = %action.action_type,
                    object_id = %action.target.object_id,
                    "action applied"
                );
                Ok(ExecutedAction::success(&action.id, action.reversible, rollback))
            }
            Err(CrmError::Remote(e)) if !e.is_fatal() => {
                tracing::warn!(
                    action_id = %action.id,
                    kind = e.kind(),
                    error = %e,
                    "action failed"
                );
                Ok(ExecutedAction::failed(&action.id, action.reversible, e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn apply(&self, action: &Action) -> Result<Option<RollbackData>> {
        let target = &action.target;
        let property = action.property();

        if action.action_type.writes_property() {
            let property = property.ok_or_else(|| {
                RemoteError::Validation(format!("{} action names no property", action.action_type))
            })?;
            self.check_writable(&target.object_type, property).await?;
        }

        // Capture immediately before the paired write, never batched.
        let rollback = if action.reversible {
            let property = property.ok_or_else(|| {
                RemoteError::Validation("cannot capture rollback data: no property named".into())
            })?;
            let mut original_value = self
                .call(|| {
                    self.client
                        .read_property(&target.object_type, &target.object_id, property)
                })
                .await?;
            if original_value.is_null() {
                original_value = serde_json::Value::String(String::new());
            }
            Some(RollbackData {
                object_type: target.object_type.clone(),
                object_id: target.object_id.clone(),
                property: property.to_string(),
                original_value,
            })
        } else {
            None
        };

        self.call(|| self.client.apply(action)).await?;
        Ok(rollback)
    }

    async fn check_writable(&self, object_type: &str, property: &str) -> Result<()> {
        let key = format!("schema:{object_type}");
        let schema = self
            .schemas
            .get_or_insert_with(&key, || {
                self.call(|| self.client.property_schema(object_type))
            })
            .await?;
        match schema.iter().find(|p| p.name == property) {
            None => Err(RemoteError::Validation(format!(
                "unknown property '{property}' on {object_type}"
            ))
            .into()),
            Some(p) if p.read_only => Err(RemoteError::Validation(format!(
                "property '{property}' on {object_type} is read-only"
            ))
            .into()),
            Some(_) => Ok(()),
        }
    }

    async fn check_access(&self) -> Result<()> {
        self.call(|| self.client.check_access()).await
    }

    /// One remote round trip under the rate limiter.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        self.limiter
            .execute(|| async move { op().await.map_err(CrmError::from) })
            .await
    }
}
