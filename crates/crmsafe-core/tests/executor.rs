use async_trait::async_trait;
use crmsafe_core::cache::ResultCache;
use crmsafe_core::config::{FailurePolicy, RateLimitConfig};
use crmsafe_core::executor::{CancelFlag, Executor};
use crmsafe_core::lock::ExecutionLock;
use crmsafe_core::plan::{Action, ActionPlan, ActionType, Change, Confidence, Target};
use crmsafe_core::rate_limiter::RateLimiter;
use crmsafe_core::record::{ActionStatus, ExecutedAction, ExecutionRecord, ExecutionStatus, RecordStore};
use crmsafe_core::remote::{PropertyInfo, RecordClient, RemoteError};
use crmsafe_core::CrmError;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// In-memory CRM
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeCrm {
    values: Mutex<HashMap<(String, String), Value>>,
    schema: Vec<PropertyInfo>,
    /// Action id -> error returned by `apply`.
    failures: Mutex<HashMap<String, RemoteError>>,
    access_error: Option<RemoteError>,
    /// Object id -> error returned by `write_property`.
    write_failures: Mutex<HashMap<String, RemoteError>>,
    /// Every `apply` call, including the ones that fail.
    attempts: Mutex<Vec<String>>,
    /// Set the flag once the named action has been applied.
    cancel_after: Mutex<Option<(String, CancelFlag)>>,
    log: Mutex<Vec<String>>,
    schema_calls: AtomicUsize,
}

impl FakeCrm {
    fn new() -> Self {
        Self {
            schema: vec![
                property("lifecyclestage", false),
                property("phone", false),
                property("hs_marketable_status", false),
                property("hs_object_id", true),
            ],
            ..Self::default()
        }
    }

    fn with_value(self, object_id: &str, property: &str, value: Value) -> Self {
        self.values
            .lock()
            .unwrap()
            .insert((object_id.into(), property.into()), value);
        self
    }

    fn failing(self, action_id: &str, err: RemoteError) -> Self {
        self.failures.lock().unwrap().insert(action_id.into(), err);
        self
    }

    fn failing_write(self, object_id: &str, err: RemoteError) -> Self {
        self.write_failures.lock().unwrap().insert(object_id.into(), err);
        self
    }

    fn attempts(&self, action_id: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == action_id)
            .count()
    }

    fn value(&self, object_id: &str, property: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap()
            .get(&(object_id.to_string(), property.to_string()))
            .cloned()
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn applied(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|l| l.strip_prefix("apply:").map(str::to_string))
            .collect()
    }
}

fn property(name: &str, read_only: bool) -> PropertyInfo {
    PropertyInfo {
        name: name.into(),
        label: name.into(),
        read_only,
    }
}

#[async_trait]
impl RecordClient for FakeCrm {
    async fn check_access(&self) -> Result<(), RemoteError> {
        match &self.access_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn property_schema(&self, _object_type: &str) -> Result<Vec<PropertyInfo>, RemoteError> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.schema.clone())
    }

    async fn read_property(
        &self,
        _object_type: &str,
        object_id: &str,
        property: &str,
    ) -> Result<Value, RemoteError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("read:{object_id}:{property}"));
        Ok(self.value(object_id, property).unwrap_or(Value::Null))
    }

    async fn apply(&self, action: &Action) -> Result<(), RemoteError> {
        self.attempts.lock().unwrap().push(action.id.clone());
        if let Some(e) = self.failures.lock().unwrap().get(&action.id) {
            return Err(e.clone());
        }
        self.log.lock().unwrap().push(format!("apply:{}", action.id));
        if let (Some(p), Some(v)) = (action.property(), &action.change.new_value) {
            self.values
                .lock()
                .unwrap()
                .insert((action.target.object_id.clone(), p.to_string()), v.clone());
        }
        let mut cancel = self.cancel_after.lock().unwrap();
        if let Some((id, flag)) = cancel.as_ref() {
            if *id == action.id {
                flag.cancel();
                *cancel = None;
            }
        }
        Ok(())
    }

    async fn write_property(
        &self,
        _object_type: &str,
        object_id: &str,
        property: &str,
        value: &Value,
    ) -> Result<(), RemoteError> {
        if let Some(e) = self.write_failures.lock().unwrap().get(object_id) {
            return Err(e.clone());
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("write:{object_id}:{property}"));
        self.values
            .lock()
            .unwrap()
            .insert((object_id.into(), property.into()), value.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PORTAL: &str = "portal-1";

fn update(id: &str, object_id: &str, property: &str, new_value: Value) -> Action {
    Action {
        id: id.into(),
        action_type: ActionType::UpdateProperty,
        confidence: Confidence::High,
        target: Target {
            object_type: "contacts".into(),
            object_id: object_id.into(),
            label: String::new(),
        },
        change: Change {
            description: format!("set {property}"),
            property: Some(property.into()),
            current_value: None,
            new_value: Some(new_value),
        },
        reasoning: String::new(),
        reversible: true,
        requires_confirmation: false,
        dependencies: vec![],
    }
}

fn delete(id: &str, object_id: &str) -> Action {
    Action {
        action_type: ActionType::DeleteRecord,
        change: Change {
            description: "remove duplicate".into(),
            ..Change::default()
        },
        reversible: false,
        ..update(id, object_id, "unused", Value::Null)
    }
}

fn depends(mut action: Action, on: &str) -> Action {
    action.dependencies.push(on.into());
    action
}

struct Harness {
    dir: TempDir,
    crm: Arc<FakeCrm>,
    executor: Executor,
}

impl Harness {
    fn store(&self) -> RecordStore {
        RecordStore::new(self.dir.path())
    }
}

fn harness(crm: FakeCrm) -> Harness {
    let dir = TempDir::new().unwrap();
    let crm = Arc::new(crm);
    let client: Arc<dyn RecordClient> = crm.clone();
    let executor = Executor::new(
        client,
        Arc::new(RateLimiter::new(RateLimitConfig::default()).unwrap()),
        Arc::new(ResultCache::new(Duration::from_secs(300))),
        ExecutionLock::new(dir.path(), PORTAL),
        RecordStore::new(dir.path()),
        PORTAL,
    );
    Harness { dir, crm, executor }
}

fn statuses(record: &ExecutionRecord) -> Vec<(&str, ActionStatus)> {
    record
        .actions
        .iter()
        .map(|a| (a.action_id.as_str(), a.status))
        .collect()
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_dependency_skips_dependent_and_continues_independent() {
    let crm = FakeCrm::new().failing("a1", RemoteError::NotFound("contact 1".into()));
    let mut h = harness(crm);
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "lifecyclestage", json!("customer")),
            depends(update("a2", "1", "phone", json!("+1 555")), "a1"),
            update("a3", "3", "lifecyclestage", json!("lead")),
        ],
    );

    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::PartiallyCompleted);
    assert_eq!(
        statuses(&record),
        [
            ("a1", ActionStatus::Failed),
            ("a2", ActionStatus::Skipped),
            ("a3", ActionStatus::Success),
        ]
    );
    assert!(record.actions[0].error.as_deref().unwrap().contains("contact 1"));
    assert_eq!(record.resume_from.as_deref(), Some("a3"));
    assert_eq!(h.crm.applied(), ["a3"]);
    assert!(!h.crm.log().iter().any(|l| l == "read:1:phone"));

    let persisted = h.store().load(&record.id).unwrap();
    assert_eq!(persisted, record);
    assert!(h.executor.current_lock().unwrap().is_none());
}

#[tokio::test]
async fn all_successes_complete_and_clear_checkpoint() {
    let mut h = harness(FakeCrm::new());
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "lifecyclestage", json!("customer")),
            delete("a2", "2"),
        ],
    );
    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.resume_from.is_none());
    assert!(record.completed_at.is_some());
    assert_eq!(record.results.successful, 2);
    assert_eq!(record.results.non_reversible, 1);
    assert_eq!(record.portal_id, PORTAL);
}

#[tokio::test]
async fn rollback_data_present_exactly_for_reversible_successes() {
    let crm = FakeCrm::new().with_value("1", "lifecyclestage", json!("lead"));
    let mut h = harness(crm);
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "lifecyclestage", json!("customer")),
            // Never set remotely: the captured original must still be non-null.
            update("a2", "2", "phone", json!("+1 555")),
            delete("a3", "3"),
        ],
    );
    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();

    for executed in &record.actions {
        assert_eq!(executed.status, ActionStatus::Success);
        match (&executed.rollback_data, executed.is_reversible) {
            (Some(data), true) => assert!(!data.original_value.is_null()),
            (None, false) => {}
            other => panic!("{}: unexpected rollback state {other:?}", executed.action_id),
        }
    }
    let a1 = record.executed("a1").unwrap().rollback_data.as_ref().unwrap();
    assert_eq!(a1.original_value, json!("lead"));
    let a2 = record.executed("a2").unwrap().rollback_data.as_ref().unwrap();
    assert_eq!(a2.original_value, json!(""));

    // The pre-mutation read happens immediately before its write.
    let log = h.crm.log();
    assert_eq!(
        log,
        ["read:1:lifecyclestage", "apply:a1", "read:2:phone", "apply:a2", "apply:a3"]
    );
}

#[tokio::test]
async fn reversible_action_without_property_fails_before_mutation() {
    let mut h = harness(FakeCrm::new());
    let mut a1 = delete("a1", "1");
    a1.reversible = true;
    let plan = ActionPlan::new("audit-1", vec![a1]);
    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.actions[0]
        .error
        .as_deref()
        .unwrap()
        .contains("cannot capture rollback data"));
    assert!(h.crm.applied().is_empty());
}

#[tokio::test]
async fn unknown_or_read_only_properties_are_rejected_without_writing() {
    let mut h = harness(FakeCrm::new());
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "hs_object_id", json!("9")),
            update("a2", "1", "favourite_colour", json!("teal")),
            update("a3", "1", "phone", json!("+1 555")),
        ],
    );
    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(
        statuses(&record),
        [
            ("a1", ActionStatus::Failed),
            ("a2", ActionStatus::Failed),
            ("a3", ActionStatus::Success),
        ]
    );
    assert!(record.actions[0].error.as_deref().unwrap().contains("read-only"));
    assert!(record.actions[1].error.as_deref().unwrap().contains("unknown property"));
    assert_eq!(h.crm.applied(), ["a3"]);
    // One schema fetch served all three checks.
    assert_eq!(h.crm.schema_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.executor.cache_stats().size, 1);
}

#[tokio::test]
async fn unknown_dependency_is_skipped() {
    let mut h = harness(FakeCrm::new());
    let plan = ActionPlan::new(
        "audit-1",
        vec![depends(update("a1", "1", "phone", json!("1")), "elsewhere")],
    );
    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(record.actions[0].status, ActionStatus::Skipped);
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(h.crm.applied().is_empty());
}

#[tokio::test]
async fn abort_policy_stops_at_first_failure() {
    let crm = FakeCrm::new().failing("a2", RemoteError::Conflict("stale".into()));
    let mut h = harness(crm);
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "phone", json!("1")),
            update("a2", "2", "phone", json!("2")),
            update("a3", "3", "phone", json!("3")),
        ],
    );
    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Abort)
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::PartiallyCompleted);
    assert_eq!(record.failure_policy, FailurePolicy::Abort);
    assert_eq!(
        statuses(&record),
        [
            ("a1", ActionStatus::Success),
            ("a2", ActionStatus::Failed),
            ("a3", ActionStatus::Pending),
        ]
    );
    assert!(record.error.as_deref().unwrap().contains("a2"));
    assert_eq!(h.crm.applied(), ["a1"]);
}

#[tokio::test]
async fn remote_rate_limit_fails_the_action_once_without_retry() {
    let crm = FakeCrm::new().failing(
        "a1",
        RemoteError::RateLimited {
            retry_after_secs: Some(10),
        },
    );
    let mut h = harness(crm);
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "phone", json!("1")),
            update("a2", "2", "phone", json!("2")),
        ],
    );

    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();

    assert_eq!(
        statuses(&record),
        [("a1", ActionStatus::Failed), ("a2", ActionStatus::Success)]
    );
    assert!(record.actions[0]
        .error
        .as_deref()
        .unwrap()
        .contains("retry after 10s"));
    assert_eq!(h.crm.attempts("a1"), 1);
    assert_eq!(h.crm.applied(), ["a2"]);
    assert_eq!(record.status, ExecutionStatus::PartiallyCompleted);
    assert!(record.error.is_none());
}

#[tokio::test]
async fn auth_failure_aborts_before_any_mutation() {
    let crm = FakeCrm {
        access_error: Some(RemoteError::Auth("token expired".into())),
        ..FakeCrm::new()
    };
    let mut h = harness(crm);
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "phone", json!("1")),
            update("a2", "2", "phone", json!("2")),
        ],
    );
    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("token expired"));
    assert!(record.actions.iter().all(|a| a.status == ActionStatus::Pending));
    assert!(h.crm.log().is_empty());
    assert_eq!(h.store().load(&record.id).unwrap().status, ExecutionStatus::Failed);
    assert!(h.executor.current_lock().unwrap().is_none());
}

#[tokio::test]
async fn scope_failure_mid_run_ends_the_run() {
    let crm = FakeCrm::new().failing("a2", RemoteError::Scope("crm.objects.contacts.write".into()));
    let mut h = harness(crm);
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "phone", json!("1")),
            update("a2", "2", "phone", json!("2")),
            update("a3", "3", "phone", json!("3")),
        ],
    );
    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(
        statuses(&record),
        [
            ("a1", ActionStatus::Success),
            ("a2", ActionStatus::Failed),
            ("a3", ActionStatus::Pending),
        ]
    );
    assert_eq!(record.status, ExecutionStatus::PartiallyCompleted);
    assert!(record.error.is_some());
}

#[tokio::test]
async fn skip_unconfirmed_leaves_flagged_actions_alone() {
    let h = harness(FakeCrm::new());
    let Harness { dir, crm, executor } = h;
    let mut executor = executor.with_skip_unconfirmed(true);
    let mut flagged = update("a1", "1", "phone", json!("1"));
    flagged.requires_confirmation = true;
    let plan = ActionPlan::new(
        "audit-1",
        vec![flagged, update("a2", "2", "phone", json!("2"))],
    );
    let record = executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(record.actions[0].status, ActionStatus::Skipped);
    assert_eq!(record.actions[0].error.as_deref(), Some("requires confirmation"));
    assert_eq!(crm.applied(), ["a2"]);
    drop(dir);
}

#[tokio::test]
async fn held_lock_fails_fast_without_a_record() {
    let mut h = harness(FakeCrm::new());
    let mut other = ExecutionLock::new(h.dir.path(), PORTAL);
    other.acquire("exec-other").unwrap();

    let plan = ActionPlan::new("audit-1", vec![update("a1", "1", "phone", json!("1"))]);
    let err = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap_err();
    match err {
        CrmError::LockHeld(existing) => assert_eq!(existing.execution_id, "exec-other"),
        other => panic!("expected LockHeld, got {other:?}"),
    }
    assert!(h.store().list().unwrap().is_empty());
    assert!(h.crm.log().is_empty());
}

#[tokio::test]
async fn limiter_capacity_is_returned_after_a_run() {
    let mut h = harness(FakeCrm::new());
    let plan = ActionPlan::new("audit-1", vec![update("a1", "1", "phone", json!("1"))]);
    h.executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    let status = h.executor.rate_limiter_status();
    assert_eq!(status.active_requests, 0);
    assert_eq!(status.queue_size, 0);
    // access check, schema, pre-mutation read, write
    assert_eq!(status.tokens, status.max_tokens - 4);
}

// ---------------------------------------------------------------------------
// Cancellation and resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_run_is_persisted_and_resumable() {
    let mut h = harness(FakeCrm::new());
    let cancel = h.executor.cancel_flag();
    *h.crm.cancel_after.lock().unwrap() = Some(("a1".into(), cancel));

    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "phone", json!("1")),
            update("a2", "2", "phone", json!("2")),
            depends(update("a3", "3", "phone", json!("3")), "a1"),
        ],
    );
    let first = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::PartiallyCompleted);
    assert_eq!(first.resume_from.as_deref(), Some("a1"));
    assert_eq!(first.error.as_deref(), Some("cancelled by operator"));
    assert_eq!(
        statuses(&first),
        [
            ("a1", ActionStatus::Success),
            ("a2", ActionStatus::Pending),
            ("a3", ActionStatus::Pending),
        ]
    );
    assert_eq!(
        h.store().latest_resumable(&plan.id).unwrap().unwrap().id,
        first.id
    );

    let Harness { dir, crm, executor } = h;
    let mut executor = executor.with_cancel_flag(CancelFlag::new());
    let second = executor.resume_execution(&first, &plan).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert_eq!(second.resumed_from.as_deref(), Some(first.id.as_str()));
    assert_eq!(
        statuses(&second),
        [("a2", ActionStatus::Success), ("a3", ActionStatus::Success)]
    );
    assert_eq!(crm.applied(), ["a1", "a2", "a3"]);
    // The prior record on disk is untouched.
    assert_eq!(RecordStore::new(dir.path()).load(&first.id).unwrap(), first);
}

#[tokio::test]
async fn resume_never_re_emits_prior_successes() {
    let mut h = harness(FakeCrm::new());
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "phone", json!("1")),
            update("a2", "2", "phone", json!("2")),
            update("a3", "3", "phone", json!("3")),
            depends(update("a4", "4", "phone", json!("4")), "a2"),
            update("a5", "5", "phone", json!("5")),
        ],
    );

    let mut prior = ExecutionRecord::start(&plan.id, PORTAL, FailurePolicy::Continue);
    for id in ["a1", "a2", "a3"] {
        prior.push(ExecutedAction::success(id, false, None));
    }
    prior.push(ExecutedAction::failed("a4", true, "conflict: stale"));
    prior.push(ExecutedAction::success("a5", false, None));
    prior.finalize(false);
    prior.resume_from = Some("a3".into());

    let record = h.executor.resume_execution(&prior, &plan).await.unwrap();
    assert_eq!(statuses(&record), [("a4", ActionStatus::Success)]);
    for id in ["a1", "a2", "a3", "a5"] {
        assert!(record.executed(id).is_none(), "{id} re-emitted");
    }
    assert_eq!(h.crm.applied(), ["a4"]);
    assert_eq!(record.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn resuming_a_resumed_run_keeps_earlier_successes() {
    let crm = FakeCrm::new().failing("a2", RemoteError::Conflict("stale".into()));
    let mut h = harness(crm);
    let cancel = h.executor.cancel_flag();
    *h.crm.cancel_after.lock().unwrap() = Some(("a1".into(), cancel));
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "phone", json!("1")),
            update("a2", "2", "phone", json!("2")),
            depends(update("a3", "3", "phone", json!("3")), "a1"),
        ],
    );

    let first = h
        .executor
        .execute_plan(&plan, FailurePolicy::Abort)
        .await
        .unwrap();
    assert_eq!(first.resume_from.as_deref(), Some("a1"));

    let Harness { dir, crm, executor } = h;
    let mut executor = executor.with_cancel_flag(CancelFlag::new());
    let second = executor.resume_execution(&first, &plan).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Failed);
    assert_eq!(
        statuses(&second),
        [("a2", ActionStatus::Failed), ("a3", ActionStatus::Pending)]
    );
    assert_eq!(second.resume_from.as_deref(), Some("a1"));
    assert_eq!(second.completed_earlier, ["a1"]);

    crm.failures.lock().unwrap().clear();
    let third = executor.resume_execution(&second, &plan).await.unwrap();
    assert_eq!(third.status, ExecutionStatus::Completed);
    assert_eq!(
        statuses(&third),
        [("a2", ActionStatus::Success), ("a3", ActionStatus::Success)]
    );
    assert_eq!(crm.applied(), ["a1", "a2", "a3"]);
    assert_eq!(crm.attempts("a1"), 1);

    let reloaded = RecordStore::new(dir.path()).load(&second.id).unwrap();
    assert_eq!(reloaded.completed_earlier, ["a1"]);
}

#[tokio::test]
async fn resume_without_checkpoint_starts_from_the_first_action() {
    let crm = FakeCrm::new().failing("a1", RemoteError::NotFound("contact 1".into()));
    let mut h = harness(crm);
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "phone", json!("1")),
            update("a2", "2", "phone", json!("2")),
        ],
    );
    let first = h
        .executor
        .execute_plan(&plan, FailurePolicy::Abort)
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert!(first.resume_from.is_none());
    assert_eq!(
        h.store().latest_resumable(&plan.id).unwrap().unwrap().id,
        first.id
    );

    h.crm.failures.lock().unwrap().clear();
    let second = h.executor.resume_execution(&first, &plan).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert_eq!(h.crm.applied(), ["a1", "a2"]);
}

#[tokio::test]
async fn resume_rejects_mismatched_or_finished_records() {
    let mut h = harness(FakeCrm::new());
    let plan = ActionPlan::new("audit-1", vec![update("a1", "1", "phone", json!("1"))]);

    let other = ExecutionRecord::start("some-other-plan", PORTAL, FailurePolicy::Continue);
    assert!(matches!(
        h.executor.resume_execution(&other, &plan).await,
        Err(CrmError::PlanMismatch { .. })
    ));

    let mut done = ExecutionRecord::start(&plan.id, PORTAL, FailurePolicy::Continue);
    done.push(ExecutedAction::success("a1", false, None));
    done.finalize(false);
    assert!(matches!(
        h.executor.resume_execution(&done, &plan).await,
        Err(CrmError::NothingToResume(_))
    ));

    let mut stray = ExecutionRecord::start(&plan.id, PORTAL, FailurePolicy::Continue);
    stray.push(ExecutedAction::failed("a1", false, "x"));
    stray.finalize(false);
    stray.resume_from = Some("gone".into());
    assert!(matches!(
        h.executor.resume_execution(&stray, &plan).await,
        Err(CrmError::UnknownCheckpoint(id)) if id == "gone"
    ));
    assert!(h.crm.log().is_empty());
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rollback_restores_originals_in_reverse_order() {
    let crm = FakeCrm::new()
        .with_value("1", "lifecyclestage", json!("lead"))
        .with_value("2", "phone", json!("+1 000"));
    let mut h = harness(crm);
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "lifecyclestage", json!("customer")),
            delete("a2", "9"),
            update("a3", "2", "phone", json!("+1 555")),
        ],
    );
    let executed = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(h.crm.value("2", "phone"), Some(json!("+1 555")));

    let rollback = h.executor.rollback_execution(&executed).await.unwrap();
    assert_eq!(rollback.status, ExecutionStatus::Completed);
    assert_eq!(rollback.rollback_of.as_deref(), Some(executed.id.as_str()));
    assert_eq!(rollback.plan_id, executed.plan_id);
    assert_ne!(rollback.id, executed.id);
    assert_eq!(
        statuses(&rollback),
        [("a3", ActionStatus::Success), ("a1", ActionStatus::Success)]
    );
    assert!(rollback
        .actions
        .iter()
        .all(|a| !a.is_reversible && a.rollback_data.is_none()));

    assert_eq!(h.crm.value("1", "lifecyclestage"), Some(json!("lead")));
    assert_eq!(h.crm.value("2", "phone"), Some(json!("+1 000")));
    let writes: Vec<String> = h
        .crm
        .log()
        .into_iter()
        .filter(|l| l.starts_with("write:"))
        .collect();
    assert_eq!(writes, ["write:2:phone", "write:1:lifecyclestage"]);

    // The original record is not modified by the rollback run.
    assert_eq!(h.store().load(&executed.id).unwrap(), executed);
    assert_eq!(h.store().list().unwrap().len(), 2);
}

#[tokio::test]
async fn failed_rollback_step_does_not_stop_the_rest() {
    let crm = FakeCrm::new()
        .with_value("1", "phone", json!("old-1"))
        .with_value("2", "phone", json!("old-2"))
        .with_value("3", "phone", json!("old-3"))
        .failing_write("2", RemoteError::Conflict("record locked".into()));
    let mut h = harness(crm);
    let plan = ActionPlan::new(
        "audit-1",
        vec![
            update("a1", "1", "phone", json!("new-1")),
            update("a2", "2", "phone", json!("new-2")),
            update("a3", "3", "phone", json!("new-3")),
        ],
    );
    let executed = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(executed.status, ExecutionStatus::Completed);

    let rollback = h.executor.rollback_execution(&executed).await.unwrap();
    assert_eq!(
        statuses(&rollback),
        [
            ("a3", ActionStatus::Success),
            ("a2", ActionStatus::Failed),
            ("a1", ActionStatus::Success),
        ]
    );
    assert!(rollback.actions[1]
        .error
        .as_deref()
        .unwrap()
        .contains("record locked"));
    assert_eq!(rollback.status, ExecutionStatus::PartiallyCompleted);
    assert_eq!(h.crm.value("3", "phone"), Some(json!("old-3")));
    assert_eq!(h.crm.value("2", "phone"), Some(json!("new-2")));
    assert_eq!(h.crm.value("1", "phone"), Some(json!("old-1")));
}

#[tokio::test]
async fn rollback_without_reversible_successes_is_an_error() {
    let mut h = harness(FakeCrm::new());
    let plan = ActionPlan::new("audit-1", vec![delete("a1", "1")]);
    let executed = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert!(matches!(
        h.executor.rollback_execution(&executed).await,
        Err(CrmError::NothingToRollback(_))
    ));
}

#[tokio::test]
async fn manual_lock_blocks_runs_until_released() {
    let mut h = harness(FakeCrm::new());
    let plan = ActionPlan::new("audit-1", vec![update("a1", "1", "phone", json!("1"))]);

    let held = h.executor.acquire_lock("maintenance").unwrap();
    assert_eq!(held.portal_id, PORTAL);
    assert!(matches!(
        h.executor.execute_plan(&plan, FailurePolicy::Continue).await,
        Err(CrmError::LockHeld(_))
    ));

    h.executor.release_lock().unwrap();
    assert!(h.executor.current_lock().unwrap().is_none());
    let record = h
        .executor
        .execute_plan(&plan, FailurePolicy::Continue)
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
}
