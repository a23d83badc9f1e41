//! Execution records: the persisted account of what a run attempted.
//!
//! A record is written when a run starts, rewritten after every action, and
//! finalized when the run ends. Operators review it; resume and rollback runs
//! take it as input. Once its status is terminal it is never mutated again.

use crate::config::FailurePolicy;
use crate::error::{CrmError, Result};
use crate::io::atomic_write;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Success => "success",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::PartiallyCompleted => "partially_completed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RollbackData / ExecutedAction
// ---------------------------------------------------------------------------

/// Pre-mutation state of one property, read immediately before the write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackData {
    pub object_type: String,
    pub object_id: String,
    pub property: String,
    pub original_value: serde_json::Value,
}

/// Outcome of one action within a run.
///
/// `rollback_data` is `Some` exactly when `is_reversible` and the status is
/// `success`. The constructors are the only way this module builds one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedAction {
    pub action_id: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    pub rollback_data: Option<RollbackData>,
    pub is_reversible: bool,
}

impl ExecutedAction {
    pub fn pending(action_id: impl Into<String>, is_reversible: bool) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Pending,
            error: None,
            executed_at: None,
            rollback_data: None,
            is_reversible,
        }
    }

    /// A successful action. Rollback data is kept only for reversible actions.
    pub fn success(
        action_id: impl Into<String>,
        is_reversible: bool,
        rollback_data: Option<RollbackData>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Success,
            error: None,
            executed_at: Some(Utc::now()),
            rollback_data: if is_reversible { rollback_data } else { None },
            is_reversible,
        }
    }

    pub fn failed(action_id: impl Into<String>, is_reversible: bool, error: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Failed,
            error: Some(error.into()),
            executed_at: Some(Utc::now()),
            rollback_data: None,
            is_reversible,
        }
    }

    pub fn skipped(action_id: impl Into<String>, is_reversible: bool, reason: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Skipped,
            error: Some(reason.into()),
            executed_at: None,
            rollback_data: None,
            is_reversible,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionResults / ExecutionRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResults {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Successful actions that cannot be rolled back.
    pub non_reversible: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub plan_id: String,
    #[serde(default)]
    pub portal_id: String,
    pub executed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    pub results: ExecutionResults,
    pub actions: Vec<ExecutedAction>,
    /// Last action that succeeded; a resumed run continues after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<String>,
    /// Why the run stopped early (fatal remote error or cancellation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    /// Actions that succeeded in earlier runs of this resume chain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_earlier: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<String>,
}

impl ExecutionRecord {
    pub fn start(
        plan_id: impl Into<String>,
        portal_id: impl Into<String>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: plan_id.into(),
            portal_id: portal_id.into(),
            executed_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::InProgress,
            failure_policy,
            results: ExecutionResults::default(),
            actions: Vec::new(),
            resume_from: None,
            error: None,
            resumed_from: None,
            completed_earlier: Vec::new(),
            rollback_of: None,
        }
    }

    /// Start a run that continues `prior`.
    ///
    /// The checkpoint and every success of the chain so far carry over, so
    /// resuming this record again never repeats work done two runs back.
    pub fn resume_of(prior: &ExecutionRecord, portal_id: impl Into<String>) -> Self {
        let mut record = Self::start(&prior.plan_id, portal_id, prior.failure_policy);
        record.resumed_from = Some(prior.id.clone());
        record.resume_from = prior.resume_from.clone();
        record.completed_earlier = prior.completed_ids().map(str::to_string).collect();
        record
    }

    /// Append an outcome, keeping counts and the resume checkpoint current.
    pub fn push(&mut self, executed: ExecutedAction) {
        match executed.status {
            ActionStatus::Success => {
                self.results.successful += 1;
                if !executed.is_reversible {
                    self.results.non_reversible += 1;
                }
                self.resume_from = Some(executed.action_id.clone());
            }
            ActionStatus::Failed => self.results.failed += 1,
            ActionStatus::Skipped => self.results.skipped += 1,
            ActionStatus::Pending => {}
        }
        self.actions.push(executed);
    }

    /// Settle the terminal status.
    ///
    /// `completed` only when nothing failed and the run was not cut short;
    /// otherwise `partially_completed` if anything succeeded, else `failed`.
    pub fn finalize(&mut self, interrupted: bool) {
        let status = if self.results.failed == 0 && !interrupted {
            ExecutionStatus::Completed
        } else if self.results.successful > 0 {
            ExecutionStatus::PartiallyCompleted
        } else {
            ExecutionStatus::Failed
        };
        if status == ExecutionStatus::Completed {
            self.resume_from = None;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn executed(&self, action_id: &str) -> Option<&ExecutedAction> {
        self.actions.iter().find(|a| a.action_id == action_id)
    }

    pub fn succeeded(&self, action_id: &str) -> bool {
        self.executed(action_id)
            .is_some_and(|a| a.status == ActionStatus::Success)
    }

    /// Succeeded in this run or an earlier run of the same resume chain.
    pub fn is_done(&self, action_id: &str) -> bool {
        self.completed_earlier.iter().any(|id| id == action_id) || self.succeeded(action_id)
    }

    /// Every action id that has succeeded across the resume chain.
    pub fn completed_ids(&self) -> impl Iterator<Item = &str> {
        self.completed_earlier.iter().map(String::as_str).chain(
            self.actions
                .iter()
                .filter(|a| a.status == ActionStatus::Success)
                .map(|a| a.action_id.as_str()),
        )
    }

    /// Successful reversible actions, in the order they ran.
    pub fn reversible_successes(&self) -> impl DoubleEndedIterator<Item = (&ExecutedAction, &RollbackData)> {
        self.actions.iter().filter_map(|a| match (&a.status, &a.rollback_data) {
            (ActionStatus::Success, Some(data)) => Some((a, data)),
            _ => None,
        })
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Failed | ExecutionStatus::PartiallyCompleted
        )
    }
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

/// Reads and writes execution records under a reports directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: reports_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, execution_id: &str) -> PathBuf {
        paths::record_path(&self.dir, execution_id)
    }

    /// Atomically write `record`, returning the path it was written to.
    pub fn save(&self, record: &ExecutionRecord) -> Result<PathBuf> {
        let path = self.path_for(&record.id);
        let data = serde_json::to_string_pretty(record)?;
        atomic_write(&path, data.as_bytes())?;
        Ok(path)
    }

    pub fn load(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let path = self.path_for(execution_id);
        if !path.exists() {
            return Err(CrmError::RecordNotFound(execution_id.to_string()));
        }
        Self::load_path(&path)
    }

    pub fn load_path(path: &Path) -> Result<ExecutionRecord> {
        if !path.exists() {
            return Err(CrmError::RecordNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// All records in the directory, newest first. Unparsable files are skipped.
    pub fn list(&self) -> Result<Vec<ExecutionRecord>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !paths::is_record_file(&path) {
                continue;
            }
            let data = match std::fs::read_to_string(&path) {
                Ok(d) => d,
                Err(_) => continue,
            };
            match serde_json::from_str::<ExecutionRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        Ok(records)
    }

    /// The newest interrupted run of `plan_id`. A run with no checkpoint
    /// resumes from the first action.
    pub fn latest_resumable(&self, plan_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|r| r.plan_id == plan_id && r.rollback_of.is_none() && r.is_resumable()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
