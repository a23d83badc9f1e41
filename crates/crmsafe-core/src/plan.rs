//! Action plans: the reviewed list of changes an execution run applies.
//!
//! Plans are produced upstream (rule-based and assisted detection) and are
//! consumed read-only here. Execution order is plan order.

use crate::error::{CrmError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

/// Property written by `set-marketing-status` when the change names none.
pub const MARKETING_STATUS_PROPERTY: &str = "hs_marketable_status";

// ---------------------------------------------------------------------------
// ActionType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    UpdateProperty,
    DeleteRecord,
    MergeRecords,
    RemoveFromList,
    SetMarketingStatus,
    CreateAssociation,
}

impl ActionType {
    pub fn all() -> &'static [ActionType] {
        &[
            ActionType::UpdateProperty,
            ActionType::DeleteRecord,
            ActionType::MergeRecords,
            ActionType::RemoveFromList,
            ActionType::SetMarketingStatus,
            ActionType::CreateAssociation,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::UpdateProperty => "update-property",
            ActionType::DeleteRecord => "delete-record",
            ActionType::MergeRecords => "merge-records",
            ActionType::RemoveFromList => "remove-from-list",
            ActionType::SetMarketingStatus => "set-marketing-status",
            ActionType::CreateAssociation => "create-association",
        }
    }

    /// Actions that write a single property value, and so can be checked
    /// against the property schema before the write.
    pub fn writes_property(self) -> bool {
        matches!(
            self,
            ActionType::UpdateProperty | ActionType::SetMarketingStatus
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = CrmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ActionType::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CrmError::InvalidPlan(format!("unknown action type '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Confidence {
    type Err = CrmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            _ => Err(CrmError::InvalidPlan(format!("unknown confidence '{s}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Target / Change
// ---------------------------------------------------------------------------

/// The remote record an action touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Remote object type, e.g. `contacts` or `companies`.
    pub object_type: String,
    pub object_id: String,
    /// Display label for operator review (e.g. a contact's email).
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub confidence: Confidence,
    pub target: Target,
    pub change: Change,
    #[serde(default)]
    pub reasoning: String,
    pub reversible: bool,
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Ids of actions that must succeed before this one may run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl Action {
    /// The property this action reads and writes, if any.
    pub fn property(&self) -> Option<&str> {
        match (self.change.property.as_deref(), self.action_type) {
            (Some(p), _) => Some(p),
            (None, ActionType::SetMarketingStatus) => Some(MARKETING_STATUS_PROPERTY),
            (None, _) => None,
        }
    }

    /// Remote calls this action costs: one write, plus the pre-mutation read
    /// when rollback data must be captured.
    pub fn estimated_api_calls(&self) -> usize {
        if self.reversible {
            2
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// PlanSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    #[serde(default)]
    pub total_actions: usize,
    #[serde(default)]
    pub by_type: BTreeMap<ActionType, usize>,
    #[serde(default)]
    pub by_confidence: BTreeMap<Confidence, usize>,
    #[serde(default)]
    pub estimated_api_calls: usize,
}

impl PlanSummary {
    pub fn from_actions(actions: &[Action]) -> Self {
        let mut summary = PlanSummary {
            total_actions: actions.len(),
            ..PlanSummary::default()
        };
        for action in actions {
            *summary.by_type.entry(action.action_type).or_default() += 1;
            *summary.by_confidence.entry(action.confidence).or_default() += 1;
            summary.estimated_api_calls += action.estimated_api_calls();
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// ActionPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub source_audit: String,
    #[serde(default)]
    pub summary: PlanSummary,
    pub actions: Vec<Action>,
}

impl ActionPlan {
    pub fn new(source_audit: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            source_audit: source_audit.into(),
            summary: PlanSummary::from_actions(&actions),
            actions,
        }
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let plan: ActionPlan = serde_json::from_str(data)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Structural checks. Dependencies naming ids outside the plan are not an
    /// error here; the executor records such actions as skipped.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for action in &self.actions {
            if action.id.trim().is_empty() {
                return Err(CrmError::InvalidPlan("action with empty id".into()));
            }
            if !seen.insert(action.id.as_str()) {
                return Err(CrmError::InvalidPlan(format!(
                    "duplicate action id '{}'",
                    action.id
                )));
            }
            if action.dependencies.iter().any(|d| d == &action.id) {
                return Err(CrmError::InvalidPlan(format!(
                    "action '{}' depends on itself",
                    action.id
                )));
            }
            if action.target.object_id.trim().is_empty() {
                return Err(CrmError::InvalidPlan(format!(
                    "action '{}' has an empty target id",
                    action.id
                )));
            }
        }
        Ok(())
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.id == id)
    }

    pub fn estimated_api_calls(&self) -> usize {
        self.actions.iter().map(Action::estimated_api_calls).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
