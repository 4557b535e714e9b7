//! Task records - tracked units of work with plans

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::{Envelope, EvidenceType};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Active,
    Blocked,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "active" => Some(TaskStatus::Active),
            "blocked" => Some(TaskStatus::Blocked),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    #[default]
    Planning,
    PlanReady,
    Executing,
    Verifying,
    Completed,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Planning => "planning",
            TaskPhase::PlanReady => "plan_ready",
            TaskPhase::Executing => "executing",
            TaskPhase::Verifying => "verifying",
            TaskPhase::Completed => "completed",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(TaskPhase::Planning),
            "plan_ready" => Some(TaskPhase::PlanReady),
            "executing" => Some(TaskPhase::Executing),
            "verifying" => Some(TaskPhase::Verifying),
            "completed" => Some(TaskPhase::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            "critical" => Some(TaskPriority::Critical),
            _ => None,
        }
    }
}

/// One step of a task plan. Position in the plan is semantic; dependencies
/// reference step indices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// A tracked unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub content: String,
    pub status: TaskStatus,
    pub phase: TaskPhase,
    pub priority: TaskPriority,
    pub plan: Vec<PlanStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Rough effort estimate in minutes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort_estimate: Option<i64>,
}

/// Input for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskInput {
    pub project_id: String,
    pub content: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub phase: TaskPhase,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort_estimate: Option<i64>,
    #[serde(default = "super::event::default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskInput {
    pub fn into_task(self) -> Result<Task> {
        if self.content.trim().is_empty() {
            return Err(EngineError::Validation("task content is empty".to_string()));
        }
        for (idx, step) in self.plan.iter().enumerate() {
            if step.depends_on.iter().any(|&dep| dep >= idx) {
                return Err(EngineError::Validation(format!(
                    "plan step {idx} depends on a later or equal step"
                )));
            }
        }

        let mut envelope = Envelope::new(self.project_id, EvidenceType::Observed);
        envelope.importance = self.importance;
        envelope.tags = self.tags;
        envelope.check()?;

        Ok(Task {
            envelope,
            content: self.content,
            status: self.status,
            phase: self.phase,
            priority: self.priority,
            plan: self.plan,
            due_at: self.due_at,
            assignee: self.assignee,
            effort_estimate: self.effort_estimate,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }

    #[test]
    fn test_plan_dependency_validation() {
        let input = TaskInput {
            project_id: "p".into(),
            content: "ship the release".into(),
            status: TaskStatus::Pending,
            phase: TaskPhase::Planning,
            priority: TaskPriority::High,
            plan: vec![
                PlanStep {
                    description: "tag".into(),
                    depends_on: vec![],
                },
                PlanStep {
                    description: "publish".into(),
                    depends_on: vec![0],
                },
            ],
            due_at: None,
            assignee: None,
            effort_estimate: Some(90),
            importance: 0.5,
            tags: vec![],
        };
        assert!(input.into_task().is_ok());
    }

    #[test]
    fn test_plan_forward_dependency_rejected() {
        let input = TaskInput {
            project_id: "p".into(),
            content: "x".into(),
            status: TaskStatus::Pending,
            phase: TaskPhase::Planning,
            priority: TaskPriority::Medium,
            plan: vec![PlanStep {
                description: "self-referential".into(),
                depends_on: vec![0],
            }],
            due_at: None,
            assignee: None,
            effort_estimate: None,
            importance: 0.5,
            tags: vec![],
        };
        assert!(input.into_task().is_err());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Active,
            TaskStatus::Blocked,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse_name(status.as_str()), Some(status));
        }
        assert_eq!(TaskPhase::parse_name("plan_ready"), Some(TaskPhase::PlanReady));
    }
}
