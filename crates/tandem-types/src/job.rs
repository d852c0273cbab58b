use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Analyzing,
    Running,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub task: String,
    pub project: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(task: impl Into<String>, project: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task: task.into(),
            project: project.into(),
            status: JobStatus::Pending,
            client_id: None,
            created_at: now,
            updated_at: now,
            total_cost_usd: 0.0,
            error: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Research,
    Plan,
    Execute,
    Verify,
    Deliver,
}

impl Phase {
    pub const ORDER: [Phase; 5] = [
        Phase::Research,
        Phase::Plan,
        Phase::Execute,
        Phase::Verify,
        Phase::Deliver,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Verify => "verify",
            Phase::Deliver => "deliver",
        }
    }

    pub fn next(self) -> Option<Phase> {
        let idx = Self::ORDER.iter().position(|p| *p == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job_id: String,
    pub phase: Phase,
    pub phase_status: PhaseStatus,
    pub step_index: usize,
    pub total_steps: usize,
    pub accumulated_cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub cancelled: bool,
}

impl ProgressRecord {
    pub fn new(job_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            phase: Phase::Research,
            phase_status: PhaseStatus::Pending,
            step_index: 0,
            total_steps: 0,
            accumulated_cost_usd: 0.0,
            started_at: now,
            updated_at: now,
            error: None,
            retries: 0,
            cancelled: false,
        }
    }

    /// `cancelled` is sticky: once true, nothing may flip it back.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
        self.updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_stale(&self, freshness_window: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.phase_status == PhaseStatus::Running && now - self.updated_at > freshness_window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStepStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
    pub status: PlanStepStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Plan steps are capped; beyond the cap the plan is truncated, not rejected.
pub const MAX_PLAN_STEPS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub job_id: String,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn new(job_id: impl Into<String>, mut steps: Vec<PlanStep>) -> Self {
        steps.truncate(MAX_PLAN_STEPS);
        for (i, step) in steps.iter_mut().enumerate() {
            step.index = i;
        }
        Self {
            job_id: job_id.into(),
            steps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetQuota {
    pub per_task_limit_usd: f64,
    pub daily_limit_usd: f64,
    pub monthly_limit_usd: f64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

fn default_warning_threshold() -> f64 {
    0.8
}

impl BudgetQuota {
    /// Approved iff projected total after this call stays within all three limits.
    pub fn approves(&self, projected_task_total: f64, projected_daily: f64, projected_monthly: f64) -> bool {
        projected_task_total <= self.per_task_limit_usd
            && projected_daily <= self.daily_limit_usd
            && projected_monthly <= self.monthly_limit_usd
    }

    pub fn warns(&self, projected_task_total: f64, projected_daily: f64, projected_monthly: f64) -> bool {
        projected_task_total > self.per_task_limit_usd * self.warning_threshold
            || projected_daily > self.daily_limit_usd * self.warning_threshold
            || projected_monthly > self.monthly_limit_usd * self.warning_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_truncates_to_cap() {
        let steps: Vec<PlanStep> = (0..30)
            .map(|i| PlanStep {
                index: i,
                description: format!("step {i}"),
                tools: vec![],
                status: PlanStepStatus::Pending,
                result: String::new(),
                attempts: 0,
                error: None,
            })
            .collect();
        let plan = ExecutionPlan::new("job-1", steps);
        assert_eq!(plan.steps.len(), MAX_PLAN_STEPS);
    }

    #[test]
    fn progress_cancelled_flag_is_sticky() {
        let mut progress = ProgressRecord::new("job-1");
        progress.mark_cancelled();
        assert!(progress.cancelled);
    }

    #[test]
    fn budget_rejects_when_any_limit_exceeded() {
        let quota = BudgetQuota {
            per_task_limit_usd: 1.0,
            daily_limit_usd: 10.0,
            monthly_limit_usd: 100.0,
            warning_threshold: 0.8,
        };
        assert!(!quota.approves(1.5, 5.0, 50.0));
        assert!(quota.approves(0.5, 5.0, 50.0));
    }
}
