use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn progress(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Status after observing `next`; never moves backwards.
    pub fn advance(self, next: RunStatus) -> RunStatus {
        if next.progress() >= self.progress() {
            next
        } else {
            self
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunConstraints {
    pub min_dscr: f64,
    pub max_leverage: f64,
}

impl Default for RunConstraints {
    fn default() -> Self {
        Self {
            min_dscr: 1.25,
            max_leverage: 0.65,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Hold,
    Refinance,
    Sell,
    Capex,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::Refinance => "refinance",
            Self::Sell => "sell",
            Self::Capex => "capex",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Only the field matching the action type is ever populated, and even that one is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionDetails {
    #[serde(default, alias = "refinanceAmount", skip_serializing_if = "Option::is_none")]
    pub refinance_amount: Option<f64>,
    #[serde(default, alias = "salePrice", skip_serializing_if = "Option::is_none")]
    pub sale_price: Option<f64>,
    #[serde(default, alias = "capexAmount", skip_serializing_if = "Option::is_none")]
    pub capex_amount: Option<f64>,
}

impl ActionDetails {
    /// The amount relevant to `action_type`, if the solver provided it.
    pub fn amount_for(&self, action_type: ActionType) -> Option<f64> {
        match action_type {
            ActionType::Hold => None,
            ActionType::Refinance => self.refinance_amount,
            ActionType::Sell => self.sale_price,
            ActionType::Capex => self.capex_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerAction {
    pub id: String,
    pub asset_id: String,
    /// First day of the month the action is scheduled for.
    pub month: NaiveDate,
    pub action_type: ActionType,
    pub confidence_score: f64,
    pub details: ActionDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationRun {
    pub id: String,
    pub fund_id: String,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub horizon_months: Option<u32>,
    pub baseline_irr: Option<f64>,
    pub optimized_irr: Option<f64>,
    pub status: RunStatus,
    pub constraints: RunConstraints,
    pub actions: Vec<OptimizerAction>,
}

impl OptimizationRun {
    /// Placeholder tracked locally between submission and the first status poll.
    pub fn submitted(run_id: String, request: &OptimizationRequest, status: RunStatus) -> Self {
        Self {
            id: run_id,
            fund_id: request.fund_id.clone(),
            start_timestamp: Some(Utc::now()),
            horizon_months: Some(request.target_horizon_years.saturating_mul(12)),
            baseline_irr: None,
            optimized_irr: None,
            status,
            constraints: request.constraints,
            actions: Vec::new(),
        }
    }

    /// Merges a polled snapshot into the tracked run.
    pub fn apply_snapshot(&mut self, snapshot: OptimizationRun) {
        self.status = self.status.advance(snapshot.status);
        if !snapshot.fund_id.is_empty() {
            self.fund_id = snapshot.fund_id;
        }
        self.start_timestamp = snapshot.start_timestamp.or(self.start_timestamp);
        self.horizon_months = snapshot.horizon_months.or(self.horizon_months);
        self.baseline_irr = snapshot.baseline_irr.or(self.baseline_irr);
        self.optimized_irr = snapshot.optimized_irr.or(self.optimized_irr);
        self.constraints = snapshot.constraints;
        self.actions = snapshot.actions;
    }

    pub fn irr_uplift(&self) -> Option<f64> {
        Some(self.optimized_irr? - self.baseline_irr?)
    }

    /// Actions are only meaningful once the run completed.
    pub fn plan(&self) -> &[OptimizerAction] {
        if self.status == RunStatus::Completed {
            &self.actions
        } else {
            &[]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationRequest {
    pub fund_id: String,
    pub target_horizon_years: u32,
    pub constraints: RunConstraints,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitResponse {
    pub run_id: String,
    pub status: RunStatus,
    pub message: Option<String>,
}

pub fn action_mix(actions: &[OptimizerAction]) -> BTreeMap<ActionType, usize> {
    let mut out = BTreeMap::new();
    for action in actions {
        *out.entry(action.action_type).or_insert(0) += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: RunStatus) -> OptimizationRun {
        OptimizationRun {
            id: "run-1".to_string(),
            fund_id: "fund-1".to_string(),
            start_timestamp: None,
            horizon_months: Some(60),
            baseline_irr: Some(0.11),
            optimized_irr: None,
            status,
            constraints: RunConstraints::default(),
            actions: vec![],
        }
    }

    #[test]
    fn status_never_regresses() {
        assert_eq!(RunStatus::Running.advance(RunStatus::Pending), RunStatus::Running);
        assert_eq!(RunStatus::Pending.advance(RunStatus::Running), RunStatus::Running);
        assert_eq!(RunStatus::Running.advance(RunStatus::Failed), RunStatus::Failed);
        assert!(RunStatus::Completed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn apply_snapshot_keeps_known_values() {
        let mut tracked = run(RunStatus::Running);
        let mut snapshot = run(RunStatus::Completed);
        snapshot.baseline_irr = None;
        snapshot.optimized_irr = Some(0.14);
        snapshot.horizon_months = None;
        tracked.apply_snapshot(snapshot);

        assert_eq!(tracked.status, RunStatus::Completed);
        assert_eq!(tracked.baseline_irr, Some(0.11));
        assert_eq!(tracked.horizon_months, Some(60));
        assert!((tracked.irr_uplift().unwrap() - 0.03).abs() < 1e-12);
    }

    #[test]
    fn details_amount_matches_action_type() {
        let details = ActionDetails {
            sale_price: Some(5_000_000.0),
            ..Default::default()
        };
        assert_eq!(details.amount_for(ActionType::Sell), Some(5_000_000.0));
        assert_eq!(details.amount_for(ActionType::Refinance), None);
        assert_eq!(details.amount_for(ActionType::Hold), None);
    }
}
