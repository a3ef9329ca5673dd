pub mod cashflow;

use crate::domain::scenario::{CashflowState, Scenario};
use cashflow::CashflowMetrics;
use serde::Serialize;

/// What a caller can show for a scenario's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScenarioMetrics {
    /// The solver has not produced a projection yet.
    Pending,
    /// The stored projection could not be decoded; rendered as "metrics unavailable".
    Unavailable { reason: String },
    Ready(CashflowMetrics),
}

pub fn scenario_metrics(scenario: &Scenario) -> ScenarioMetrics {
    match &scenario.cashflow {
        CashflowState::Pending => ScenarioMetrics::Pending,
        CashflowState::Malformed(reason) => ScenarioMetrics::Unavailable {
            reason: reason.clone(),
        },
        CashflowState::Ready(payload) => ScenarioMetrics::Ready(cashflow::derive_metrics(payload)),
    }
}
