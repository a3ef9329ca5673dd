//! Wire shapes returned by the solver and their validation into domain types.
//!
//! Everything loosely typed (ids as numbers, cashflow as strings, wrapped lists) is
//! resolved here so the rest of the crate only sees one representation.

use crate::domain::optimization::{
    ActionDetails, ActionType, OptimizationRun, OptimizerAction, RunConstraints, RunStatus,
    SubmitResponse,
};
use crate::domain::scenario::{CashflowState, Scenario, ScenarioVariable};
use crate::metrics::cashflow::{self, CashflowInput};
use crate::solver::error::SolverError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Ids arrive as strings from some endpoints and as integers from others.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Text(String),
    Number(serde_json::Number),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s.trim().to_string(),
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScenarioListResponse {
    Bare(Vec<WireScenario>),
    Wrapped { scenarios: Vec<WireScenario> },
}

impl ScenarioListResponse {
    pub fn validate_and_into_scenarios(self, deal_id: &str) -> Result<Vec<Scenario>, SolverError> {
        let items = match self {
            Self::Bare(items) => items,
            Self::Wrapped { scenarios } => scenarios,
        };

        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let scenario = item.validate_and_into_scenario(deal_id)?;
            if !seen.insert(scenario.id.clone()) {
                return Err(SolverError::validation(
                    "list_scenarios",
                    format!("duplicate scenario id {} for deal {deal_id}", scenario.id),
                ));
            }
            out.push(scenario);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireScenario {
    pub id: WireId,
    #[serde(default, alias = "dealId")]
    pub deal_id: Option<WireId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "variableChanged", alias = "var")]
    pub variable_changed: ScenarioVariable,
    pub delta: f64,
    #[serde(default)]
    pub irr: Option<Value>,
    #[serde(default)]
    pub cashflow: Option<Value>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
}

impl WireScenario {
    pub fn validate_and_into_scenario(self, deal_id: &str) -> Result<Scenario, SolverError> {
        let id = self.id.into_string();
        if id.is_empty() {
            return Err(SolverError::validation("scenario", "scenario id must be non-empty"));
        }

        if let Some(wire_deal) = self.deal_id.map(WireId::into_string) {
            if wire_deal != deal_id {
                return Err(SolverError::validation(
                    "scenario",
                    format!("scenario {id} belongs to deal {wire_deal}, expected {deal_id}"),
                ));
            }
        }

        if !self.delta.is_finite() {
            return Err(SolverError::validation(
                "scenario",
                format!("scenario {id} has a non-finite delta"),
            ));
        }

        let name = self
            .name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                crate::domain::scenario::default_name(self.variable_changed, self.delta)
            });

        Ok(Scenario {
            irr: decode_irr(&id, self.irr),
            cashflow: decode_cashflow(&id, self.cashflow),
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            id,
            deal_id: deal_id.to_string(),
            name,
            variable_changed: self.variable_changed,
            delta: self.delta,
        })
    }
}

fn decode_irr(scenario_id: &str, raw: Option<Value>) -> Option<f64> {
    match raw? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Some(v),
            _ => {
                tracing::warn!(scenario_id, raw = %s, "unparsable scenario irr; treating as pending");
                None
            }
        },
        _ => None,
    }
}

fn decode_cashflow(scenario_id: &str, raw: Option<Value>) -> CashflowState {
    let value = match raw {
        None | Some(Value::Null) => return CashflowState::Pending,
        Some(v) => v,
    };

    match CashflowInput::from_value(value).and_then(cashflow::parse) {
        Ok(payload) => CashflowState::Ready(payload),
        Err(err) => {
            tracing::warn!(scenario_id, error = %err, "scenario cashflow is malformed");
            CashflowState::Malformed(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateScenarioBody {
    pub var: ScenarioVariable,
    pub delta: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSubmitResponse {
    pub run_id: WireId,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub message: Option<String>,
}

impl WireSubmitResponse {
    pub fn validate_and_into_response(self) -> Result<SubmitResponse, SolverError> {
        let run_id = self.run_id.into_string();
        if run_id.is_empty() {
            return Err(SolverError::validation("submit_optimization", "run_id must be non-empty"));
        }
        Ok(SubmitResponse {
            run_id,
            status: self.status.unwrap_or(RunStatus::Pending),
            message: self.message,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireRun {
    #[serde(default)]
    pub id: Option<WireId>,
    #[serde(default, alias = "runId")]
    pub run_id: Option<WireId>,
    #[serde(default, alias = "fundId")]
    pub fund_id: Option<WireId>,
    #[serde(default, alias = "startTimestamp")]
    pub start_timestamp: Option<String>,
    #[serde(default, alias = "horizonMonths")]
    pub horizon_months: Option<u32>,
    #[serde(default, alias = "baselineIrr")]
    pub baseline_irr: Option<f64>,
    #[serde(default, alias = "optimizedIrr")]
    pub optimized_irr: Option<f64>,
    pub status: RunStatus,
    #[serde(default)]
    pub constraints: Option<WireConstraints>,
    #[serde(default)]
    pub actions: Option<Vec<WireAction>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireConstraints {
    #[serde(default, alias = "minDscr")]
    pub min_dscr: Option<f64>,
    #[serde(default, alias = "maxLeverage")]
    pub max_leverage: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireAction {
    #[serde(default)]
    pub id: Option<WireId>,
    #[serde(alias = "assetId")]
    pub asset_id: WireId,
    pub month: String,
    #[serde(alias = "actionType")]
    pub action_type: ActionType,
    #[serde(alias = "confidenceScore")]
    pub confidence_score: f64,
    #[serde(default)]
    pub details: Option<ActionDetails>,
}

impl WireRun {
    pub fn validate_and_into_run(self, expected_run_id: &str) -> Result<OptimizationRun, SolverError> {
        // Some solvers do not echo the id back; only a different id is an error.
        let id = match self.id.or(self.run_id).map(WireId::into_string) {
            Some(id) => id,
            None => expected_run_id.to_string(),
        };
        if id != expected_run_id {
            return Err(SolverError::validation(
                "fetch_run",
                format!("run id mismatch: expected {expected_run_id}, got {id:?}"),
            ));
        }

        let defaults = RunConstraints::default();
        let constraints = match self.constraints {
            Some(c) => RunConstraints {
                min_dscr: c.min_dscr.unwrap_or(defaults.min_dscr),
                max_leverage: c.max_leverage.unwrap_or(defaults.max_leverage),
            },
            None => defaults,
        };

        let wire_actions = self.actions.unwrap_or_default();
        let mut actions = Vec::with_capacity(wire_actions.len());
        for (idx, action) in wire_actions.into_iter().enumerate() {
            actions.push(action.validate_and_into_action(&id, idx)?);
        }

        Ok(OptimizationRun {
            fund_id: self.fund_id.map(WireId::into_string).unwrap_or_default(),
            start_timestamp: self.start_timestamp.as_deref().and_then(parse_timestamp),
            horizon_months: self.horizon_months,
            baseline_irr: self.baseline_irr,
            optimized_irr: self.optimized_irr,
            status: self.status,
            constraints,
            actions,
            id,
        })
    }
}

impl WireAction {
    fn validate_and_into_action(self, run_id: &str, idx: usize) -> Result<OptimizerAction, SolverError> {
        let asset_id = self.asset_id.into_string();
        if asset_id.is_empty() {
            return Err(SolverError::validation(
                "fetch_run",
                format!("action #{idx} of run {run_id} has an empty asset_id"),
            ));
        }

        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(SolverError::validation(
                "fetch_run",
                format!(
                    "action #{idx} of run {run_id}: confidence must be between 0 and 1 (got {})",
                    self.confidence_score
                ),
            ));
        }

        let month = parse_month(&self.month).ok_or_else(|| {
            SolverError::validation(
                "fetch_run",
                format!("action #{idx} of run {run_id}: unrecognized month {:?}", self.month),
            )
        })?;

        let id = self
            .id
            .map(WireId::into_string)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{run_id}-{idx}"));

        Ok(OptimizerAction {
            id,
            asset_id,
            month,
            action_type: self.action_type,
            confidence_score: self.confidence_score,
            details: self.details.unwrap_or_default(),
        })
    }
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM` or an RFC 3339 timestamp; returns the first of the month.
pub fn parse_month(raw: &str) -> Option<NaiveDate> {
    use chrono::Datelike;

    let s = raw.trim();
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d").ok())
        .or_else(|| parse_timestamp(s).map(|ts| ts.date_naive()))?;
    date.with_day(1)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|ts| ts.and_utc())
                .ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario_json(id: Value) -> Value {
        json!({
            "id": id,
            "dealId": "deal-7",
            "name": "Rate shock",
            "variableChanged": "interest",
            "delta": 50.0,
            "irr": 0.142,
            "cashflow": {
                "yearly": [{"year": 1, "noi": 100.0, "debt_service": 80.0, "free_cash": 20.0, "cumulative": -1000.0}],
                "final_cash": 1500.0
            },
            "createdAt": "2026-09-30T12:00:00Z"
        })
    }

    #[test]
    fn accepts_bare_and_wrapped_lists() {
        let bare: ScenarioListResponse =
            serde_json::from_value(json!([scenario_json(json!("s1"))])).unwrap();
        let wrapped: ScenarioListResponse =
            serde_json::from_value(json!({"scenarios": [scenario_json(json!(2))]})).unwrap();

        let a = bare.validate_and_into_scenarios("deal-7").unwrap();
        let b = wrapped.validate_and_into_scenarios("deal-7").unwrap();
        assert_eq!(a[0].id, "s1");
        assert_eq!(b[0].id, "2");
        assert!(matches!(a[0].cashflow, CashflowState::Ready(_)));
        assert!(a[0].created_at.is_some());
    }

    #[test]
    fn string_encoded_fields_are_normalized() {
        let inner = json!({"yearly": [{"year": 1, "noi": 1.0, "debt_service": 1.0, "free_cash": 0.0, "cumulative": -1.0}], "final_cash": 2.0});
        let v = json!({
            "id": "s1",
            "variable_changed": "exit_cap",
            "delta": -1.0,
            "irr": "0.09",
            "cashflow": inner.to_string(),
        });
        let s = serde_json::from_value::<WireScenario>(v)
            .unwrap()
            .validate_and_into_scenario("deal-7")
            .unwrap();
        assert_eq!(s.irr, Some(0.09));
        assert_eq!(s.name, "-1% exit cap");
        assert!(matches!(s.cashflow, CashflowState::Ready(ref p) if p.final_cash == 2.0));
    }

    #[test]
    fn pending_and_malformed_scenarios_still_decode() {
        let v = json!([
            {"id": "p", "var": "rent", "delta": 2.0, "irr": null, "cashflow": null},
            {"id": "m", "var": "vacancy", "delta": 1.0, "irr": 0.1, "cashflow": "{broken"},
        ]);
        let list = serde_json::from_value::<ScenarioListResponse>(v)
            .unwrap()
            .validate_and_into_scenarios("deal-7")
            .unwrap();
        assert!(list[0].is_pending());
        assert_eq!(list[0].cashflow, CashflowState::Pending);
        assert!(matches!(list[1].cashflow, CashflowState::Malformed(_)));
    }

    #[test]
    fn rejects_duplicate_ids_and_foreign_deals() {
        let dup: ScenarioListResponse = serde_json::from_value(json!([
            scenario_json(json!("s1")),
            scenario_json(json!("s1")),
        ]))
        .unwrap();
        assert!(matches!(
            dup.validate_and_into_scenarios("deal-7"),
            Err(SolverError::Validation { .. })
        ));

        let one: ScenarioListResponse =
            serde_json::from_value(json!([scenario_json(json!("s1"))])).unwrap();
        assert!(one.validate_and_into_scenarios("deal-8").is_err());
    }

    #[test]
    fn run_snapshot_decodes_actions() {
        let v = json!({
            "id": 42,
            "fund_id": "fund-1",
            "status": "completed",
            "baseline_irr": 0.11,
            "optimized_irr": 0.135,
            "horizon_months": 60,
            "constraints": {"min_dscr": 1.3, "max_leverage": 0.6},
            "actions": [
                {"id": "a1", "asset_id": "A-1", "month": "2027-03-15", "action_type": "refinance", "confidence_score": 0.82, "details": {"refinance_amount": 1.0e6}},
                {"asset_id": 9, "month": "2027-04", "action_type": "hold", "confidence_score": 0.5},
            ]
        });
        let run = serde_json::from_value::<WireRun>(v)
            .unwrap()
            .validate_and_into_run("42")
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.actions.len(), 2);
        assert_eq!(run.actions[0].month, NaiveDate::from_ymd_opt(2027, 3, 1).unwrap());
        assert_eq!(run.actions[1].id, "42-1");
        assert_eq!(run.actions[1].asset_id, "9");
        assert_eq!(run.actions[1].details, ActionDetails::default());
        assert_eq!(run.constraints.min_dscr, 1.3);
    }

    #[test]
    fn run_snapshot_rejects_mismatched_id_and_bad_confidence() {
        let v = json!({"run_id": "r1", "status": "running"});
        let wire = serde_json::from_value::<WireRun>(v).unwrap();
        assert!(wire.clone().validate_and_into_run("r1").is_ok());
        assert!(wire.validate_and_into_run("r2").is_err());

        let bad = json!({
            "id": "r1", "status": "completed",
            "actions": [{"asset_id": "A", "month": "2027-01-01", "action_type": "sell", "confidence_score": 1.5}]
        });
        let wire = serde_json::from_value::<WireRun>(bad).unwrap();
        assert!(matches!(
            wire.validate_and_into_run("r1"),
            Err(SolverError::Validation { .. })
        ));
    }

    #[test]
    fn run_snapshot_without_id_takes_requested_id() {
        let v = json!({"fund_id": "f", "status": "completed", "actions": [
            {"asset_id": "A", "month": "2027-01-01", "action_type": "sell", "confidence_score": 0.9}
        ]});
        let run = serde_json::from_value::<WireRun>(v)
            .unwrap()
            .validate_and_into_run("run-1")
            .unwrap();
        assert_eq!(run.id, "run-1");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.actions[0].id, "run-1-0");
    }

    #[test]
    fn parse_month_variants() {
        let expected = NaiveDate::from_ymd_opt(2027, 6, 1);
        assert_eq!(parse_month("2027-06-20"), expected);
        assert_eq!(parse_month("2027-06"), expected);
        assert_eq!(parse_month("2027-06-20T08:00:00Z"), expected);
        assert_eq!(parse_month("June"), None);
    }
}
