use crate::metrics::cashflow::CashflowPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioVariable {
    Interest,
    #[serde(alias = "exitCap")]
    ExitCap,
    Rent,
    Vacancy,
}

impl ScenarioVariable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interest => "interest",
            Self::ExitCap => "exit_cap",
            Self::Rent => "rent",
            Self::Vacancy => "vacancy",
        }
    }

    /// Suffix used when synthesizing a scenario name.
    pub fn unit_label(self) -> &'static str {
        match self {
            Self::Interest => " bp interest",
            Self::ExitCap => "% exit cap",
            Self::Rent => "% rent",
            Self::Vacancy => "% vacancy",
        }
    }
}

impl fmt::Display for ScenarioVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScenarioVariable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "interest" => Ok(Self::Interest),
            "exit_cap" | "exitcap" => Ok(Self::ExitCap),
            "rent" => Ok(Self::Rent),
            "vacancy" => Ok(Self::Vacancy),
            other => Err(format!("unknown scenario variable: {other}")),
        }
    }
}

/// Cashflow as it stands after the boundary decode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "payload", rename_all = "snake_case")]
pub enum CashflowState {
    Pending,
    Ready(CashflowPayload),
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub id: String,
    pub deal_id: String,
    pub name: String,
    pub variable_changed: ScenarioVariable,
    pub delta: f64,
    pub irr: Option<f64>,
    pub cashflow: CashflowState,
    pub created_at: Option<DateTime<Utc>>,
}

impl Scenario {
    /// The solver has not filled in results yet.
    pub fn is_pending(&self) -> bool {
        self.irr.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewScenario {
    pub variable: ScenarioVariable,
    pub delta: f64,
    pub name: Option<String>,
}

impl NewScenario {
    /// The caller-provided name, or one synthesized from the variable and delta.
    pub fn resolved_name(&self) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_name(self.variable, self.delta))
    }
}

/// `+0.5 bp interest`, `-1% exit cap`, `0% rent`.
pub fn default_name(variable: ScenarioVariable, delta: f64) -> String {
    // -0.0 == 0.0, so this also drops the sign of a negative zero.
    let delta = if delta == 0.0 { 0.0 } else { delta };
    let sign = if delta > 0.0 { "+" } else { "" };
    format!("{sign}{delta}{}", variable.unit_label())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_uses_sign_and_unit() {
        assert_eq!(default_name(ScenarioVariable::Interest, 0.5), "+0.5 bp interest");
        assert_eq!(default_name(ScenarioVariable::ExitCap, -1.0), "-1% exit cap");
        assert_eq!(default_name(ScenarioVariable::Rent, 0.0), "0% rent");
        assert_eq!(default_name(ScenarioVariable::Vacancy, 2.5), "+2.5% vacancy");
        assert_eq!(default_name(ScenarioVariable::Rent, -0.0), "0% rent");
    }

    #[test]
    fn resolved_name_prefers_non_blank_input() {
        let mut input = NewScenario {
            variable: "exit_cap".parse().unwrap(),
            delta: -1.0,
            name: Some("  ".to_string()),
        };
        assert_eq!(input.resolved_name(), "-1% exit cap");

        input.name = Some(" Downside ".to_string());
        assert_eq!(input.resolved_name(), "Downside");
    }

    #[test]
    fn variable_accepts_both_spellings() {
        let a: ScenarioVariable = serde_json::from_str("\"exit_cap\"").unwrap();
        let b: ScenarioVariable = serde_json::from_str("\"exitCap\"").unwrap();
        assert_eq!(a, b);
        assert_eq!("exitCap".parse::<ScenarioVariable>().unwrap(), ScenarioVariable::ExitCap);
        assert!("leverage".parse::<ScenarioVariable>().is_err());
    }
}
