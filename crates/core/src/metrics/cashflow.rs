use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashflowYear {
    pub year: u32,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub noi: f64,
    #[serde(default, alias = "debtService", deserialize_with = "zero_if_null")]
    pub debt_service: f64,
    #[serde(default, alias = "freeCash", deserialize_with = "zero_if_null")]
    pub free_cash: f64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub cumulative: f64,
}

/// Projection emitted by the solver for a single scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashflowPayload {
    pub yearly: Vec<CashflowYear>,
    #[serde(default, alias = "exitValue", deserialize_with = "zero_if_null")]
    pub exit_value: f64,
    #[serde(default, alias = "exitProceeds", deserialize_with = "zero_if_null")]
    pub exit_proceeds: f64,
    #[serde(default, alias = "finalCash", deserialize_with = "zero_if_null")]
    pub final_cash: f64,
}

/// The two shapes a stored cashflow arrives in.
#[derive(Debug, Clone, PartialEq)]
pub enum CashflowInput {
    Encoded(String),
    Structured(CashflowPayload),
}

impl CashflowInput {
    /// Tags an arbitrary JSON value. Anything that is not a string is treated as the
    /// structured form and validated by [`parse`].
    pub fn from_value(value: Value) -> Result<Self, MalformedCashflowError> {
        match value {
            Value::String(s) => Ok(Self::Encoded(s)),
            other => serde_json::from_value::<CashflowPayload>(other)
                .map(Self::Structured)
                .map_err(MalformedCashflowError::Shape),
        }
    }
}

impl From<CashflowPayload> for CashflowInput {
    fn from(payload: CashflowPayload) -> Self {
        Self::Structured(payload)
    }
}

#[derive(Debug, Error)]
pub enum MalformedCashflowError {
    #[error("cashflow payload is empty")]
    Empty,

    #[error("cashflow payload is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("cashflow payload has an unexpected shape: {0}")]
    Shape(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CashflowMetrics {
    pub equity_multiple: f64,
    pub dscr: f64,
}

/// Normalizes either representation into a payload with `yearly` sorted by year.
///
/// Structured input goes through the same normalization, so feeding the output back
/// in yields an identical payload.
pub fn parse(raw: CashflowInput) -> Result<CashflowPayload, MalformedCashflowError> {
    let mut payload = match raw {
        CashflowInput::Structured(payload) => payload,
        CashflowInput::Encoded(text) => decode_text(&text)?,
    };
    payload.yearly.sort_by_key(|y| y.year);
    Ok(payload)
}

fn decode_text(text: &str) -> Result<CashflowPayload, MalformedCashflowError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(MalformedCashflowError::Empty);
    }

    let value = serde_json::from_str::<Value>(trimmed).map_err(MalformedCashflowError::Json)?;
    let value = match value {
        // Some rows were stored double-encoded.
        Value::String(inner) => {
            serde_json::from_str::<Value>(inner.trim()).map_err(MalformedCashflowError::Json)?
        }
        other => other,
    };

    serde_json::from_value::<CashflowPayload>(value).map_err(MalformedCashflowError::Shape)
}

pub fn derive_metrics(payload: &CashflowPayload) -> CashflowMetrics {
    let Some(first) = payload.yearly.first() else {
        return CashflowMetrics {
            equity_multiple: 0.0,
            dscr: 0.0,
        };
    };

    CashflowMetrics {
        equity_multiple: ratio_or_zero(payload.final_cash, first.cumulative.abs()),
        dscr: ratio_or_zero(first.noi, first.debt_service),
    }
}

fn ratio_or_zero(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let out = numerator / denominator;
    if out.is_finite() {
        out
    } else {
        0.0
    }
}

fn zero_if_null<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0))
}
