use crate::domain::optimization::{OptimizationRun, OptimizerAction};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

const CSV_HEADER: [&str; 4] = ["Month", "Asset ID", "Action Type", "Confidence Score"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthLabel {
    year: i32,
    month: u32,
}

impl MonthLabel {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }
}

impl fmt::Display for MonthLabel {
    /// `Mar 2027`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.first_day() {
            Some(d) => write!(f, "{}", d.format("%b %Y")),
            None => write!(f, "{:04}-{:02}", self.year, self.month),
        }
    }
}

impl Serialize for MonthLabel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthGroup {
    pub label: MonthLabel,
    pub actions: Vec<OptimizerAction>,
}

/// Actions bucketed by month, in the order each month was first seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MonthGroups {
    groups: Vec<MonthGroup>,
}

impl MonthGroups {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MonthGroup> {
        self.groups.iter()
    }

    pub fn labels(&self) -> Vec<MonthLabel> {
        self.groups.iter().map(|g| g.label).collect()
    }

    pub fn get(&self, label: &MonthLabel) -> Option<&[OptimizerAction]> {
        self.groups
            .iter()
            .find(|g| &g.label == label)
            .map(|g| g.actions.as_slice())
    }

    pub fn total_actions(&self) -> usize {
        self.groups.iter().map(|g| g.actions.len()).sum()
    }
}

impl<'a> IntoIterator for &'a MonthGroups {
    type Item = &'a MonthGroup;
    type IntoIter = std::slice::Iter<'a, MonthGroup>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.iter()
    }
}

pub fn group_by_month(actions: &[OptimizerAction]) -> MonthGroups {
    let mut index: HashMap<MonthLabel, usize> = HashMap::new();
    let mut groups: Vec<MonthGroup> = Vec::new();

    for action in actions {
        let label = MonthLabel::of(action.month);
        let slot = *index.entry(label).or_insert_with(|| {
            groups.push(MonthGroup {
                label,
                actions: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].actions.push(action.clone());
    }

    MonthGroups { groups }
}

/// Presentation weighting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

pub fn confidence_tier(score: f64) -> ConfidenceTier {
    if score >= 0.8 {
        ConfidenceTier::High
    } else if score >= 0.6 {
        ConfidenceTier::Medium
    } else {
        ConfidenceTier::Low
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("csv output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// One row per action in the run's original order. Runs that have not completed
/// export the header only.
pub fn to_csv(run: &OptimizationRun) -> Result<String, ExportError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(CSV_HEADER)?;
    for action in run.plan() {
        writer.write_record([
            action.month.format("%Y-%m-%d").to_string(),
            action.asset_id.clone(),
            action.action_type.as_str().to_string(),
            action.confidence_score.to_string(),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8(bytes)?)
}
