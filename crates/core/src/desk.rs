//! Operations exposed to presentation callers.

use crate::config::Settings;
use crate::domain::optimization::{OptimizationRequest, OptimizationRun, RunConstraints};
use crate::domain::scenario::{NewScenario, Scenario};
use crate::metrics::{self, ScenarioMetrics};
use crate::optimize::client::{OptimizationJobClient, PollHandle, PollSettings, SubmissionError};
use crate::optimize::plan::{self, ExportError, MonthGroups};
use crate::solver::error::SolverError;
use crate::solver::http::HttpSolverClient;
use crate::solver::SolverClient;
use crate::store::scenarios::{ScenarioFetchError, ScenarioStore};
use crate::store::selection::{resolve_selection, ScopeKey, SelectionStore};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizationParams {
    pub target_horizon_years: u32,
    pub constraints: RunConstraints,
}

pub struct DealDesk {
    scenarios: Arc<ScenarioStore>,
    selection: Arc<SelectionStore>,
    jobs: OptimizationJobClient,
}

impl DealDesk {
    pub fn new(solver: Arc<dyn SolverClient>, selection: Arc<SelectionStore>, settings: &Settings) -> Self {
        tracing::debug!(solver = solver.solver_name(), "deal desk initialized");
        let scenarios = Arc::new(ScenarioStore::new(solver.clone(), selection.clone(), settings));
        let jobs = OptimizationJobClient::new(solver, PollSettings::from_settings(settings))
            .with_selection(selection.clone());
        Self {
            scenarios,
            selection,
            jobs,
        }
    }

    /// HTTP solver plus selection state (file-backed when `SELECTION_STATE_PATH` is set).
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let solver: Arc<dyn SolverClient> = Arc::new(HttpSolverClient::from_settings(settings)?);
        let selection = match settings.selection_state_path.as_deref() {
            Some(path) => SelectionStore::open(path)?,
            None => SelectionStore::in_memory(),
        };
        Ok(Self::new(solver, Arc::new(selection), settings))
    }

    pub fn scenario_store(&self) -> Arc<ScenarioStore> {
        self.scenarios.clone()
    }

    pub fn selection(&self) -> Arc<SelectionStore> {
        self.selection.clone()
    }

    pub fn jobs(&self) -> &OptimizationJobClient {
        &self.jobs
    }

    pub async fn list_scenarios(&self, deal_id: &str) -> Result<Vec<Scenario>, ScenarioFetchError> {
        self.scenarios.list(deal_id).await
    }

    /// Creates a scenario and makes it the deal's active one.
    pub async fn create_scenario(&self, deal_id: &str, input: NewScenario) -> Result<Scenario, SolverError> {
        let created = self.scenarios.create(deal_id, input).await?;
        self.selection
            .set(&ScopeKey::scenario(deal_id), created.id.clone());
        Ok(created)
    }

    pub async fn delete_scenario(&self, deal_id: &str, scenario_id: &str) -> Result<(), SolverError> {
        self.scenarios.remove(deal_id, scenario_id).await
    }

    pub fn derive_metrics(&self, scenario: &Scenario) -> ScenarioMetrics {
        metrics::scenario_metrics(scenario)
    }

    pub fn select_scenario(&self, deal_id: &str, scenario_id: &str) {
        self.selection
            .set(&ScopeKey::scenario(deal_id), scenario_id);
    }

    /// The remembered scenario if it still exists, else the deal's first scenario.
    pub async fn active_scenario(&self, deal_id: &str) -> Result<Option<Scenario>, ScenarioFetchError> {
        let scenarios = self.scenarios.list(deal_id).await?;
        Ok(self.active_in(deal_id, &scenarios).cloned())
    }

    /// Same as [`Self::active_scenario`] against a list the caller already holds.
    pub fn active_in<'a>(&self, deal_id: &str, scenarios: &'a [Scenario]) -> Option<&'a Scenario> {
        let stored = self.selection.get(&ScopeKey::scenario(deal_id));
        resolve_selection(stored.as_deref(), scenarios, |s| s.id.as_str())
    }

    pub async fn submit_optimization(
        &self,
        fund_id: &str,
        params: OptimizationParams,
    ) -> Result<PollHandle, SubmissionError> {
        self.jobs
            .submit(OptimizationRequest {
                fund_id: fund_id.trim().to_string(),
                target_horizon_years: params.target_horizon_years,
                constraints: params.constraints,
            })
            .await
    }

    pub fn load_run(&self, run_id: &str) -> Result<PollHandle, SolverError> {
        self.jobs.load_run(run_id)
    }

    pub fn resume_run(&self, fund_id: &str) -> Option<PollHandle> {
        self.jobs.resume(fund_id)
    }

    pub fn stop_polling(&self) {
        self.jobs.stop_polling();
    }

    pub fn export_csv(&self, run: &OptimizationRun) -> Result<String, ExportError> {
        plan::to_csv(run)
    }

    pub fn grouped_actions(&self, run: &OptimizationRun) -> MonthGroups {
        plan::group_by_month(run.plan())
    }
}
