pub mod error;
pub mod http;

#[cfg(test)]
pub(crate) mod fake;

use crate::domain::optimization::{OptimizationRequest, OptimizationRun, SubmitResponse};
use crate::domain::scenario::{NewScenario, Scenario};
use error::SolverError;

pub type SolverResult<T> = Result<T, SolverError>;

/// The external solver as seen by the engine.
#[async_trait::async_trait]
pub trait SolverClient: Send + Sync {
    fn solver_name(&self) -> &'static str;

    async fn list_scenarios(&self, deal_id: &str) -> SolverResult<Vec<Scenario>>;

    async fn create_scenario(&self, deal_id: &str, input: &NewScenario) -> SolverResult<Scenario>;

    async fn delete_scenario(&self, scenario_id: &str) -> SolverResult<()>;

    async fn submit_optimization(&self, request: &OptimizationRequest) -> SolverResult<SubmitResponse>;

    async fn fetch_run(&self, run_id: &str) -> SolverResult<OptimizationRun>;
}
