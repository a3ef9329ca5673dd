//! Scripted in-memory solver used by unit tests.

use crate::domain::optimization::{
    OptimizationRequest, OptimizationRun, RunConstraints, RunStatus, SubmitResponse,
};
use crate::domain::scenario::{CashflowState, NewScenario, Scenario, ScenarioVariable};
use crate::solver::error::SolverError;
use crate::solver::{SolverClient, SolverResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct FakeSolver {
    scenarios: Mutex<HashMap<String, Vec<Scenario>>>,
    list_errors: Mutex<VecDeque<SolverError>>,
    mutation_error: Mutex<Option<SolverError>>,
    submit_result: Mutex<Option<SolverResult<SubmitResponse>>>,
    run_script: Mutex<VecDeque<SolverResult<OptimizationRun>>>,
    fetch_delays: Mutex<HashMap<usize, Duration>>,
    submit_delay: Mutex<Option<Duration>>,
    next_id: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl FakeSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scenarios(self, deal_id: &str, scenarios: Vec<Scenario>) -> Self {
        self.scenarios
            .lock()
            .unwrap()
            .insert(deal_id.to_string(), scenarios);
        self
    }

    /// Errors returned by the next `list_scenarios` calls, in order.
    pub fn fail_lists(&self, errors: Vec<SolverError>) {
        self.list_errors.lock().unwrap().extend(errors);
    }

    pub fn fail_next_mutation(&self, err: SolverError) {
        *self.mutation_error.lock().unwrap() = Some(err);
    }

    pub fn set_submit_result(&self, result: SolverResult<SubmitResponse>) {
        *self.submit_result.lock().unwrap() = Some(result);
    }

    /// Responses for successive `fetch_run` calls; the last one repeats forever.
    pub fn script_runs(&self, script: Vec<SolverResult<OptimizationRun>>) {
        let mut guard = self.run_script.lock().unwrap();
        guard.clear();
        guard.extend(script);
    }

    /// Makes the `call`-th `fetch_run` (1-based) take `delay` before answering.
    pub fn delay_fetch(&self, call: usize, delay: Duration) {
        self.fetch_delays.lock().unwrap().insert(call, delay);
    }

    pub fn delay_submit(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = Some(delay);
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn submit_count(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SolverClient for FakeSolver {
    fn solver_name(&self) -> &'static str {
        "fake"
    }

    async fn list_scenarios(&self, deal_id: &str) -> SolverResult<Vec<Scenario>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.list_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .scenarios
            .lock()
            .unwrap()
            .get(deal_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_scenario(&self, deal_id: &str, input: &NewScenario) -> SolverResult<Scenario> {
        if let Some(err) = self.mutation_error.lock().unwrap().take() {
            return Err(err);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created = scenario(&format!("new-{n}"), deal_id);
        let created = Scenario {
            name: input.resolved_name(),
            variable_changed: input.variable,
            delta: input.delta,
            ..created
        };
        self.scenarios
            .lock()
            .unwrap()
            .entry(deal_id.to_string())
            .or_default()
            .push(created.clone());
        Ok(created)
    }

    async fn delete_scenario(&self, scenario_id: &str) -> SolverResult<()> {
        if let Some(err) = self.mutation_error.lock().unwrap().take() {
            return Err(err);
        }
        let mut guard = self.scenarios.lock().unwrap();
        let mut found = false;
        for list in guard.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != scenario_id);
            found |= list.len() != before;
        }
        if found {
            Ok(())
        } else {
            Err(SolverError::not_found(format!("scenario {scenario_id}")))
        }
    }

    async fn submit_optimization(&self, _request: &OptimizationRequest) -> SolverResult<SubmitResponse> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.submit_result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(SolverError::network("submit_optimization", "no scripted response")))
    }

    async fn fetch_run(&self, run_id: &str) -> SolverResult<OptimizationRun> {
        let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.fetch_delays.lock().unwrap().remove(&call);
        let next = {
            let mut guard = self.run_script.lock().unwrap();
            if guard.len() > 1 {
                guard.pop_front()
            } else {
                guard.front().cloned()
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = next.unwrap_or_else(|| Err(SolverError::network("fetch_run", "no scripted response")));
        next.map(|mut run| {
            run.id = run_id.to_string();
            run
        })
    }
}

pub(crate) fn scenario(id: &str, deal_id: &str) -> Scenario {
    Scenario {
        id: id.to_string(),
        deal_id: deal_id.to_string(),
        name: format!("Scenario {id}"),
        variable_changed: ScenarioVariable::Rent,
        delta: 1.0,
        irr: None,
        cashflow: CashflowState::Pending,
        created_at: None,
    }
}

pub(crate) fn run(id: &str, status: RunStatus) -> OptimizationRun {
    OptimizationRun {
        id: id.to_string(),
        fund_id: "fund-1".to_string(),
        start_timestamp: None,
        horizon_months: Some(60),
        baseline_irr: Some(0.11),
        optimized_irr: (status == RunStatus::Completed).then_some(0.135),
        status,
        constraints: RunConstraints::default(),
        actions: Vec::new(),
    }
}
