//! Submit-and-poll lifecycle for fund optimization runs.
//!
//! `Idle -> Submitting -> Polling -> {Completed, Failed}`. At most one polling task
//! runs per client; starting another one (new submission, `load_run`, `resume`)
//! stops the previous one first. Every state write made by a polling task is
//! guarded by the generation it was started with, so once `stop_polling` returns
//! (or a handle is cancelled) that task can no longer touch the snapshot.
//!
//! A hung status request does not hold up the next tick: up to two requests may be
//! outstanding, and once a newer one answers the older one is dropped unapplied.

use crate::config::Settings;
use crate::domain::optimization::{OptimizationRequest, OptimizationRun, RunStatus};
use crate::solver::error::SolverError;
use crate::solver::SolverClient;
use crate::store::selection::{ScopeKey, SelectionStore};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Idle,
    Submitting,
    Polling {
        run_id: String,
    },
    Completed {
        run_id: String,
    },
    Failed {
        run_id: String,
    },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// No request is in flight and none will be issued.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Idle) || self.is_terminal()
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::Polling { run_id } | Self::Completed { run_id } | Self::Failed { run_id } => {
                Some(run_id)
            }
            Self::Idle | Self::Submitting => None,
        }
    }
}

/// What observers see; updated in place by the polling task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSnapshot {
    pub state: JobState,
    pub run: Option<OptimizationRun>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Set once `consecutive_failures` reaches the configured limit; cleared by the next success.
    pub stale: bool,
    generation: u64,
}

#[derive(Debug, Error)]
#[error("optimization submission for fund {fund_id} failed: {source}")]
pub struct SubmissionError {
    pub fund_id: String,
    #[source]
    pub source: SolverError,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
}

impl PollSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: settings.poll_interval(),
            max_consecutive_failures: settings.max_poll_failures(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Returned when polling starts; cancelling it stops that polling task only.
#[derive(Debug, Clone)]
pub struct PollHandle {
    run_id: String,
    token: CancellationToken,
}

impl PollHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct PollTask {
    token: CancellationToken,
    join: JoinHandle<()>,
}

pub struct OptimizationJobClient {
    solver: Arc<dyn SolverClient>,
    selection: Option<Arc<SelectionStore>>,
    settings: PollSettings,
    state: Arc<watch::Sender<JobSnapshot>>,
    task: Mutex<Option<PollTask>>,
}

impl OptimizationJobClient {
    pub fn new(solver: Arc<dyn SolverClient>, settings: PollSettings) -> Self {
        let (tx, _rx) = watch::channel(JobSnapshot::default());
        Self {
            solver,
            selection: None,
            settings,
            state: Arc::new(tx),
            task: Mutex::new(None),
        }
    }

    /// Remember the last run per fund in `selection`.
    pub fn with_selection(mut self, selection: Arc<SelectionStore>) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.state.borrow().clone()
    }

    /// Waits until the client is idle or the tracked run reached a terminal status.
    pub async fn wait_until_settled(&self) -> JobSnapshot {
        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(|s| s.state.is_settled()).await.map(|s| s.clone());
        settled.unwrap_or_else(|_| self.snapshot())
    }

    /// Starts a run. Submission is attempted exactly once.
    pub async fn submit(&self, request: OptimizationRequest) -> Result<PollHandle, SubmissionError> {
        if let Err(source) = validate_request(&request) {
            return Err(SubmissionError {
                fund_id: request.fund_id,
                source,
            });
        }

        self.halt(false);
        let mut generation = 0;
        self.state.send_modify(|s| {
            s.state = JobState::Submitting;
            s.run = None;
            s.last_error = None;
            s.consecutive_failures = 0;
            s.stale = false;
            generation = s.generation;
        });

        let fund_id = request.fund_id.clone();
        match self.solver.submit_optimization(&request).await {
            Ok(res) => {
                tracing::info!(
                    %fund_id,
                    run_id = %res.run_id,
                    status = %res.status,
                    message = res.message.as_deref().unwrap_or(""),
                    "optimization run submitted"
                );
                if let Some(selection) = &self.selection {
                    selection.set(&ScopeKey::run(fund_id.as_str()), res.run_id.clone());
                }

                if self.generation() != generation {
                    // Stopped or superseded while the request was in flight.
                    tracing::info!(%fund_id, run_id = %res.run_id, "submission superseded; not polling");
                    let token = CancellationToken::new();
                    token.cancel();
                    return Ok(PollHandle {
                        run_id: res.run_id,
                        token,
                    });
                }

                let seed = OptimizationRun::submitted(res.run_id.clone(), &request, res.status);
                Ok(self.start_polling(res.run_id, Some(seed), Some(fund_id)))
            }
            Err(source) => {
                tracing::warn!(%fund_id, error = %source, "optimization submission failed");
                self.state.send_if_modified(|s| {
                    if s.generation != generation {
                        return false;
                    }
                    s.state = JobState::Idle;
                    s.last_error = Some(source.to_string());
                    true
                });
                Err(SubmissionError { fund_id, source })
            }
        }
    }

    /// Tracks an already-started run, skipping submission.
    pub fn load_run(&self, run_id: &str) -> Result<PollHandle, SolverError> {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Err(SolverError::validation("load_run", "run id must be non-empty"));
        }
        Ok(self.start_polling(run_id.to_string(), None, None))
    }

    /// Resumes the fund's last remembered run, if there is one.
    pub fn resume(&self, fund_id: &str) -> Option<PollHandle> {
        let selection = self.selection.as_ref()?;
        let run_id = selection.get(&ScopeKey::run(fund_id))?;
        tracing::info!(fund_id, %run_id, "resuming optimization run");
        Some(self.start_polling(run_id, None, Some(fund_id.to_string())))
    }

    /// Stops the active polling task. The snapshot keeps its last value, except that a
    /// submission still waiting on the solver is abandoned and the client returns to `Idle`.
    pub fn stop_polling(&self) {
        self.halt(true);
    }

    fn halt(&self, abandon_submission: bool) {
        let task = self.lock_task().take();
        self.state.send_if_modified(|s| {
            s.generation += 1;
            if abandon_submission && s.state == JobState::Submitting {
                s.state = JobState::Idle;
                return true;
            }
            false
        });
        if let Some(task) = task {
            task.token.cancel();
            task.join.abort();
            tracing::debug!("optimization polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.lock_task()
            .as_ref()
            .is_some_and(|t| !t.token.is_cancelled() && !t.join.is_finished())
    }

    fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<PollTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_polling(
        &self,
        run_id: String,
        seed: Option<OptimizationRun>,
        fund_hint: Option<String>,
    ) -> PollHandle {
        self.halt(false);

        let mut generation = 0;
        self.state.send_modify(|s| {
            s.state = JobState::Polling {
                run_id: run_id.clone(),
            };
            s.run = seed;
            s.last_error = None;
            s.consecutive_failures = 0;
            s.stale = false;
            generation = s.generation;
        });

        let token = CancellationToken::new();
        let poller = Poller {
            solver: self.solver.clone(),
            state: self.state.clone(),
            selection: self.selection.clone(),
            run_id: run_id.clone(),
            fund_hint,
            generation,
            token: token.clone(),
            settings: self.settings,
        };
        let join = tokio::spawn(poller.run());
        *self.lock_task() = Some(PollTask {
            token: token.clone(),
            join,
        });

        tracing::debug!(%run_id, interval_ms = self.settings.interval.as_millis(), "optimization polling started");
        PollHandle { run_id, token }
    }
}

impl Drop for OptimizationJobClient {
    fn drop(&mut self) {
        if let Some(task) = self.lock_task().take() {
            task.token.cancel();
            task.join.abort();
        }
    }
}

fn validate_request(request: &OptimizationRequest) -> Result<(), SolverError> {
    const STAGE: &str = "submit_optimization";
    if request.fund_id.trim().is_empty() {
        return Err(SolverError::validation(STAGE, "fund id must be non-empty"));
    }
    if request.target_horizon_years == 0 {
        return Err(SolverError::validation(STAGE, "target horizon must be at least one year"));
    }
    let c = request.constraints;
    if !c.min_dscr.is_finite() || c.min_dscr < 0.0 {
        return Err(SolverError::validation(
            STAGE,
            format!("min_dscr must be a non-negative number (got {})", c.min_dscr),
        ));
    }
    if !c.max_leverage.is_finite() || c.max_leverage < 0.0 {
        return Err(SolverError::validation(
            STAGE,
            format!("max_leverage must be a non-negative number (got {})", c.max_leverage),
        ));
    }
    Ok(())
}

enum Flow {
    Continue,
    Stop,
}

/// Selection bookkeeping decided while applying a poll result.
enum SelectionEffect {
    None,
    Remember(String),
    Forget,
}

struct Poller {
    solver: Arc<dyn SolverClient>,
    state: Arc<watch::Sender<JobSnapshot>>,
    selection: Option<Arc<SelectionStore>>,
    run_id: String,
    fund_hint: Option<String>,
    generation: u64,
    token: CancellationToken,
    settings: PollSettings,
}

/// Requests allowed to be outstanding at once: the current tick plus one hung predecessor.
const MAX_IN_FLIGHT: usize = 2;

type FetchResult = Result<OptimizationRun, SolverError>;

/// Outstanding status requests, oldest first. Dropping it aborts whatever is left.
#[derive(Default)]
struct InFlight {
    requests: VecDeque<JoinHandle<FetchResult>>,
}

impl InFlight {
    fn len(&self) -> usize {
        self.requests.len()
    }

    fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn push(&mut self, request: JoinHandle<FetchResult>) {
        self.requests.push_back(request);
    }

    /// Resolves with the first request to finish. Older requests still pending at that
    /// point are aborted, so a response never lands after a later-issued one.
    async fn next_settled(&mut self) -> FetchResult {
        let (idx, joined) = std::future::poll_fn(|cx| {
            for (idx, request) in self.requests.iter_mut().enumerate() {
                if let Poll::Ready(joined) = Pin::new(request).poll(cx) {
                    return Poll::Ready((idx, joined));
                }
            }
            Poll::Pending
        })
        .await;

        for older in self.requests.drain(..idx) {
            older.abort();
        }
        self.requests.pop_front();
        joined.unwrap_or_else(|e| Err(SolverError::network("fetch_run", format!("status request aborted: {e}"))))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        for request in &self.requests {
            request.abort();
        }
    }
}

impl Poller {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = InFlight::default();

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                result = in_flight.next_settled(), if !in_flight.is_empty() => {
                    if self.token.is_cancelled() {
                        break;
                    }
                    if let Flow::Stop = self.apply(result) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if in_flight.len() >= MAX_IN_FLIGHT {
                        tracing::warn!(run_id = %self.run_id, "status requests still outstanding; skipping tick");
                        continue;
                    }
                    let solver = self.solver.clone();
                    let run_id = self.run_id.clone();
                    in_flight.push(tokio::spawn(async move { solver.fetch_run(&run_id).await }));
                }
            }
        }

        tracing::debug!(run_id = %self.run_id, "optimization poll loop exited");
    }

    fn apply(&mut self, result: Result<OptimizationRun, SolverError>) -> Flow {
        let mut flow = Flow::Continue;
        let mut effect = SelectionEffect::None;
        let token = &self.token;
        let generation = self.generation;
        let run_id = self.run_id.as_str();
        let max_failures = self.settings.max_consecutive_failures;

        self.state.send_if_modified(|snap| {
            if token.is_cancelled() || snap.generation != generation {
                flow = Flow::Stop;
                return false;
            }

            match result {
                Ok(polled) => {
                    snap.consecutive_failures = 0;
                    snap.stale = false;
                    snap.last_error = None;

                    let merged = match snap.run.take() {
                        Some(mut run) => {
                            run.apply_snapshot(polled);
                            run
                        }
                        None => polled,
                    };
                    let run = snap.run.insert(merged);
                    if !run.fund_id.is_empty() {
                        effect = SelectionEffect::Remember(run.fund_id.clone());
                    }

                    tracing::debug!(run_id, status = %run.status, "optimization run polled");
                    match run.status {
                        RunStatus::Completed => {
                            tracing::info!(run_id, actions = run.actions.len(), "optimization run completed");
                            snap.state = JobState::Completed {
                                run_id: run_id.to_string(),
                            };
                            flow = Flow::Stop;
                        }
                        RunStatus::Failed => {
                            tracing::warn!(run_id, "optimization run failed");
                            snap.state = JobState::Failed {
                                run_id: run_id.to_string(),
                            };
                            flow = Flow::Stop;
                        }
                        RunStatus::Pending | RunStatus::Running => {}
                    }
                    true
                }
                Err(err) if err.is_not_found() => {
                    tracing::warn!(run_id, error = %err, "optimization run no longer exists");
                    snap.state = JobState::Idle;
                    snap.last_error = Some(err.to_string());
                    effect = SelectionEffect::Forget;
                    flow = Flow::Stop;
                    true
                }
                Err(err) if !err.is_retryable() => {
                    tracing::error!(run_id, error = %err, "optimization run status is unusable; polling stopped");
                    snap.state = JobState::Idle;
                    snap.last_error = Some(err.to_string());
                    flow = Flow::Stop;
                    true
                }
                Err(err) => {
                    snap.consecutive_failures += 1;
                    snap.last_error = Some(err.to_string());
                    if snap.consecutive_failures >= max_failures && !snap.stale {
                        snap.stale = true;
                        tracing::error!(
                            run_id,
                            consecutive_failures = snap.consecutive_failures,
                            error = %err,
                            "optimization status unavailable; still polling"
                        );
                    } else {
                        tracing::warn!(
                            run_id,
                            consecutive_failures = snap.consecutive_failures,
                            error = %err,
                            "optimization status poll failed"
                        );
                    }
                    true
                }
            }
        });

        self.apply_selection(effect);
        flow
    }

    fn apply_selection(&mut self, effect: SelectionEffect) {
        let Some(selection) = &self.selection else {
            return;
        };
        match effect {
            SelectionEffect::None => {}
            SelectionEffect::Remember(fund_id) => {
                if self.fund_hint.as_deref() != Some(fund_id.as_str()) {
                    selection.set(&ScopeKey::run(fund_id.as_str()), self.run_id.clone());
                    self.fund_hint = Some(fund_id);
                }
            }
            SelectionEffect::Forget => {
                if let Some(fund_id) = &self.fund_hint {
                    let key = ScopeKey::run(fund_id.as_str());
                    if selection.get(&key).as_deref() == Some(self.run_id.as_str()) {
                        selection.clear(&key);
                    }
                }
            }
        }
    }
}
