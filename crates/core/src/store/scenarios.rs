use crate::config::Settings;
use crate::domain::scenario::{NewScenario, Scenario};
use crate::solver::error::SolverError;
use crate::solver::SolverClient;
use crate::store::selection::{ScopeKey, SelectionStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A scenario list could not be loaded. `stale` holds the last cached list, if any,
/// so callers can keep showing it.
#[derive(Debug, Error)]
#[error("failed to load scenarios for deal {deal_id}: {source}")]
pub struct ScenarioFetchError {
    pub deal_id: String,
    #[source]
    pub source: SolverError,
    pub stale: Option<Vec<Scenario>>,
}

#[derive(Debug)]
struct CachedList {
    scenarios: Vec<Scenario>,
    fetched_at: Instant,
    invalidated: bool,
}

impl CachedList {
    fn is_fresh(&self, ttl: Duration) -> bool {
        !self.invalidated && self.fetched_at.elapsed() < ttl
    }
}

#[derive(Debug, Default)]
struct CacheState {
    lists: HashMap<String, CachedList>,
    // Bumped on every invalidation so a fetch that raced a mutation is not cached as fresh.
    epochs: HashMap<String, u64>,
}

impl CacheState {
    fn epoch(&self, deal_id: &str) -> u64 {
        self.epochs.get(deal_id).copied().unwrap_or(0)
    }
}

/// Scenario lists per deal, shared by every caller holding the same store.
pub struct ScenarioStore {
    solver: Arc<dyn SolverClient>,
    selection: Arc<SelectionStore>,
    cache: Mutex<CacheState>,
    ttl: Duration,
    read_retries: u32,
}

impl ScenarioStore {
    pub fn new(
        solver: Arc<dyn SolverClient>,
        selection: Arc<SelectionStore>,
        settings: &Settings,
    ) -> Self {
        Self {
            solver,
            selection,
            cache: Mutex::new(CacheState::default()),
            ttl: settings.scenario_cache_ttl(),
            read_retries: settings.read_retries(),
        }
    }

    pub async fn list(&self, deal_id: &str) -> Result<Vec<Scenario>, ScenarioFetchError> {
        let epoch = {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.lists.get(deal_id) {
                if entry.is_fresh(self.ttl) {
                    return Ok(entry.scenarios.clone());
                }
            }
            cache.epoch(deal_id)
        };

        let fetched = match require_deal_id("list_scenarios", deal_id) {
            Ok(()) => self.fetch_with_retries(deal_id).await,
            Err(err) => Err(err),
        };

        let mut cache = self.cache.lock().await;
        match fetched {
            Ok(scenarios) => {
                let invalidated = cache.epoch(deal_id) != epoch;
                cache.lists.insert(
                    deal_id.to_string(),
                    CachedList {
                        scenarios: scenarios.clone(),
                        fetched_at: Instant::now(),
                        invalidated,
                    },
                );
                tracing::debug!(deal_id, count = scenarios.len(), "scenario list refreshed");
                Ok(scenarios)
            }
            Err(source) => {
                let stale = cache.lists.get(deal_id).map(|e| e.scenarios.clone());
                tracing::warn!(
                    deal_id,
                    has_stale = stale.is_some(),
                    error = %source,
                    "scenario list fetch failed"
                );
                Err(ScenarioFetchError {
                    deal_id: deal_id.to_string(),
                    source,
                    stale,
                })
            }
        }
    }

    async fn fetch_with_retries(&self, deal_id: &str) -> Result<Vec<Scenario>, SolverError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.solver.list_scenarios(deal_id).await {
                Ok(scenarios) => return Ok(scenarios),
                Err(err) if err.is_retryable() && attempt <= self.read_retries => {
                    tracing::warn!(attempt, deal_id, error = %err, "scenario list fetch failed; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Creates a scenario and invalidates the deal's cached list. Never retried.
    pub async fn create(&self, deal_id: &str, input: NewScenario) -> Result<Scenario, SolverError> {
        require_deal_id("create_scenario", deal_id)?;
        if !input.delta.is_finite() {
            return Err(SolverError::validation(
                "create_scenario",
                format!("delta must be a finite number (got {})", input.delta),
            ));
        }

        let created = self.solver.create_scenario(deal_id, &input).await?;
        self.invalidate(deal_id).await;
        tracing::info!(deal_id, scenario_id = %created.id, name = %created.name, "scenario created");
        Ok(created)
    }

    /// Deletes a scenario the caller already confirmed. A scenario the solver no longer
    /// knows about counts as removed.
    pub async fn remove(&self, deal_id: &str, scenario_id: &str) -> Result<(), SolverError> {
        require_deal_id("delete_scenario", deal_id)?;
        if scenario_id.trim().is_empty() {
            return Err(SolverError::validation("delete_scenario", "scenario id must be non-empty"));
        }

        match self.solver.delete_scenario(scenario_id).await {
            Ok(()) => {
                tracing::info!(deal_id, scenario_id, "scenario deleted");
            }
            Err(err) if err.is_not_found() => {
                tracing::warn!(deal_id, scenario_id, "scenario already gone; treating delete as done");
            }
            Err(err) => return Err(err),
        }

        let remaining: Vec<Scenario> = {
            let mut cache = self.cache.lock().await;
            let remaining = match cache.lists.get_mut(deal_id) {
                Some(entry) => {
                    entry.scenarios.retain(|s| s.id != scenario_id);
                    entry.scenarios.clone()
                }
                None => Vec::new(),
            };
            invalidate_locked(&mut cache, deal_id);
            remaining
        };

        let key = ScopeKey::scenario(deal_id);
        if self.selection.get(&key).as_deref() == Some(scenario_id) {
            match remaining.first() {
                Some(next) => self.selection.set(&key, next.id.clone()),
                None => self.selection.clear(&key),
            }
        }
        Ok(())
    }

    /// Forces the next `list` for this deal to refetch; the old list stays available as stale.
    pub async fn invalidate(&self, deal_id: &str) {
        let mut cache = self.cache.lock().await;
        invalidate_locked(&mut cache, deal_id);
    }

    /// Last fetched list regardless of freshness.
    pub async fn cached(&self, deal_id: &str) -> Option<Vec<Scenario>> {
        self.cache
            .lock()
            .await
            .lists
            .get(deal_id)
            .map(|e| e.scenarios.clone())
    }
}

fn invalidate_locked(cache: &mut CacheState, deal_id: &str) {
    *cache.epochs.entry(deal_id.to_string()).or_insert(0) += 1;
    if let Some(entry) = cache.lists.get_mut(deal_id) {
        entry.invalidated = true;
    }
}

fn require_deal_id(stage: &'static str, deal_id: &str) -> Result<(), SolverError> {
    if deal_id.trim().is_empty() {
        return Err(SolverError::validation(stage, "deal id must be non-empty"));
    }
    Ok(())
}
