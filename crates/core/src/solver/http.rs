use crate::config::Settings;
use crate::domain::contract::{CreateScenarioBody, ScenarioListResponse, WireRun, WireScenario, WireSubmitResponse};
use crate::domain::optimization::{OptimizationRequest, OptimizationRun, SubmitResponse};
use crate::domain::scenario::{NewScenario, Scenario};
use crate::solver::error::SolverError;
use crate::solver::{SolverClient, SolverResult};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct HttpSolverClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpSolverClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let base_url = settings.require_solver_base_url()?;
        let timeout = Duration::from_secs(settings.solver_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        Self::new(base_url, settings.solver_api_key.clone(), timeout)
    }

    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("SOLVER_BASE_URL is not a valid URL: {base_url}"))?;
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "SOLVER_BASE_URL cannot be used as a base URL: {base_url}"
        );

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build solver http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn headers(&self, stage: &'static str) -> SolverResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| SolverError::validation(stage, format!("invalid api key header: {e}")))?;
            headers.insert("x-api-key", value);
        }
        Ok(headers)
    }

    /// Sends the request and returns the body of a 2xx response.
    async fn send(
        &self,
        stage: &'static str,
        what: &str,
        req: reqwest::RequestBuilder,
    ) -> SolverResult<String> {
        let res = req
            .headers(self.headers(stage)?)
            .send()
            .await
            .map_err(|e| classify_transport(stage, e))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| SolverError::network(stage, format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            tracing::debug!(stage, %status, body = %text, "solver returned non-success status");
            return Err(classify_status(stage, what, status, &text));
        }

        Ok(text)
    }
}

fn decode<T: DeserializeOwned>(stage: &'static str, text: &str) -> SolverResult<T> {
    serde_json::from_str::<T>(text)
        .map_err(|e| SolverError::validation(stage, format!("unexpected response shape ({e}): {text}")))
}

fn classify_transport(stage: &'static str, err: reqwest::Error) -> SolverError {
    if err.is_builder() {
        SolverError::validation(stage, err)
    } else {
        SolverError::network(stage, err)
    }
}

fn classify_status(stage: &'static str, what: &str, status: StatusCode, body: &str) -> SolverError {
    if status == StatusCode::NOT_FOUND {
        return SolverError::not_found(what);
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return SolverError::network(stage, format!("HTTP {status}: {body}"));
    }
    SolverError::validation(stage, format!("HTTP {status}: {body}"))
}

#[async_trait::async_trait]
impl SolverClient for HttpSolverClient {
    fn solver_name(&self) -> &'static str {
        "external_http_solver"
    }

    async fn list_scenarios(&self, deal_id: &str) -> SolverResult<Vec<Scenario>> {
        const STAGE: &str = "list_scenarios";
        let req = self
            .http
            .get(self.endpoint(&["scenarios"]))
            .query(&[("dealId", deal_id)]);
        let text = self.send(STAGE, &format!("deal {deal_id}"), req).await?;
        decode::<ScenarioListResponse>(STAGE, &text)?.validate_and_into_scenarios(deal_id)
    }

    async fn create_scenario(&self, deal_id: &str, input: &NewScenario) -> SolverResult<Scenario> {
        const STAGE: &str = "create_scenario";
        let body = CreateScenarioBody {
            var: input.variable,
            delta: input.delta,
            name: Some(input.resolved_name()),
        };
        let req = self
            .http
            .post(self.endpoint(&["scenarios"]))
            .query(&[("dealId", deal_id)])
            .json(&body);
        let text = self.send(STAGE, &format!("deal {deal_id}"), req).await?;
        decode::<WireScenario>(STAGE, &text)?.validate_and_into_scenario(deal_id)
    }

    async fn delete_scenario(&self, scenario_id: &str) -> SolverResult<()> {
        let req = self.http.delete(self.endpoint(&["scenarios", scenario_id]));
        self.send("delete_scenario", &format!("scenario {scenario_id}"), req)
            .await?;
        Ok(())
    }

    async fn submit_optimization(&self, request: &OptimizationRequest) -> SolverResult<SubmitResponse> {
        const STAGE: &str = "submit_optimization";
        let req = self.http.post(self.endpoint(&["fund", "optimize"])).json(request);
        let text = self.send(STAGE, &format!("fund {}", request.fund_id), req).await?;
        decode::<WireSubmitResponse>(STAGE, &text)?.validate_and_into_response()
    }

    async fn fetch_run(&self, run_id: &str) -> SolverResult<OptimizationRun> {
        const STAGE: &str = "fetch_run";
        let req = self.http.get(self.endpoint(&["fund", "optimize", run_id]));
        let text = self.send(STAGE, &format!("optimization run {run_id}"), req).await?;
        decode::<WireRun>(STAGE, &text)?.validate_and_into_run(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::optimization::RunConstraints;
    use serde_json::json;

    fn client(base: &str) -> HttpSolverClient {
        HttpSolverClient::new(base, None, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn endpoint_joins_and_escapes_segments() {
        let c = client("https://solver.example.com/api/");
        assert_eq!(
            c.endpoint(&["scenarios", "a b/c"]).as_str(),
            "https://solver.example.com/api/scenarios/a%20b%2Fc"
        );

        let c = client("https://solver.example.com");
        assert_eq!(
            c.endpoint(&["fund", "optimize", "run-9"]).as_str(),
            "https://solver.example.com/fund/optimize/run-9"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(HttpSolverClient::new("not a url", None, Duration::from_secs(1)).is_err());
        assert!(HttpSolverClient::new("mailto:ops@example.com", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn classifies_http_statuses() {
        assert!(classify_status("s", "run r1", StatusCode::NOT_FOUND, "").is_not_found());
        assert!(classify_status("s", "x", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status("s", "x", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(matches!(
            classify_status("s", "x", StatusCode::UNPROCESSABLE_ENTITY, "missing var"),
            SolverError::Validation { .. }
        ));
    }

    #[test]
    fn request_bodies_match_solver_contract() {
        let request = OptimizationRequest {
            fund_id: "fund-1".to_string(),
            target_horizon_years: 5,
            constraints: RunConstraints {
                min_dscr: 1.3,
                max_leverage: 0.6,
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "fund_id": "fund-1",
                "target_horizon_years": 5,
                "constraints": {"min_dscr": 1.3, "max_leverage": 0.6}
            })
        );

        let body = CreateScenarioBody {
            var: crate::domain::scenario::ScenarioVariable::ExitCap,
            delta: -1.0,
            name: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"var": "exit_cap", "delta": -1.0})
        );
    }

    #[test]
    fn decode_reports_shape_errors_as_validation() {
        let err = decode::<WireSubmitResponse>("submit_optimization", "{\"status\":\"pending\"}").unwrap_err();
        assert!(matches!(err, SolverError::Validation { .. }));
    }
}
