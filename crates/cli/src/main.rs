use anyhow::Context;
use clap::{Parser, Subcommand};
use dealdesk_core::desk::{DealDesk, OptimizationParams};
use dealdesk_core::domain::optimization::{action_mix, OptimizationRun, RunConstraints};
use dealdesk_core::domain::scenario::{NewScenario, ScenarioVariable};
use dealdesk_core::optimize::client::{JobSnapshot, JobState};
use dealdesk_core::optimize::plan::confidence_tier;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "dealdesk")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// What-if scenarios for a deal.
    Scenarios {
        #[command(subcommand)]
        command: ScenarioCommand,
    },
    /// Fund-level optimization runs.
    Optimize {
        #[command(subcommand)]
        command: OptimizeCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ScenarioCommand {
    List {
        #[arg(long)]
        deal_id: String,
    },
    Create {
        #[arg(long)]
        deal_id: String,
        /// interest, exit_cap, rent or vacancy.
        #[arg(long)]
        variable: String,
        #[arg(long, allow_hyphen_values = true)]
        delta: f64,
        #[arg(long)]
        name: Option<String>,
    },
    Delete {
        #[arg(long)]
        deal_id: String,
        #[arg(long)]
        scenario_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum OptimizeCommand {
    /// Submit a run and poll it until it settles.
    Submit {
        #[arg(long)]
        fund_id: String,
        #[arg(long, default_value_t = 5)]
        horizon_years: u32,
        #[arg(long, default_value_t = 1.25)]
        min_dscr: f64,
        #[arg(long, default_value_t = 0.65)]
        max_leverage: f64,
        /// Write the completed plan as CSV.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Poll an existing run until it settles.
    Watch {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Poll the last run remembered for a fund.
    Resume {
        #[arg(long)]
        fund_id: String,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = dealdesk_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    let desk = DealDesk::from_settings(&settings)?;

    let result = match args.command {
        Command::Scenarios { command } => run_scenarios(&desk, command).await,
        Command::Optimize { command } => run_optimize(&desk, command).await,
    };

    if let Err(err) = &result {
        sentry_anyhow::capture_anyhow(err);
        tracing::error!(error = %format!("{err:#}"), "dealdesk command failed");
    }
    result
}

fn init_sentry(settings: &dealdesk_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

async fn run_scenarios(desk: &DealDesk, command: ScenarioCommand) -> anyhow::Result<()> {
    match command {
        ScenarioCommand::List { deal_id } => {
            let scenarios = match desk.list_scenarios(&deal_id).await {
                Ok(scenarios) => scenarios,
                Err(err) => {
                    let Some(stale) = err.stale.clone() else {
                        return Err(err.into());
                    };
                    tracing::warn!(%deal_id, error = %err, "showing last known scenarios");
                    stale
                }
            };
            let active = desk.active_in(&deal_id, &scenarios);
            for scenario in &scenarios {
                let marker = match active {
                    Some(a) if a.id == scenario.id => "*",
                    _ => " ",
                };
                let metrics = serde_json::to_string(&desk.derive_metrics(scenario))?;
                let irr = scenario
                    .irr
                    .map(|v| format!("{:.2}%", v * 100.0))
                    .unwrap_or_else(|| "-".to_string());
                println!("{marker} {}\t{}\tirr={irr}\t{metrics}", scenario.id, scenario.name);
            }
        }
        ScenarioCommand::Create {
            deal_id,
            variable,
            delta,
            name,
        } => {
            let variable: ScenarioVariable = variable.parse().map_err(anyhow::Error::msg)?;
            let created = desk
                .create_scenario(&deal_id, NewScenario { variable, delta, name })
                .await
                .with_context(|| format!("create scenario for deal {deal_id} failed"))?;
            println!("{}\t{}", created.id, created.name);
        }
        ScenarioCommand::Delete {
            deal_id,
            scenario_id,
        } => {
            desk.delete_scenario(&deal_id, &scenario_id)
                .await
                .with_context(|| format!("delete scenario {scenario_id} failed"))?;
            match desk.active_scenario(&deal_id).await? {
                Some(active) => println!("deleted {scenario_id}; active is now {}", active.id),
                None => println!("deleted {scenario_id}; no scenarios left"),
            }
        }
    }
    Ok(())
}

async fn run_optimize(desk: &DealDesk, command: OptimizeCommand) -> anyhow::Result<()> {
    let csv = match command {
        OptimizeCommand::Submit {
            fund_id,
            horizon_years,
            min_dscr,
            max_leverage,
            csv,
        } => {
            let params = OptimizationParams {
                target_horizon_years: horizon_years,
                constraints: RunConstraints {
                    min_dscr,
                    max_leverage,
                },
            };
            let handle = desk.submit_optimization(&fund_id, params).await?;
            tracing::info!(%fund_id, run_id = handle.run_id(), "optimization submitted");
            csv
        }
        OptimizeCommand::Watch { run_id, csv } => {
            desk.load_run(&run_id)?;
            csv
        }
        OptimizeCommand::Resume { fund_id, csv } => {
            if desk.resume_run(&fund_id).is_none() {
                anyhow::bail!("no remembered run for fund {fund_id}");
            }
            csv
        }
    };

    let snapshot = watch_until_settled(desk).await?;
    if snapshot.state == JobState::Idle {
        anyhow::bail!(
            "polling stopped: {}",
            snapshot.last_error.as_deref().unwrap_or("no details")
        );
    }
    let Some(run) = snapshot.run.as_ref() else {
        anyhow::bail!(
            "run is gone: {}",
            snapshot.last_error.as_deref().unwrap_or("no details")
        );
    };
    print_run(desk, run);

    if let Some(path) = csv {
        let body = desk.export_csv(run)?;
        std::fs::write(&path, body).with_context(|| format!("write {} failed", path.display()))?;
        tracing::info!(path = %path.display(), "plan exported");
    }
    Ok(())
}

async fn watch_until_settled(desk: &DealDesk) -> anyhow::Result<JobSnapshot> {
    let mut rx = desk.jobs().subscribe();
    loop {
        let snapshot = rx.borrow_and_update().clone();
        report_progress(&snapshot);
        if snapshot.state.is_settled() {
            return Ok(snapshot);
        }

        tokio::select! {
            changed = rx.changed() => changed.context("job client closed")?,
            _ = tokio::signal::ctrl_c() => {
                desk.stop_polling();
                anyhow::bail!("interrupted; polling stopped");
            }
        }
    }
}

fn report_progress(snapshot: &JobSnapshot) {
    let status = snapshot
        .run
        .as_ref()
        .map(|r| r.status.to_string())
        .unwrap_or_else(|| "-".to_string());
    match &snapshot.state {
        JobState::Polling { run_id } => {
            tracing::info!(%run_id, %status, stale = snapshot.stale, "polling")
        }
        JobState::Submitting => tracing::info!("submitting"),
        JobState::Completed { run_id } | JobState::Failed { run_id } => {
            tracing::info!(%run_id, %status, "run settled")
        }
        JobState::Idle => {}
    }
}

fn print_run(desk: &DealDesk, run: &OptimizationRun) {
    println!("run {} ({})", run.id, run.status);
    if let Some(uplift) = run.irr_uplift() {
        println!("irr uplift: {:+.2}pp", uplift * 100.0);
    }
    for (action_type, count) in action_mix(run.plan()) {
        println!("  {action_type}: {count}");
    }
    for group in &desk.grouped_actions(run) {
        println!("{}", group.label);
        for action in &group.actions {
            let amount = action
                .details
                .amount_for(action.action_type)
                .map(|v| format!(" {v:.0}"))
                .unwrap_or_default();
            println!(
                "  {}\t{}{amount}\t{:.2} ({})",
                action.asset_id,
                action.action_type,
                action.confidence_score,
                confidence_tier(action.confidence_score).as_str()
            );
        }
    }
}
