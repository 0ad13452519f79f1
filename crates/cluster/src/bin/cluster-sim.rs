//! cluster-sim: runs a coordinator against in-process simulated clusters.
//!
//! Selects an environment for a task only the clusters can run, dispatches it
//! as a single task, then fans an inner task out over every environment and
//! prints a JSON summary of where the work ran.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use kiln_cluster::{
    ClusterCoordinator, ClusterTaskInvoker, DuplicationMode, InnerTaskParameters, TaskInvoker,
};
use kiln_compute::FixedCountPredicate;
use kiln_core::config::load_dotenv;
use kiln_core::{
    Capability, ExecutionConfig, ExecutionEnvironment, FnTaskFactory, PropertySelector,
    TaskFactory,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Simulated cluster: environment selection, task races and inner task fan-out.
#[derive(Parser, Debug)]
#[command(name = "cluster-sim", version, about)]
struct Cli {
    /// Number of simulated clusters.
    #[arg(long, env = "KILN_SIM_CLUSTERS", default_value_t = 3)]
    clusters: usize,

    /// Total inner task invocations across the cluster.
    #[arg(long, env = "KILN_SIM_INVOCATIONS", default_value_t = 24)]
    invocations: u32,

    /// Per-environment ceiling on concurrent invocations (0 = unlimited).
    #[arg(long, env = "KILN_SIM_ENVIRONMENT_FACTOR", default_value_t = 0)]
    environment_factor: i32,

    /// Simulated work per invocation in milliseconds.
    #[arg(long, env = "KILN_SIM_WORK_MS", default_value_t = 5)]
    work_ms: u64,
}

#[derive(Serialize)]
struct Summary {
    local_environment: String,
    clusters: Vec<String>,
    selected_environment: String,
    single_task_ran_in: String,
    inner_invocations: u32,
    inner_failures: usize,
    invocations_per_environment: BTreeMap<String, u32>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = ExecutionConfig::from_env();
    config.log_summary();

    let local = ExecutionEnvironment::new().with_property("role", "coordinator");
    let coordinator = ClusterCoordinator::new(local, &config);

    let mut clusters = Vec::with_capacity(cli.clusters);
    for i in 0..cli.clusters {
        let environment = ExecutionEnvironment::new()
            .with_property("role", "worker")
            .with_property("slot", i as u64);
        let invoker = Arc::new(ClusterTaskInvoker::new(environment, &config));
        coordinator
            .connect(invoker.environment_id(), Arc::clone(&invoker) as Arc<dyn TaskInvoker>)
            .with_context(|| format!("connecting simulated cluster {i}"))?;
        clusters.push(invoker);
    }
    info!(clusters = clusters.len(), "Simulated clusters connected");

    // Only workers qualify, so selection has to go through the mailboxes.
    let worker_task: Arc<dyn TaskFactory<String>> = Arc::new(
        FnTaskFactory::new("where-am-i", |ctx| Ok(ctx.environment_id().to_string()))
            .with_capability(Capability::RemoteDispatchable)
            .with_selector(Arc::new(PropertySelector::new("role", "worker"))),
    );
    let selection = coordinator
        .select_environment(worker_task.as_ref(), None)
        .wait()
        .context("selecting an environment")?;
    info!(environment = %selection.environment_id, "Environment selected");

    let ran_in = coordinator
        .invoke_task(Arc::clone(&worker_task), &selection)
        .context("dispatching the single task")?
        .context("running the single task")?;

    let work = Duration::from_millis(cli.work_ms);
    let inner: Arc<dyn TaskFactory<String>> = Arc::new(
        FnTaskFactory::new("inner-work", move |ctx| {
            ctx.check_interrupted()?;
            thread::sleep(work);
            Ok(ctx.environment_id().to_string())
        })
        .with_capability(Capability::RemoteDispatchable)
        .with_capability(Capability::ComputationalInnerTasks)
        .with_token_count(1),
    );
    let parameters = InnerTaskParameters::new()
        .with_cluster_duplicate_factor(-1)
        .with_max_environment_factor(cli.environment_factor)
        .with_duplication(DuplicationMode::coordinated(FixedCountPredicate::new(
            cli.invocations,
        )));
    // Qualifier-free selection so the local environment takes part as well.
    let everywhere = kiln_core::SelectionResult::new(
        coordinator.local_environment().id(),
        Default::default(),
    );
    let results = coordinator
        .invoke_inner_task(inner, &everywhere, parameters)
        .context("starting the inner task")?;

    let mut per_environment = BTreeMap::new();
    let mut failures = 0;
    while let Some(result) = results.next()? {
        match result.into_result() {
            Ok(environment) => *per_environment.entry(environment).or_insert(0u32) += 1,
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, "inner invocation failed");
            }
        }
    }
    let counts = results.wait_finish();

    let summary = Summary {
        local_environment: coordinator.local_environment().id().to_string(),
        clusters: clusters.iter().map(|c| c.environment_id().to_string()).collect(),
        selected_environment: selection.environment_id.to_string(),
        single_task_ran_in: ran_in,
        inner_invocations: counts.invoked,
        inner_failures: failures,
        invocations_per_environment: per_environment,
    };
    coordinator.close();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
