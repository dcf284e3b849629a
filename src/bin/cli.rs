//! Phone Orchestrator - multi-device task orchestration for Android automation
//!
//! This is the CLI entry point. Configuration comes from the saved settings
//! file, a `.env` file and the environment.
//!
//! ```text
//! phone-orchestrator run <task...>     run one task on the configured devices
//! phone-orchestrator plan <plan.json>  submit a plan file and wait for it
//! phone-orchestrator rule <rule.json>  add a schedule rule
//! phone-orchestrator serve             workers + scheduler + interactive intake
//! ```

use std::env;
use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use phone_orchestrator::adb::AdbClient;
use phone_orchestrator::decision::{DecisionRouter, LocalStepDecision, RemoteWorkflowDecision};
use phone_orchestrator::model::ModelClient;
use phone_orchestrator::schedule::ScheduleRule;
use phone_orchestrator::store::{JsonStore, StateStore};
use phone_orchestrator::queue::PlanSnapshot;
use phone_orchestrator::task::{HistoryFilter, PlanSpec};
use phone_orchestrator::transport::AdbTransport;
use phone_orchestrator::{
    Orchestrator, OrchestratorError, OrchestratorOptions, OrchestratorSettings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let settings = OrchestratorSettings::from_env();

    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "run" => {
            let task = args[1..].join(" ");
            if task.trim().is_empty() {
                bail!("usage: phone-orchestrator run <task...>");
            }
            run_once(&settings, PlanSpec::single(task)).await
        }
        "plan" => {
            let path = args.get(1).context("usage: phone-orchestrator plan <plan.json>")?;
            let content =
                std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            let spec: PlanSpec =
                serde_json::from_str(&content).with_context(|| format!("parsing {}", path))?;
            run_once(&settings, spec).await
        }
        "rule" => {
            let path = args.get(1).context("usage: phone-orchestrator rule <rule.json>")?;
            let content =
                std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            let rule: ScheduleRule =
                serde_json::from_str(&content).with_context(|| format!("parsing {}", path))?;
            let orchestrator = build(&settings)?;
            let id = orchestrator.add_rule(rule)?;
            println!("✅ Rule added: {}", id);
            Ok(())
        }
        "serve" => serve(&settings).await,
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("🤖 Phone Orchestrator");
    println!("Usage:");
    println!("  phone-orchestrator run <task...>");
    println!("  phone-orchestrator plan <plan.json>");
    println!("  phone-orchestrator rule <rule.json>");
    println!("  phone-orchestrator serve");
}

/// Wire settings into an orchestrator backed by the JSON store.
fn build(settings: &OrchestratorSettings) -> anyhow::Result<Orchestrator> {
    let client = ModelClient::new(settings.model_config()).context("building model client")?;
    let mut router = DecisionRouter::new(Arc::new(LocalStepDecision::new(client, &settings.lang)));
    if let Some(remote) = settings.remote_config() {
        let remote = RemoteWorkflowDecision::new(remote).context("building workflow client")?;
        router = router.with_remote(Arc::new(remote));
    }

    let adb = AdbClient::new().with_path(&settings.adb_path);
    let transport = Arc::new(AdbTransport::new(adb));

    let data_dir = settings
        .data_path()
        .context("cannot determine data directory; set DATA_DIR")?;
    let store: Arc<dyn StateStore> = Arc::new(JsonStore::open(&data_dir)?);

    let options = OrchestratorOptions {
        defaults: settings.step_defaults(),
        run_loop: settings.run_loop_config(),
        poll_interval: settings.poll_interval(),
        scheduler_tick: settings.scheduler_tick(),
    };
    Ok(Orchestrator::new(transport, router, Some(store), options)?)
}

/// Configured devices, or every device adb reports as ready.
async fn devices(settings: &OrchestratorSettings) -> anyhow::Result<Vec<String>> {
    if !settings.device_ids.is_empty() {
        return Ok(settings.device_ids.clone());
    }
    let found = AdbClient::new()
        .with_path(&settings.adb_path)
        .list_devices()
        .await?;
    if found.is_empty() {
        bail!("no devices found; connect one or set DEVICE_IDS");
    }
    Ok(found)
}

fn print_banner(settings: &OrchestratorSettings, devices: &[String]) {
    println!("🤖 Phone Orchestrator");
    println!("================================================");
    println!("Model: {} @ {}", settings.model_name, settings.model_base_url);
    match settings.remote_config() {
        Some(remote) => println!("Workflow: {}", remote.base_url),
        None => println!("Workflow: not configured (local decisions only)"),
    }
    println!("Language: {}", settings.lang);
    println!("Devices: {}", devices.join(", "));
    println!(
        "Limits: {} steps, {}s per step, {} retries",
        settings.max_steps, settings.step_timeout_secs, settings.max_retries
    );
    println!("================================================\n");
}

async fn run_once(settings: &OrchestratorSettings, spec: PlanSpec) -> anyhow::Result<()> {
    let devices = devices(settings).await?;
    print_banner(settings, &devices);

    let orchestrator = build(settings)?;
    orchestrator.start(&devices)?;

    let plan_id = orchestrator.submit_plan(spec)?;
    println!("📝 Plan submitted: {}\n", plan_id);

    let result = orchestrator.wait_plan(&plan_id, None).await;
    orchestrator.shutdown().await;
    let snapshot = result?;

    print_snapshot(&snapshot);
    for record in orchestrator.list_history(&HistoryFilter::plan(plan_id)) {
        let mark = if record.success { "✅" } else { "❌" };
        println!("{} [{}] {} ({})", mark, record.device_id, record.summary, record.step_id);
    }
    Ok(())
}

fn print_snapshot(snapshot: &PlanSnapshot) {
    println!(
        "📋 {} [{}] {:?} - {:.0}% ({}/{} done)",
        snapshot.name,
        snapshot.id,
        snapshot.status,
        snapshot.progress.percent,
        snapshot.progress.success + snapshot.progress.failed + snapshot.progress.skipped,
        snapshot.progress.total
    );
    for step in &snapshot.steps {
        let device = step.device_id.as_deref().unwrap_or("-");
        println!(
            "   {:<12} {:?} on {} ({} steps) {}",
            step.id,
            step.status,
            device,
            step.steps_executed,
            step.last_action.as_deref().unwrap_or("")
        );
    }
}

fn report(result: Result<(), OrchestratorError>, done: &str) {
    match result {
        Ok(()) => println!("✅ {}", done),
        Err(e) => eprintln!("❌ {}", e),
    }
}

async fn serve(settings: &OrchestratorSettings) -> anyhow::Result<()> {
    let devices = devices(settings).await?;
    print_banner(settings, &devices);

    let orchestrator = build(settings)?;
    orchestrator.start(&devices)?;

    println!("Interactive mode. Type a task to submit it.");
    println!("Commands: status [plan_id], cancel <id|all>, retry <item_id>, priority <item_id> <n>,");
    println!("          pause|resume|reset|delete <plan_id>, history, stats, rules, leases, quit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("📝 > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        let (command, rest) = input
            .split_once(char::is_whitespace)
            .map(|(c, r)| (c, r.trim()))
            .unwrap_or((input, ""));

        match command {
            "" => continue,
            "quit" | "exit" => break,
            "status" if rest.is_empty() => {
                for snapshot in orchestrator.plans() {
                    print_snapshot(&snapshot);
                }
            }
            "status" => match orchestrator.get_status(rest) {
                Ok(snapshot) => print_snapshot(&snapshot),
                Err(e) => eprintln!("❌ {}", e),
            },
            "cancel" if rest == "all" => {
                let (skipped, signalled) = orchestrator.cancel_all();
                println!("🛑 {} skipped, {} signalled", skipped, signalled);
            }
            "retry" => report(orchestrator.retry(rest), "Queued for retry"),
            "priority" => match rest.split_once(char::is_whitespace) {
                Some((item, value)) => match value.trim().parse::<i32>() {
                    Ok(priority) => report(orchestrator.set_priority(item, priority), "Priority set"),
                    Err(_) => eprintln!("❌ priority must be an integer"),
                },
                None => eprintln!("❌ usage: priority <item_id> <n>"),
            },
            "pause" => report(orchestrator.pause_plan(rest), "Paused"),
            "resume" => report(orchestrator.resume_plan(rest), "Resumed"),
            "reset" => report(orchestrator.reset_plan(rest), "Reset"),
            "delete" => report(orchestrator.delete_plan(rest), "Deleted"),
            "cancel" => match orchestrator.cancel(rest) {
                Ok(report) => println!("🛑 {:?}", report),
                Err(e) => eprintln!("❌ {}", e),
            },
            "history" => {
                let filter = HistoryFilter {
                    limit: Some(20),
                    ..Default::default()
                };
                for record in orchestrator.list_history(&filter) {
                    let mark = if record.success { "✅" } else { "❌" };
                    println!(
                        "{} {} [{}] {} - {}",
                        mark,
                        record.started_at.format("%m-%d %H:%M:%S"),
                        record.device_id,
                        record.task,
                        record.summary
                    );
                }
            }
            "stats" => {
                let stats = orchestrator.history_stats(&HistoryFilter::default());
                println!(
                    "📊 {} runs, {} ok, {} failed, {:.1}% success, avg {:.1}s / {:.1} steps",
                    stats.total,
                    stats.success,
                    stats.failed,
                    stats.success_rate,
                    stats.avg_duration_secs,
                    stats.avg_steps
                );
                for (error, count) in &stats.top_errors {
                    println!("   {} x{}", error, count);
                }
            }
            "rules" => {
                for rule in orchestrator.rules() {
                    let state = if rule.enabled { "on " } else { "off" };
                    println!("⏰ [{}] {} {} - {}", state, rule.id, rule.name, rule.describe());
                }
            }
            "leases" => {
                for lease in orchestrator.leases() {
                    println!(
                        "🔒 {} -> {} since {}",
                        lease.device_id,
                        lease.item_id,
                        lease.acquired_at.format("%H:%M:%S")
                    );
                }
            }
            _ => match orchestrator.submit_task(input) {
                Ok(plan_id) => println!("✅ Submitted: {}", plan_id),
                Err(e) => eprintln!("❌ {}", e),
            },
        }
    }

    println!("Stopping, waiting for running tasks...");
    orchestrator.shutdown().await;
    println!("Goodbye! 👋");
    Ok(())
}
