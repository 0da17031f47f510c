use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use warden_core::config::EngineConfig;
use warden_core::policy::Policy;
use warden_history::HistoryLogger;
use warden_policy::PolicyValidator;
use warden_runtime::{ActionRegistry, InMemoryMetadataStore, Runner, TickContext, TickOutcome};
use warden_sim::{RecordingNotificationChannel, SimCluster, SimIndexSpec, SimOptions};

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Warden lifecycle policy tooling")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a policy document (JSON or YAML).
    Validate {
        /// Path to the policy file
        file: PathBuf,
    },

    /// Run a policy against a simulated index, one tick at a time.
    Simulate {
        /// Path to the policy file
        file: PathBuf,

        /// Engine configuration file (warden.yaml); defaults apply if absent
        #[arg(long)]
        config: Option<PathBuf>,

        /// Name of the simulated index
        #[arg(long, default_value = "logs-000001")]
        index: String,

        /// Number of ticks to run
        #[arg(long, default_value_t = 10)]
        ticks: u32,

        /// Document count of the simulated index
        #[arg(long, default_value_t = 0)]
        docs: u64,

        /// Size of the simulated index in bytes
        #[arg(long, default_value_t = 0)]
        size_bytes: u64,

        /// Primary shard count of the simulated index
        #[arg(long, default_value_t = 1)]
        shards: u32,

        /// Segment count of the simulated index
        #[arg(long, default_value_t = 1)]
        segments: u32,

        /// Age of the simulated index (e.g. "30d")
        #[arg(long, default_value = "0s")]
        age: String,

        /// Whether the index is the write target of a rollover alias
        #[arg(long, default_value_t = false)]
        aliased: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Validate { file } => run_validate(&file),

        Command::Simulate {
            file,
            config,
            index,
            ticks,
            docs,
            size_bytes,
            shards,
            segments,
            age,
            aliased,
        } => {
            let age = humantime::parse_duration(&age)
                .map_err(|e| anyhow::anyhow!("invalid --age '{}': {}", age, e))?;
            let spec = SimIndexSpec {
                doc_count: docs,
                size_bytes,
                segment_count: segments,
                number_of_shards: shards,
                number_of_replicas: 1,
                age: chrono::Duration::from_std(age)?,
                has_rollover_alias: aliased,
            };
            let engine_config = match config {
                Some(path) => EngineConfig::from_file(&path)?,
                None => EngineConfig::default(),
            };
            run_simulate(&file, &engine_config, &index, ticks, spec).await
        }
    }
}

fn load_policy(path: &Path) -> anyhow::Result<Policy> {
    let content = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase();

    let policy = if ext == "yaml" || ext == "yml" {
        Policy::from_yaml(&content)?
    } else {
        Policy::from_json(&content)?
    };
    Ok(policy)
}

fn run_validate(file: &Path) -> anyhow::Result<()> {
    let policy = load_policy(file)?;

    match PolicyValidator::new().validate(&policy) {
        Ok(()) => {
            println!("✔ Policy '{}' is valid.", policy.policy_id);
            println!("  - file: {}", file.display());
            println!("  - states: {}", policy.states.len());
            for state in &policy.states {
                let actions: Vec<&str> = state
                    .actions
                    .iter()
                    .map(|a| a.kind.type_name())
                    .collect();
                println!(
                    "    - {:<16} actions=[{}] transitions={}",
                    state.name,
                    actions.join(", "),
                    state.transitions.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("✖ Policy is invalid: {}", e);
            Err(anyhow::anyhow!("policy validation failed"))
        }
    }
}

async fn run_simulate(
    file: &Path,
    engine_config: &EngineConfig,
    index: &str,
    ticks: u32,
    spec: SimIndexSpec,
) -> anyhow::Result<()> {
    let policy = load_policy(file)?;
    PolicyValidator::new()
        .validate(&policy)
        .map_err(|e| anyhow::anyhow!("policy validation failed: {}", e))?;

    let cluster = Arc::new(SimCluster::with_options(SimOptions::default()));
    cluster.create_index(index, spec);

    let store = Arc::new(InMemoryMetadataStore::new());
    let notifications = Arc::new(RecordingNotificationChannel::new());
    let history = Arc::new(HistoryLogger::new(engine_config.history.clone())?);
    let runner = Runner::new(
        ActionRegistry::new(),
        cluster.clone(),
        store,
        notifications.clone(),
        history,
    );

    let index_uuid = format!("sim-{}", index);
    println!(
        "Simulating policy '{}' against index '{}' for {} ticks (interval {}, jitter {})",
        policy.policy_id,
        index,
        ticks,
        humantime::format_duration(engine_config.job_interval),
        engine_config.jitter,
    );

    for tick in 1..=ticks {
        let outcome = runner
            .run_tick(&TickContext {
                index,
                index_uuid: &index_uuid,
                policy: &policy,
                policy_seq_no: 1,
                policy_primary_term: 1,
            })
            .await?;

        println!("tick {:>3}: {}", tick, describe(&outcome));

        if matches!(
            outcome,
            TickOutcome::PolicyCompleted | TickOutcome::AlreadyCompleted
        ) {
            break;
        }
        if matches!(outcome, TickOutcome::Stuck) {
            println!("index is stuck; clear it with an explicit retry");
            break;
        }
    }

    for (channel, message) in notifications.messages() {
        println!("notification -> {}: {}", channel, message);
    }

    if let Some(explain) = runner.explain(&index_uuid).await? {
        println!("final metadata:");
        println!("{}", serde_json::to_string_pretty(&explain.metadata)?);
    }

    Ok(())
}

fn describe(outcome: &TickOutcome) -> String {
    match outcome {
        TickOutcome::Initialized => "initialized metadata at the default state".to_string(),
        TickOutcome::Stuck => "stuck awaiting explicit retry".to_string(),
        TickOutcome::AlreadyCompleted => "policy already completed".to_string(),
        TickOutcome::AwaitingRetry => "backing off before retry".to_string(),
        TickOutcome::StepExecuted { step, status } => format!("{} -> {}", step, status),
        TickOutcome::TransitionReady { to } => format!("transition ready -> '{}'", to),
        TickOutcome::Transitioned { to } => format!("entered state '{}'", to),
        TickOutcome::PolicyCompleted => "policy completed".to_string(),
        TickOutcome::Failed { cause } => format!("failed: {}", cause),
        TickOutcome::DroppedOnConflict => "dropped on write conflict".to_string(),
    }
}
