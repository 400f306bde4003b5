use anyhow::Result;
use clap::{Parser, Subcommand};
use instruction_arbiter::persistence::PersistedState;
use instruction_arbiter::replay::{Replay, parse_script};
use instruction_arbiter::scheduler::ManualClock;
use instruction_arbiter::{
    ArbiterConfig, DatabaseConfig, Instruction, InstructionKind, Scheduler, StateStore,
    SurrealStore, Verifier, create_connection, ensure_schema, load_config,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "instruction-arbiter")]
#[command(about = "Single-slot instruction arbitration and scheduling")]
struct Cli {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/instruction-arbiter/arbiter.json or ./arbiter.json)
    #[arg(long, global = true, env = "ARBITER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate instruction JSON (one object or an array) and authorize it
    /// against the configured producers
    Validate { file: PathBuf },
    /// List configured producers
    Producers,
    /// Print the conflict table and check it for asymmetric rules
    CheckRules,
    /// Run a replay script against a fresh scheduler
    Replay {
        script: PathBuf,
        /// Persist to this database; volatile when omitted
        #[arg(long)]
        db_url: Option<String>,
        /// Advance a virtual clock on `wait` steps instead of sleeping
        #[arg(long, default_value_t = false)]
        virtual_time: bool,
    },
    /// Show the persisted scheduler state
    Inspect {
        #[arg(long, default_value = "memory", env = "SURREALDB_URL")]
        db_url: String,
    },
    /// Initialize the database
    Init {
        #[arg(long, default_value = "memory", env = "SURREALDB_URL")]
        db_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("instruction_arbiter=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { file } => validate(&config, &file)?,
        Commands::Producers => {
            let registry = config.registry();
            if registry.is_empty() {
                println!("No producers configured.");
                return Ok(());
            }

            println!(
                "{:<20} {:<28} {:<9} {:<10} {}",
                "ID", "NAME", "PRIORITY", "RATE/MIN", "KINDS"
            );
            println!("{}", "-".repeat(100));
            for producer in registry.list() {
                let rate = producer
                    .rate_limit_per_minute
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let kinds = producer
                    .permitted_kinds
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                println!(
                    "{:<20} {:<28} {:<9} {:<10} {}",
                    producer.id.as_str(),
                    producer.name.as_str(),
                    producer.priority,
                    rate,
                    kinds
                );
            }
        }
        Commands::CheckRules => {
            let table = config.conflict_table()?;
            for kind in InstructionKind::ALL {
                let Some(rule) = table.rule(kind) else {
                    println!("{}: no rule", kind);
                    continue;
                };
                let list = |kinds: &std::collections::BTreeSet<InstructionKind>| {
                    kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
                };
                println!("{}", kind);
                println!("    conflicts with: {}", list(&rule.conflicts_with));
                println!("    supersedes:     {}", list(&rule.supersedes));
            }
            println!("Conflict rules are symmetric.");
        }
        Commands::Replay {
            script,
            db_url,
            virtual_time,
        } => {
            let raw = std::fs::read_to_string(&script)?;
            let steps = parse_script(&raw)?;

            let mut builder = Scheduler::builder(config.registry())
                .conflicts(config.conflict_table()?)
                .settings(config.scheduler.clone());

            if let Some(url) = db_url {
                info!("Using database url for replay: {}", url);
                let db = create_connection(DatabaseConfig::for_url(url)).await?;
                ensure_schema(&db).await?;
                builder = builder.store(Arc::new(SurrealStore::new(db)));
            }

            let clock = virtual_time.then(ManualClock::default);
            if let Some(clock) = &clock {
                builder = builder.manual_clock(clock);
            }

            let mut replay = Replay::new(builder.init().await?);
            if let Some(clock) = clock {
                replay = replay.with_manual_clock(clock);
            }

            for report in replay.run(steps).await {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            replay.scheduler().dispose().await;
        }
        Commands::Inspect { db_url } => {
            let db = create_connection(DatabaseConfig::for_url(db_url)).await?;
            ensure_schema(&db).await?;

            let store = SurrealStore::new(db);
            let key = &config.scheduler.storage_key;
            let Some(raw) = store.get(key).await? else {
                println!("No persisted state under {}.", key);
                return Ok(());
            };

            let state = PersistedState::decode(&raw)?;
            if state.is_stale(chrono::Utc::now(), config.scheduler.staleness()) {
                warn!("State under {} is stale and would be discarded on restore", key);
            }
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Init { db_url } => {
            let db_config = DatabaseConfig::for_url(db_url);
            info!("Using database url for initialization: {}", db_config.url);

            info!("Initializing database...");
            let db = create_connection(db_config).await?;
            ensure_schema(&db).await?;
            info!("Database initialized successfully");
        }
    }

    Ok(())
}

/// Decode, validate and authorize every instruction in `file`.
fn validate(config: &ArbiterConfig, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let verifier = Verifier::new(Arc::new(config.registry()));
    let mut failures = 0;

    for (index, item) in items.iter().enumerate() {
        let result = Instruction::from_json(&item.to_string())
            .map_err(instruction_arbiter::ArbiterError::from)
            .and_then(|instruction| {
                verifier.verify(&instruction)?;
                Ok(instruction)
            });

        match result {
            Ok(instruction) => println!("[{}] ok: {}", index, instruction.kind()),
            Err(e) => {
                failures += 1;
                println!("[{}] rejected: {}", index, e);
            }
        }
    }

    if failures > 0 {
        return Err(anyhow::anyhow!(
            "{} of {} instructions failed",
            failures,
            items.len()
        ));
    }
    Ok(())
}
