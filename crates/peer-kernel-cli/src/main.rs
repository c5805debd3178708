use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use peer_kernel_core::{validate_seeded_answers, ExerciseConfig, SeededAnswer, SelectionAlgorithm};
use peer_kernel_store_sqlite::SqliteStore;
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pk")]
#[command(about = "Peer-instruction kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./peer_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show or replace the exercise configuration for one item.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Validate an authoring form (options, seeds, algorithm) without
    /// touching the database.
    Validate(ValidateArgs),
    /// List stored stage submissions for one item.
    Responses(ItemArgs),
    /// Per-option submission counts for one item, recomputed from storage.
    Stats(ItemArgs),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show(ItemArgs),
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
struct ItemArgs {
    #[arg(long)]
    course: String,
    #[arg(long)]
    item: String,
}

#[derive(Debug, Args)]
struct ConfigSetArgs {
    #[command(flatten)]
    item: ItemArgs,
    /// JSON file holding the full exercise configuration.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    /// JSON file holding {"options": [...], "seeds": [...], "algo": "..."}.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ValidateFile {
    options: Vec<String>,
    seeds: Vec<SeededAnswer>,
    algo: SelectionAlgorithm,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "data": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Config { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_config(command, &mut store)
        }
        Command::Validate(args) => run_validate(&args),
        Command::Responses(args) => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_responses(&args, &store)
        }
        Command::Stats(args) => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_stats(&args, &store)
        }
    }
}

fn run_config(command: ConfigCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        ConfigCommand::Show(args) => {
            let config = store
                .get_config(&args.course, &args.item)?
                .ok_or_else(|| anyhow!("no configuration stored for {}/{}", args.course, args.item))?;
            emit_json(serde_json::json!({
                "course_id": args.course,
                "item_id": args.item,
                "config": config
            }))
        }
        ConfigCommand::Set(args) => {
            let body = fs::read_to_string(&args.file).with_context(|| {
                format!("failed to read configuration file {}", args.file.display())
            })?;
            let config: ExerciseConfig = serde_json::from_str(&body).with_context(|| {
                format!("failed to parse configuration file {}", args.file.display())
            })?;
            config.validate().map_err(anyhow::Error::new)?;

            store.save_config(&args.item.course, &args.item.item, &config, OffsetDateTime::now_utc())?;
            store.delete_answers_for_item(&args.item.course, &args.item.item)?;
            emit_json(serde_json::json!({
                "course_id": args.item.course,
                "item_id": args.item.item,
                "success": true
            }))
        }
    }
}

fn run_validate(args: &ValidateArgs) -> Result<()> {
    let body = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read form file {}", args.file.display()))?;
    let form: ValidateFile = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse form file {}", args.file.display()))?;

    validate_seeded_answers(&form.seeds, &form.options, form.algo).map_err(anyhow::Error::new)?;
    emit_json(serde_json::json!({
        "algo": form.algo,
        "options": form.options.len(),
        "seeds": form.seeds.len(),
        "valid": true
    }))
}

fn run_responses(args: &ItemArgs, store: &SqliteStore) -> Result<()> {
    let answers = store.list_answers_for_item(&args.course, &args.item)?;
    emit_json(serde_json::json!({
        "course_id": args.course,
        "item_id": args.item,
        "responses": answers
    }))
}

fn run_stats(args: &ItemArgs, store: &SqliteStore) -> Result<()> {
    let stats = store.stats_for_item(&args.course, &args.item)?;
    emit_json(serde_json::json!({
        "course_id": args.course,
        "item_id": args.item,
        "stats": stats
    }))
}
