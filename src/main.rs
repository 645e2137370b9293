use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use repcoach::logging::{init_logging, LogLevel};
use repcoach::rescore::RescoreReport;
use repcoach::{
    catalog, rescore, AppConfig, Exercise, Operation, RepCoachService, SetAggregator,
    SetActivity, SetState, SqliteSessionStore,
};

/// RepCoach - Rep Scoring and Coaching Engine
///
/// Scores exercise reps against per-exercise form rules, aggregates them per
/// training set and picks a coaching cue when the set ends.
#[derive(Parser)]
#[command(name = "repcoach")]
#[command(author = "RepCoach Contributors")]
#[command(version)]
#[command(about = "Rep scoring and coaching engine", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the session database path
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke an endpoint with a JSON body and print the JSON response
    Call {
        /// start-set, record-rep or end-set
        operation: Operation,

        /// Request body; `-` reads it from stdin
        payload: String,
    },

    /// Show the persisted state of a set
    Set {
        set_id: i64,

        /// Print raw JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// List Active sets with no activity for a while
    Stale {
        /// Idle minutes (default from config)
        #[arg(short, long)]
        minutes: Option<i64>,
    },

    /// Manage the exercise catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },

    /// Re-score a CSV of rep metrics against an exercise's rules
    Rescore {
        /// CSV file with one rep per row
        #[arg(short, long)]
        file: PathBuf,

        /// Exercise whose rules apply
        #[arg(short, long)]
        exercise: i64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configure application settings
    Config {
        /// Write a default config file
        #[arg(long)]
        init: bool,

        /// Print the active configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Load exercises from a TOML or JSON catalog file
    Import {
        file: PathBuf,
    },

    /// List exercises
    List {
        /// Filter on primary muscle (substring, case-insensitive)
        #[arg(short, long)]
        muscle: Option<String>,

        /// Maximum rows
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[derive(Tabled)]
struct ExerciseRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Muscle")]
    muscle: String,
    #[tabled(rename = "Rules")]
    rules: String,
}

impl From<&Exercise> for ExerciseRow {
    fn from(exercise: &Exercise) -> Self {
        let rules = exercise
            .rules
            .as_ref()
            .map(|rules| {
                rules
                    .iter()
                    .map(|rule| format!("{} {}={}", rule.kind(), rule.threshold_key(), rule.threshold()))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_else(|| "-".to_string());

        Self {
            id: exercise.id,
            name: exercise.name.clone(),
            muscle: exercise.primary_muscle.clone().unwrap_or_else(|| "-".to_string()),
            rules,
        }
    }
}

#[derive(Tabled)]
struct StaleRow {
    #[tabled(rename = "Set")]
    set_id: i64,
    #[tabled(rename = "Workout")]
    workout_id: i64,
    #[tabled(rename = "Exercise")]
    exercise_id: i64,
    #[tabled(rename = "Reps")]
    rep_count: u32,
    #[tabled(rename = "Last update")]
    updated_at: String,
}

impl From<&SetActivity> for StaleRow {
    fn from(activity: &SetActivity) -> Self {
        Self {
            set_id: activity.set_id,
            workout_id: activity.workout_id,
            exercise_id: activity.exercise_id,
            rep_count: activity.rep_count,
            updated_at: activity.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Tabled)]
struct RepRow {
    #[tabled(rename = "Rep")]
    rep_index: i64,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Violations")]
    violations: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if cli.verbose > 0 {
        config.logging.level = LogLevel::from_verbosity(cli.verbose);
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Config { init, show } => {
            if init {
                let mut fresh = AppConfig::default();
                let path = match &cli.config {
                    Some(path) => {
                        fresh.save_to_file(path)?;
                        path.clone()
                    }
                    None => {
                        fresh.save_default()?;
                        AppConfig::default_config_path()
                    }
                };
                println!("{} {}", "✓ Wrote default config to".green(), path.display());
            }
            if show || !init {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }

        Commands::Call { operation, payload } => {
            let raw = if payload == "-" {
                let mut buffer = String::new();
                std::io::stdin()
                    .read_to_string(&mut buffer)
                    .context("Failed to read request body from stdin")?;
                buffer
            } else {
                payload
            };

            let service = RepCoachService::new(open_aggregator(&config, cli.db.as_deref())?);
            let response = service.handle_json(operation, &raw);
            println!("{}", serde_json::to_string_pretty(&response.body)?);
            if !response.is_ok() {
                eprintln!(
                    "{}",
                    format!("✗ {} failed with status {}", operation, response.status_code()).red()
                );
                std::process::exit(1);
            }
        }

        Commands::Set { set_id, json } => {
            let aggregator = open_aggregator(&config, cli.db.as_deref())?;
            let set = aggregator.get_set(set_id).map_err(|e| anyhow::anyhow!(e.user_message()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&set)?);
            } else {
                print_set(&set);
            }
        }

        Commands::Stale { minutes } => {
            let aggregator = open_aggregator(&config, cli.db.as_deref())?;
            let stale = match minutes {
                Some(minutes) => aggregator.stale_sets(chrono::Duration::minutes(minutes))?,
                None => aggregator.default_stale_sets()?,
            };
            let minutes = minutes.unwrap_or(aggregator.settings().stale_after_minutes);

            if stale.is_empty() {
                println!("{}", format!("No Active sets idle for {} minutes", minutes).green());
            } else {
                let rows: Vec<StaleRow> = stale.iter().map(StaleRow::from).collect();
                println!("{}", Table::new(rows).with(Style::rounded()).to_string());
                println!("{}", format!("{} stale set(s)", stale.len()).yellow());
            }
        }

        Commands::Catalog { command } => {
            let store = open_store(&config, cli.db.as_deref())?;
            match command {
                CatalogCommands::Import { file } => {
                    let count = catalog::import_catalog(&store, &file)?;
                    println!(
                        "{}",
                        format!("✓ Imported {} exercise(s) from {}", count, file.display()).green()
                    );
                }
                CatalogCommands::List { muscle, limit } => {
                    let exercises = catalog::list_exercises(&store, muscle.as_deref(), limit)?;
                    let rows: Vec<ExerciseRow> = exercises.iter().map(ExerciseRow::from).collect();
                    println!("{}", Table::new(rows).with(Style::rounded()).to_string());
                }
            }
        }

        Commands::Rescore {
            file,
            exercise,
            json,
        } => {
            let store = open_store(&config, cli.db.as_deref())?;
            let report = rescore::rescore_file(&store, &file, exercise)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from_file(path),
        None => AppConfig::load_or_default(),
    }
}

fn open_store(config: &AppConfig, db_override: Option<&Path>) -> Result<SqliteSessionStore> {
    let db_path = db_override.unwrap_or(&config.store.database_path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }

    SqliteSessionStore::open_with_timeout(
        db_path,
        Duration::from_millis(config.store.busy_timeout_ms),
    )
    .with_context(|| format!("Failed to open session store: {}", db_path.display()))
}

fn open_aggregator(config: &AppConfig, db_override: Option<&Path>) -> Result<SetAggregator> {
    let store = open_store(config, db_override)?;
    Ok(SetAggregator::with_settings(
        Arc::new(store),
        config.engine.clone(),
    ))
}

fn print_set(set: &SetState) {
    println!("{}", format!("Set {}", set.set_id).bold());
    println!("  Workout:   {}", set.workout_id);
    println!("  Exercise:  {}", set.exercise_id);
    println!("  Set no:    {}", set.set_no);
    println!("  Status:    {}", set.status.as_str());
    println!("  Reps:      {} / {}", set.rep_count, set.expected_reps);
    match set.mean_score() {
        Some(mean) => println!("  Mean:      {:.3}", mean),
        None => println!("  Mean:      -"),
    }
    for (kind, count) in &set.histogram {
        println!("  {:<10} {}", format!("{}:", kind), count);
    }
    println!("  Updated:   {}", set.updated_at.to_rfc3339());
    if let Some(suggestion) = &set.suggestion {
        println!("  Cue:       {}", suggestion.cue.cyan());
    }
}

fn print_report(report: &RescoreReport) {
    let rows: Vec<RepRow> = report
        .reps
        .iter()
        .map(|rep| RepRow {
            rep_index: rep.rep_index,
            score: format!("{:.2}", rep.score.score),
            violations: rep
                .score
                .violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()).to_string());

    match report.mean_score {
        Some(mean) => println!("Mean score: {}", format!("{:.3}", mean).bold()),
        None => println!("Mean score: -"),
    }
    for (kind, count) in &report.histogram {
        println!("  {}: {}", kind, count);
    }
    println!("{} {}", "Cue:".bold(), report.suggestion.cue.cyan());
}
