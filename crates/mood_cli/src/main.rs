use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use mood_calibration::CycleTrigger;
use mood_core::{ConversationalUnit, EngineConfig, ValidationMethod};
use mood_memory::{CalibrationScheduler, MoodEngine};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "moodcal", author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "MOOD_CONFIG", default_value = "mood.toml")]
    config: String,

    /// Database path, overrides the config file
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record conversational units from a JSON file ("-" for stdin)
    Ingest {
        file: String,
        /// Score each unit after recording it
        #[arg(long)]
        score: bool,
    },
    /// Score a recorded unit
    Score { unit_id: Uuid },
    /// Current mood of a unit
    Mood {
        unit_id: Uuid,
        /// Include the quality metrics and issues recorded with the score
        #[arg(long)]
        details: bool,
    },
    /// A participant's stored trajectory
    Trajectory {
        participant: String,
        /// Window length ending now, in hours
        #[arg(long, default_value_t = 24)]
        hours: i64,
        /// Window start (RFC 3339); overrides --hours
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Re-run pattern and turning point detection before reading
        #[arg(long)]
        analyze: bool,
    },
    /// Submit a human judgment for a unit's current score
    Validate {
        unit_id: Uuid,
        /// Human score on the 0-10 scale; omit to record an incomplete result
        #[arg(long)]
        human: Option<f64>,
        #[arg(long, default_value = "cli")]
        validator: String,
        #[arg(long, default_value = "expert_review", value_parser = ValidationMethod::from_str)]
        method: ValidationMethod,
    },
    /// Run a calibration cycle now
    Calibrate,
    /// Calibration history
    History,
    /// Live scoring weights
    Weights,
    /// Review-flagged calibrations
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },
    /// Restore the weights that were live before the last applied change
    Rollback,
    /// Run scheduled calibration until interrupted
    Schedule,
}

#[derive(Subcommand, Debug)]
enum ReviewAction {
    /// Open reviews
    List,
    /// Apply the proposed weights
    Apply { record_id: Uuid },
    /// Close without changing weights
    Dismiss { record_id: Uuid },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UnitInput {
    One(ConversationalUnit),
    Many(Vec<ConversationalUnit>),
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_units(file: &str) -> Result<Vec<ConversationalUnit>> {
    let raw = if file == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read units from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))?
    };
    let units = match serde_json::from_str::<UnitInput>(&raw).context("Failed to parse units")? {
        UnitInput::One(unit) => vec![unit],
        UnitInput::Many(units) => units,
    };
    Ok(units)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut config = EngineConfig::load_or_default(&args.config);
    if let Some(db) = args.db {
        config.storage.db_path = db;
    }

    info!("Opening mood store at {}...", config.storage.db_path);
    let engine = Arc::new(MoodEngine::open(config).await?);

    match args.command {
        Command::Ingest { file, score } => {
            let units = read_units(&file)?;
            for unit in &units {
                engine.store().record_unit(unit).await?;
                if score {
                    let report = engine.score_unit(unit.id).await?;
                    println!("{} {:.2} (confidence {:.2})", unit.id, report.score.score, report.score.confidence);
                } else {
                    println!("{}", unit.id);
                }
            }
            info!("Recorded {} units", units.len());
        }
        Command::Score { unit_id } => print_json(&engine.score_unit(unit_id).await?)?,
        Command::Mood { unit_id, details } => {
            let Some(score) = engine.get_current_mood(unit_id).await? else {
                anyhow::bail!("Unit {} has not been scored", unit_id);
            };
            if details {
                let metadata = engine.get_analysis_metadata(unit_id).await?;
                print_json(&serde_json::json!({ "score": score, "metadata": metadata }))?;
            } else {
                print_json(&score)?;
            }
        }
        Command::Trajectory {
            participant,
            hours,
            since,
            analyze,
        } => {
            let until = Utc::now();
            let since = since.unwrap_or(until - Duration::hours(hours));
            if analyze {
                engine.analyze_trajectory(&participant, since, until).await?;
            }
            print_json(&engine.get_trajectory(&participant, since, until).await?)?;
        }
        Command::Validate {
            unit_id,
            human,
            validator,
            method,
        } => {
            let submission = engine
                .submit_validation(unit_id, human, &validator, method)
                .await?;
            print_json(&submission)?;
        }
        Command::Calibrate => {
            print_json(&engine.run_calibration_cycle(CycleTrigger::Manual).await?)?;
        }
        Command::History => print_json(&engine.calibration_history().await)?,
        Command::Weights => print_json(engine.weights().as_ref())?,
        Command::Review { action } => match action {
            ReviewAction::List => print_json(&engine.pending_reviews().await)?,
            ReviewAction::Apply { record_id } => print_json(&engine.force_apply(record_id).await?)?,
            ReviewAction::Dismiss { record_id } => {
                print_json(&engine.force_rollback(record_id).await?)?
            }
        },
        Command::Rollback => print_json(&engine.rollback_last_applied().await?)?,
        Command::Schedule => {
            let Some(scheduler) = CalibrationScheduler::spawn(engine.clone()) else {
                anyhow::bail!("calibration.interval_secs is 0; nothing to schedule");
            };
            info!("Calibration scheduler running. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await;
        }
    }

    Ok(())
}
