use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use serde::Serialize;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod care;
mod classify;
mod config;
mod db;
mod error;
mod models;
mod notifications;
mod records;
mod report;
mod stats;

use crate::classify::{ClassificationRequest, ClassificationResponse, Classifier, FhrData};
use crate::config::Settings;
use crate::error::CareError;
use crate::models::{Actor, CareStatus, Role, Sample};

#[derive(Parser)]
#[command(name = "fhr-care")]
#[command(about = "Fetal heart-rate classification and care coordination", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a BPM sample set without storing it
    #[command(group(
        ArgGroup::new("fhr")
            .args(["input", "bpm"])
            .required(true)
            .multiple(false)
    ))]
    Classify {
        /// JSON classification request
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long, value_delimiter = ',')]
        bpm: Vec<i32>,
        #[arg(long)]
        gestational_age: Option<i32>,
        #[arg(long)]
        maternal_age: Option<i32>,
        #[arg(long)]
        duration_minutes: Option<i32>,
    },
    #[command(flatten)]
    Stored(StoredCommands),
}

/// Commands that need the database.
#[derive(Subcommand)]
enum StoredCommands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo users and an assignment
    Seed,
    /// Store a completed monitoring session
    #[command(group(
        ArgGroup::new("fhr")
            .args(["bpm", "csv"])
            .required(true)
            .multiple(false)
    ))]
    CreateRecord {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        patient: Uuid,
        #[arg(long)]
        doctor: Option<Uuid>,
        /// clinic or self
        #[arg(long, default_value = "self")]
        source: String,
        /// Comma-separated BPM samples, one per second
        #[arg(long, value_delimiter = ',')]
        bpm: Vec<i32>,
        /// CSV with time_offset,bpm,signal_quality columns
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        start_time: Option<DateTime<Utc>>,
        #[arg(long)]
        end_time: Option<DateTime<Utc>>,
        #[arg(long)]
        notes: Option<String>,
        /// Free-form label, used when no gestational age is given
        #[arg(long)]
        classification: Option<String>,
        #[arg(long)]
        gestational_age: Option<i32>,
        #[arg(long)]
        maternal_age: Option<i32>,
    },
    /// Share a record with a doctor and notify them
    ShareRecord {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        record: Uuid,
        #[arg(long)]
        doctor: Uuid,
        #[arg(long)]
        note: Option<String>,
    },
    /// List a doctor's notifications
    Notifications {
        #[arg(long)]
        actor: Uuid,
    },
    /// Mark a notification as read
    MarkRead {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        notification: Uuid,
    },
    /// Assign a patient to a doctor
    Assign {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        doctor: Uuid,
        #[arg(long)]
        patient: Uuid,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Remove a doctor-patient assignment
    Unassign {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        doctor: Uuid,
        #[arg(long)]
        patient: Uuid,
    },
    /// Change the care status of an assignment
    UpdateStatus {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        doctor: Uuid,
        #[arg(long)]
        patient: Uuid,
        /// active, inactive or discharged
        #[arg(long)]
        status: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show the status audit trail of an assignment
    History {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        doctor: Uuid,
        #[arg(long)]
        patient: Uuid,
    },
    /// Write a markdown report for a monitoring record
    Report {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        record: Uuid,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast::<CareError>() {
            Ok(care) => {
                tracing::warn!(kind = care.kind(), "request rejected: {care}");
                print_json(&serde_json::json!({
                    "error": care.kind(),
                    "message": care.to_string(),
                }))?;
                std::process::exit(care.exit_code());
            }
            Err(other) => Err(other),
        },
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = cli.settings;
    let classifier = Classifier::new(settings.bpm_bounds()?);

    match cli.command {
        Commands::Classify {
            input,
            bpm,
            gestational_age,
            maternal_age,
            duration_minutes,
        } => {
            let request = match input {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str::<ClassificationRequest>(&raw).map_err(|e| {
                        CareError::invalid(format!("malformed classification request: {e}"))
                    })?
                }
                None => ClassificationRequest {
                    fhr_data: FhrData::Bpm(bpm),
                    gestational_age: gestational_age.ok_or_else(|| {
                        CareError::invalid("--gestational-age is required with --bpm")
                    })?,
                    maternal_age,
                    duration_minutes,
                },
            };
            let result = classifier.classify_request(&request)?;
            print_json(&ClassificationResponse::from(&result))
        }
        Commands::Stored(command) => {
            let pool = db::connect(&settings).await?;
            run_stored(command, &pool, &settings, &classifier).await
        }
    }
}

async fn run_stored(
    command: StoredCommands,
    pool: &PgPool,
    settings: &Settings,
    classifier: &Classifier,
) -> anyhow::Result<()> {
    let attempts = settings.tx_attempts;

    match command {
        StoredCommands::InitDb => {
            db::init_db(pool).await?;
            println!("Schema ready.");
        }
        StoredCommands::Seed => {
            db::seed(pool).await?;
            println!("Seed data inserted.");
        }
        StoredCommands::CreateRecord {
            actor,
            patient,
            doctor,
            source,
            bpm,
            csv,
            start_time,
            end_time,
            notes,
            classification,
            gestational_age,
            maternal_age,
        } => {
            let actor = db::resolve_actor(pool, actor).await?;
            let samples = match csv {
                Some(path) => db::read_samples_csv(&path)?,
                None => bpm
                    .into_iter()
                    .enumerate()
                    .map(|(i, bpm)| Sample {
                        time_offset: i as f64,
                        bpm,
                        signal_quality: None,
                    })
                    .collect(),
            };
            let new = records::NewRecord {
                patient_id: patient,
                doctor_id: doctor,
                source: source.parse()?,
                samples,
                start_time: start_time.unwrap_or_else(Utc::now),
                end_time,
                notes,
                classification,
                gestational_age,
                maternal_age,
            };
            let record = records::create_record(pool, new, &actor, classifier).await?;
            print_json(&record)?;
        }
        StoredCommands::ShareRecord {
            actor,
            record,
            doctor,
            note,
        } => {
            let actor = require_role(db::resolve_actor(pool, actor).await?, Role::Patient)?;
            let notification =
                records::share(pool, attempts, record, actor.user_id, doctor, note).await?;
            print_json(&serde_json::json!({
                "message": "Record shared",
                "notification": notification,
            }))?;
        }
        StoredCommands::Notifications { actor } => {
            let actor = require_role(db::resolve_actor(pool, actor).await?, Role::Doctor)?;
            let inbox = notifications::list_notifications(pool, actor.user_id).await?;
            print_json(&inbox)?;
        }
        StoredCommands::MarkRead {
            actor,
            notification,
        } => {
            let actor = require_role(db::resolve_actor(pool, actor).await?, Role::Doctor)?;
            let notification =
                notifications::mark_read(pool, attempts, notification, actor.user_id).await?;
            print_json(&serde_json::json!({
                "message": "Notification marked as read",
                "notification": notification,
            }))?;
        }
        StoredCommands::Assign {
            actor,
            doctor,
            patient,
            status,
            note,
        } => {
            let actor = db::resolve_actor(pool, actor).await?;
            let status = status.as_deref().map(str::parse::<CareStatus>).transpose()?;
            let association = care::assign(pool, doctor, patient, status, note, &actor).await?;
            print_json(&serde_json::json!({
                "message": "Patient assigned",
                "association": association,
            }))?;
        }
        StoredCommands::Unassign {
            actor,
            doctor,
            patient,
        } => {
            let actor = db::resolve_actor(pool, actor).await?;
            care::unassign(pool, doctor, patient, &actor).await?;
            print_json(&serde_json::json!({ "message": "Patient unassigned" }))?;
        }
        StoredCommands::UpdateStatus {
            actor,
            doctor,
            patient,
            status,
            notes,
        } => {
            let actor = db::resolve_actor(pool, actor).await?;
            let update = care::StatusUpdate {
                status: status.parse()?,
                notes,
            };
            let response =
                care::update_status(pool, attempts, doctor, patient, update, &actor).await?;
            print_json(&response)?;
        }
        StoredCommands::History {
            actor,
            doctor,
            patient,
        } => {
            let actor = db::resolve_actor(pool, actor).await?;
            let entries = care::history(pool, doctor, patient, &actor).await?;
            print_json(&entries)?;
        }
        StoredCommands::Report { actor, record, out } => {
            let actor = db::resolve_actor(pool, actor).await?;
            let record = records::get_record(pool, record, &actor).await?;

            let mut conn = pool.acquire().await.map_err(CareError::from)?;
            let patient = db::fetch_user(&mut conn, record.patient_id)
                .await?
                .ok_or_else(|| CareError::not_found("patient", record.patient_id))?;
            let shared_with = match record.shared_with {
                Some(doctor_id) => db::fetch_user(&mut conn, doctor_id).await?,
                None => None,
            };

            let report = report::build_report(
                &record,
                &patient.full_name,
                shared_with.as_ref().map(|u| u.full_name.as_str()),
                classifier.bounds(),
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

fn require_role(actor: Actor, role: Role) -> Result<Actor, CareError> {
    if actor.role == role {
        Ok(actor)
    } else {
        Err(CareError::forbidden(format!(
            "this action requires the {role} role (caller is {})",
            actor.role
        )))
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
