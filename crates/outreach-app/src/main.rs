//! Outreach application binary - composition root.
//!
//! Ties the outreach crates into a single executable:
//! 1. Load configuration from TOML
//! 2. Open the SQLite database and resolve the goal catalog
//! 3. Build selector, dispatcher, history service, and sweep scheduler
//! 4. Run the requested subcommand

mod cli;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde::Serialize;
use uuid::Uuid;

use outreach_core::config::OutreachConfig;
use outreach_core::types::{Contact, Timestamp};
use outreach_planner::{
    DeliveryHandle, Dispatcher, DoNotContactGuard, GoalRegistry, GoalSelector, HistoryService,
    LayeredClassifier, PatternClassifier, Rehearsal, ReplyHandler, StateReader, SweepScheduler,
    Transport, TransportError,
};
use outreach_scoring::{RecomputeService, ScoreComposer, SqliteSignalSource};
use outreach_storage::{ContactRepository, Database, GoalRepository, ReportService};

use cli::{CliArgs, Command};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Logs outbound messages instead of delivering them. Real channels plug in
/// through the same [`Transport`] seam.
struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, contact: &Contact, body: &str) -> Result<DeliveryHandle, TransportError> {
        let message_id = Uuid::new_v4().to_string();
        tracing::info!(
            contact_id = %contact.id,
            message_id = %message_id,
            body_len = body.len(),
            "Outbound message"
        );
        tracing::debug!(contact_id = %contact.id, body = %body, "Outbound message body");
        Ok(DeliveryHandle { message_id })
    }
}

/// Long-lived services shared by the subcommands.
struct App {
    config: OutreachConfig,
    db: Arc<Database>,
    registry: Arc<GoalRegistry>,
    selector: Arc<GoalSelector>,
    history: Arc<HistoryService>,
    dispatcher: Arc<Dispatcher>,
    classifier: Arc<LayeredClassifier>,
}

impl App {
    fn build(config: OutreachConfig, db: Arc<Database>) -> AppResult<Self> {
        let registry = Arc::new(GoalRegistry::load(
            &config.goals,
            &GoalRepository::new(db.clone()),
        )?);
        let guard = DoNotContactGuard::new(config.planner.refusal_cooldown_days);
        let selector = Arc::new(GoalSelector::new(
            registry.clone(),
            guard,
            config.planner.registry_mode,
        ));
        let history = Arc::new(HistoryService::new(db.clone(), registry.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            registry.clone(),
            guard,
            config.dispatch.clone(),
            Arc::new(LogTransport),
        ));

        Ok(Self {
            config,
            db,
            registry,
            selector,
            history,
            dispatcher,
            classifier: Arc::new(LayeredClassifier::patterns_only()),
        })
    }

    fn scheduler(&self) -> SweepScheduler {
        let composer = ScoreComposer::new(
            Arc::new(SqliteSignalSource::new(self.db.clone())),
            self.config.scoring.clone(),
        );
        let recompute = Arc::new(RecomputeService::new(self.db.clone(), composer));
        SweepScheduler::new(
            self.db.clone(),
            &self.config,
            self.history.clone(),
            self.selector.clone(),
            self.dispatcher.clone(),
        )
        .with_recompute(recompute)
    }
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_database(data_dir: &Path) -> AppResult<Arc<Database>> {
    if let Err(e) = std::fs::create_dir_all(data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("outreach.db");
    let db = Database::new(&db_path)?;
    tracing::info!(path = %db_path.display(), "SQLite database opened");
    Ok(Arc::new(db))
}

async fn run_until_interrupted(app: &App) -> AppResult<()> {
    let scheduler = Arc::new(app.scheduler());
    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, finishing current sweep");
    scheduler.shutdown();
    handle.await?;
    Ok(())
}

#[derive(Serialize)]
struct Report {
    goals: Vec<outreach_storage::GoalStats>,
    lifecycle: Vec<outreach_storage::StageCount>,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let config = OutreachConfig::load_or_default(&config_file);
    let log_level = args.resolve_log_level(&config.general.log_level);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    tracing::info!(path = %config_file.display(), "Starting outreach v{}", env!("CARGO_PKG_VERSION"));

    // Catalog checks and classification need no database.
    match &args.command {
        Command::ValidateGoals { path } => {
            let registry = GoalRegistry::from_file(path)?;
            println!("{}: {} goals, catalog is valid", path.display(), registry.len());
            return Ok(());
        }
        Command::Classify { text } => {
            return print_json(&PatternClassifier::new().classify_text(text));
        }
        _ => {}
    }

    let data_dir = args.resolve_data_dir(&config.general.data_dir);
    let db = open_database(&data_dir)?;

    if let Command::ImportGoals { path } = &args.command {
        let registry = GoalRegistry::from_file(path)?;
        registry.persist(&GoalRepository::new(db.clone()))?;
        println!("Imported {} goals from {}", registry.len(), path.display());
        return Ok(());
    }

    let app = App::build(config, db)?;
    tracing::info!(goals = app.registry.len(), "Outreach engine ready");

    let now = Timestamp::now();
    match args.command {
        Command::Run => run_until_interrupted(&app).await?,
        Command::Sweep => {
            let summary = app.scheduler().run_once(now).await?;
            print_json(&summary)?;
        }
        Command::Plan { contact_id } => {
            let state = StateReader::new(app.db.clone()).load(contact_id)?;
            let selection = app.selector.select_goal(&state, now).await?;
            print_json(&selection)?;
        }
        Command::Report => {
            let reports = ReportService::new(app.db.clone());
            print_json(&Report {
                goals: reports.goal_stats()?,
                lifecycle: reports.lifecycle_distribution()?,
            })?;
        }
        Command::Rehearse {
            contact_id,
            replies,
        } => {
            let contact = ContactRepository::new(app.db.clone()).require(contact_id)?;
            let state = StateReader::new(app.db.clone()).project(&contact)?;
            let script: Vec<Option<String>> = replies
                .into_iter()
                .map(|r| if r.trim().is_empty() { None } else { Some(r) })
                .collect();
            let report = Rehearsal::new(app.selector.clone(), app.classifier.clone())
                .rehearse(&contact, state, &script, now)
                .await?;
            print_json(&report)?;
        }
        Command::Reply { contact_id, text } => {
            let handler = ReplyHandler::new(app.db.clone(), app.history.clone(), app.classifier.clone());
            print_json(&handler.handle(contact_id, &text, now).await)?;
        }
        Command::Resolve {
            attempt_id,
            declined,
            note,
        } => {
            let attempt = app
                .history
                .resolve_escalation(attempt_id, !declined, &note, now)?;
            print_json(&attempt)?;
        }
        Command::Classify { .. } | Command::ValidateGoals { .. } | Command::ImportGoals { .. } => {}
    }

    Ok(())
}
