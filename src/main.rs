use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use spooltrack::audit::{FileOutbox, Outbox};
use spooltrack::coordination::{
    CancelRequest, ClaimRequest, CoordinatorSettings, InspectionRequest, OccupationCoordinator,
    OccupationError, OccupationResponse, ReleaseRequest, RepairRequest, Verdict,
};
use spooltrack::domain::{ActorId, Operation, UnitTag};
use spooltrack::store::{FileRowStore, RateLimitedStore, RowStore};
use spooltrack::telemetry::init_telemetry;
use spooltrack::SpoolTrackConfig;

#[derive(Parser)]
#[command(name = "spooltrack")]
#[command(about = "Shop-floor occupation tracking for pipe spools")]
#[command(long_about = "SpoolTrack records which worker occupies which spool for which operation, \
                       stamps finished unions on release and keeps an append-only audit trail. \
                       Every command prints a JSON response and exits with 1 when it was rejected.")]
struct Cli {
    /// Row store document (overrides configuration)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Audit outbox file (overrides configuration)
    #[arg(long, global = true)]
    outbox: Option<PathBuf>,
    /// Directory holding spooltrack.toml / .spooltrack-rc
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Occupy a spool for an operation
    Claim {
        tag: String,
        #[arg(long, short = 'o')]
        operation: Operation,
        #[arg(long, short = 'w')]
        worker: String,
    },
    /// Release a claim, stamping the unions finished during it
    Release {
        tag: String,
        #[arg(long, short = 'o')]
        operation: Operation,
        #[arg(long, short = 'w')]
        worker: String,
        /// Finished union ids; leave empty to cancel
        #[arg(long, value_delimiter = ',')]
        select: Vec<String>,
    },
    /// Give up a claim without finishing anything
    Cancel {
        tag: String,
        #[arg(long, short = 'o')]
        operation: Operation,
        #[arg(long, short = 'w')]
        worker: String,
        /// Supervisor override for a claim held by someone else
        #[arg(long)]
        admin: bool,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Record the verdict of a claimed inspection
    Inspect {
        tag: String,
        #[arg(long, short = 'w')]
        worker: String,
        #[arg(long, value_enum)]
        verdict: VerdictArg,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Finish a claimed repair and send the spool back to inspection
    RepairDone {
        tag: String,
        #[arg(long, short = 'w')]
        worker: String,
    },
    /// Show states, progress and eligible unions of a spool
    Status { tag: String },
    /// Rebuild claims from the store and list stale ones
    Reconcile,
    /// Push committed audit events to the audit sheet
    FlushAudit,
}

#[derive(Clone, Copy, ValueEnum)]
enum VerdictArg {
    Passed,
    Failed,
}

impl From<VerdictArg> for Verdict {
    fn from(arg: VerdictArg) -> Self {
        match arg {
            VerdictArg::Passed => Verdict::Passed,
            VerdictArg::Failed => Verdict::Failed,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    SpoolTrackConfig::load_env_file()?;
    let mut config = match &cli.config_dir {
        Some(dir) => SpoolTrackConfig::load_from_dir(dir)?,
        None => SpoolTrackConfig::load()?,
    };
    if let Some(path) = cli.store {
        config.store.path = path;
    }
    if let Some(path) = cli.outbox {
        config.audit.outbox_path = path;
    }
    init_telemetry(&config.observability)?;

    let code = tokio::runtime::Runtime::new()?.block_on(async {
        run(cli.command, &config).await
    })?;
    std::process::exit(code);
}

async fn build_coordinator(config: &SpoolTrackConfig) -> Result<OccupationCoordinator> {
    let file_store = FileRowStore::new(&config.store.path, config.store.max_rows_per_call);
    file_store.init().await?;
    let store: Arc<dyn RowStore> = Arc::new(RateLimitedStore::new(
        file_store,
        config.store.requests_per_second,
        config.store.burst,
        config.store.column_cache_ttl(),
    ));

    let coordinator =
        OccupationCoordinator::new(store, open_outbox(config).await?, CoordinatorSettings::from(config));
    coordinator.startup().await?;
    Ok(coordinator)
}

#[cfg(feature = "database")]
async fn open_outbox(config: &SpoolTrackConfig) -> Result<Arc<dyn Outbox>> {
    if let Some(url) = &config.audit.database_url {
        let outbox = spooltrack::audit::SqliteOutbox::connect(url).await?;
        return Ok(Arc::new(outbox));
    }
    Ok(Arc::new(FileOutbox::new(&config.audit.outbox_path)))
}

#[cfg(not(feature = "database"))]
async fn open_outbox(config: &SpoolTrackConfig) -> Result<Arc<dyn Outbox>> {
    if config.audit.database_url.is_some() {
        tracing::warn!("audit.database_url is set but this build lacks the `database` feature; using the outbox file");
    }
    Ok(Arc::new(FileOutbox::new(&config.audit.outbox_path)))
}

async fn run(command: Commands, config: &SpoolTrackConfig) -> Result<i32> {
    let coordinator = build_coordinator(config).await?;

    match command {
        Commands::Claim {
            tag,
            operation,
            worker,
        } => {
            let result = coordinator
                .claim(ClaimRequest::new(tag.clone(), operation, worker))
                .await;
            respond(result, &tag, operation)
        }
        Commands::Release {
            tag,
            operation,
            worker,
            select,
        } => {
            let result = coordinator
                .release(ReleaseRequest::new(tag.clone(), operation, worker, select))
                .await;
            respond(result, &tag, operation)
        }
        Commands::Cancel {
            tag,
            operation,
            worker,
            admin,
            reason,
        } => {
            let result = coordinator
                .cancel(CancelRequest {
                    unit_tag: UnitTag::new(tag.clone()),
                    operation,
                    actor_id: ActorId::new(worker),
                    admin,
                    reason,
                })
                .await;
            respond(result, &tag, operation)
        }
        Commands::Inspect {
            tag,
            worker,
            verdict,
            notes,
        } => {
            let result = coordinator
                .record_inspection(InspectionRequest {
                    unit_tag: UnitTag::new(tag.clone()),
                    actor_id: ActorId::new(worker),
                    verdict: verdict.into(),
                    notes,
                })
                .await;
            respond(result, &tag, Operation::Inspection)
        }
        Commands::RepairDone { tag, worker } => {
            let result = coordinator
                .complete_repair(RepairRequest {
                    unit_tag: UnitTag::new(tag.clone()),
                    actor_id: ActorId::new(worker),
                })
                .await;
            respond(result, &tag, Operation::Inspection)
        }
        Commands::Status { tag } => match coordinator.status(&UnitTag::new(tag)).await {
            Ok(status) => print_json(&status).map(|_| 0),
            Err(err) => print_error(&err),
        },
        Commands::Reconcile => match coordinator.reconcile().await {
            Ok(report) => print_json(&report).map(|_| 0),
            Err(err) => print_error(&err),
        },
        Commands::FlushAudit => {
            let report = coordinator.flush_audit().await;
            print_json(&report)?;
            Ok(if report.error.is_some() { 1 } else { 0 })
        }
    }
}

fn respond(
    result: Result<OccupationResponse, OccupationError>,
    tag: &str,
    operation: Operation,
) -> Result<i32> {
    let response = result
        .unwrap_or_else(|err| OccupationResponse::rejected(&UnitTag::new(tag), operation, &err));
    print_json(&response)?;
    Ok(if response.is_rejected() { 1 } else { 0 })
}

fn print_error(err: &OccupationError) -> Result<i32> {
    print_json(&json!({
        "error_code": err.error_code(),
        "message": err.to_string(),
    }))?;
    Ok(1)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
