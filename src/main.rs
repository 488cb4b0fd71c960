use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use territory_crm::config::Config;
use territory_crm::db::{self, ClientId, ClientStatus, EmployeeId, ProjectId, TabularStore};
use territory_crm::territory::{
    ActivityAggregator, ActivitySummary, Actor, AssignmentReconciler, ClientListing, ClientQuery,
    ReconcileError, Role, TimeWindow, VisibleClients, WorkReport, audit, resolve_scope,
};

#[derive(Debug, Parser)]
#[command(name = "territory", version, about = "Territory assignment and activity tooling")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "TERRITORY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or upgrade the database schema.
    Migrate,
    /// Show the visibility scope of an actor.
    Scope(ActorArgs),
    /// List clients visible to an actor.
    Clients {
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long, value_parser = parse_status)]
        status: Option<ClientStatus>,
        #[arg(long)]
        project: Option<ProjectId>,
        #[arg(long)]
        search: Option<String>,
        #[command(flatten)]
        created: OptionalWindowArgs,
        /// Only clients with no assignment.
        #[arg(long)]
        unassigned: bool,
    },
    /// Make an employee's assignments equal the given client set.
    Reconcile {
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long)]
        employee: EmployeeId,
        /// Desired client ids, comma separated.
        #[arg(long, value_delimiter = ',')]
        clients: Vec<ClientId>,
        /// File with one desired client id per line.
        #[arg(long)]
        clients_file: Option<PathBuf>,
    },
    /// Activity for visible clients within a window.
    Activity {
        #[command(flatten)]
        actor: ActorArgs,
        #[command(flatten)]
        window: WindowArgs,
        /// Only activity performed by this employee.
        #[arg(long)]
        employee: Option<EmployeeId>,
        /// Restrict to these clients (still limited to the actor's scope).
        #[arg(long, value_delimiter = ',')]
        clients: Vec<ClientId>,
        /// Print the individual events instead of the summary.
        #[arg(long)]
        events: bool,
    },
    /// Worked-on summary for visible clients.
    Report {
        #[command(flatten)]
        actor: ActorArgs,
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long)]
        employee: Option<EmployeeId>,
    },
}

#[derive(Debug, Clone, Copy, Args)]
struct ActorArgs {
    /// Acting employee id.
    #[arg(long = "as", env = "TERRITORY_ACTOR_ID")]
    actor_id: Uuid,
    /// Acting employee role: admin, sales_manager or sales.
    #[arg(long, env = "TERRITORY_ACTOR_ROLE")]
    role: Role,
}

impl ActorArgs {
    fn actor(self) -> Actor {
        Actor::new(self.actor_id, self.role)
    }
}

#[derive(Debug, Clone, Args)]
struct WindowArgs {
    /// Inclusive start (RFC 3339 or YYYY-MM-DD).
    #[arg(long, value_parser = parse_instant)]
    from: DateTime<Utc>,
    /// Exclusive end (RFC 3339 or YYYY-MM-DD).
    #[arg(long, value_parser = parse_instant)]
    to: DateTime<Utc>,
}

impl WindowArgs {
    fn window(&self) -> anyhow::Result<TimeWindow> {
        Ok(TimeWindow::new(self.from, self.to)?)
    }
}

#[derive(Debug, Clone, Args)]
struct OptionalWindowArgs {
    #[arg(long = "created-from", value_parser = parse_instant, requires = "created_to")]
    created_from: Option<DateTime<Utc>>,
    #[arg(long = "created-to", value_parser = parse_instant, requires = "created_from")]
    created_to: Option<DateTime<Utc>>,
}

impl OptionalWindowArgs {
    fn window(&self) -> anyhow::Result<Option<TimeWindow>> {
        match (self.created_from, self.created_to) {
            (Some(from), Some(to)) => Ok(Some(TimeWindow::new(from, to)?)),
            _ => Ok(None),
        }
    }
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("'{raw}' is neither RFC 3339 nor YYYY-MM-DD"))
}

fn parse_status(raw: &str) -> Result<ClientStatus, String> {
    ClientStatus::from_db_value(&raw.trim().to_ascii_lowercase())
        .ok_or_else(|| format!("unknown status '{raw}' (lead, reserved, visited, converted)"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr; stdout carries the JSON result.
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_client_ids(path: &PathBuf) -> anyhow::Result<Vec<ClientId>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading client ids from {}", path.display()))?;
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            Uuid::parse_str(line).with_context(|| format!("invalid client id '{line}'"))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::from_env().context("loading configuration")?;
    audit::init(&config.territory.audit);

    let database = db::connect_from_config(&config.database)
        .await
        .context("connecting to the database")?;
    let store: Arc<dyn TabularStore> = database;
    let territory = &config.territory;

    match cli.command {
        Command::Migrate => {
            // connect_from_config has already applied pending migrations.
            tracing::info!("schema is up to date");
            print_json(&serde_json::json!({ "migrated": true }))?;
        }
        Command::Scope(actor) => {
            let scope = resolve_scope(store.as_ref(), &actor.actor(), &territory.page_options()).await;
            print_json(&scope)?;
        }
        Command::Clients {
            actor,
            status,
            project,
            search,
            created,
            unassigned,
        } => {
            let query = ClientQuery {
                status,
                project_id: project,
                search,
                created: created.window()?,
                unassigned_only: unassigned,
            };
            let listing = ClientListing::new(store, territory);
            let page = listing.list(&actor.actor(), &query).await;
            print_json(&serde_json::json!({
                "count": page.len(),
                "complete": page.is_complete(),
                "clients": page.rows,
            }))?;
        }
        Command::Reconcile {
            actor,
            employee,
            clients,
            clients_file,
        } => {
            let mut desired: BTreeSet<ClientId> = clients.into_iter().collect();
            if let Some(path) = &clients_file {
                desired.extend(read_client_ids(path)?);
            }
            let reconciler = AssignmentReconciler::new(store, territory);
            match reconciler.reconcile(&actor.actor(), employee, &desired).await {
                Ok(outcome) => print_json(&outcome)?,
                Err(err) => {
                    if let ReconcileError::Partial {
                        planned_added,
                        planned_removed,
                        applied_added,
                        applied_removed,
                        ..
                    } = &err
                    {
                        print_json(&serde_json::json!({
                            "outcome": "partial",
                            "planned_added": planned_added,
                            "planned_removed": planned_removed,
                            "applied_added": applied_added,
                            "applied_removed": applied_removed,
                            "error": err.to_string(),
                        }))?;
                        bail!("reconciliation incomplete; run it again to converge");
                    }
                    return Err(err.into());
                }
            }
        }
        Command::Activity {
            actor,
            window,
            employee,
            clients,
            events,
        } => {
            let window = window.window()?;
            let requested: BTreeSet<ClientId> = clients.into_iter().collect();
            let listing = ClientListing::new(store.clone(), territory);
            let visible = VisibleClients::resolve(&listing, &actor.actor(), &requested).await;

            let aggregator = ActivityAggregator::new(store, territory);
            if events {
                print_json(&serde_json::json!({
                    "scope_complete": visible.is_complete(),
                    "events": aggregator.events(&visible.ids, &window, employee).await,
                }))?;
            } else {
                let report = aggregator.aggregate(&visible.ids, &window, employee).await;
                print_json(&ActivitySummary::new(&visible, report))?;
            }
        }
        Command::Report {
            actor,
            window,
            employee,
        } => {
            let window = window.window()?;
            let report = WorkReport::build(store, territory, &actor.actor(), &window, employee).await;
            print_json(&report)?;
        }
    }

    Ok(())
}
