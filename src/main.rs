use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod cli;

use dbprov::config::{self, Config, StoreBackend};
use dbprov::lifecycle::LifecycleEngine;
use dbprov::models::request::{Decision, DecisionAction, NewRequest, RequestStatus};
use dbprov::store::memory::MemoryStore;
use dbprov::store::postgres::PgStore;
use dbprov::store::CatalogStore;
use dbprov::{api, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(&cfg)?;
    let args = cli::Cli::parse();

    let store = open_store(&cfg).await?;
    let engine = LifecycleEngine::new(store.clone())
        .with_host(cfg.db_host.clone())
        .with_list_limit(cfg.list_limit);

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(engine, cfg, port).await,
        Some(cli::Commands::Request { command }) => handle_request_command(&engine, command).await,
        Some(cli::Commands::Approval { command }) => {
            handle_approval_command(&engine, command).await
        }
        Some(cli::Commands::Database { command }) => {
            handle_database_command(&engine, command).await
        }
        Some(cli::Commands::Reconcile) => handle_reconcile(&engine).await,
        None => run_server(engine, cfg, None).await,
    };

    store.close().await;
    opentelemetry::global::shutdown_tracer_provider();

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing(cfg: &Config) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when an endpoint is configured
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "dbprov"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let (plain, json) = if cfg.log_json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dbprov=debug,tower_http=debug".into()),
        ))
        .with(plain)
        .with(json)
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn CatalogStore>> {
    match cfg.store {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(&cfg.database_url, cfg.max_connections)
                .await
                .context("failed to connect to provisioning database")?;

            tracing::info!("Running migrations...");
            db.migrate().await?;
            Ok(Arc::new(db))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory catalog store; contents are lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run_server(engine: LifecycleEngine, cfg: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(cfg.port);
    let state = Arc::new(AppState { engine, config: cfg });
    let app = api::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("dbprov API listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn handle_request_command(
    engine: &LifecycleEngine,
    cmd: cli::RequestCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::RequestCommands::Submit {
            team,
            db_type,
            environment,
            size,
            purpose,
        } => {
            let req = engine
                .submit(NewRequest {
                    team_name: team,
                    db_type: db_type.into(),
                    environment: environment.into(),
                    size: size.into(),
                    purpose,
                })
                .await?;
            println!(
                "Request submitted:\n  ID:     {}\n  Team:   {}\n  Type:   {} ({}, {})\n  Status: {}",
                req.id, req.team_name, req.db_type, req.environment, req.size, req.status
            );
        }
        cli::RequestCommands::List { status } => {
            let status = status
                .map(|s| s.parse::<RequestStatus>())
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            let requests = engine.list_requests(status).await?;
            if requests.is_empty() {
                println!("No requests found.");
                return Ok(());
            }

            println!(
                "{:<38} {:<20} {:<10} {:<8} {:<8} {:<12} CREATED",
                "ID", "TEAM", "TYPE", "ENV", "SIZE", "STATUS"
            );
            for r in requests {
                println!(
                    "{:<38} {:<20} {:<10} {:<8} {:<8} {:<12} {}",
                    r.id,
                    truncate(&r.team_name, 20),
                    r.db_type,
                    r.environment,
                    r.size,
                    r.status,
                    r.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        cli::RequestCommands::Show { request_id } => {
            let id = parse_id(&request_id)?;
            let req = engine.get_request(id).await?;
            println!("{}", serde_json::to_string_pretty(&req)?);
        }
    }
    Ok(())
}

async fn handle_approval_command(
    engine: &LifecycleEngine,
    cmd: cli::ApprovalCommands,
) -> anyhow::Result<()> {
    let (request_id, action, approver, notes) = match cmd {
        cli::ApprovalCommands::Approve {
            request_id,
            approver,
            notes,
        } => (request_id, DecisionAction::Approve, approver, notes),
        cli::ApprovalCommands::Reject {
            request_id,
            approver,
            notes,
        } => (request_id, DecisionAction::Reject, approver, notes),
    };

    let id = parse_id(&request_id)?;
    let outcome = engine
        .decide(
            id,
            Decision {
                action,
                approver,
                notes,
            },
        )
        .await?;

    println!("Request {} {}.", outcome.request_id, outcome.status);
    if let Some(db) = outcome.database {
        println!(
            "  Database: {}\n  Endpoint: {}:{}\n  Cost:     ${}/month",
            db.name, db.host, db.port, db.estimated_cost
        );
    }
    Ok(())
}

async fn handle_database_command(
    engine: &LifecycleEngine,
    cmd: cli::DatabaseCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::DatabaseCommands::List => {
            let catalog = engine.list_databases().await?;
            if catalog.databases.is_empty() {
                println!("No provisioned databases.");
                return Ok(());
            }

            println!(
                "{:<6} {:<44} {:<20} {:<28} {:>10}",
                "ID", "NAME", "TEAM", "ENDPOINT", "COST/MO"
            );
            for d in &catalog.databases {
                let db = &d.database;
                println!(
                    "{:<6} {:<44} {:<20} {:<28} {:>10}",
                    db.id,
                    truncate(&db.name, 44),
                    truncate(&d.team_name, 20),
                    format!("{}:{}", db.host, db.port),
                    db.estimated_cost
                );
            }
            println!(
                "\n{} database(s), ${} per month",
                catalog.total_count, catalog.total_monthly_cost
            );
        }
    }
    Ok(())
}

async fn handle_reconcile(engine: &LifecycleEngine) -> anyhow::Result<()> {
    let issues = engine.find_inconsistencies().await?;
    if issues.is_empty() {
        println!("Catalog is consistent.");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<4} PROBLEM", "REQUEST", "STATUS", "DBS");
    for i in &issues {
        println!(
            "{:<38} {:<12} {:<4} {}",
            i.request_id, i.status, i.database_count, i.kind
        );
    }
    anyhow::bail!("{} request(s) need manual reconciliation", issues.len())
}

fn parse_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| anyhow::anyhow!("invalid request ID: {}", raw))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}
