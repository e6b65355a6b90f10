use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gemlink::models::account::AccountSummary;
use gemlink::store::postgres::PgStore;
use gemlink::store::{AccountStore, SharedStore};
use gemlink::{api, cli, config, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional OTLP export when an endpoint is configured; plain stdout
    // logging otherwise.
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "gemlink-gateway"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .expect("failed to install OpenTelemetry tracer");
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gemlink=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    match args.command {
        Some(cli::Commands::Account {
            command: cli::AccountCommands::List,
        }) => {
            let store = connect_store(&cfg).await?;
            let accounts = store.list_accounts().await?;
            if accounts.is_empty() {
                println!("no accounts enrolled");
                return Ok(());
            }
            for account in &accounts {
                let summary = AccountSummary::from(account);
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Ok(())
        }
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    }
}

async fn connect_store(cfg: &config::Config) -> anyhow::Result<PgStore> {
    let store = PgStore::connect(&cfg.database_url)
        .await
        .context("failed to connect to database")?;
    store.migrate().await.context("migrations failed")?;
    Ok(store)
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let store = connect_store(&cfg).await?;
    let store: SharedStore = Arc::new(store);

    let state = AppState::new(cfg, store.clone());

    // Warm the pool so the first request doesn't pay the load.
    if let Err(e) = state.accounts.warm().await {
        tracing::warn!("account pool warm-up failed: {}", e);
    }

    jobs::reactivate::spawn(
        store,
        state.cooldown.clone(),
        state.config.reactivate_interval,
        state.config.exhaustion_cooldown,
    );

    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("gemlink gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .await
        .context("server terminated")?;

    Ok(())
}
