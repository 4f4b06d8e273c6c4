mod api;
mod config;
mod db;
mod error;
mod tickets;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AppState;
use config::Config;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "helpdesk_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let db = Arc::new(db::connect(&config.database_url).await?);
    tracing::info!("Database initialized at {}", config.database_url);

    if let Some(path) = &config.seed_file {
        let seed = db::seed::SeedFile::load(path)?;
        db::seed::apply(&db, &seed).await?;
    }

    tracing::info!(
        "Staff load ignores tickets in: {}",
        config
            .load_terminal
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let state = Arc::new(AppState::new(db, &config));

    let app = api::router()
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http());

    tracing::info!("Helpdesk server starting on http://{}", config.bind);
    tracing::info!("");
    tracing::info!("API Endpoints:");
    tracing::info!("  GET  /api/tickets              - Tickets visible to the caller");
    tracing::info!("  POST /api/tickets              - File a ticket");
    tracing::info!("  POST /api/tickets/:id/actions  - Lifecycle action and message edits");
    tracing::info!("  GET  /api/history              - History search (moderators)");

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
