//! Workflow execution engine - binary entry point.
//!
//! Loads configuration and the workflow document, then serves the HTTP
//! surface: `GET /health`, `GET /ready`, `POST /execute` (§4.5).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workflow_engine::config::Config;
use workflow_engine::server;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workflow_engine=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    server::serve(config).await;
}
