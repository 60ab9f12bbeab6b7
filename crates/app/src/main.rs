mod dispatch;
mod maintenance;
mod outbound;
mod problem;
mod router;
mod telemetry;
mod webhook;

use std::net::SocketAddr;

use sqgate_storage::Database;
use sqgate_util::{load_env_file, AppConfig, IntegrationConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;
    let integration = IntegrationConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    if integration.webhook_signature_key.is_none() {
        warn!(
            stage = "app",
            "SQUARE_WEBHOOK_SIGNATURE_KEY is not set; production webhooks will be refused"
        );
    }
    if integration.api_auth_token.is_none() {
        info!(stage = "app", "API_AUTH_TOKEN is not set; /api routes are disabled");
    }
    info!(stage = "app", integration = ?integration, "integration settings loaded");

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let state = router::AppState::new(metrics, database.clone(), &integration)?;
    maintenance::MaintenanceWorker::new(database, state.payment_executor()).spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
