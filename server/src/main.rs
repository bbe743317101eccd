use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use cnep_server::auth;
use cnep_server::config::{generate_config_template, Config};
use cnep_server::db::{self, SqliteMessageStore};
use cnep_server::relay::Relay;
use cnep_server::routes;
use cnep_server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("cnep_server=info,tower_http=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter()).init();
    }

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    // Handle --issue-token: print a bearer token for local clients and exit
    if let Some(user_id) = config.issue_token {
        let token = auth::jwt::issue_access_token(&jwt_secret, user_id, config.auth().token_ttl())?;
        println!("{}", token);
        return Ok(());
    }

    tracing::info!("CNEP relay v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;
    let store = Arc::new(SqliteMessageStore::new(db));

    let relay_config = config.relay();
    let (relay, coordinator) = Relay::spawn(store, relay_config);
    let relay_control = relay.clone();

    let app_state = AppState {
        jwt_secret,
        relay,
        relay_config,
    };

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await?;

    // Sessions still hold Relay clones, so stop the coordinator explicitly;
    // it sends 1001 to every connection still registered
    if relay_control.shutdown().is_ok() {
        if let Err(e) = coordinator.await {
            tracing::error!("Relay coordinator failed: {}", e);
        }
    }
    tracing::info!("Server stopped");

    Ok(())
}
