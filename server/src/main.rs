//! Merathon Server - Main entry point.
//!
//! This binary starts the Merathon API server with:
//! - Structured JSON logging
//! - A MongoDB connection verified at startup (or the in-memory store)
//! - Graceful shutdown handling (SIGTERM/SIGINT) followed by store teardown
//!
//! # Configuration
//!
//! See [`merathon_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Local development without a database
//! ACCESS_TOKEN_SECRET=dev-secret MERATHON_IN_MEMORY_STORE=true \
//! cargo run --bin merathon-server
//!
//! # Production
//! ACCESS_TOKEN_SECRET=... DB_USER=... DB_PASS=... DB_HOST=cluster0.example.mongodb.net \
//! OPENAI_API_KEY=... APP_ENV=production CORS_ORIGINS=https://merathon.example \
//! cargo run --release --bin merathon-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use merathon_server::chat::ChatClient;
use merathon_server::config::Config;
use merathon_server::routes::{create_router, AppState};
use merathon_server::store::{MemoryStore, MongoStore, Store};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  ACCESS_TOKEN_SECRET      - Secret for signing session tokens");
            eprintln!("  DB_USER, DB_PASS, DB_HOST - Database credentials and cluster host");
            eprintln!("                             (or MONGODB_URI with a connection string)");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  DB_NAME                  - Database name (default: merathonDB)");
            eprintln!("  OPENAI_API_KEY           - Enables the chat relay");
            eprintln!("  OPENAI_BASE_URL          - Completion service URL");
            eprintln!("                             (default: https://api.openai.com)");
            eprintln!("  PORT                     - HTTP server port (default: 5000)");
            eprintln!("  APP_ENV                  - 'production' for cross-site secure cookies");
            eprintln!("  CORS_ORIGINS             - Allowed origins");
            eprintln!("                             (default: http://localhost:5173)");
            eprintln!("  RUST_LOG                 - Log level filter (default: info)");
            eprintln!("  MERATHON_IN_MEMORY_STORE - Keep data in memory (dev only, set to 'true')");
            return ExitCode::from(1);
        }
    };

    let store: Arc<dyn Store> = match &config.database {
        Some(database) if !config.in_memory_store => {
            match MongoStore::connect_with_retry(database).await {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    error!(error = %err, "Failed to connect to MongoDB");
                    return ExitCode::from(1);
                }
            }
        }
        _ => Arc::new(MemoryStore::new()),
    };

    let chat = match &config.openai_api_key {
        Some(api_key) => match ChatClient::new(&config.openai_base_url, api_key) {
            Ok(client) => Some(client),
            Err(err) => {
                error!(error = %err, "Failed to create chat client");
                return ExitCode::from(1);
            }
        },
        None => None,
    };

    info!(
        port = config.port,
        store = store.backend(),
        chat_enabled = chat.is_some(),
        production = config.production,
        allowed_origins = ?config.allowed_origins,
        "Merathon server starting"
    );

    let port = config.port;
    let state = AppState::new(config, Arc::clone(&store), chat);
    let app = create_router(state);

    // Bind to address
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            store.shutdown().await;
            return ExitCode::from(1);
        }
    };

    // Start server with graceful shutdown
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    let result = server.await;

    // In-flight requests have finished; release database connections.
    info!("Server shutting down gracefully");
    store.shutdown().await;

    if let Err(err) = result {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default
/// `info,tower_http=debug,axum::rejection=trace`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
