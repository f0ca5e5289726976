//! # IncomeStack Backend - Main Application Entry Point
//!
//! Actix-web server hosting the IncomeStack Wealth Coach:
//! - a real-time voice coach (`/ws/live`) bridging the browser's microphone and
//!   speakers to a Gemini Live session
//! - request/response coach features (`/api/v1/coach/*`)
//! - health, metrics and runtime configuration endpoints
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared application state, clients and metrics
//! - **audio**: PCM codec, playback scheduling, capture, device abstractions
//! - **live**: Live session state machine and the Gemini Live transport
//! - **gemini**: REST client for the coach features
//! - **websocket**: Browser bridge for live sessions
//! - **health / handlers / middleware / error**: HTTP surface

mod audio;
mod config;
mod error;
mod gemini;
mod handlers;
mod health;
mod live;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handlers when the server should shut down.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup sequence:
/// 1. Load `.env`, set up tracing
/// 2. Load and validate configuration
/// 3. Build shared state (Gemini REST client + Live transport)
/// 4. Serve until the server fails or a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting incomestack-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if !config.has_api_key() {
        warn!("No Gemini API key configured (set GEMINI_API_KEY); coach features will use fallbacks");
    }

    let app_state = AppState::new(config.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().limit(256 * 1024))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .service(
                        web::scope("/coach")
                            .route("/insights", web::post().to(handlers::market_insights))
                            .route("/mastermind", web::post().to(handlers::mastermind))
                            .route("/jobs/analyze", web::post().to(handlers::analyze_job))
                            .route("/vision-board", web::post().to(handlers::vision_board)),
                    ),
            )
            .route("/ws/live", web::get().to(websocket::live_websocket))
            .route("/health", web::get().to(health::health_check))
            .default_service(web::route().to(handlers::not_found))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls filtering; defaults to `incomestack_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "incomestack_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM/SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
