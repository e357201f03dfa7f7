//! # Voice Relay Backend - Main Application Entry Point
//!
//! Bridges telephony calls (8 kHz µ-law) to a conversational AI voice
//! endpoint (16 kHz PCM in, 24 kHz PCM out) in real time.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every call is a handful of tasks on the tokio runtime
//! - **modules**: one module per concern, declared below
//! - **Arc<dyn Trait>**: the endpoint client is chosen here and shared by all calls
//! - **static**: the shutdown flag lives for the entire program
//!
//! ## Application Architecture:
//! - **audio**: codec, resampler, ingress/egress pipelines, egress queue
//! - **voice**: AI voice endpoint session client
//! - **relay**: per-call orchestrator and the active call registry
//! - **websocket**: telephony media stream adapter
//! - **config / state / error**: configuration, shared state, error types
//! - **health / handlers / middleware**: the REST surface

mod audio;       // Audio codec and resampling (audio/ directory)
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod relay;       // Call orchestration (relay/ directory)
mod state;       // Application state management (state.rs)
mod voice;       // AI voice endpoint client (voice/ directory)
mod websocket;   // Telephony media WebSocket (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice::{VoiceSessionClient, WsVoiceClient};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from defaults, `config.*` files and `APP_*` variables
/// 2. **Sets up logging**
/// 3. **Builds the endpoint client** and the shared application state
/// 4. **Starts the HTTP server** with the REST API and the media WebSocket
/// 5. **Shuts down gracefully**: active calls are hung up before the server stops
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        server = %format!("{}:{}", config.server.host, config.server.port),
        endpoint = %config.endpoint.url,
        max_concurrent_calls = config.performance.max_concurrent_calls,
        "Configuration loaded"
    );

    let voice_client: Arc<dyn VoiceSessionClient> = Arc::new(WsVoiceClient::new(&config.endpoint));
    let app_state = AppState::new(config.clone(), voice_client);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware runs in reverse order of registration on the way in
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/calls", web::get().to(handlers::list_calls))
                    .route("/calls/{call_id}", web::get().to(handlers::get_call))
                    .route("/calls/{call_id}", web::delete().to(handlers::hang_up_call))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/ws/media", web::get().to(websocket::media_websocket))
            .route("/health", web::get().to(health::health_check))
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
            let hung_up = app_state.calls.hang_up_all();
            info!(active_calls = hung_up, "Shutdown signal received, hanging up calls and stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: log filter, e.g. `voice_relay_backend=trace`
/// - If not set, defaults to "voice_relay_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
///
/// If a handler cannot be installed the server keeps running; it just cannot
/// be stopped that way.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!("Failed to install signal handlers: {}", e);
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
