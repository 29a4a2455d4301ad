mod config;
mod db;
mod errors;
mod interview;
mod llm_client;
mod models;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::create_pool;
use crate::interview::controller::ControllerSettings;
use crate::interview::feedback::FeedbackPipeline;
use crate::interview::registry::SessionRegistry;
use crate::interview::store::{InMemorySessionStore, PgSessionStore, SessionStore};
use crate::interview::voice::{HostedVoiceConnector, VoiceEventRouter};
use crate::llm_client::LlmClient;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Interview API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize session store
    let store: Arc<dyn SessionStore> = match &config.database_url {
        Some(url) => Arc::new(PgSessionStore::new(create_pool(url).await?)),
        None => {
            warn!("DATABASE_URL not set, sessions are kept in memory and lost on restart");
            Arc::new(InMemorySessionStore::new())
        }
    };

    // Initialize evaluation service (one attempt per request; retries are caller-driven)
    let llm = LlmClient::new(config.anthropic_api_key.clone(), config.feedback_timeout)?;
    info!("LLM client initialized (model: {})", llm_client::MODEL);
    let pipeline = FeedbackPipeline::new(Arc::new(llm), config.feedback_timeout);

    // Initialize voice service connector
    let voice_router = Arc::new(VoiceEventRouter::new());
    let connector = Arc::new(HostedVoiceConnector::new(
        config.voice_api_url.clone(),
        config.voice_api_key.clone(),
        config.public_base_url.clone(),
        Arc::clone(&voice_router),
    )?);
    info!("Voice connector initialized ({})", config.voice_api_url);

    let settings = ControllerSettings {
        checkpoint_interval: config.checkpoint_interval,
        max_duration: config.max_interview_duration,
    };
    info!(
        "Checkpoint every {}s, interviews capped at {} min, feedback timeout {}s",
        settings.checkpoint_interval.as_secs(),
        settings.max_duration.as_secs() / 60,
        config.feedback_timeout.as_secs()
    );

    // Build app state
    let state = AppState {
        registry: Arc::new(SessionRegistry::new(store, connector, pipeline, settings)),
        voice_router,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins to the recruiter web app

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
