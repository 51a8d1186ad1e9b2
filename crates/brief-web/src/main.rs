mod api;
mod config;
mod session;
mod state;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;

use axum::Router;
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::state::AppState;

/// API routes with the shared middleware stack
fn app(state: AppState) -> Router {
    let mut router = Router::new().nest("/api", api::router());

    if let Some(static_dir) = state.config.static_dir.as_deref() {
        let serve_dir = ServeDir::new(static_dir)
            .not_found_service(ServeFile::new(format!("{static_dir}/index.html")));
        router = router.fallback_service(serve_dir);
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brief_web=debug,brief_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    if config.openai.api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; meeting briefs will fail");
    }
    if config.composio.api_key.is_none() {
        tracing::warn!("COMPOSIO_API_KEY is not set; research stage has no shared credential");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config)?;

    tracing::info!("Starting meeting brief server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
