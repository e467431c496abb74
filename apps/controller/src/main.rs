mod features;

use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    /// Progress fan-out to UI subscribers.
    pub ws: tokio::sync::broadcast::Sender<String>,
    /// Shared bearer secret for agent RPC; empty disables auth.
    pub secret: String,
    pub agent_timeout_secs: u64,
    pub image_sync_enabled: bool,
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("warn,controller=info")
            .add_directive("hyper_util=warn".parse().unwrap())
            .add_directive("sqlx=warn".parse().unwrap())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = PgPool::connect(&std::env::var("DATABASE_URL")?).await?;

    let (ws, _) = tokio::sync::broadcast::channel(256);
    let state = AppState {
        db,
        ws,
        secret: std::env::var("CONTROLLER_SECRET").unwrap_or_default(),
        agent_timeout_secs: std::env::var("AGENT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120),
        image_sync_enabled: env_bool("IMAGE_SYNC_ENABLED", false),
    };

    let _reconciler_handle = features::reconciler::spawn(state.clone());

    let app = features::router(state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .max_age(std::time::Duration::from_secs(3600)),
    );
    let bind = std::env::var("CONTROLLER_BIND").unwrap_or_else(|_| "127.0.0.1:8000".into());
    info!(%bind, "controller listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
