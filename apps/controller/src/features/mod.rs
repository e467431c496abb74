use axum::Router;

use crate::AppState;

pub mod agents;
pub mod labs;
pub mod lifecycle;
pub mod reconciler;
pub mod topology;
pub mod ws;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(agents::routes::router())
        .merge(topology::routes::router())
        .merge(lifecycle::routes::router())
        .merge(ws::router())
        .with_state(state)
}
