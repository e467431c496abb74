use std::sync::Arc;

use axum::{middleware, Extension, Router};

use crate::plugin::OvsPlugin;
use crate::providers::docker::DockerProvider;
use crate::providers::libvirt::LibvirtProvider;

pub mod auth;
pub mod console;
pub mod deploy;
pub mod health;
pub mod inventory;
pub mod links;
pub mod overlay;

#[derive(Clone)]
pub struct AppState {
    pub plugin: Arc<OvsPlugin>,
    pub docker: Arc<DockerProvider>,
    pub libvirt: Arc<LibvirtProvider>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(deploy::router())
        .merge(links::router())
        .merge(overlay::router())
        .merge(console::router())
        .merge(inventory::router())
        .layer(middleware::from_fn(auth::bearer_auth))
        .layer(Extension(state))
}
