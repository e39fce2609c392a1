//! HTTP control plane: a thin axum layer over [`InstanceManager`].

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::runtime::{InstanceManager, Runtime};

pub mod error;
pub mod handlers;

/// Shared handler state. Cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub instances: InstanceManager,
}

impl AppState {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let instances = runtime.instances();
        Self { runtime, instances }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        // POST takes an orchestration name, GET an instance id
        .route(
            "/workflow/{id}",
            get(handlers::get_workflow).post(handlers::start_workflow),
        )
        .route("/workflow/{id}/terminate", post(handlers::terminate_workflow))
        .with_state(state)
}
