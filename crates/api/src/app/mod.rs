//! Axum application: router, service wiring and JSON mapping.
//!
//! - `services.rs`: engine, store, bus, board and background workers
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request bodies and response shapes
//! - `errors.rs`: error bodies and status mapping

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router over already wired services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    // Identity headers are required everywhere except /health.
    let scoped = routes::router().layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn(middleware::context_middleware))
            .layer(Extension(services)),
    );

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(scoped)
}
