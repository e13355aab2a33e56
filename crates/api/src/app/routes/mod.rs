use axum::{Router, routing::get};

pub mod bids;
pub mod board;
pub mod common;
pub mod invoices;
pub mod offers;
pub mod settlement;
pub mod system;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/stream", get(system::stream))
        .route("/notifications", get(system::notifications))
        .nest(
            "/invoices",
            invoices::router().merge(offers::router()).merge(bids::router()),
        )
        .merge(settlement::router())
        .nest("/board", board::router())
}
