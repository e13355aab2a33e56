use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    routing::get,
};

use finflow_infra::projections::InvoiceBoardRow;

use crate::app::services::AppServices;
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/default-candidates", get(default_candidates))
        .route("/lagging-settlements", get(lagging_settlements))
}

/// Funded invoices whose repayment is past due plus grace.
pub async fn default_candidates(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> Json<Vec<InvoiceBoardRow>> {
    let now = services.engine.now();
    Json(services.board.default_candidates(ctx.tenant_id(), now))
}

/// Invoices whose settlement follow-ups have not all landed yet.
pub async fn lagging_settlements(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> Json<Vec<InvoiceBoardRow>> {
    let tenant_id = ctx.tenant_id();
    let rows = services
        .board
        .lagging_settlements(tenant_id)
        .into_iter()
        .filter_map(|invoice_id| services.board.get(tenant_id, invoice_id))
        .collect();
    Json(rows)
}
