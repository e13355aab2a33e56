use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use finflow_financing::{AuctionSummary, RankedBid};

use super::common::{bid_id, invoice_id};
use crate::app::dto::{BidRequest, InvoiceResponse, SettlementResponse};
use crate::app::errors::ApiResult;
use crate::app::services::AppServices;
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/:id/bidding", post(open_for_bidding))
        .route("/:id/bids", post(submit_bid).get(ranked_bids))
        .route("/:id/auction", get(auction_summary))
        .route("/:id/bids/:bid_id/withdraw", post(withdraw_bid))
        .route("/:id/bids/:bid_id/accept", post(accept_bid))
}

/// POST /invoices/:id/bidding: the seller puts an accepted invoice up for bids.
pub async fn open_for_bidding(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice =
        services
            .engine
            .open_for_bidding(ctx.tenant_id(), ctx.actor(), invoice_id(&id)?)?;
    Ok(Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())))
}

/// POST /invoices/:id/bids: the caller bids as financier.
pub async fn submit_bid(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<BidRequest>,
) -> ApiResult<impl IntoResponse> {
    let bid = services.engine.submit_bid(
        ctx.tenant_id(),
        ctx.actor(),
        invoice_id(&id)?,
        body.terms()?,
    )?;
    Ok((StatusCode::CREATED, Json(bid)))
}

/// GET /invoices/:id/bids: live bids, best for the seller first. Seller and
/// buyer only.
pub async fn ranked_bids(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<RankedBid>>> {
    let ranked = services
        .engine
        .ranked_bids(ctx.tenant_id(), ctx.actor(), invoice_id(&id)?)?;
    Ok(Json(ranked))
}

/// GET /invoices/:id/auction: what any bidder may see.
pub async fn auction_summary(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<AuctionSummary>> {
    let summary = services
        .engine
        .auction_summary(ctx.tenant_id(), invoice_id(&id)?)?;
    Ok(Json(summary))
}

pub async fn withdraw_bid(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, bid)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let bid = services.engine.withdraw_bid(
        ctx.tenant_id(),
        ctx.actor(),
        invoice_id(&id)?,
        bid_id(&bid)?,
    )?;
    Ok(Json(bid))
}

/// POST /invoices/:id/bids/:bid_id/accept: one winner; rivals are rejected in
/// the same commit. A lost race answers 409.
pub async fn accept_bid(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, bid)): Path<(String, String)>,
) -> ApiResult<Json<SettlementResponse>> {
    let settlement = services.engine.accept_bid(
        ctx.tenant_id(),
        ctx.actor(),
        invoice_id(&id)?,
        bid_id(&bid)?,
    )?;
    Ok(Json(SettlementResponse::for_viewer(&settlement, ctx.actor())))
}
