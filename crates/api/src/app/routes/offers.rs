use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use super::common::{invoice_id, offer_id};
use crate::app::dto::{InvoiceResponse, OfferRequest, ReasonRequest, SettlementResponse};
use crate::app::errors::ApiResult;
use crate::app::services::AppServices;
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/:id/offers", post(create_offer))
        .route("/:id/revisions", post(revise_offer))
        .route("/:id/offers/:offer_id/accept", post(accept_offer))
        .route("/:id/offers/:offer_id/reject", post(reject_offer))
        .route("/:id/standard-payment", post(fallback_to_standard_payment))
}

/// POST /invoices/:id/offers: the buyer opens the negotiation.
pub async fn create_offer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<OfferRequest>,
) -> ApiResult<impl IntoResponse> {
    let offer = services.engine.create_offer(
        ctx.tenant_id(),
        ctx.actor(),
        invoice_id(&id)?,
        body.discount()?,
        body.expires_at,
    )?;
    Ok((StatusCode::CREATED, Json(offer)))
}

/// POST /invoices/:id/revisions: a counter-offer from the buyer.
pub async fn revise_offer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<OfferRequest>,
) -> ApiResult<impl IntoResponse> {
    let offer = services.engine.revise_offer(
        ctx.tenant_id(),
        ctx.actor(),
        invoice_id(&id)?,
        body.discount()?,
        body.expires_at,
    )?;
    Ok((StatusCode::CREATED, Json(offer)))
}

pub async fn accept_offer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, offer)): Path<(String, String)>,
) -> ApiResult<Json<SettlementResponse>> {
    let settlement = services.engine.accept_offer(
        ctx.tenant_id(),
        ctx.actor(),
        invoice_id(&id)?,
        offer_id(&offer)?,
    )?;
    Ok(Json(SettlementResponse::for_viewer(&settlement, ctx.actor())))
}

pub async fn reject_offer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, offer)): Path<(String, String)>,
    body: Option<Json<ReasonRequest>>,
) -> ApiResult<Json<InvoiceResponse>> {
    let reason = body.and_then(|Json(b)| b.reason);
    let invoice = services.engine.reject_offer(
        ctx.tenant_id(),
        ctx.actor(),
        invoice_id(&id)?,
        offer_id(&offer)?,
        reason,
    )?;
    Ok(Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())))
}

/// POST /invoices/:id/standard-payment: the seller stops negotiating.
pub async fn fallback_to_standard_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = services.engine.fallback_to_standard_payment(
        ctx.tenant_id(),
        ctx.actor(),
        invoice_id(&id)?,
    )?;
    Ok(Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())))
}
