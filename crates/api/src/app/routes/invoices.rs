use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;

use finflow_core::DomainError;
use finflow_financing::{ContractId, DisbursementId, RepaymentId};
use finflow_infra::event_store::{EventQuery, EventQueryResult, Pagination};
use finflow_infra::projections::InvoiceBoardRow;

use super::common::{invoice_id, optional};
use crate::app::dto::{
    ContractResponse, CreateInvoiceRequest, DisbursementResponse, HistoryQuery,
    InvoiceResponse, ListInvoicesQuery, ReasonRequest, RepaymentResponse, UpdateInvoiceRequest,
};
use crate::app::errors::ApiResult;
use crate::app::services::AppServices;
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_invoice).get(list_invoices))
        .route("/:id", get(get_invoice).patch(update_invoice))
        .route("/:id/submit", post(submit_invoice))
        .route("/:id/accept", post(accept_invoice))
        .route("/:id/cancel", post(cancel_invoice))
        .route("/:id/default", post(confirm_default))
        .route("/:id/resume", post(resume_settlement))
        .route("/:id/settlement", get(get_settlement))
        .route("/:id/history", get(get_history))
}

/// POST /invoices: draft a new invoice; the caller is the seller.
pub async fn create_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CreateInvoiceRequest>,
) -> ApiResult<impl IntoResponse> {
    let invoice = services.engine.create_draft(
        ctx.tenant_id(),
        ctx.actor(),
        body.buyer_id,
        body.fields,
        body.source,
        body.product_type,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())),
    ))
}

/// GET /invoices?status=OPEN_FOR_BIDDING: board rows, newest activity first.
pub async fn list_invoices(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<ListInvoicesQuery>,
) -> Json<Vec<InvoiceBoardRow>> {
    Json(services.board.list(ctx.tenant_id(), query.status))
}

pub async fn get_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = services.engine.invoice(ctx.tenant_id(), invoice_id(&id)?)?;
    Ok(Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())))
}

pub async fn update_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateInvoiceRequest>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = services.engine.update_draft(
        ctx.tenant_id(),
        ctx.actor(),
        invoice_id(&id)?,
        body.fields,
        body.source,
    )?;
    Ok(Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())))
}

pub async fn submit_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = services
        .engine
        .submit_invoice(ctx.tenant_id(), ctx.actor(), invoice_id(&id)?)?;
    Ok(Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())))
}

/// POST /invoices/:id/accept: the buyer acknowledges the invoice.
pub async fn accept_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = services
        .engine
        .accept_invoice(ctx.tenant_id(), ctx.actor(), invoice_id(&id)?)?;
    Ok(Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())))
}

pub async fn cancel_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> ApiResult<Json<InvoiceResponse>> {
    let reason = body.and_then(|Json(b)| b.reason);
    let invoice =
        services
            .engine
            .cancel_invoice(ctx.tenant_id(), ctx.actor(), invoice_id(&id)?, reason)?;
    Ok(Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())))
}

/// POST /invoices/:id/default: the financier confirms a default after grace.
pub async fn confirm_default(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> ApiResult<Json<InvoiceResponse>> {
    let reason = body.and_then(|Json(b)| b.reason);
    let invoice =
        services
            .engine
            .confirm_default(ctx.tenant_id(), ctx.actor(), invoice_id(&id)?, reason)?;
    Ok(Json(InvoiceResponse::for_viewer(&invoice, ctx.actor())))
}

/// POST /invoices/:id/resume: finish settlement follow-ups an interruption
/// left undone. Safe to repeat.
pub async fn resume_settlement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = services
        .engine
        .resume_settlement(ctx.tenant_id(), invoice_id(&id)?)?;
    Ok(Json(serde_json::json!({ "steps": outcome.steps })))
}

#[derive(Debug, Serialize)]
pub struct SettlementView {
    pub contract: Option<ContractResponse>,
    pub disbursement: Option<DisbursementResponse>,
    pub repayment: Option<RepaymentResponse>,
}

/// GET /invoices/:id/settlement: contract, disbursement and repayment of
/// the accepted terms, whichever exist.
pub async fn get_settlement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<SettlementView>> {
    let tenant_id = ctx.tenant_id();
    let invoice_id = invoice_id(&id)?;
    let invoice = services.engine.invoice(tenant_id, invoice_id)?;
    let terms = invoice
        .accepted_terms()
        .ok_or_else(|| DomainError::conflict("invoice has no accepted terms"))?;

    let disbursement_id = DisbursementId::for_terms(invoice_id, terms);
    let contract = optional(
        services
            .engine
            .contract(tenant_id, ContractId::for_terms(invoice_id, terms)),
    )?;
    let disbursement = optional(services.engine.disbursement(tenant_id, disbursement_id))?;
    let repayment = optional(
        services
            .engine
            .repayment(tenant_id, RepaymentId::for_disbursement(disbursement_id)),
    )?;

    Ok(Json(SettlementView {
        contract: contract.as_ref().map(ContractResponse::from),
        disbursement: disbursement.as_ref().map(DisbursementResponse::from),
        repayment: repayment.as_ref().map(RepaymentResponse::from),
    }))
}

/// GET /invoices/:id/history?limit=50&offset=0: the invoice stream, oldest first.
pub async fn get_history(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<EventQueryResult>> {
    let invoice_id = invoice_id(&id)?;
    // Existence check keeps other tenants' ids indistinguishable from unknown ones.
    services.engine.invoice(ctx.tenant_id(), invoice_id)?;

    let page = services.store.aggregate_history(
        ctx.tenant_id(),
        invoice_id.0,
        Some(Pagination::new(query.limit, query.offset)),
    )?;
    Ok(Json(page))
}
