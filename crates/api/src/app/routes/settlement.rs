use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    routing::{get, post},
};

use finflow_financing::{ContractId, DisbursementId, RepaymentId};

use crate::app::dto::{
    ContractResponse, DisbursementResponse, FailureRequest, ReferenceRequest, RepaymentResponse,
};
use crate::app::errors::{ApiResult, parse_stream_id};
use crate::app::services::AppServices;
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/contracts/:id", get(get_contract))
        .route("/disbursements/:id", get(get_disbursement))
        .route("/disbursements/:id/initiate", post(initiate_disbursement))
        .route("/disbursements/:id/complete", post(complete_disbursement))
        .route("/disbursements/:id/fail", post(fail_disbursement))
        .route("/repayments/:id", get(get_repayment))
        .route("/repayments/:id/complete", post(complete_repayment))
}

fn disbursement_id(raw: &str) -> ApiResult<DisbursementId> {
    Ok(DisbursementId::new(parse_stream_id(raw, "disbursement")?))
}

fn repayment_id(raw: &str) -> ApiResult<RepaymentId> {
    Ok(RepaymentId::new(parse_stream_id(raw, "repayment")?))
}

pub async fn get_contract(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContractResponse>> {
    let contract_id = ContractId::new(parse_stream_id(&id, "contract")?);
    let contract = services.engine.contract(ctx.tenant_id(), contract_id)?;
    Ok(Json(ContractResponse::from(&contract)))
}

pub async fn get_disbursement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<DisbursementResponse>> {
    let disbursement = services
        .engine
        .disbursement(ctx.tenant_id(), disbursement_id(&id)?)?;
    Ok(Json(DisbursementResponse::from(&disbursement)))
}

/// POST /disbursements/:id/initiate: the payer sends the funds. Repeating a
/// call while the transfer is in flight returns the same record.
pub async fn initiate_disbursement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<DisbursementResponse>> {
    let disbursement = services.engine.initiate_disbursement(
        ctx.tenant_id(),
        ctx.actor(),
        disbursement_id(&id)?,
    )?;
    Ok(Json(DisbursementResponse::from(&disbursement)))
}

pub async fn complete_disbursement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Option<Json<ReferenceRequest>>,
) -> ApiResult<Json<DisbursementResponse>> {
    let reference = body.and_then(|Json(b)| b.reference);
    let disbursement = services.engine.complete_disbursement(
        ctx.tenant_id(),
        ctx.actor(),
        disbursement_id(&id)?,
        reference,
    )?;
    Ok(Json(DisbursementResponse::from(&disbursement)))
}

pub async fn fail_disbursement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<FailureRequest>,
) -> ApiResult<Json<DisbursementResponse>> {
    let disbursement = services.engine.fail_disbursement(
        ctx.tenant_id(),
        ctx.actor(),
        disbursement_id(&id)?,
        body.reason,
    )?;
    Ok(Json(DisbursementResponse::from(&disbursement)))
}

pub async fn get_repayment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<RepaymentResponse>> {
    let repayment = services
        .engine
        .repayment(ctx.tenant_id(), repayment_id(&id)?)?;
    Ok(Json(RepaymentResponse::from(&repayment)))
}

/// POST /repayments/:id/complete: the buyer has paid the financier.
pub async fn complete_repayment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Option<Json<ReferenceRequest>>,
) -> ApiResult<Json<RepaymentResponse>> {
    let reference = body.and_then(|Json(b)| b.reference);
    let repayment = services.engine.complete_repayment(
        ctx.tenant_id(),
        ctx.actor(),
        repayment_id(&id)?,
        reference,
    )?;
    Ok(Json(RepaymentResponse::from(&repayment)))
}
