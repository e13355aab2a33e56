use std::str::FromStr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use finflow_core::{AggregateId, DomainError};
use finflow_infra::command_dispatcher::DispatchError;
use finflow_infra::engine::EngineError;
use finflow_infra::event_store::EventStoreError;

/// Error side of every handler; renders as `{"error": code, "message": ..}`.
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Store(EventStoreError),
    BadRequest {
        code: &'static str,
        message: String,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            code,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        ApiError::Engine(value)
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        ApiError::Engine(value.into())
    }
}

impl From<EventStoreError> for ApiError {
    fn from(value: EventStoreError) -> Self {
        ApiError::Store(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Engine(err) => engine_error_to_response(&err),
            ApiError::Store(err @ EventStoreError::Unavailable(_)) => {
                error!(error = %err, "event store unavailable");
                json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
            }
            ApiError::Store(err) => {
                error!(error = %err, "event store query failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
            }
            ApiError::BadRequest { code, message } => {
                json_error(StatusCode::BAD_REQUEST, code, message)
            }
        }
    }
}

pub fn engine_error_to_response(err: &EngineError) -> Response {
    let status = match err {
        EngineError::Dispatch(DispatchError::Domain(domain)) => domain_status(domain),
        EngineError::Dispatch(DispatchError::Concurrency(_)) => StatusCode::CONFLICT,
        EngineError::Dispatch(DispatchError::TenantIsolation(_)) => StatusCode::FORBIDDEN,
        EngineError::Dispatch(DispatchError::Store(EventStoreError::Unavailable(_))) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::MissingBankAccount { .. } | EngineError::KycNotApproved { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::ExternalService(_) => StatusCode::BAD_GATEWAY,
    };
    if status.is_server_error() {
        error!(code = err.code(), error = %err, "request failed");
    }
    json_error(status, err.code(), err.to_string())
}

fn domain_status(err: &DomainError) -> StatusCode {
    match err {
        DomainError::Validation(_) | DomainError::InvalidId(_) => StatusCode::BAD_REQUEST,
        DomainError::Unauthorized(_) => StatusCode::FORBIDDEN,
        DomainError::NotFound => StatusCode::NOT_FOUND,
        DomainError::InvalidStateTransition { .. }
        | DomainError::OfferConflict(_)
        | DomainError::OfferExpired(_)
        | DomainError::RevisionLimitExceeded { .. }
        | DomainError::DuplicateBid(_)
        | DomainError::BidExpired(_)
        | DomainError::Conflict(_) => StatusCode::CONFLICT,
        DomainError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Path segment naming an event stream.
pub fn parse_stream_id(raw: &str, what: &str) -> ApiResult<AggregateId> {
    AggregateId::from_str(raw)
        .map_err(|_| ApiError::bad_request("invalid_id", format!("invalid {what} id")))
}

/// Path segment naming an offer or bid inside an invoice.
pub fn parse_entity_id(raw: &str, what: &str) -> ApiResult<Uuid> {
    Uuid::from_str(raw).map_err(|_| ApiError::bad_request("invalid_id", format!("invalid {what} id")))
}
