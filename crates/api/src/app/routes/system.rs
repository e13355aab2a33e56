use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, sse::Event as SseEvent},
};

use crate::app::services::{self, AppServices};
use crate::context::RequestContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(ctx): Extension<RequestContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "tenant_id": ctx.tenant_id().to_string(),
        "actor_id": ctx.actor().to_string(),
    }))
}

pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>>
{
    services::tenant_sse_stream(services, ctx.tenant_id())
}

/// Notifications delivered to the calling party.
pub async fn notifications(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> impl IntoResponse {
    let mine: Vec<_> = services
        .notifications
        .sent_to(ctx.actor())
        .into_iter()
        .filter(|n| n.tenant_id == ctx.tenant_id())
        .collect();
    Json(mine)
}
