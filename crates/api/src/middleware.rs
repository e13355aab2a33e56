use std::str::FromStr;

use axum::{
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::app::errors::json_error;
use crate::context::RequestContext;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Resolve [`RequestContext`] from the forwarded identity headers.
pub async fn context_middleware(
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let tenant_id = header_id(req.headers(), TENANT_HEADER)?;
    let actor = header_id(req.headers(), ACTOR_HEADER)?;

    req.extensions_mut()
        .insert(RequestContext::new(tenant_id, actor));

    Ok(next.run(req).await)
}

fn header_id<T: FromStr>(headers: &HeaderMap, name: &'static str) -> Result<T, Response> {
    let raw = headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "missing_context",
                format!("{name} header is required"),
            )
        })?;

    raw.parse().map_err(|_| {
        json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_context",
            format!("{name} is not a valid id"),
        )
    })
}
