use finflow_core::DomainError;
use finflow_financing::{BidId, InvoiceId, OfferId};
use finflow_infra::engine::EngineResult;

use crate::app::errors::{ApiResult, parse_entity_id, parse_stream_id};

pub fn invoice_id(raw: &str) -> ApiResult<InvoiceId> {
    Ok(InvoiceId::new(parse_stream_id(raw, "invoice")?))
}

pub fn offer_id(raw: &str) -> ApiResult<OfferId> {
    Ok(OfferId(parse_entity_id(raw, "offer")?))
}

pub fn bid_id(raw: &str) -> ApiResult<BidId> {
    Ok(BidId(parse_entity_id(raw, "bid")?))
}

/// `NotFound` as `None`; every other error passes through.
pub fn optional<T>(result: EngineResult<T>) -> ApiResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.domain() == Some(&DomainError::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
