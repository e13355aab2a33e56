//! Read models built from committed financing events.
//!
//! Projections are disposable: they can be rebuilt from the event store at
//! any time, are partitioned by tenant, and tolerate at-least-once delivery.

pub mod invoice_board;

pub use invoice_board::{
    BoardProjectionError, InvoiceBoardProjection, InvoiceBoardRow, PendingBid, PendingOffer,
};
