//! Invoice financing domain (event-sourced).
//!
//! Business rules for the financing lifecycle, implemented as deterministic
//! domain logic (no IO, no clocks, no storage):
//!
//! - `invoice`: the invoice aggregate and its lifecycle state machine; it also
//!   owns discount offers (`negotiation`) and financier bids (`auction`), so
//!   every acceptance commits in a single stream append
//! - `settlement`: money-flow arithmetic for two- and three-party topologies
//! - `contract`, `disbursement`, `repayment`: the settlement-side aggregates

pub mod auction;
pub mod contract;
pub mod disbursement;
pub mod ids;
pub mod invoice;
pub mod negotiation;
pub mod policy;
pub mod repayment;
pub mod settlement;
pub mod status;

pub use auction::{AuctionSummary, Bid, BidStatus, RankedBid};
pub use contract::{
    CancelContract, CompleteContract, Contract, ContractCommand, ContractEvent, ContractStatus,
    ContractTerms, GenerateContract,
};
pub use disbursement::{
    BankAccountRef, CancelDisbursement, CompleteDisbursement, Disbursement, DisbursementCommand,
    DisbursementEvent, DisbursementStatus, FailDisbursement, InitiateDisbursement,
    StartProcessing,
};
pub use ids::{BidId, ContractId, DisbursementId, InvoiceId, OfferId, RepaymentId, TermsRef};
pub use invoice::{
    AcceptBid, AcceptInvoice, AcceptOffer, CancelInvoice, ConfirmDefault, CreateDraft,
    CreateOffer, ExpireStale, FallbackToStandardPayment, FieldSource, Invoice, InvoiceCommand,
    InvoiceEvent, InvoiceFields, OpenForBidding, RecordFinanced, RecordRepaid, RejectOffer,
    ReviseOffer, SubmitBid, SubmitInvoice, UpdateDraft, WithdrawBid,
};
pub use negotiation::{DiscountOffer, OfferStatus};
pub use policy::FinancingPolicy;
pub use repayment::{
    CancelRepayment, CompleteRepayment, CreateRepayment, MarkOverdue, Repayment,
    RepaymentCommand, RepaymentEvent, RepaymentStatus,
};
pub use settlement::{ContractType, FundingType, SettlementPlan, annualized_yield, tenure_days};
pub use status::{InvoiceStatus, ProductType};
