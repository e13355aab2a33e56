use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finflow_core::{PartyId, Rate};
use finflow_financing::{
    Bid, BankAccountRef, Contract, ContractId, ContractStatus, ContractTerms, DiscountOffer,
    Disbursement, DisbursementId, DisbursementStatus, FieldSource, FundingType, Invoice,
    InvoiceFields, InvoiceId, InvoiceStatus, ProductType, Repayment, RepaymentId,
    RepaymentStatus, TermsRef,
};
use finflow_infra::engine::{BidTerms, Settlement};

use crate::app::errors::{ApiError, ApiResult};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub buyer_id: PartyId,
    #[serde(flatten)]
    pub fields: InvoiceFields,
    #[serde(default = "manual")]
    pub source: FieldSource,
    #[serde(default = "self_funded")]
    pub product_type: ProductType,
}

#[derive(Debug, Deserialize)]
pub struct UpdateInvoiceRequest {
    #[serde(flatten)]
    pub fields: InvoiceFields,
    #[serde(default = "manual")]
    pub source: FieldSource,
}

fn manual() -> FieldSource {
    FieldSource::Manual
}

fn self_funded() -> ProductType {
    ProductType::SelfFundedDiscount
}

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    pub status: Option<InvoiceStatus>,
}

/// Percentages are plain numbers with up to two decimals (`1.6` = 1.6%).
#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub discount_percentage: f64,
    pub expires_at: DateTime<Utc>,
}

impl OfferRequest {
    pub fn discount(&self) -> ApiResult<Rate> {
        percent("discount_percentage", self.discount_percentage)
    }
}

#[derive(Debug, Deserialize)]
pub struct BidRequest {
    pub discount_rate: f64,
    #[serde(default)]
    pub processing_fee: f64,
    pub haircut_percentage: Option<f64>,
    pub valid_until: DateTime<Utc>,
}

impl BidRequest {
    pub fn terms(&self) -> ApiResult<BidTerms> {
        Ok(BidTerms {
            discount_rate: percent("discount_rate", self.discount_rate)?,
            processing_fee: percent("processing_fee", self.processing_fee)?,
            haircut: self
                .haircut_percentage
                .map(|h| percent("haircut_percentage", h))
                .transpose()?,
            valid_until: self.valid_until,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FailureRequest {
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReferenceRequest {
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn percent(field: &str, value: f64) -> ApiResult<Rate> {
    Rate::from_percent(value)
        .map_err(|e| ApiError::bad_request("validation_error", format!("{field}: {e}")))
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub id: InvoiceId,
    pub status: InvoiceStatus,
    pub status_reason: Option<String>,
    pub seller: Option<PartyId>,
    pub buyer: Option<PartyId>,
    pub product_type: ProductType,
    #[serde(flatten)]
    pub fields: InvoiceFields,
    pub gst_backed: bool,
    pub offers: Vec<DiscountOffer>,
    pub negotiation_closed: bool,
    pub bids: Vec<Bid>,
    pub accepted_terms: Option<TermsRef>,
    pub financed_by: Option<DisbursementId>,
    pub repaid_by: Option<RepaymentId>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InvoiceResponse {
    /// Parties to the invoice see every bid; a financier sees only its own.
    pub fn for_viewer(invoice: &Invoice, viewer: PartyId) -> Self {
        let is_party = invoice.seller() == Some(viewer) || invoice.buyer() == Some(viewer);
        let bids = invoice
            .bids()
            .iter()
            .filter(|b| is_party || b.financier == viewer)
            .cloned()
            .collect();

        Self {
            id: invoice.id_typed(),
            status: invoice.status(),
            status_reason: invoice.status_reason().map(str::to_string),
            seller: invoice.seller(),
            buyer: invoice.buyer(),
            product_type: invoice.product_type(),
            fields: invoice.fields().clone(),
            gst_backed: invoice.is_gst_backed(),
            offers: invoice.offers().to_vec(),
            negotiation_closed: invoice.negotiation_closed(),
            bids,
            accepted_terms: invoice.accepted_terms(),
            financed_by: invoice.financed_by(),
            repaid_by: invoice.repaid_by(),
            updated_at: invoice.updated_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ContractResponse {
    pub id: ContractId,
    pub status: ContractStatus,
    pub status_reason: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub terms: Option<ContractTerms>,
}

impl From<&Contract> for ContractResponse {
    fn from(c: &Contract) -> Self {
        Self {
            id: c.id_typed(),
            status: c.status(),
            status_reason: c.status_reason().map(str::to_string),
            generated_at: c.generated_at(),
            terms: c.terms().cloned(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DisbursementResponse {
    pub id: DisbursementId,
    pub invoice_id: Option<InvoiceId>,
    pub terms: Option<TermsRef>,
    pub funding_type: FundingType,
    pub status: DisbursementStatus,
    pub amount: u64,
    pub payer: Option<PartyId>,
    pub payee: Option<PartyId>,
    pub source_account: Option<BankAccountRef>,
    pub destination_account: Option<BankAccountRef>,
    pub attempts: u32,
    pub reference: Option<String>,
    pub failure_reason: Option<String>,
    pub disbursed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Disbursement> for DisbursementResponse {
    fn from(d: &Disbursement) -> Self {
        Self {
            id: d.id_typed(),
            invoice_id: d.invoice_id(),
            terms: d.terms(),
            funding_type: d.funding_type(),
            status: d.status(),
            amount: d.amount(),
            payer: d.payer(),
            payee: d.payee(),
            source_account: d.source_account().cloned(),
            destination_account: d.destination_account().cloned(),
            attempts: d.attempts(),
            reference: d.reference().map(str::to_string),
            failure_reason: d.failure_reason().map(str::to_string),
            disbursed_at: d.disbursed_at(),
            completed_at: d.completed_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RepaymentResponse {
    pub id: RepaymentId,
    pub invoice_id: Option<InvoiceId>,
    pub disbursement_id: Option<DisbursementId>,
    pub status: RepaymentStatus,
    pub amount: u64,
    pub payer: Option<PartyId>,
    pub payee: Option<PartyId>,
    pub due_date: Option<DateTime<Utc>>,
    pub overdue_since: Option<DateTime<Utc>>,
    pub reference: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Repayment> for RepaymentResponse {
    fn from(r: &Repayment) -> Self {
        Self {
            id: r.id_typed(),
            invoice_id: r.invoice_id(),
            disbursement_id: r.disbursement_id(),
            status: r.status(),
            amount: r.amount(),
            payer: r.payer(),
            payee: r.payee(),
            due_date: r.due_date(),
            overdue_since: r.overdue_since(),
            reference: r.reference().map(str::to_string),
            completed_at: r.completed_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SettlementResponse {
    pub invoice: InvoiceResponse,
    /// `null` until the settlement has been opened.
    pub contract: Option<ContractResponse>,
    pub disbursement: Option<DisbursementResponse>,
}

impl SettlementResponse {
    pub fn for_viewer(settlement: &Settlement, viewer: PartyId) -> Self {
        Self {
            invoice: InvoiceResponse::for_viewer(&settlement.invoice, viewer),
            contract: settlement.contract.as_ref().map(ContractResponse::from),
            disbursement: settlement.disbursement.as_ref().map(DisbursementResponse::from),
        }
    }
}
