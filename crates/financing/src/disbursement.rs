//! Early-payment disbursements.
//!
//! ```text
//! PENDING -> PROCESSING -> COMPLETED
//!    |           |
//!    +-----------+--> FAILED --(retry)--> PENDING
//!    +-----------+------+---> CANCELLED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finflow_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, PartyId, TenantId,
};
use finflow_events::{Command, Event};

use crate::ids::{DisbursementId, InvoiceId, TermsRef};
use crate::settlement::FundingType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisbursementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl DisbursementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DisbursementStatus::Pending => "PENDING",
            DisbursementStatus::Processing => "PROCESSING",
            DisbursementStatus::Completed => "COMPLETED",
            DisbursementStatus::Failed => "FAILED",
            DisbursementStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn can_transition_to(self, next: DisbursementStatus) -> bool {
        use DisbursementStatus::*;
        match self {
            Pending => matches!(next, Processing | Failed | Cancelled),
            Processing => matches!(next, Completed | Failed | Cancelled),
            Failed => matches!(next, Pending | Cancelled),
            Completed | Cancelled => false,
        }
    }

    fn ensure_transition(self, next: DisbursementStatus) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::transition("disbursement", self, next))
        }
    }
}

impl core::fmt::Display for DisbursementStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified bank account as reported by the profile service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccountRef {
    pub account_id: String,
    pub holder: PartyId,
    /// Display form, e.g. `XXXXXX4321`.
    pub masked_number: String,
    pub ifsc: String,
}

/// Aggregate root: Disbursement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disbursement {
    id: DisbursementId,
    tenant_id: Option<TenantId>,
    invoice_id: Option<InvoiceId>,
    terms: Option<TermsRef>,
    amount: u64,
    funding_type: FundingType,
    payer: Option<PartyId>,
    payee: Option<PartyId>,
    status: DisbursementStatus,
    source_account: Option<BankAccountRef>,
    destination_account: Option<BankAccountRef>,
    attempts: u32,
    reference: Option<String>,
    failure_reason: Option<String>,
    disbursed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Disbursement {
    pub fn empty(id: DisbursementId) -> Self {
        Self {
            id,
            tenant_id: None,
            invoice_id: None,
            terms: None,
            amount: 0,
            funding_type: FundingType::SelfFunded,
            payer: None,
            payee: None,
            status: DisbursementStatus::Pending,
            source_account: None,
            destination_account: None,
            attempts: 0,
            reference: None,
            failure_reason: None,
            disbursed_at: None,
            completed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> DisbursementId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn invoice_id(&self) -> Option<InvoiceId> {
        self.invoice_id
    }

    pub fn terms(&self) -> Option<TermsRef> {
        self.terms
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn funding_type(&self) -> FundingType {
        self.funding_type
    }

    pub fn payer(&self) -> Option<PartyId> {
        self.payer
    }

    pub fn payee(&self) -> Option<PartyId> {
        self.payee
    }

    pub fn status(&self) -> DisbursementStatus {
        self.status
    }

    pub fn source_account(&self) -> Option<&BankAccountRef> {
        self.source_account.as_ref()
    }

    pub fn destination_account(&self) -> Option<&BankAccountRef> {
        self.destination_account.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn disbursed_at(&self) -> Option<DateTime<Utc>> {
        self.disbursed_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

impl AggregateRoot for Disbursement {
    type Id = DisbursementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: InitiateDisbursement.
///
/// Idempotent per id: re-initiating an in-flight or completed disbursement
/// changes nothing, re-initiating a failed one schedules a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateDisbursement {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub invoice_id: InvoiceId,
    pub terms: TermsRef,
    pub amount: u64,
    pub payer: PartyId,
    pub payee: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartProcessing (bank accounts resolved, transfer requested).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProcessing {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub source_account: BankAccountRef,
    pub destination_account: BankAccountRef,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteDisbursement (manual confirmation of funds received).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteDisbursement {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FailDisbursement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailDisbursement {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelDisbursement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDisbursement {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisbursementCommand {
    InitiateDisbursement(InitiateDisbursement),
    StartProcessing(StartProcessing),
    CompleteDisbursement(CompleteDisbursement),
    FailDisbursement(FailDisbursement),
    CancelDisbursement(CancelDisbursement),
}

impl Command for DisbursementCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            DisbursementCommand::InitiateDisbursement(c) => c.disbursement_id.0,
            DisbursementCommand::StartProcessing(c) => c.disbursement_id.0,
            DisbursementCommand::CompleteDisbursement(c) => c.disbursement_id.0,
            DisbursementCommand::FailDisbursement(c) => c.disbursement_id.0,
            DisbursementCommand::CancelDisbursement(c) => c.disbursement_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbursementInitiated {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub invoice_id: InvoiceId,
    pub terms: TermsRef,
    pub amount: u64,
    pub funding_type: FundingType,
    pub payer: PartyId,
    pub payee: PartyId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbursementRetried {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbursementProcessing {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub source_account: BankAccountRef,
    pub destination_account: BankAccountRef,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbursementCompleted {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub invoice_id: InvoiceId,
    pub amount: u64,
    pub reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbursementFailed {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbursementCancelled {
    pub tenant_id: TenantId,
    pub disbursement_id: DisbursementId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisbursementEvent {
    DisbursementInitiated(DisbursementInitiated),
    DisbursementRetried(DisbursementRetried),
    DisbursementProcessing(DisbursementProcessing),
    DisbursementCompleted(DisbursementCompleted),
    DisbursementFailed(DisbursementFailed),
    DisbursementCancelled(DisbursementCancelled),
}

impl Event for DisbursementEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DisbursementEvent::DisbursementInitiated(_) => "financing.disbursement.initiated",
            DisbursementEvent::DisbursementRetried(_) => "financing.disbursement.retried",
            DisbursementEvent::DisbursementProcessing(_) => "financing.disbursement.processing",
            DisbursementEvent::DisbursementCompleted(_) => "financing.disbursement.completed",
            DisbursementEvent::DisbursementFailed(_) => "financing.disbursement.failed",
            DisbursementEvent::DisbursementCancelled(_) => "financing.disbursement.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DisbursementEvent::DisbursementInitiated(e) => e.occurred_at,
            DisbursementEvent::DisbursementRetried(e) => e.occurred_at,
            DisbursementEvent::DisbursementProcessing(e) => e.occurred_at,
            DisbursementEvent::DisbursementCompleted(e) => e.occurred_at,
            DisbursementEvent::DisbursementFailed(e) => e.occurred_at,
            DisbursementEvent::DisbursementCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Disbursement {
    type Command = DisbursementCommand;
    type Event = DisbursementEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "financing.disbursement";

    fn apply(&mut self, event: &Self::Event) {
        match event {
            DisbursementEvent::DisbursementInitiated(e) => {
                self.id = e.disbursement_id;
                self.tenant_id = Some(e.tenant_id);
                self.invoice_id = Some(e.invoice_id);
                self.terms = Some(e.terms);
                self.amount = e.amount;
                self.funding_type = e.funding_type;
                self.payer = Some(e.payer);
                self.payee = Some(e.payee);
                self.status = DisbursementStatus::Pending;
                self.attempts = 1;
                self.created = true;
            }
            DisbursementEvent::DisbursementRetried(e) => {
                self.attempts = e.attempt;
                self.failure_reason = None;
                self.status = DisbursementStatus::Pending;
            }
            DisbursementEvent::DisbursementProcessing(e) => {
                self.source_account = Some(e.source_account.clone());
                self.destination_account = Some(e.destination_account.clone());
                self.disbursed_at = Some(e.occurred_at);
                self.status = DisbursementStatus::Processing;
            }
            DisbursementEvent::DisbursementCompleted(e) => {
                self.reference = e.reference.clone();
                self.completed_at = Some(e.occurred_at);
                self.status = DisbursementStatus::Completed;
            }
            DisbursementEvent::DisbursementFailed(e) => {
                self.failure_reason = Some(e.reason.clone());
                self.status = DisbursementStatus::Failed;
            }
            DisbursementEvent::DisbursementCancelled(e) => {
                self.failure_reason = e.reason.clone();
                self.status = DisbursementStatus::Cancelled;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            DisbursementCommand::InitiateDisbursement(cmd) => self.handle_initiate(cmd),
            DisbursementCommand::StartProcessing(cmd) => self.handle_start_processing(cmd),
            DisbursementCommand::CompleteDisbursement(cmd) => self.handle_complete(cmd),
            DisbursementCommand::FailDisbursement(cmd) => self.handle_fail(cmd),
            DisbursementCommand::CancelDisbursement(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Disbursement {
    fn ensure_target(
        &self,
        tenant_id: TenantId,
        disbursement_id: DisbursementId,
    ) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != disbursement_id {
            return Err(DomainError::invariant("disbursement_id mismatch"));
        }
        Ok(())
    }

    fn handle_initiate(
        &self,
        cmd: &InitiateDisbursement,
    ) -> Result<Vec<DisbursementEvent>, DomainError> {
        if cmd.disbursement_id != DisbursementId::for_terms(cmd.invoice_id, cmd.terms) {
            return Err(DomainError::invariant(
                "disbursement_id does not derive from invoice and accepted terms",
            ));
        }

        if self.created {
            self.ensure_target(cmd.tenant_id, cmd.disbursement_id)?;
            return match self.status {
                DisbursementStatus::Pending
                | DisbursementStatus::Processing
                | DisbursementStatus::Completed => Ok(vec![]),
                DisbursementStatus::Failed => Ok(vec![DisbursementEvent::DisbursementRetried(
                    DisbursementRetried {
                        tenant_id: cmd.tenant_id,
                        disbursement_id: cmd.disbursement_id,
                        attempt: self.attempts + 1,
                        occurred_at: cmd.occurred_at,
                    },
                )]),
                DisbursementStatus::Cancelled => Err(DomainError::conflict(
                    "disbursement was cancelled and cannot be restarted",
                )),
            };
        }

        if cmd.amount == 0 {
            return Err(DomainError::validation("disbursement amount must be positive"));
        }
        if cmd.payer == cmd.payee {
            return Err(DomainError::validation("payer and payee must differ"));
        }

        Ok(vec![DisbursementEvent::DisbursementInitiated(
            DisbursementInitiated {
                tenant_id: cmd.tenant_id,
                disbursement_id: cmd.disbursement_id,
                invoice_id: cmd.invoice_id,
                terms: cmd.terms,
                amount: cmd.amount,
                funding_type: cmd.terms.contract_type().funding_type(),
                payer: cmd.payer,
                payee: cmd.payee,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_start_processing(
        &self,
        cmd: &StartProcessing,
    ) -> Result<Vec<DisbursementEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.disbursement_id)?;
        if self.status == DisbursementStatus::Processing
            && self.source_account.as_ref() == Some(&cmd.source_account)
            && self.destination_account.as_ref() == Some(&cmd.destination_account)
        {
            return Ok(vec![]);
        }
        self.status.ensure_transition(DisbursementStatus::Processing)?;

        if Some(cmd.source_account.holder) != self.payer {
            return Err(DomainError::validation(
                "source account must belong to the payer",
            ));
        }
        if Some(cmd.destination_account.holder) != self.payee {
            return Err(DomainError::validation(
                "destination account must belong to the payee",
            ));
        }

        Ok(vec![DisbursementEvent::DisbursementProcessing(
            DisbursementProcessing {
                tenant_id: cmd.tenant_id,
                disbursement_id: cmd.disbursement_id,
                source_account: cmd.source_account.clone(),
                destination_account: cmd.destination_account.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_complete(
        &self,
        cmd: &CompleteDisbursement,
    ) -> Result<Vec<DisbursementEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.disbursement_id)?;
        if self.status == DisbursementStatus::Completed {
            return Ok(vec![]);
        }
        self.status.ensure_transition(DisbursementStatus::Completed)?;

        let reference = cmd
            .reference
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        let invoice_id = self
            .invoice_id
            .ok_or_else(|| DomainError::invariant("disbursement without invoice"))?;

        Ok(vec![DisbursementEvent::DisbursementCompleted(
            DisbursementCompleted {
                tenant_id: cmd.tenant_id,
                disbursement_id: cmd.disbursement_id,
                invoice_id,
                amount: self.amount,
                reference,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_fail(&self, cmd: &FailDisbursement) -> Result<Vec<DisbursementEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.disbursement_id)?;
        if self.status == DisbursementStatus::Failed {
            return Ok(vec![]);
        }
        self.status.ensure_transition(DisbursementStatus::Failed)?;
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("failure reason must not be blank"));
        }

        Ok(vec![DisbursementEvent::DisbursementFailed(DisbursementFailed {
            tenant_id: cmd.tenant_id,
            disbursement_id: cmd.disbursement_id,
            reason: cmd.reason.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(
        &self,
        cmd: &CancelDisbursement,
    ) -> Result<Vec<DisbursementEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.disbursement_id)?;
        if self.status == DisbursementStatus::Cancelled {
            return Ok(vec![]);
        }
        self.status.ensure_transition(DisbursementStatus::Cancelled)?;

        Ok(vec![DisbursementEvent::DisbursementCancelled(
            DisbursementCancelled {
                tenant_id: cmd.tenant_id,
                disbursement_id: cmd.disbursement_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use finflow_events::execute;

    use crate::ids::BidId;

    use super::*;

    struct Setup {
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        terms: TermsRef,
        id: DisbursementId,
        payer: PartyId,
        payee: PartyId,
        now: DateTime<Utc>,
    }

    impl Setup {
        fn new() -> Self {
            let invoice_id = InvoiceId::new(AggregateId::new());
            let terms = TermsRef::Bid(BidId::new());
            Self {
                tenant_id: TenantId::new(),
                invoice_id,
                terms,
                id: DisbursementId::for_terms(invoice_id, terms),
                payer: PartyId::new(),
                payee: PartyId::new(),
                now: Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap(),
            }
        }

        fn initiate(&self) -> DisbursementCommand {
            DisbursementCommand::InitiateDisbursement(InitiateDisbursement {
                tenant_id: self.tenant_id,
                disbursement_id: self.id,
                invoice_id: self.invoice_id,
                terms: self.terms,
                amount: 981_500,
                payer: self.payer,
                payee: self.payee,
                occurred_at: self.now,
            })
        }

        fn account(&self, holder: PartyId, suffix: &str) -> BankAccountRef {
            BankAccountRef {
                account_id: format!("acct-{suffix}"),
                holder,
                masked_number: format!("XXXXXX{suffix}"),
                ifsc: "HDFC0000123".to_string(),
            }
        }

        fn start(&self) -> DisbursementCommand {
            DisbursementCommand::StartProcessing(StartProcessing {
                tenant_id: self.tenant_id,
                disbursement_id: self.id,
                source_account: self.account(self.payer, "1111"),
                destination_account: self.account(self.payee, "2222"),
                occurred_at: self.now,
            })
        }

        fn fail(&self) -> DisbursementCommand {
            DisbursementCommand::FailDisbursement(FailDisbursement {
                tenant_id: self.tenant_id,
                disbursement_id: self.id,
                reason: "bank rejected transfer".to_string(),
                occurred_at: self.now,
            })
        }

        fn complete(&self) -> DisbursementCommand {
            DisbursementCommand::CompleteDisbursement(CompleteDisbursement {
                tenant_id: self.tenant_id,
                disbursement_id: self.id,
                reference: Some(" UTR123 ".to_string()),
                occurred_at: self.now,
            })
        }
    }

    #[test]
    fn initiate_is_idempotent() {
        let s = Setup::new();
        let mut d = Disbursement::empty(s.id);
        assert_eq!(execute(&mut d, &s.initiate()).unwrap().len(), 1);
        assert!(execute(&mut d, &s.initiate()).unwrap().is_empty());
        assert_eq!(d.funding_type(), FundingType::FinancierFunded);
        assert_eq!(d.version(), 1);
    }

    #[test]
    fn happy_path_records_accounts_and_reference() {
        let s = Setup::new();
        let mut d = Disbursement::empty(s.id);
        execute(&mut d, &s.initiate()).unwrap();
        execute(&mut d, &s.start()).unwrap();
        assert_eq!(d.status(), DisbursementStatus::Processing);
        assert_eq!(d.source_account().unwrap().masked_number, "XXXXXX1111");

        execute(&mut d, &s.complete()).unwrap();
        assert_eq!(d.status(), DisbursementStatus::Completed);
        assert_eq!(d.reference(), Some("UTR123"));
        // Completion redelivered: nothing new.
        assert!(execute(&mut d, &s.complete()).unwrap().is_empty());
    }

    #[test]
    fn failed_disbursement_can_be_retried() {
        let s = Setup::new();
        let mut d = Disbursement::empty(s.id);
        execute(&mut d, &s.initiate()).unwrap();
        execute(&mut d, &s.fail()).unwrap();
        assert_eq!(d.failure_reason(), Some("bank rejected transfer"));

        let events = execute(&mut d, &s.initiate()).unwrap();
        assert!(matches!(events[0], DisbursementEvent::DisbursementRetried(_)));
        assert_eq!(d.status(), DisbursementStatus::Pending);
        assert_eq!(d.attempts(), 2);
        assert_eq!(d.failure_reason(), None);
    }

    #[test]
    fn completion_requires_processing() {
        let s = Setup::new();
        let mut d = Disbursement::empty(s.id);
        execute(&mut d, &s.initiate()).unwrap();
        let err = d.handle(&s.complete()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn accounts_must_belong_to_the_parties() {
        let s = Setup::new();
        let mut d = Disbursement::empty(s.id);
        execute(&mut d, &s.initiate()).unwrap();
        let wrong = DisbursementCommand::StartProcessing(StartProcessing {
            tenant_id: s.tenant_id,
            disbursement_id: s.id,
            source_account: s.account(PartyId::new(), "9999"),
            destination_account: s.account(s.payee, "2222"),
            occurred_at: s.now,
        });
        assert!(matches!(
            d.handle(&wrong).unwrap_err(),
            DomainError::Validation(_)
        ));
    }

    #[test]
    fn cancelled_disbursement_stays_cancelled() {
        let s = Setup::new();
        let mut d = Disbursement::empty(s.id);
        execute(&mut d, &s.initiate()).unwrap();
        execute(
            &mut d,
            &DisbursementCommand::CancelDisbursement(CancelDisbursement {
                tenant_id: s.tenant_id,
                disbursement_id: s.id,
                reason: Some("invoice cancelled".to_string()),
                occurred_at: s.now,
            }),
        )
        .unwrap();
        assert!(matches!(
            d.handle(&s.initiate()).unwrap_err(),
            DomainError::Conflict(_)
        ));
        assert!(d.handle(&s.start()).is_err());
    }

    #[test]
    fn id_must_derive_from_invoice_and_terms() {
        let s = Setup::new();
        let d = Disbursement::empty(s.id);
        let mut cmd = match s.initiate() {
            DisbursementCommand::InitiateDisbursement(c) => c,
            _ => unreachable!(),
        };
        cmd.terms = TermsRef::Bid(BidId::new());
        assert!(matches!(
            d.handle(&DisbursementCommand::InitiateDisbursement(cmd))
                .unwrap_err(),
            DomainError::InvariantViolation(_)
        ));
    }
}
