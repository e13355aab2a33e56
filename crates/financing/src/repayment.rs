//! Buyer repayments to the financier (three-party settlement only).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use finflow_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, PartyId, TenantId,
};
use finflow_events::{Command, Event};

use crate::ids::{DisbursementId, InvoiceId, RepaymentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepaymentStatus {
    Pending,
    Completed,
    Overdue,
    /// The invoice was cancelled before the buyer paid.
    Cancelled,
}

impl RepaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RepaymentStatus::Pending => "PENDING",
            RepaymentStatus::Completed => "COMPLETED",
            RepaymentStatus::Overdue => "OVERDUE",
            RepaymentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RepaymentStatus::Completed | RepaymentStatus::Cancelled)
    }
}

impl core::fmt::Display for RepaymentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: Repayment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repayment {
    id: RepaymentId,
    tenant_id: Option<TenantId>,
    invoice_id: Option<InvoiceId>,
    disbursement_id: Option<DisbursementId>,
    payer: Option<PartyId>,
    payee: Option<PartyId>,
    amount: u64,
    due_date: Option<DateTime<Utc>>,
    status: RepaymentStatus,
    reference: Option<String>,
    overdue_since: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Repayment {
    pub fn empty(id: RepaymentId) -> Self {
        Self {
            id,
            tenant_id: None,
            invoice_id: None,
            disbursement_id: None,
            payer: None,
            payee: None,
            amount: 0,
            due_date: None,
            status: RepaymentStatus::Pending,
            reference: None,
            overdue_since: None,
            completed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> RepaymentId {
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

    pub fn disbursement_id(&self) -> Option<DisbursementId> {
        self.disbursement_id
    }

    /// The buyer.
    pub fn payer(&self) -> Option<PartyId> {
        self.payer
    }

    /// The financier.
    pub fn payee(&self) -> Option<PartyId> {
        self.payee
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.due_date
    }

    pub fn status(&self) -> RepaymentStatus {
        self.status
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn overdue_since(&self) -> Option<DateTime<Utc>> {
        self.overdue_since
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Past due and still unpaid at `now`, whether or not it was marked overdue yet.
    pub fn is_past_due_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.due_date.is_some_and(|due| now > due)
    }

    /// Marked overdue and past the grace period at `now`.
    pub fn is_default_eligible_at(&self, now: DateTime<Utc>, grace_period_days: u32) -> bool {
        self.status == RepaymentStatus::Overdue
            && self
                .due_date
                .is_some_and(|due| now > due + Duration::days(i64::from(grace_period_days)))
    }
}

impl AggregateRoot for Repayment {
    type Id = RepaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateRepayment (one per completed three-party disbursement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRepayment {
    pub tenant_id: TenantId,
    pub repayment_id: RepaymentId,
    pub invoice_id: InvoiceId,
    pub disbursement_id: DisbursementId,
    pub payer: PartyId,
    pub payee: PartyId,
    pub amount: u64,
    pub due_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkOverdue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOverdue {
    pub tenant_id: TenantId,
    pub repayment_id: RepaymentId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteRepayment (buyer's payment confirmed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRepayment {
    pub tenant_id: TenantId,
    pub repayment_id: RepaymentId,
    pub reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelRepayment (the invoice was cancelled while financed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRepayment {
    pub tenant_id: TenantId,
    pub repayment_id: RepaymentId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepaymentCommand {
    CreateRepayment(CreateRepayment),
    MarkOverdue(MarkOverdue),
    CompleteRepayment(CompleteRepayment),
    CancelRepayment(CancelRepayment),
}

impl Command for RepaymentCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            RepaymentCommand::CreateRepayment(c) => c.repayment_id.0,
            RepaymentCommand::MarkOverdue(c) => c.repayment_id.0,
            RepaymentCommand::CompleteRepayment(c) => c.repayment_id.0,
            RepaymentCommand::CancelRepayment(c) => c.repayment_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentScheduled {
    pub tenant_id: TenantId,
    pub repayment_id: RepaymentId,
    pub invoice_id: InvoiceId,
    pub disbursement_id: DisbursementId,
    pub payer: PartyId,
    pub payee: PartyId,
    pub amount: u64,
    pub due_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentOverdue {
    pub tenant_id: TenantId,
    pub repayment_id: RepaymentId,
    pub invoice_id: InvoiceId,
    pub days_overdue: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentCompleted {
    pub tenant_id: TenantId,
    pub repayment_id: RepaymentId,
    pub invoice_id: InvoiceId,
    pub amount: u64,
    pub reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentCancelled {
    pub tenant_id: TenantId,
    pub repayment_id: RepaymentId,
    pub invoice_id: InvoiceId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepaymentEvent {
    RepaymentScheduled(RepaymentScheduled),
    RepaymentOverdue(RepaymentOverdue),
    RepaymentCompleted(RepaymentCompleted),
    RepaymentCancelled(RepaymentCancelled),
}

impl Event for RepaymentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RepaymentEvent::RepaymentScheduled(_) => "financing.repayment.scheduled",
            RepaymentEvent::RepaymentOverdue(_) => "financing.repayment.overdue",
            RepaymentEvent::RepaymentCompleted(_) => "financing.repayment.completed",
            RepaymentEvent::RepaymentCancelled(_) => "financing.repayment.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RepaymentEvent::RepaymentScheduled(e) => e.occurred_at,
            RepaymentEvent::RepaymentOverdue(e) => e.occurred_at,
            RepaymentEvent::RepaymentCompleted(e) => e.occurred_at,
            RepaymentEvent::RepaymentCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Repayment {
    type Command = RepaymentCommand;
    type Event = RepaymentEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "financing.repayment";

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RepaymentEvent::RepaymentScheduled(e) => {
                self.id = e.repayment_id;
                self.tenant_id = Some(e.tenant_id);
                self.invoice_id = Some(e.invoice_id);
                self.disbursement_id = Some(e.disbursement_id);
                self.payer = Some(e.payer);
                self.payee = Some(e.payee);
                self.amount = e.amount;
                self.due_date = Some(e.due_date);
                self.status = RepaymentStatus::Pending;
                self.created = true;
            }
            RepaymentEvent::RepaymentOverdue(e) => {
                self.overdue_since = Some(e.occurred_at);
                self.status = RepaymentStatus::Overdue;
            }
            RepaymentEvent::RepaymentCompleted(e) => {
                self.reference = e.reference.clone();
                self.completed_at = Some(e.occurred_at);
                self.status = RepaymentStatus::Completed;
            }
            RepaymentEvent::RepaymentCancelled(_) => {
                self.status = RepaymentStatus::Cancelled;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RepaymentCommand::CreateRepayment(cmd) => self.handle_create(cmd),
            RepaymentCommand::MarkOverdue(cmd) => self.handle_mark_overdue(cmd),
            RepaymentCommand::CompleteRepayment(cmd) => self.handle_complete(cmd),
            RepaymentCommand::CancelRepayment(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Repayment {
    fn ensure_target(&self, tenant_id: TenantId, repayment_id: RepaymentId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != repayment_id {
            return Err(DomainError::invariant("repayment_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateRepayment) -> Result<Vec<RepaymentEvent>, DomainError> {
        if cmd.repayment_id != RepaymentId::for_disbursement(cmd.disbursement_id) {
            return Err(DomainError::invariant(
                "repayment_id does not derive from the disbursement",
            ));
        }
        if self.created {
            self.ensure_target(cmd.tenant_id, cmd.repayment_id)?;
            return Ok(vec![]);
        }
        if cmd.amount == 0 {
            return Err(DomainError::validation("repayment amount must be positive"));
        }
        if cmd.payer == cmd.payee {
            return Err(DomainError::validation("payer and payee must differ"));
        }

        Ok(vec![RepaymentEvent::RepaymentScheduled(RepaymentScheduled {
            tenant_id: cmd.tenant_id,
            repayment_id: cmd.repayment_id,
            invoice_id: cmd.invoice_id,
            disbursement_id: cmd.disbursement_id,
            payer: cmd.payer,
            payee: cmd.payee,
            amount: cmd.amount,
            due_date: cmd.due_date,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_overdue(&self, cmd: &MarkOverdue) -> Result<Vec<RepaymentEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.repayment_id)?;
        match self.status {
            RepaymentStatus::Overdue => return Ok(vec![]),
            RepaymentStatus::Completed | RepaymentStatus::Cancelled => {
                return Err(DomainError::transition(
                    "repayment",
                    self.status,
                    RepaymentStatus::Overdue,
                ));
            }
            RepaymentStatus::Pending => {}
        }
        let (Some(due), Some(invoice_id)) = (self.due_date, self.invoice_id) else {
            return Err(DomainError::invariant("repayment without schedule"));
        };
        if cmd.occurred_at <= due {
            return Err(DomainError::validation("repayment is not past due yet"));
        }

        Ok(vec![RepaymentEvent::RepaymentOverdue(RepaymentOverdue {
            tenant_id: cmd.tenant_id,
            repayment_id: cmd.repayment_id,
            invoice_id,
            days_overdue: cmd.occurred_at.signed_duration_since(due).num_days(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(
        &self,
        cmd: &CompleteRepayment,
    ) -> Result<Vec<RepaymentEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.repayment_id)?;
        match self.status {
            RepaymentStatus::Completed => return Ok(vec![]),
            RepaymentStatus::Cancelled => {
                return Err(DomainError::transition(
                    "repayment",
                    self.status,
                    RepaymentStatus::Completed,
                ));
            }
            RepaymentStatus::Pending | RepaymentStatus::Overdue => {}
        }
        let invoice_id = self
            .invoice_id
            .ok_or_else(|| DomainError::invariant("repayment without invoice"))?;

        Ok(vec![RepaymentEvent::RepaymentCompleted(RepaymentCompleted {
            tenant_id: cmd.tenant_id,
            repayment_id: cmd.repayment_id,
            invoice_id,
            amount: self.amount,
            reference: cmd
                .reference
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelRepayment) -> Result<Vec<RepaymentEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.repayment_id)?;
        match self.status {
            RepaymentStatus::Cancelled => return Ok(vec![]),
            RepaymentStatus::Completed => {
                return Err(DomainError::transition(
                    "repayment",
                    self.status,
                    RepaymentStatus::Cancelled,
                ));
            }
            RepaymentStatus::Pending | RepaymentStatus::Overdue => {}
        }
        let invoice_id = self
            .invoice_id
            .ok_or_else(|| DomainError::invariant("repayment without invoice"))?;

        Ok(vec![RepaymentEvent::RepaymentCancelled(RepaymentCancelled {
            tenant_id: cmd.tenant_id,
            repayment_id: cmd.repayment_id,
            invoice_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use finflow_events::execute;

    use crate::ids::{BidId, TermsRef};

    use super::*;

    struct Setup {
        tenant_id: TenantId,
        id: RepaymentId,
        due: DateTime<Utc>,
        repayment: Repayment,
    }

    fn scheduled() -> Setup {
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());
        let disbursement_id =
            DisbursementId::for_terms(invoice_id, TermsRef::Bid(BidId::new()));
        let id = RepaymentId::for_disbursement(disbursement_id);
        let due = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut repayment = Repayment::empty(id);
        let create = RepaymentCommand::CreateRepayment(CreateRepayment {
            tenant_id,
            repayment_id: id,
            invoice_id,
            disbursement_id,
            payer: PartyId::new(),
            payee: PartyId::new(),
            amount: 1_000_000,
            due_date: due,
            occurred_at: due - Duration::days(30),
        });
        execute(&mut repayment, &create).unwrap();
        assert!(execute(&mut repayment, &create).unwrap().is_empty());
        Setup {
            tenant_id,
            id,
            due,
            repayment,
        }
    }

    fn mark_overdue(s: &Setup, at: DateTime<Utc>) -> RepaymentCommand {
        RepaymentCommand::MarkOverdue(MarkOverdue {
            tenant_id: s.tenant_id,
            repayment_id: s.id,
            occurred_at: at,
        })
    }

    #[test]
    fn overdue_only_after_the_due_date() {
        let mut s = scheduled();
        let early = mark_overdue(&s, s.due);
        assert!(matches!(
            s.repayment.handle(&early).unwrap_err(),
            DomainError::Validation(_)
        ));

        let late = mark_overdue(&s, s.due + Duration::days(3));
        let events = execute(&mut s.repayment, &late).unwrap();
        match &events[0] {
            RepaymentEvent::RepaymentOverdue(e) => assert_eq!(e.days_overdue, 3),
            other => panic!("expected RepaymentOverdue, got {other:?}"),
        }
        assert_eq!(s.repayment.status(), RepaymentStatus::Overdue);
        assert!(execute(&mut s.repayment, &late).unwrap().is_empty());
    }

    #[test]
    fn default_eligibility_waits_for_the_grace_period() {
        let mut s = scheduled();
        let overdue = mark_overdue(&s, s.due + Duration::days(1));
        execute(&mut s.repayment, &overdue).unwrap();
        assert!(!s.repayment.is_default_eligible_at(s.due + Duration::days(30), 30));
        assert!(s.repayment.is_default_eligible_at(s.due + Duration::days(31), 30));
    }

    #[test]
    fn overdue_repayment_can_still_be_paid() {
        let mut s = scheduled();
        let overdue = mark_overdue(&s, s.due + Duration::days(2));
        execute(&mut s.repayment, &overdue).unwrap();
        execute(
            &mut s.repayment,
            &RepaymentCommand::CompleteRepayment(CompleteRepayment {
                tenant_id: s.tenant_id,
                repayment_id: s.id,
                reference: Some("NEFT-88".to_string()),
                occurred_at: s.due + Duration::days(3),
            }),
        )
        .unwrap();
        assert_eq!(s.repayment.status(), RepaymentStatus::Completed);
        assert_eq!(s.repayment.reference(), Some("NEFT-88"));
        assert!(!s.repayment.is_past_due_at(s.due + Duration::days(10)));

        let err = s
            .repayment
            .handle(&mark_overdue(&s, s.due + Duration::days(10)))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn cancelled_repayment_can_no_longer_be_paid_or_go_overdue() {
        let mut s = scheduled();
        let cancel = RepaymentCommand::CancelRepayment(CancelRepayment {
            tenant_id: s.tenant_id,
            repayment_id: s.id,
            reason: Some("invoice cancelled".to_string()),
            occurred_at: s.due - Duration::days(5),
        });
        execute(&mut s.repayment, &cancel).unwrap();
        assert_eq!(s.repayment.status(), RepaymentStatus::Cancelled);
        assert!(execute(&mut s.repayment, &cancel).unwrap().is_empty());
        assert!(!s.repayment.is_past_due_at(s.due + Duration::days(1)));

        let pay = RepaymentCommand::CompleteRepayment(CompleteRepayment {
            tenant_id: s.tenant_id,
            repayment_id: s.id,
            reference: None,
            occurred_at: s.due,
        });
        assert!(matches!(
            s.repayment.handle(&pay).unwrap_err(),
            DomainError::InvalidStateTransition { .. }
        ));
        assert!(matches!(
            s.repayment
                .handle(&mark_overdue(&s, s.due + Duration::days(2)))
                .unwrap_err(),
            DomainError::InvalidStateTransition { .. }
        ));
    }

    #[test]
    fn completed_repayment_cannot_be_cancelled() {
        let mut s = scheduled();
        execute(
            &mut s.repayment,
            &RepaymentCommand::CompleteRepayment(CompleteRepayment {
                tenant_id: s.tenant_id,
                repayment_id: s.id,
                reference: None,
                occurred_at: s.due,
            }),
        )
        .unwrap();
        let err = s
            .repayment
            .handle(&RepaymentCommand::CancelRepayment(CancelRepayment {
                tenant_id: s.tenant_id,
                repayment_id: s.id,
                reason: None,
                occurred_at: s.due,
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }
}
