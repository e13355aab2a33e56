//! End-to-end tests: engine → dispatcher → store → bus → projection/relay,
//! all in memory, with a manual clock.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::Value as JsonValue;

    use finflow_core::{
        Aggregate, AggregateId, DomainError, ExpectedVersion, PartyId, Rate, TenantId,
    };
    use finflow_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
    use finflow_financing::{
        AcceptOffer, BidStatus, CancelInvoice, Contract, ContractStatus, ContractType,
        DisbursementId, DisbursementStatus, FieldSource, Invoice, InvoiceCommand, InvoiceFields,
        InvoiceId, InvoiceStatus, OfferStatus, ProductType, RepaymentId, RepaymentStatus, TermsRef,
    };

    use crate::command_dispatcher::CommandDispatcher;
    use crate::config::EngineConfig;
    use crate::engine::{BidTerms, EngineError, EngineServices, FinancingEngine, ManualClock};
    use crate::event_store::{
        EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent,
    };
    use crate::external::{
        AuditAction, BankAccount, ExternalError, InMemoryAuditLog, InMemoryKycService,
        InMemoryNotificationSink, InMemoryProfileService, KycStatus, Notification,
        NotificationKind, NotificationSink,
    };
    use crate::projections::InvoiceBoardProjection;
    use crate::workers::{Delivery, ExpirySweeper, NotificationRelay, RetryPolicy};

    type Store = Arc<InMemoryEventStore>;
    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Engine = FinancingEngine<Store, Bus>;

    const AMOUNT: u64 = 1_000_000;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap()
    }

    fn due_date() -> DateTime<Utc> {
        t0() + Duration::days(30)
    }

    struct Market {
        tenant: TenantId,
        seller: PartyId,
        buyer: PartyId,
        financiers: [PartyId; 3],
        engine: Arc<Engine>,
        store: Store,
        bus: Bus,
        clock: Arc<ManualClock>,
        kyc: Arc<InMemoryKycService>,
        profiles: Arc<InMemoryProfileService>,
        audit: Arc<InMemoryAuditLog>,
    }

    impl Market {
        fn new() -> Self {
            let store: Store = Arc::new(InMemoryEventStore::new());
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let clock = Arc::new(ManualClock::new(t0()));
            let kyc = Arc::new(InMemoryKycService::new());
            let profiles = Arc::new(InMemoryProfileService::new());
            let audit = Arc::new(InMemoryAuditLog::new());

            let engine = FinancingEngine::new(
                CommandDispatcher::new(store.clone(), bus.clone()),
                EngineServices {
                    kyc: kyc.clone(),
                    profiles: profiles.clone(),
                    audit: audit.clone(),
                },
                EngineConfig::default(),
            )
            .with_clock(clock.clone());

            let market = Self {
                tenant: TenantId::new(),
                seller: PartyId::new(),
                buyer: PartyId::new(),
                financiers: [PartyId::new(), PartyId::new(), PartyId::new()],
                engine: Arc::new(engine),
                store,
                bus,
                clock,
                kyc,
                profiles,
                audit,
            };
            market.kyc.approve(market.tenant, market.seller);
            market.kyc.approve(market.tenant, market.buyer);
            market
        }

        fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
            self.bus.subscribe()
        }

        fn fields(&self) -> InvoiceFields {
            InvoiceFields {
                invoice_number: Some("INV-2026-014".to_string()),
                amount: Some(AMOUNT),
                invoice_date: Some(t0() - Duration::days(1)),
                due_date: Some(due_date()),
                gstin: None,
            }
        }

        fn bank_account(&self, party: PartyId, verified: bool) {
            self.profiles.add_bank_account(
                self.tenant,
                BankAccount {
                    account_id: format!("acc-{party}"),
                    holder: party,
                    account_number: "50100234567812".to_string(),
                    ifsc: "HDFC0001234".to_string(),
                    bank_name: "HDFC Bank".to_string(),
                    verified,
                    primary: true,
                },
            );
        }

        fn submitted_invoice(&self) -> InvoiceId {
            let draft = self
                .engine
                .create_draft(
                    self.tenant,
                    self.seller,
                    self.buyer,
                    self.fields(),
                    FieldSource::Manual,
                    ProductType::SelfFundedDiscount,
                )
                .unwrap();
            let invoice_id = draft.id_typed();
            self.engine
                .submit_invoice(self.tenant, self.seller, invoice_id)
                .unwrap();
            invoice_id
        }

        fn accepted_invoice(&self) -> InvoiceId {
            let invoice_id = self.submitted_invoice();
            self.engine
                .accept_invoice(self.tenant, self.buyer, invoice_id)
                .unwrap();
            invoice_id
        }

        fn open_auction(&self) -> InvoiceId {
            let invoice_id = self.accepted_invoice();
            self.engine
                .open_for_bidding(self.tenant, self.seller, invoice_id)
                .unwrap();
            invoice_id
        }

        fn bid(&self, invoice_id: InvoiceId, financier: PartyId, rate_bps: u32) -> finflow_financing::Bid {
            self.engine
                .submit_bid(
                    self.tenant,
                    financier,
                    invoice_id,
                    BidTerms {
                        discount_rate: Rate::from_bps(rate_bps),
                        processing_fee: Rate::from_bps(25),
                        haircut: None,
                        valid_until: self.clock_now() + Duration::days(2),
                    },
                )
                .unwrap()
        }

        fn clock_now(&self) -> DateTime<Utc> {
            self.engine.now()
        }

        fn invoice(&self, invoice_id: InvoiceId) -> Invoice {
            self.engine.invoice(self.tenant, invoice_id).unwrap()
        }

        /// Three-party flow up to a completed disbursement.
        fn financed_by_bid(&self) -> (InvoiceId, PartyId, RepaymentId) {
            let invoice_id = self.open_auction();
            let financier = self.financiers[0];
            let bid = self.bid(invoice_id, financier, 160);
            let settlement = self
                .engine
                .accept_bid(self.tenant, self.seller, invoice_id, bid.bid_id)
                .unwrap();

            self.bank_account(financier, true);
            self.bank_account(self.seller, true);
            let disbursement_id = settlement.disbursement.unwrap().id_typed();
            self.engine
                .initiate_disbursement(self.tenant, financier, disbursement_id)
                .unwrap();
            self.engine
                .complete_disbursement(self.tenant, self.seller, disbursement_id, Some("UTR1".into()))
                .unwrap();
            (invoice_id, financier, RepaymentId::for_disbursement(disbursement_id))
        }
    }

    #[test]
    fn two_party_discount_settles_seller_at_980000_without_repayment() {
        let m = Market::new();
        let invoice_id = m.submitted_invoice();

        let offer = m
            .engine
            .create_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(200), t0() + Duration::days(2))
            .unwrap();
        let settlement = m
            .engine
            .accept_offer(m.tenant, m.seller, invoice_id, offer.offer_id)
            .unwrap();

        assert_eq!(settlement.invoice.status(), InvoiceStatus::Accepted);
        assert_eq!(settlement.invoice.accepted_terms(), Some(TermsRef::Offer(offer.offer_id)));
        assert!(settlement.is_open());
        let contract = settlement.contract.unwrap();
        let disbursement = settlement.disbursement.unwrap();
        let terms = contract.terms().unwrap();
        assert_eq!(terms.contract_type, ContractType::TwoParty);
        assert_eq!(terms.seller_receives, 980_000);
        assert_eq!(disbursement.amount(), 980_000);
        assert_eq!(disbursement.payer(), Some(m.buyer));
        assert_eq!(disbursement.payee(), Some(m.seller));

        m.bank_account(m.buyer, true);
        m.bank_account(m.seller, true);
        let disbursement_id = disbursement.id_typed();
        let processing = m
            .engine
            .initiate_disbursement(m.tenant, m.buyer, disbursement_id)
            .unwrap();
        assert_eq!(processing.status(), DisbursementStatus::Processing);
        assert_eq!(processing.source_account().unwrap().masked_number, "XXXX7812");

        m.engine
            .complete_disbursement(m.tenant, m.seller, disbursement_id, None)
            .unwrap();

        let invoice = m.invoice(invoice_id);
        assert_eq!(invoice.status(), InvoiceStatus::Repaid);
        assert_eq!(invoice.financed_by(), Some(disbursement_id));
        let contract = m.engine.contract(m.tenant, contract.id_typed()).unwrap();
        assert_eq!(contract.status(), ContractStatus::Completed);

        let no_repayment = m
            .engine
            .repayment(m.tenant, RepaymentId::for_disbursement(disbursement_id))
            .unwrap_err();
        assert_eq!(no_repayment.domain(), Some(&DomainError::NotFound));
    }

    #[test]
    fn three_party_bid_pays_981500_and_buyer_repays_face_value() {
        let m = Market::new();
        let (invoice_id, financier, repayment_id) = m.financed_by_bid();

        let invoice = m.invoice(invoice_id);
        assert_eq!(invoice.status(), InvoiceStatus::Financed);
        let disbursement = m
            .engine
            .disbursement(m.tenant, invoice.financed_by().unwrap())
            .unwrap();
        assert_eq!(disbursement.amount(), 981_500);
        assert_eq!(disbursement.payer(), Some(financier));

        let repayment = m.engine.repayment(m.tenant, repayment_id).unwrap();
        assert_eq!(repayment.amount(), AMOUNT);
        assert_eq!(repayment.payer(), Some(m.buyer));
        assert_eq!(repayment.payee(), Some(financier));
        assert_eq!(repayment.due_date(), Some(due_date()));

        m.engine
            .complete_repayment(m.tenant, m.buyer, repayment_id, Some("UTR2".into()))
            .unwrap();
        let invoice = m.invoice(invoice_id);
        assert_eq!(invoice.status(), InvoiceStatus::Repaid);
        assert_eq!(invoice.repaid_by(), Some(repayment_id));

        let terms = invoice.accepted_terms().unwrap();
        let contract = m
            .engine
            .contract(m.tenant, finflow_financing::ContractId::for_terms(invoice_id, terms))
            .unwrap();
        assert_eq!(contract.status(), ContractStatus::Completed);
        assert_eq!(contract.terms().unwrap().financier_pays, Some(981_500));
    }

    #[test]
    fn accepting_one_of_three_bids_rejects_the_rivals_in_one_commit() {
        let m = Market::new();
        let invoice_id = m.open_auction();
        let b1 = m.bid(invoice_id, m.financiers[0], 180);
        let b2 = m.bid(invoice_id, m.financiers[1], 150);
        let b3 = m.bid(invoice_id, m.financiers[2], 170);

        let ranked = m.engine.ranked_bids(m.tenant, m.seller, invoice_id).unwrap();
        assert_eq!(ranked.first().map(|r| r.bid.bid_id), Some(b2.bid_id));
        let hidden = m.engine.ranked_bids(m.tenant, m.financiers[0], invoice_id);
        assert!(matches!(
            hidden.unwrap_err().domain(),
            Some(DomainError::Unauthorized(_))
        ));

        let before = m.store.load_stream(m.tenant, invoice_id.0).unwrap().len();
        let settlement = m
            .engine
            .accept_bid(m.tenant, m.buyer, invoice_id, b2.bid_id)
            .unwrap();
        let after = m.store.load_stream(m.tenant, invoice_id.0).unwrap().len();
        assert_eq!(after, before + 1);

        let invoice = settlement.invoice;
        assert_eq!(invoice.status(), InvoiceStatus::BidAccepted);
        assert_eq!(invoice.bid(b1.bid_id).unwrap().status, BidStatus::Rejected);
        assert_eq!(invoice.bid(b2.bid_id).unwrap().status, BidStatus::Accepted);
        assert_eq!(invoice.bid(b3.bid_id).unwrap().status, BidStatus::Rejected);

        let second = m
            .engine
            .accept_bid(m.tenant, m.seller, invoice_id, b1.bid_id)
            .unwrap_err();
        assert!(matches!(second.domain(), Some(DomainError::Conflict(_))));
        assert_eq!(
            m.invoice(invoice_id).bid(b2.bid_id).unwrap().status,
            BidStatus::Accepted
        );
    }

    #[test]
    fn concurrent_acceptances_yield_exactly_one_winner() {
        let m = Market::new();
        let invoice_id = m.open_auction();
        let bids: Vec<_> = m
            .financiers
            .iter()
            .zip([150, 160, 170])
            .map(|(f, rate)| m.bid(invoice_id, *f, rate))
            .collect();

        let barrier = Arc::new(Barrier::new(bids.len()));
        let handles: Vec<_> = bids
            .iter()
            .enumerate()
            .map(|(i, bid)| {
                let engine = m.engine.clone();
                let barrier = barrier.clone();
                let (tenant, bid_id) = (m.tenant, bid.bid_id);
                let actor = if i % 2 == 0 { m.seller } else { m.buyer };
                thread::spawn(move || {
                    barrier.wait();
                    engine.accept_bid(tenant, actor, invoice_id, bid_id)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(
                err.is_concurrency() || matches!(err.domain(), Some(DomainError::Conflict(_))),
                "unexpected error: {err}"
            );
        }

        let invoice = m.invoice(invoice_id);
        let accepted = invoice
            .bids()
            .iter()
            .filter(|b| b.status == BidStatus::Accepted)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(invoice.status(), InvoiceStatus::BidAccepted);
    }

    #[test]
    fn fourth_offer_in_a_chain_is_refused() {
        let m = Market::new();
        let invoice_id = m.submitted_invoice();
        let expires = t0() + Duration::days(3);

        m.engine
            .create_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(300), expires)
            .unwrap();
        m.engine
            .revise_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(250), expires)
            .unwrap();
        let third = m
            .engine
            .revise_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(200), expires)
            .unwrap();
        assert_eq!(third.sequence, 3);
        assert_eq!(third.revisions_remaining, 0);

        m.engine
            .reject_offer(m.tenant, m.seller, invoice_id, third.offer_id, Some("too steep".into()))
            .unwrap();
        let err = m
            .engine
            .revise_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(150), expires)
            .unwrap_err();
        assert_eq!(
            err.domain(),
            Some(&DomainError::RevisionLimitExceeded { max: 3 })
        );

        let invoice = m.engine.fallback_to_standard_payment(m.tenant, m.seller, invoice_id).unwrap();
        assert!(invoice.negotiation_closed());
    }

    #[test]
    fn initiating_a_disbursement_twice_keeps_one_record() {
        let m = Market::new();
        let invoice_id = m.open_auction();
        let bid = m.bid(invoice_id, m.financiers[0], 160);
        let settlement = m
            .engine
            .accept_bid(m.tenant, m.seller, invoice_id, bid.bid_id)
            .unwrap();
        m.bank_account(m.financiers[0], true);
        m.bank_account(m.seller, true);

        let id = settlement.disbursement.unwrap().id_typed();
        assert_eq!(id, DisbursementId::for_terms(invoice_id, TermsRef::Bid(bid.bid_id)));
        let first = m.engine.initiate_disbursement(m.tenant, m.financiers[0], id).unwrap();
        let version = m.store.load_stream(m.tenant, id.0).unwrap().len();
        let second = m.engine.initiate_disbursement(m.tenant, m.financiers[0], id).unwrap();

        assert_eq!(first.id_typed(), second.id_typed());
        assert_eq!(second.status(), DisbursementStatus::Processing);
        assert_eq!(m.store.load_stream(m.tenant, id.0).unwrap().len(), version);
    }

    #[test]
    fn failed_disbursement_is_retried_by_explicit_reinitiation() {
        let m = Market::new();
        let invoice_id = m.open_auction();
        let financier = m.financiers[0];
        let bid = m.bid(invoice_id, financier, 160);
        let id = m
            .engine
            .accept_bid(m.tenant, m.seller, invoice_id, bid.bid_id)
            .unwrap()
            .disbursement
            .unwrap()
            .id_typed();
        m.bank_account(financier, true);
        m.bank_account(m.seller, true);

        m.engine.initiate_disbursement(m.tenant, financier, id).unwrap();
        let failed = m
            .engine
            .fail_disbursement(m.tenant, financier, id, "beneficiary bank offline".into())
            .unwrap();
        assert_eq!(failed.status(), DisbursementStatus::Failed);
        assert_eq!(failed.failure_reason(), Some("beneficiary bank offline"));
        assert_eq!(m.invoice(invoice_id).status(), InvoiceStatus::BidAccepted);

        let retried = m.engine.initiate_disbursement(m.tenant, financier, id).unwrap();
        assert_eq!(retried.status(), DisbursementStatus::Processing);
        assert_eq!(retried.attempts(), 2);
    }

    #[test]
    fn disbursement_needs_verified_primary_accounts_and_the_payer() {
        let m = Market::new();
        let invoice_id = m.open_auction();
        let financier = m.financiers[0];
        let bid = m.bid(invoice_id, financier, 160);
        let id = m
            .engine
            .accept_bid(m.tenant, m.seller, invoice_id, bid.bid_id)
            .unwrap()
            .disbursement
            .unwrap()
            .id_typed();

        m.bank_account(financier, true);
        m.bank_account(m.seller, false);
        let err = m.engine.initiate_disbursement(m.tenant, financier, id).unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingBankAccount { party, role: "payee" } if party == m.seller
        ));
        assert_eq!(err.code(), "missing_bank_account");

        m.bank_account(m.seller, true);
        let err = m.engine.initiate_disbursement(m.tenant, m.seller, id).unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Unauthorized(_))));
        assert_eq!(
            m.engine.disbursement(m.tenant, id).unwrap().status(),
            DisbursementStatus::Pending
        );
    }

    #[test]
    fn unreachable_profile_service_fails_the_disbursement_until_reinitiated() {
        let m = Market::new();
        let invoice_id = m.open_auction();
        let financier = m.financiers[1];
        let bid = m.bid(invoice_id, financier, 160);
        let id = m
            .engine
            .accept_bid(m.tenant, m.seller, invoice_id, bid.bid_id)
            .unwrap()
            .disbursement
            .unwrap()
            .id_typed();
        m.bank_account(financier, true);
        m.bank_account(m.seller, true);

        m.profiles.set_offline(true);
        let err = m.engine.initiate_disbursement(m.tenant, financier, id).unwrap_err();
        assert_eq!(err.code(), "external_service_error");
        let failed = m.engine.disbursement(m.tenant, id).unwrap();
        assert_eq!(failed.status(), DisbursementStatus::Failed);
        assert!(failed.failure_reason().unwrap().contains("profile unavailable"));

        m.profiles.set_offline(false);
        let retried = m.engine.initiate_disbursement(m.tenant, financier, id).unwrap();
        assert_eq!(retried.status(), DisbursementStatus::Processing);
        assert_eq!(retried.attempts(), 2);
    }

    #[test]
    fn submission_requires_approved_kyc_for_both_parties() {
        let m = Market::new();
        m.kyc.set_status(m.tenant, m.buyer, KycStatus::Rejected);
        let draft = m
            .engine
            .create_draft(
                m.tenant,
                m.seller,
                m.buyer,
                m.fields(),
                FieldSource::Extracted,
                ProductType::SelfFundedDiscount,
            )
            .unwrap();

        let err = m
            .engine
            .submit_invoice(m.tenant, m.seller, draft.id_typed())
            .unwrap_err();
        assert!(matches!(err, EngineError::KycNotApproved { role: "buyer" }));
        assert_eq!(m.invoice(draft.id_typed()).status(), InvoiceStatus::Draft);
    }

    #[test]
    fn expired_offer_cannot_be_accepted_and_is_recorded_as_expired() {
        let m = Market::new();
        let invoice_id = m.submitted_invoice();
        let offer = m
            .engine
            .create_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(200), t0() + Duration::hours(1))
            .unwrap();

        m.clock.advance(Duration::hours(2));
        let err = m
            .engine
            .accept_offer(m.tenant, m.seller, invoice_id, offer.offer_id)
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::OfferExpired(_))));
        assert_eq!(err.code(), "offer_expired");

        let invoice = m.invoice(invoice_id);
        assert_eq!(invoice.offer(offer.offer_id).unwrap().status, OfferStatus::Expired);
        assert_eq!(invoice.accepted_terms(), None);
    }

    #[test]
    fn cancelling_after_acceptance_unwinds_contract_and_disbursement() {
        let m = Market::new();
        let invoice_id = m.open_auction();
        let bid = m.bid(invoice_id, m.financiers[0], 160);
        let settlement = m
            .engine
            .accept_bid(m.tenant, m.seller, invoice_id, bid.bid_id)
            .unwrap();

        let invoice = m
            .engine
            .cancel_invoice(m.tenant, m.buyer, invoice_id, Some("duplicate invoice".into()))
            .unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Cancelled);

        let contract_id = settlement.contract.as_ref().unwrap().id_typed();
        let contract = m.engine.contract(m.tenant, contract_id).unwrap();
        assert_eq!(contract.status(), ContractStatus::Cancelled);
        let disbursement = m
            .engine
            .disbursement(m.tenant, settlement.disbursement.as_ref().unwrap().id_typed())
            .unwrap();
        assert_eq!(disbursement.status(), DisbursementStatus::Cancelled);

        let actions: Vec<_> = m
            .audit
            .entries_for(m.tenant, *invoice_id.as_uuid())
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert!(actions.contains(&AuditAction::Accept));
        assert!(actions.contains(&AuditAction::Cancel));

        let err = m
            .engine
            .accept_bid(m.tenant, m.seller, invoice_id, bid.bid_id)
            .unwrap_err();
        assert!(err.domain().is_some());

        // Unwinding again changes nothing.
        let outcome = m.engine.resume_settlement(m.tenant, invoice_id).unwrap();
        assert!(outcome.is_empty());
    }

    #[test]
    fn cancelling_a_financed_invoice_cancels_repayment_and_contract() {
        let m = Market::new();
        let (invoice_id, financier, repayment_id) = m.financed_by_bid();

        let invoice = m
            .engine
            .cancel_invoice(m.tenant, m.seller, invoice_id, Some("goods returned".into()))
            .unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Cancelled);

        let terms = invoice.accepted_terms().unwrap();
        let disbursement = m
            .engine
            .disbursement(m.tenant, DisbursementId::for_terms(invoice_id, terms))
            .unwrap();
        assert_eq!(disbursement.status(), DisbursementStatus::Completed);
        assert_eq!(
            m.engine.repayment(m.tenant, repayment_id).unwrap().status(),
            RepaymentStatus::Cancelled
        );
        let contract = m
            .engine
            .contract(m.tenant, finflow_financing::ContractId::for_terms(invoice_id, terms))
            .unwrap();
        assert_eq!(contract.status(), ContractStatus::Cancelled);

        let err = m
            .engine
            .complete_repayment(m.tenant, m.buyer, repayment_id, None)
            .unwrap_err();
        assert!(matches!(
            err.domain(),
            Some(DomainError::InvalidStateTransition { .. })
        ));
        let err = m
            .engine
            .confirm_default(m.tenant, financier, invoice_id, None)
            .unwrap_err();
        assert!(err.domain().is_some());

        let again = m.engine.resume_settlement(m.tenant, invoice_id).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn disbursement_cannot_complete_once_the_invoice_is_cancelled() {
        let m = Market::new();
        let invoice_id = m.open_auction();
        let financier = m.financiers[0];
        let bid = m.bid(invoice_id, financier, 160);
        let id = m
            .engine
            .accept_bid(m.tenant, m.seller, invoice_id, bid.bid_id)
            .unwrap()
            .disbursement
            .unwrap()
            .id_typed();
        m.bank_account(financier, true);
        m.bank_account(m.seller, true);
        m.engine.initiate_disbursement(m.tenant, financier, id).unwrap();

        // Cancellation committed, unwind never ran.
        m.engine
            .dispatcher()
            .dispatch(
                m.tenant,
                invoice_id.0,
                InvoiceCommand::CancelInvoice(CancelInvoice {
                    tenant_id: m.tenant,
                    invoice_id,
                    actor: m.buyer,
                    reason: None,
                    occurred_at: m.clock_now(),
                }),
                |_, id: AggregateId| Invoice::empty(InvoiceId::new(id)),
            )
            .unwrap();

        let err = m
            .engine
            .complete_disbursement(m.tenant, m.seller, id, Some("UTR9".into()))
            .unwrap_err();
        assert!(matches!(
            err.domain(),
            Some(DomainError::InvalidStateTransition { .. })
        ));
        assert_eq!(
            m.engine.disbursement(m.tenant, id).unwrap().status(),
            DisbursementStatus::Processing
        );

        let outcome = m.engine.resume_settlement(m.tenant, invoice_id).unwrap();
        assert_eq!(outcome.steps, vec!["unwound"]);
        assert_eq!(
            m.engine.disbursement(m.tenant, id).unwrap().status(),
            DisbursementStatus::Cancelled
        );
        assert_eq!(m.invoice(invoice_id).financed_by(), None);
    }

    #[test]
    fn repayment_after_a_confirmed_default_is_refused() {
        let m = Market::new();
        let (invoice_id, financier, repayment_id) = m.financed_by_bid();
        m.clock.set(due_date() + Duration::days(31));
        m.engine
            .confirm_default(m.tenant, financier, invoice_id, None)
            .unwrap();

        let err = m
            .engine
            .complete_repayment(m.tenant, m.buyer, repayment_id, Some("late".into()))
            .unwrap_err();
        assert!(matches!(
            err.domain(),
            Some(DomainError::InvalidStateTransition { .. })
        ));
        assert_eq!(
            m.engine.repayment(m.tenant, repayment_id).unwrap().status(),
            RepaymentStatus::Overdue
        );
        assert_eq!(m.invoice(invoice_id).status(), InvoiceStatus::Defaulted);
    }

    /// Event store whose contract streams can be taken offline.
    #[derive(Default)]
    struct ContractOutage {
        inner: InMemoryEventStore,
        offline: AtomicBool,
    }

    impl EventStore for ContractOutage {
        fn append(
            &self,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            let contract = events
                .first()
                .is_some_and(|e| e.aggregate_type == Contract::AGGREGATE_TYPE);
            if contract && self.offline.load(Ordering::SeqCst) {
                return Err(EventStoreError::Unavailable("contract storage offline".into()));
            }
            self.inner.append(events, expected_version)
        }

        fn load_stream(
            &self,
            tenant_id: TenantId,
            aggregate_id: AggregateId,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_stream(tenant_id, aggregate_id)
        }
    }

    #[test]
    fn acceptance_stands_when_opening_the_settlement_fails() {
        let store = Arc::new(ContractOutage::default());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let kyc = Arc::new(InMemoryKycService::new());
        let engine = FinancingEngine::new(
            CommandDispatcher::new(store.clone(), bus),
            EngineServices {
                kyc: kyc.clone(),
                profiles: Arc::new(InMemoryProfileService::new()),
                audit: Arc::new(InMemoryAuditLog::new()),
            },
            EngineConfig::default(),
        )
        .with_clock(Arc::new(ManualClock::new(t0())));

        let (tenant, seller, buyer) = (TenantId::new(), PartyId::new(), PartyId::new());
        kyc.approve(tenant, seller);
        kyc.approve(tenant, buyer);
        let fields = InvoiceFields {
            invoice_number: Some("INV-2026-020".to_string()),
            amount: Some(AMOUNT),
            invoice_date: Some(t0() - Duration::days(1)),
            due_date: Some(due_date()),
            gstin: None,
        };
        let invoice_id = engine
            .create_draft(
                tenant,
                seller,
                buyer,
                fields,
                FieldSource::Manual,
                ProductType::SelfFundedDiscount,
            )
            .unwrap()
            .id_typed();
        engine.submit_invoice(tenant, seller, invoice_id).unwrap();
        let offer = engine
            .create_offer(tenant, buyer, invoice_id, Rate::from_bps(200), t0() + Duration::days(1))
            .unwrap();

        store.offline.store(true, Ordering::SeqCst);
        let settlement = engine
            .accept_offer(tenant, seller, invoice_id, offer.offer_id)
            .unwrap();
        assert!(!settlement.is_open());
        assert_eq!(settlement.invoice.status(), InvoiceStatus::Accepted);
        assert_eq!(
            engine.invoice(tenant, invoice_id).unwrap().accepted_terms(),
            Some(TermsRef::Offer(offer.offer_id))
        );

        store.offline.store(false, Ordering::SeqCst);
        let outcome = engine.resume_settlement(tenant, invoice_id).unwrap();
        assert_eq!(outcome.steps, vec!["settlement_opened"]);
        let terms = TermsRef::Offer(offer.offer_id);
        let disbursement = engine
            .disbursement(tenant, DisbursementId::for_terms(invoice_id, terms))
            .unwrap();
        assert_eq!(disbursement.amount(), 980_000);
    }

    #[test]
    fn default_is_confirmed_only_after_the_grace_period() {
        let m = Market::new();
        let (invoice_id, financier, repayment_id) = m.financed_by_bid();

        m.clock.set(due_date() + Duration::days(5));
        let overdue = m.engine.mark_overdue(m.tenant, repayment_id).unwrap();
        assert_eq!(overdue.status(), RepaymentStatus::Overdue);

        let early = m
            .engine
            .confirm_default(m.tenant, financier, invoice_id, None)
            .unwrap_err();
        assert!(matches!(early.domain(), Some(DomainError::Validation(_))));

        m.clock.set(due_date() + Duration::days(31));
        let wrong_party = m
            .engine
            .confirm_default(m.tenant, m.seller, invoice_id, None)
            .unwrap_err();
        assert!(matches!(wrong_party.domain(), Some(DomainError::Unauthorized(_))));

        let invoice = m
            .engine
            .confirm_default(m.tenant, financier, invoice_id, Some("no response".into()))
            .unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Defaulted);

        let terms = invoice.accepted_terms().unwrap();
        let contract = m
            .engine
            .contract(m.tenant, finflow_financing::ContractId::for_terms(invoice_id, terms))
            .unwrap();
        assert_eq!(contract.status(), ContractStatus::Active);
    }

    #[test]
    fn resume_opens_settlement_that_was_interrupted_after_acceptance() {
        let m = Market::new();
        let invoice_id = m.submitted_invoice();
        let offer = m
            .engine
            .create_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(200), t0() + Duration::days(1))
            .unwrap();

        // Acceptance committed, follow-ups never ran.
        m.engine
            .dispatcher()
            .dispatch(
                m.tenant,
                invoice_id.0,
                InvoiceCommand::AcceptOffer(AcceptOffer {
                    tenant_id: m.tenant,
                    invoice_id,
                    offer_id: offer.offer_id,
                    actor: m.seller,
                    occurred_at: m.clock_now(),
                }),
                |_, id: AggregateId| Invoice::empty(InvoiceId::new(id)),
            )
            .unwrap();

        let outcome = m.engine.resume_settlement(m.tenant, invoice_id).unwrap();
        assert_eq!(outcome.steps, vec!["settlement_opened"]);

        let terms = TermsRef::Offer(offer.offer_id);
        let disbursement = m
            .engine
            .disbursement(m.tenant, DisbursementId::for_terms(invoice_id, terms))
            .unwrap();
        assert_eq!(disbursement.amount(), 980_000);

        let again = m.engine.resume_settlement(m.tenant, invoice_id).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn relay_notifies_the_party_that_has_to_act() {
        let m = Market::new();
        m.profiles.set_display_name(m.tenant, m.buyer, "Acme Retail");
        m.profiles.set_display_name(m.tenant, m.financiers[0], "Northwind Capital");
        let sub = m.subscribe();

        let sink = Arc::new(InMemoryNotificationSink::new());
        let relay = NotificationRelay::new(m.engine.clone(), sink.clone());

        let invoice_id = m.accepted_invoice();
        m.engine
            .create_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(200), t0() + Duration::days(1))
            .unwrap();
        m.engine.open_for_bidding(m.tenant, m.seller, invoice_id).unwrap();
        m.bid(invoice_id, m.financiers[0], 160);

        let envelopes = sub.drain();
        for env in &envelopes {
            relay.handle(env).unwrap();
        }
        // Redelivery must not duplicate anything.
        for env in &envelopes {
            relay.handle(env).unwrap();
        }

        let to_seller = sink.sent_to(m.seller);
        let kinds: Vec<_> = to_seller.iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NotificationKind::DiscountOfferReceived, NotificationKind::BidReceived]
        );
        assert_eq!(to_seller[0].counterparty_name.as_deref(), Some("Acme Retail"));
        assert_eq!(to_seller[0].amount, Some(980_000));
        assert_eq!(to_seller[1].counterparty_name.as_deref(), Some("Northwind Capital"));
        assert_eq!(to_seller[1].amount, Some(981_500));
        assert_eq!(to_seller[1].invoice_number.as_deref(), Some("INV-2026-014"));

        // Opening the auction rejected the live offer.
        let to_buyer = sink.sent_to(m.buyer);
        assert_eq!(to_buyer.len(), 1);
        assert_eq!(to_buyer[0].kind, NotificationKind::DiscountOfferRejected);
        assert!(to_buyer[0].message.contains("opened for bidding"));
        assert_eq!(to_buyer[0].invoice_number.as_deref(), Some("INV-2026-014"));
    }

    #[test]
    fn falling_back_to_standard_payment_tells_the_buyer_their_offer_is_gone() {
        let m = Market::new();
        let sub = m.subscribe();
        let sink = Arc::new(InMemoryNotificationSink::new());
        let relay = NotificationRelay::new(m.engine.clone(), sink.clone());

        let invoice_id = m.submitted_invoice();
        m.engine
            .create_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(250), t0() + Duration::days(1))
            .unwrap();
        m.engine
            .fallback_to_standard_payment(m.tenant, m.seller, invoice_id)
            .unwrap();
        for env in sub.drain() {
            relay.handle(&env).unwrap();
        }

        let kinds: Vec<_> = sink.sent_to(m.buyer).into_iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::DiscountOfferRejected]);
    }

    /// Refuses the first `failures` sends, then delivers.
    struct FlakySink {
        failures: std::sync::atomic::AtomicU32,
        inner: InMemoryNotificationSink,
    }

    impl FlakySink {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: std::sync::atomic::AtomicU32::new(failures),
                inner: InMemoryNotificationSink::new(),
            })
        }
    }

    impl NotificationSink for FlakySink {
        fn send(&self, notification: &Notification) -> Result<(), ExternalError> {
            let left = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if left.is_ok() {
                return Err(ExternalError::unavailable("notifications", "smtp timeout"));
            }
            self.inner.send(notification)
        }
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(
            max_attempts,
            std::time::Duration::from_millis(5),
            std::time::Duration::from_millis(20),
        )
    }

    #[test]
    fn notification_refused_once_is_delivered_on_retry() {
        let m = Market::new();
        let sub = m.subscribe();
        let sink = FlakySink::failing(1);
        let backoff = std::time::Duration::from_secs(30);
        let relay = NotificationRelay::new(m.engine.clone(), sink.clone())
            .with_retry(RetryPolicy::exponential(5, backoff, backoff));

        let invoice_id = m.submitted_invoice();
        m.engine
            .create_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(200), t0() + Duration::days(1))
            .unwrap();
        let offered = sub
            .drain()
            .into_iter()
            .find(|env| env.event_type() == "financing.invoice.discount_offered")
            .unwrap();

        assert!(relay.handle(&offered).is_err());
        assert!(sink.inner.sent_to(m.seller).is_empty());
        assert_eq!(relay.outbox().pending(), 1);

        // Not due yet.
        let early = relay.redeliver_due(std::time::Instant::now());
        assert_eq!(early.delivered, 0);

        let report = relay.redeliver_due(std::time::Instant::now() + backoff);
        assert_eq!(report.delivered, 1);
        assert_eq!(relay.outbox().pending(), 0);
        let kinds: Vec<_> = sink.inner.sent_to(m.seller).into_iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::DiscountOfferReceived]);
    }

    #[test]
    fn running_relay_recovers_from_a_transient_sink_failure() {
        let m = Market::new();
        let sink = FlakySink::failing(1);
        let relay = Arc::new(
            NotificationRelay::new(m.engine.clone(), sink.clone()).with_retry(quick_retry(5)),
        );
        let handle = relay.clone().spawn(&m.bus).unwrap();

        let invoice_id = m.submitted_invoice();
        m.engine
            .create_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(200), t0() + Duration::days(1))
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while sink.inner.sent_to(m.seller).is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(10));
        }
        handle.shutdown();

        let kinds: Vec<_> = sink.inner.sent_to(m.seller).into_iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::DiscountOfferReceived]);
        assert!(relay.outbox().dead_letters().is_empty());
    }

    #[test]
    fn notification_is_dead_lettered_when_attempts_run_out() {
        let m = Market::new();
        let sub = m.subscribe();
        let sink = FlakySink::failing(u32::MAX);
        let relay = NotificationRelay::new(m.engine.clone(), sink.clone()).with_retry(quick_retry(3));

        let invoice_id = m.submitted_invoice();
        m.engine
            .create_offer(m.tenant, m.buyer, invoice_id, Rate::from_bps(200), t0() + Duration::days(1))
            .unwrap();
        for env in sub.drain() {
            let _ = relay.handle(&env);
        }

        let later = std::time::Instant::now() + std::time::Duration::from_secs(1);
        assert_eq!(relay.redeliver_due(later).rescheduled, 1);
        assert_eq!(relay.redeliver_due(later + std::time::Duration::from_secs(1)).dead_lettered, 1);

        assert_eq!(relay.outbox().pending(), 0);
        let dead = relay.outbox().dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert!(matches!(
            &dead[0].delivery,
            Delivery::Notification(n) if n.recipient == m.seller
        ));
        assert!(sink.inner.sent().is_empty());
    }

    #[test]
    fn relay_reminds_the_buyer_of_the_repayment() {
        let m = Market::new();
        let sub = m.subscribe();
        let sink = Arc::new(InMemoryNotificationSink::new());
        let relay = NotificationRelay::new(m.engine.clone(), sink.clone());

        let (_, financier, _) = m.financed_by_bid();
        for env in sub.drain() {
            relay.handle(&env).unwrap();
        }

        let to_seller: Vec<_> = sink.sent_to(m.seller).into_iter().map(|n| n.kind).collect();
        assert!(to_seller.contains(&NotificationKind::PaymentDisbursed));
        let due: Vec<_> = sink
            .sent_to(m.buyer)
            .into_iter()
            .filter(|n| n.kind == NotificationKind::RepaymentDue)
            .collect();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].amount, Some(AMOUNT));
        assert!(sink.sent_to(financier).is_empty());
    }

    #[test]
    fn board_follows_the_lifecycle_and_drives_the_sweeper() {
        let m = Market::new();
        let sub = m.subscribe();
        let board = Arc::new(InvoiceBoardProjection::in_memory());

        let offered = m.submitted_invoice();
        m.engine
            .create_offer(m.tenant, m.buyer, offered, Rate::from_bps(200), t0() + Duration::hours(6))
            .unwrap();
        let (financed, _, repayment_id) = m.financed_by_bid();

        for env in sub.drain() {
            board.handle(&m.store, &env).unwrap();
        }

        let row = board.get(m.tenant, offered).unwrap();
        assert_eq!(row.status, InvoiceStatus::Submitted);
        assert!(row.pending_offer.is_some());

        let row = board.get(m.tenant, financed).unwrap();
        assert_eq!(row.status, InvoiceStatus::Financed);
        assert_eq!(row.disbursement_status, Some(DisbursementStatus::Completed));
        assert_eq!(row.repayment_id, Some(repayment_id));
        assert_eq!(row.repayment_due, Some(due_date()));
        assert!(!row.settlement_lagging());
        assert_eq!(board.list(m.tenant, Some(InvoiceStatus::Financed)).len(), 1);
        assert!(board.list(TenantId::new(), None).is_empty());

        m.clock.set(due_date() + Duration::days(1));
        let sweeper = ExpirySweeper::new(m.engine.clone(), board.clone());
        let report = sweeper.sweep_once();
        assert_eq!(report.expired, 1);
        assert_eq!(report.overdue, 1);
        assert_eq!(report.failures, 0);

        for env in sub.drain() {
            board.handle(&m.store, &env).unwrap();
        }
        assert!(board.get(m.tenant, offered).unwrap().pending_offer.is_none());
        assert_eq!(
            board.get(m.tenant, financed).unwrap().repayment_status,
            Some(RepaymentStatus::Overdue)
        );

        m.clock.set(due_date() + Duration::days(31));
        let candidates = board.default_candidates(m.tenant, m.clock_now());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].invoice_id, financed);
    }

    #[test]
    fn board_fills_gaps_from_the_store() {
        let m = Market::new();
        let board = InvoiceBoardProjection::in_memory();
        let sub = m.subscribe();

        let invoice_id = m.accepted_invoice();
        let envelopes = sub.drain();
        let last = envelopes.last().unwrap();

        // Only the newest event arrives; the rest is read back from the store.
        let applied = board.handle(&m.store, last).unwrap();
        assert_eq!(applied, envelopes.len());
        assert_eq!(board.get(m.tenant, invoice_id).unwrap().status, InvoiceStatus::Accepted);

        for env in &envelopes {
            assert_eq!(board.handle(&m.store, env).unwrap(), 0);
        }
    }
}
