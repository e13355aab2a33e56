use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::Value as JsonValue;

use finflow_core::{PartyId, Rate, TenantId};
use finflow_events::{EventEnvelope, InMemoryEventBus};
use finflow_financing::{BidId, FieldSource, InvoiceFields, InvoiceId, ProductType};
use finflow_infra::command_dispatcher::CommandDispatcher;
use finflow_infra::config::EngineConfig;
use finflow_infra::engine::{BidTerms, EngineServices, FinancingEngine, ManualClock};
use finflow_infra::event_store::{EventStore, InMemoryEventStore};
use finflow_infra::external::{InMemoryAuditLog, InMemoryKycService, InMemoryProfileService};
use finflow_infra::projections::InvoiceBoardProjection;

type Store = Arc<InMemoryEventStore>;
type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

struct Auction {
    engine: FinancingEngine<Store, Bus>,
    store: Store,
    tenant: TenantId,
    seller: PartyId,
    invoice_id: InvoiceId,
    bids: Vec<BidId>,
}

/// An invoice open for bidding with `bid_count` pending bids.
fn auction_with_bids(bid_count: usize) -> Auction {
    let now = Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap();
    let store: Store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let kyc = Arc::new(InMemoryKycService::new());
    let engine = FinancingEngine::new(
        CommandDispatcher::new(store.clone(), bus.clone()),
        EngineServices {
            kyc: kyc.clone(),
            profiles: Arc::new(InMemoryProfileService::new()),
            audit: Arc::new(InMemoryAuditLog::new()),
        },
        EngineConfig::default(),
    )
    .with_clock(Arc::new(ManualClock::new(now)));

    let tenant = TenantId::new();
    let (seller, buyer) = (PartyId::new(), PartyId::new());
    kyc.approve(tenant, seller);
    kyc.approve(tenant, buyer);

    let fields = InvoiceFields {
        invoice_number: Some("INV-BENCH".to_string()),
        amount: Some(5_000_000),
        invoice_date: Some(now - Duration::days(1)),
        due_date: Some(now + Duration::days(60)),
        gstin: None,
    };
    let invoice_id = engine
        .create_draft(tenant, seller, buyer, fields, FieldSource::Manual, ProductType::FinancierBacked)
        .unwrap()
        .id_typed();
    engine.submit_invoice(tenant, seller, invoice_id).unwrap();
    engine.accept_invoice(tenant, buyer, invoice_id).unwrap();
    engine.open_for_bidding(tenant, seller, invoice_id).unwrap();

    let bids = (0..bid_count)
        .map(|i| {
            engine
                .submit_bid(
                    tenant,
                    PartyId::new(),
                    invoice_id,
                    BidTerms {
                        discount_rate: Rate::from_bps(120 + (i % 200) as u32),
                        processing_fee: Rate::from_bps(25),
                        haircut: None,
                        valid_until: now + Duration::days(3),
                    },
                )
                .unwrap()
                .bid_id
        })
        .collect();

    Auction {
        engine,
        store,
        tenant,
        seller,
        invoice_id,
        bids,
    }
}

fn bench_accept_bid(c: &mut Criterion) {
    let mut group = c.benchmark_group("accept_bid");
    group.sample_size(20);

    for bid_count in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(bid_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(bid_count), &bid_count, |b, &n| {
            b.iter_batched(
                || auction_with_bids(n),
                |a| {
                    let winner = a.bids[n / 2];
                    black_box(a.engine.accept_bid(a.tenant, a.seller, a.invoice_id, winner).unwrap())
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_rank_bids(c: &mut Criterion) {
    let mut group = c.benchmark_group("rank_bids");

    for bid_count in [10usize, 100, 500] {
        let a = auction_with_bids(bid_count);
        group.throughput(Throughput::Elements(bid_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(bid_count), &a, |b, a| {
            b.iter(|| black_box(a.engine.ranked_bids(a.tenant, a.seller, a.invoice_id).unwrap()));
        });
    }
    group.finish();
}

fn bench_invoice_rehydration(c: &mut Criterion) {
    let mut group = c.benchmark_group("invoice_rehydration");

    for bid_count in [10usize, 100, 1000] {
        let a = auction_with_bids(bid_count);
        group.throughput(Throughput::Elements(bid_count as u64 + 4));
        group.bench_with_input(BenchmarkId::from_parameter(bid_count), &a, |b, a| {
            b.iter(|| black_box(a.engine.invoice(a.tenant, a.invoice_id).unwrap()));
        });
    }
    group.finish();
}

fn bench_board_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("board_rebuild");
    group.sample_size(30);

    for bid_count in [10usize, 100, 1000] {
        let a = auction_with_bids(bid_count);
        let envelopes: Vec<EventEnvelope<JsonValue>> = a
            .store
            .load_stream(a.tenant, a.invoice_id.0)
            .unwrap()
            .iter()
            .map(|e| e.to_envelope())
            .collect();

        group.throughput(Throughput::Elements(envelopes.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(bid_count),
            &envelopes,
            |b, envelopes| {
                let board = InvoiceBoardProjection::in_memory();
                b.iter(|| {
                    board.rebuild_from_scratch(a.tenant, envelopes).unwrap();
                    black_box(board.get(a.tenant, a.invoice_id))
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_accept_bid,
    bench_rank_bids,
    bench_invoice_rehydration,
    bench_board_rebuild
);
criterion_main!(benches);
