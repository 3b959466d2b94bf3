//! Multi-cycle runs of the autobidder against the in-memory marketplace

use bidfleet_core::{Descriptor, HostId, Offer, OfferId, RentalId};
use bidfleet_orchestrator::memory::{InMemoryMarketplace, MarketCall, StaticEstimator};
use bidfleet_orchestrator::{Autobidder, BidderConfig, BlacklistReason, DestroyReason, FleetCommand};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use tokio_test::assert_ok;

fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// One throughput unit per second is worth one dollar per hour
fn config(dir: &TempDir) -> BidderConfig {
    BidderConfig::default()
        .with_budget(1.0, 3600.0)
        .with_target_throughput(3.0)
        .with_max_dph(10.0)
        .with_idle_timeout_secs(3600)
        .with_offer_search_interval_secs(0)
        .with_state_file(dir.path().join("fleet.json"))
        .with_clear_screen(false)
}

fn offer(id: u64, host: u64, dph_total: f64, min_bid: f64) -> Offer {
    Offer {
        offer_id: OfferId(id),
        host_id: HostId(host),
        descriptor: Descriptor::new("RTX 3090", 1, 35.6),
        location: Some("Quebec, CA".into()),
        is_bid: false,
        min_bid,
        dph_total,
    }
}

fn marketplace() -> InMemoryMarketplace {
    InMemoryMarketplace::new(t0())
        .with_offer(offer(100, 20, 1.0, 1.0))
        .with_offer(offer(101, 21, 5.0, 0.5))
}

fn estimator() -> StaticEstimator {
    StaticEstimator::new()
        .with_expected(HostId(20), 2.0)
        .with_expected(HostId(21), 2.0)
}

#[tokio::test]
async fn test_fleet_lifecycle() {
    let dir = TempDir::new().unwrap();
    let mut bidder = assert_ok!(Autobidder::new(config(&dir), marketplace(), estimator()));

    // Empty fleet: the bid offer ranks first (25% vs 38%), both are rented
    let report = assert_ok!(bidder.run_cycle(t0()).await);
    let selection = report.selection.expect("search should run");
    assert_eq!(selection.summary.count, 2);
    assert_eq!(
        bidder.marketplace().calls(),
        vec![
            MarketCall::Create {
                offer_id: OfferId(101),
                price: Some(0.5 * 1.1),
            },
            MarketCall::Create {
                offer_id: OfferId(100),
                price: None,
            },
        ]
    );
    bidder.marketplace().clear_calls();

    // At target: reconcile only, both machines start their idle timers
    let t1 = t0() + Duration::seconds(60);
    let report = assert_ok!(bidder.run_cycle(t1).await);
    assert!(report.selection.is_none());
    assert_eq!(report.reconcile.rows.len(), 2);
    assert!((report.totals.throughput - 4.0).abs() < 1e-9);
    assert!(bidder.marketplace().calls().is_empty());
    assert_eq!(bidder.state().idle_since(HostId(20)), Some(t1));

    // The bid machine starts producing; the fixed one never does
    bidder.estimator().set_realized(RentalId(1000), 1.5);
    let t2 = t1 + Duration::hours(2);
    let report = assert_ok!(bidder.run_cycle(t2).await);
    assert_eq!(
        report.reconcile.blacklisted,
        vec![(HostId(20), BlacklistReason::Idle { since: t1 })]
    );
    assert!(report.reconcile.commands.contains(&FleetCommand::Destroy {
        rental_id: RentalId(1001),
        reason: DestroyReason::Blacklisted,
    }));
    assert_eq!(bidder.state().idle_since(HostId(20)), None);
    assert_eq!(bidder.state().idle_since(HostId(21)), None);
    bidder.marketplace().clear_calls();

    // Below target again, but the only offer left is on the blacklisted host
    let t3 = t2 + Duration::seconds(15);
    let report = assert_ok!(bidder.run_cycle(t3).await);
    let selection = report.selection.expect("search should run");
    assert_eq!(selection.summary.count, 0);
    assert!(bidder.marketplace().calls().is_empty());
    assert!(report.reconcile.blacklisted.is_empty());

    // Task complete: everything is torn down, nothing is rented
    bidder.estimator().set_task_complete(true);
    let report = assert_ok!(bidder.run_cycle(t3 + Duration::seconds(15)).await);
    assert!(report.kill_switch);
    assert!(report.selection.is_none());
    assert_eq!(
        bidder.marketplace().calls(),
        vec![MarketCall::Destroy {
            rental_id: RentalId(1000),
        }]
    );
    assert!(bidder.marketplace().rentals().is_empty());
}

#[tokio::test]
async fn test_blacklist_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let mut bidder = assert_ok!(Autobidder::new(
            config(&dir).with_rent(false),
            InMemoryMarketplace::new(t0()),
            StaticEstimator::new(),
        ));
        assert_ok!(bidder.run_cycle(t0()).await);
    }

    // Seed a blacklist through the state file, as an operator would
    std::fs::write(
        dir.path().join("fleet.json"),
        r#"{"host_active_since": {}, "host_blacklist": [20]}"#,
    )
    .unwrap();

    let mut bidder = assert_ok!(Autobidder::new(config(&dir), marketplace(), estimator()));
    assert!(bidder.state().is_blacklisted(HostId(20)));

    let report = assert_ok!(bidder.run_cycle(t0()).await);
    assert_eq!(report.selection.map(|s| s.summary.count), Some(1));
    assert_eq!(
        bidder.marketplace().calls(),
        vec![MarketCall::Create {
            offer_id: OfferId(101),
            price: Some(0.5 * 1.1),
        }]
    );

    let persisted = std::fs::read_to_string(dir.path().join("fleet.json")).unwrap();
    let persisted: serde_json::Value = serde_json::from_str(&persisted).unwrap();
    assert_eq!(persisted["host_blacklist"], serde_json::json!([20]));
    assert!(!dir.path().join("fleet.json.tmp").exists());
}

#[tokio::test]
async fn test_estimator_outage_does_not_stop_the_loop() {
    let dir = TempDir::new().unwrap();
    let market = InMemoryMarketplace::new(t0()).with_offer(offer(100, 20, 1.0, 1.0));
    let estimator = StaticEstimator::new();
    estimator.set_failing(true);

    let mut bidder = assert_ok!(Autobidder::new(config(&dir), market, estimator));
    let report = assert_ok!(bidder.run_cycle(t0()).await);

    // Zero throughput means zero max price: nothing is worth renting
    assert!(!report.kill_switch);
    assert_eq!(report.selection.map(|s| s.summary.count), Some(0));
    assert!(bidder.marketplace().calls().is_empty());
}

#[tokio::test]
async fn test_realized_throughput_outage_keeps_fleet() {
    let dir = TempDir::new().unwrap();
    let market = InMemoryMarketplace::new(t0()).with_offer(offer(101, 21, 5.0, 0.5));
    let estimator = StaticEstimator::new().with_expected(HostId(21), 2.0);
    let mut bidder = assert_ok!(Autobidder::new(config(&dir), market, estimator));

    assert_ok!(bidder.run_cycle(t0()).await);
    assert_eq!(bidder.marketplace().rentals().len(), 1);
    bidder.estimator().set_realized(RentalId(1000), 5.0);
    assert_ok!(bidder.run_cycle(t0() + Duration::seconds(30)).await);
    bidder.marketplace().clear_calls();

    // Telemetry goes dark for longer than the idle timeout
    bidder.estimator().set_failing(true);
    for minutes in [1, 90, 4 * 60 + 2] {
        let report = assert_ok!(bidder.run_cycle(t0() + Duration::minutes(minutes)).await);
        assert!(!report.kill_switch);
        assert!(report.reconcile.blacklisted.is_empty());
    }

    assert!(!bidder.state().is_blacklisted(HostId(21)));
    assert_eq!(bidder.state().idle_since(HostId(21)), None);
    assert!(bidder.marketplace().calls().is_empty());
    assert_eq!(bidder.marketplace().rentals().len(), 1);
}
