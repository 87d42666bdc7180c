pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use test_utils::*;
use transit_reconcile::pings::parse_timestamp;
use transit_reconcile::geo::Coord;
use transit_reconcile::geocode::{CachedGeocoder, OfflineGeocoder, RateLimiter, ReverseGeocoder};
use transit_reconcile::overspeed::{vehicle_speeds, StreetAccumulator};
use transit_reconcile::{OverspeedEvent, OverspeedReport, PingBatch, SpeedAnomalyDetector, Street};

fn km_north(km: f64) -> f64 {
    52.0 + (km / 6371.0).to_degrees()
}

#[test]
fn one_km_in_an_hour() {
    let a = ping("v1", "10", 52.0, 21.0, "2024-02-16 08:00:00", "1");
    let b = ping("v1", "10", km_north(1.0), 21.0, "2024-02-16 09:00:00", "1");
    let speeds = vehicle_speeds(&[&a, &b]);
    assert_eq!(speeds[0].1, 0.0);
    assert_relative_eq!(speeds[1].1, 1.0, epsilon = 1e-9);
}

#[test]
fn stationary_vehicle_is_zero() {
    let a = ping("v1", "10", 52.0, 21.0, "2024-02-16 08:00:00", "1");
    let b = ping("v1", "10", 52.0, 21.0, "2024-02-16 08:00:01", "1");
    let speeds = vehicle_speeds(&[&a, &b]);
    assert_eq!(speeds[1].1, 0.0);
}

#[test]
fn unordered_pings_are_sorted_and_deduplicated() {
    let a = ping("v1", "10", 52.0, 21.0, "2024-02-16 08:00:00", "1");
    let b = ping("v1", "10", km_north(1.0), 21.0, "2024-02-16 08:01:00", "1");
    let b_again = ping("v1", "10", km_north(2.0), 21.0, "2024-02-16 08:01:00", "1");
    let speeds = vehicle_speeds(&[&b, &a, &b_again]);
    assert_eq!(speeds.len(), 2);
    assert_eq!(speeds[0].0.timestamp, a.timestamp);
    assert_relative_eq!(speeds[1].1, 60.0, epsilon = 1e-6);
}

#[test]
fn only_fast_segments_are_flagged() {
    // 50 km/h, then 60 km/h
    let a = ping("v1", "10", 52.0, 21.0, "2024-02-16 08:00:00", "1");
    let b = ping("v1", "10", km_north(5.0), 21.0, "2024-02-16 08:06:00", "1");
    let c = ping("v1", "10", km_north(11.0), 21.0, "2024-02-16 08:12:00", "1");
    let detector = SpeedAnomalyDetector::new(50.5);
    let events = detector.detect_vehicle(&[&a, &b, &c]);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].observed_at, c.timestamp);
    assert_relative_eq!(events[0].speed_kmh, 60.0, epsilon = 1e-6);
}

#[test]
fn fixture_flags_two_vehicles() {
    let batch = PingBatch::load(data_path("test-buses.json")).unwrap();
    let events = SpeedAnomalyDetector::new(50.0).detect(&batch);
    let vehicles: Vec<&str> = events.iter().map(|e| e.vehicle_id.as_str()).collect();
    assert_eq!(vehicles, vec!["1801", "1871"]);
    for event in &events {
        assert_eq!(event.coord(), Coord::new(FAR_LAT, FAR_LON));
        assert!(event.speed_kmh > 2000.0, "{}", event.speed_kmh);
    }
}

#[test]
fn streets_ranked_by_vehicle_count() {
    let pasteura = Street::new("Ludwika Pasteura", "Ochota", "Warszawa");
    let grojecka = Street::new("Grójecka", "Ochota", "Warszawa");
    let banacha = Street::new("Stefana Banacha", "Ochota", "Warszawa");

    let mut acc = StreetAccumulator::default();
    acc.add(pasteura.clone(), "1");
    acc.add(grojecka.clone(), "1");
    acc.add(grojecka.clone(), "2");
    acc.add(banacha.clone(), "3");
    acc.add(pasteura.clone(), "1");

    let mut other = StreetAccumulator::default();
    other.add(banacha.clone(), "4");
    acc.merge(other);

    let ranked = acc.into_ranked();
    let order: Vec<(&Street, usize)> = ranked.iter().map(|t| (&t.street, t.count())).collect();
    assert_eq!(
        order,
        vec![(&grojecka, 2), (&banacha, 2), (&pasteura, 1)]
    );
}

#[tokio::test]
async fn aggregate_counts_vehicles_per_street() {
    let batch = PingBatch::load(data_path("test-buses.json")).unwrap();
    let events = SpeedAnomalyDetector::new(50.0).detect(&batch);
    let geocoder = FakeGeocoder::default().with(FAR_LAT, FAR_LON, kolonia_lubeckiego());

    let report = OverspeedReport::aggregate(events, &geocoder, 4).await;
    assert_eq!(report.overspeeding_vehicles, 2);
    assert_eq!(report.streets.len(), 1);
    assert_eq!(report.count_on(&kolonia_lubeckiego()), 2);
    assert_eq!(report.top(10).len(), 1);
    assert_eq!(report.top(0).len(), 0);
    assert!(report.events.iter().all(|e| e.street.is_some()));
}

#[tokio::test]
async fn failed_lookups_still_count_vehicles() {
    let batch = PingBatch::load(data_path("test-buses.json")).unwrap();
    let events = SpeedAnomalyDetector::new(50.0).detect(&batch);

    let report = OverspeedReport::aggregate(events.clone(), &FakeGeocoder::default(), 2).await;
    assert_eq!(report.overspeeding_vehicles, 2);
    assert!(report.streets.is_empty());
    assert_eq!(report.count_on(&kolonia_lubeckiego()), 0);

    let report = OverspeedReport::aggregate(events, &OfflineGeocoder, 2).await;
    assert_eq!(report.overspeeding_vehicles, 2);
    assert!(report.streets.is_empty());
}

#[tokio::test]
async fn aggregate_keeps_event_order() {
    let a = ping("v1", "10", 52.0, 21.0, "2024-02-16 08:00:00", "1");
    let b = ping("v1", "10", km_north(1.0), 21.0, "2024-02-16 08:00:30", "1");
    let c = ping("v2", "10", 52.0, 21.0, "2024-02-16 08:00:00", "1");
    let d = ping("v2", "10", km_north(1.0), 21.0, "2024-02-16 08:00:20", "1");
    let batch = PingBatch::new(vec![a, b, c, d]);
    let events = SpeedAnomalyDetector::new(50.0).detect(&batch);
    let geocoder = FakeGeocoder::default().with(km_north(1.0), 21.0, kolonia_lubeckiego());

    let report = OverspeedReport::aggregate(events, &geocoder, 8).await;
    let vehicles: Vec<&str> = report.events.iter().map(|e| e.vehicle_id.as_str()).collect();
    assert_eq!(vehicles, vec!["v1", "v2"]);
    assert_eq!(report.count_on(&kolonia_lubeckiego()), 2);
}

#[tokio::test]
async fn cache_hits_skip_the_inner_geocoder() {
    let fake = Arc::new(FakeGeocoder::default().with(FAR_LAT, FAR_LON, kolonia_lubeckiego()));
    let cached = CachedGeocoder::new(Arc::clone(&fake), 4);

    let near_far = Coord::new(FAR_LAT + 0.00001, FAR_LON);
    assert_eq!(cached.resolve(Coord::new(FAR_LAT, FAR_LON)).await.unwrap(), kolonia_lubeckiego());
    assert_eq!(cached.resolve(near_far).await.unwrap(), kolonia_lubeckiego());
    assert_eq!(fake.calls(), 1);

    assert!(cached.resolve(Coord::new(0.0, 0.0)).await.is_err());
    assert!(cached.resolve(Coord::new(0.0, 0.0)).await.is_err());
    assert_eq!(fake.calls(), 2);
    assert_eq!(cached.misses(), 2);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let cached = CachedGeocoder::new(FlakyGeocoder, 4);
    assert!(cached.resolve(Coord::new(FAR_LAT, FAR_LON)).await.is_err());
    assert!(cached.resolve(Coord::new(FAR_LAT, FAR_LON)).await.is_err());
    assert_eq!(cached.misses(), 2);
}

#[tokio::test]
async fn vehicle_flagged_twice_on_one_street_counts_once() {
    let pings = vec![
        ping("v1", "10", 52.0, 21.0, "2024-02-16 08:00:00", "1"),
        ping("v1", "10", km_north(1.0), 21.0, "2024-02-16 08:00:30", "1"),
        ping("v1", "10", km_north(1.0), 21.0, "2024-02-16 08:10:00", "1"),
        ping("v1", "10", km_north(2.0), 21.0, "2024-02-16 08:10:30", "1"),
    ];
    let batch = PingBatch::new(pings);
    let events = SpeedAnomalyDetector::new(50.0).detect(&batch);
    assert_eq!(events.len(), 2);

    let street = Street::new("Grójecka", "Ochota", "Warszawa");
    let geocoder = FakeGeocoder::default()
        .with(km_north(1.0), 21.0, street.clone())
        .with(km_north(2.0), 21.0, street.clone());
    let report = OverspeedReport::aggregate(events, &geocoder, 4).await;
    assert_eq!(report.overspeeding_vehicles, 1);
    assert_eq!(report.streets.len(), 1);
    assert_eq!(report.count_on(&street), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_lookups_of_one_point_share_a_request() {
    let batch = PingBatch::load(data_path("test-buses.json")).unwrap();
    let events = SpeedAnomalyDetector::new(50.0).detect(&batch);
    assert_eq!(events.len(), 2);

    let slow = Arc::new(SlowGeocoder::new(
        FakeGeocoder::default().with(FAR_LAT, FAR_LON, kolonia_lubeckiego()),
        Duration::from_millis(50),
    ));
    let cached = CachedGeocoder::new(Arc::clone(&slow), 4);

    let report = OverspeedReport::aggregate(events, &cached, 4).await;
    assert_eq!(report.count_on(&kolonia_lubeckiego()), 2);
    assert_eq!(slow.calls(), 1);
    assert_eq!(cached.misses(), 1);
}

#[tokio::test(start_paused = true)]
async fn geocoding_concurrency_is_bounded() {
    let events: Vec<OverspeedEvent> = (0..10)
        .map(|i| OverspeedEvent {
            vehicle_id: format!("v{i}"),
            line: "10".to_string(),
            lat: km_north(i as f64),
            lon: 21.0,
            observed_at: parse_timestamp("2024-02-16 08:00:00").unwrap(),
            speed_kmh: 80.0,
            street: None,
        })
        .collect();
    let slow = SlowGeocoder::new(FakeGeocoder::default(), Duration::from_millis(20));

    let report = OverspeedReport::aggregate(events, &slow, 3).await;
    assert_eq!(report.overspeeding_vehicles, 10);
    assert_eq!(slow.calls(), 10);
    assert!(slow.peak() <= 3, "peak {}", slow.peak());
    assert!(slow.peak() > 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_spaces_out_calls() {
    let interval = Duration::from_millis(1000);
    let limiter = RateLimiter::new(interval);
    let start = tokio::time::Instant::now();
    for _ in 0..3 {
        limiter.wait().await;
    }
    assert!(start.elapsed() >= interval * 2, "{:?}", start.elapsed());
    assert!(start.elapsed() < interval * 3);
}
