use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use chrono::{TimeZone, Utc, Weekday};
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use slotguard::config::{FailurePolicy, ValidatorConfig};
use slotguard::engine::{BookingError, BookingRequest, SLOT_UNAVAILABLE_EXTERNALLY, STAFF_ALREADY_BOOKED};
use slotguard::ledger::{Ledger, Seed};
use slotguard::engine::ExternalError;
use slotguard::model::*;
use slotguard::ports::{ExternalAvailability, SlotPage, SlotSearch};
use slotguard::store::{ExternalSlot, FixedAvailability};

// ── Test infrastructure ──────────────────────────────────────

fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("slotguard_flow_{name}_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("ledger.wal")
}

/// 2024-03-04 (a Monday) at `h:m` UTC.
fn at(h: u32, m: u32) -> Ms {
    Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap().timestamp_millis()
}

struct Shopfront {
    seed: Seed,
    shop: Ulid,
    service: Ulid,
    staff: Ulid,
    customers: Vec<Ulid>,
}

impl Shopfront {
    fn new(customers: usize, location: Option<&str>) -> Self {
        let shop = Shop {
            id: Ulid::new(),
            name: Some("Harbor Barbers".into()),
            external_location_id: location.map(String::from),
            time_zone: Some("UTC".into()),
        };
        let service = Service {
            id: Ulid::new(),
            shop_id: shop.id,
            name: "Beard trim".into(),
            duration_minutes: 30,
            external_ref: Some("SVC-TRIM".into()),
            external_version: None,
        };
        let staff = Staff {
            id: Ulid::new(),
            shop_id: shop.id,
            name: "Rosa".into(),
            external_ref: None,
            active: true,
        };
        let customer_rows: Vec<Customer> = (0..customers)
            .map(|i| Customer {
                id: Ulid::new(),
                shop_id: shop.id,
                name: Some(format!("walk-in {i}")),
                external_ref: None,
            })
            .collect();
        let hours = WorkingHours {
            shop_id: shop.id,
            staff_id: staff.id,
            weekday: Weekday::Mon,
            start: "09:00".parse().unwrap(),
            end: "17:00".parse().unwrap(),
        };
        Self {
            shop: shop.id,
            service: service.id,
            staff: staff.id,
            customers: customer_rows.iter().map(|c| c.id).collect(),
            seed: Seed {
                shops: vec![shop],
                services: vec![service],
                staff: vec![staff],
                customers: customer_rows,
                working_hours: vec![hours],
                ..Default::default()
            },
        }
    }

    fn request(&self, customer: usize, start: Ms) -> BookingRequest {
        BookingRequest {
            shop_id: self.shop,
            service_id: self.service,
            customer_id: self.customers[customer],
            staff_id: Some(self.staff),
            start,
        }
    }
}

fn open(path: &PathBuf) -> Ledger {
    Ledger::open(path.clone(), Arc::new(FixedAvailability::new(10)), &ValidatorConfig::default()).unwrap()
}

async fn seeded(name: &str, customers: usize) -> (Ledger, Shopfront, PathBuf) {
    let path = wal_path(name);
    let front = Shopfront::new(customers, None);
    let ledger = open(&path);
    ledger.load_seed(&front.seed).await.unwrap();
    (ledger, front, path)
}

fn is_staff_conflict(e: &BookingError) -> bool {
    matches!(e, BookingError::Conflict { reason, .. } if *reason == STAFF_ALREADY_BOOKED)
}

// ── Booking ──────────────────────────────────────────────────

#[tokio::test]
async fn second_booking_for_same_slot_is_rejected() {
    let (ledger, front, _) = seeded("double", 2).await;

    let first = ledger.book(&front.request(0, at(10, 0)), Some("first".into())).await.unwrap();
    assert_eq!(first.span, Span::new(at(10, 0), at(10, 30)));
    assert_eq!(first.status, AppointmentStatus::Scheduled);

    let err = ledger.book(&front.request(1, at(10, 15)), None).await.unwrap_err();
    assert!(is_staff_conflict(&err), "{err:?}");

    // Back-to-back is fine.
    ledger.book(&front.request(1, at(10, 30)), None).await.unwrap();
    assert_eq!(ledger.appointments_for_staff(front.staff).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_slot_admit_exactly_one() {
    let (ledger, front, _) = seeded("race", 16).await;
    let ledger = Arc::new(ledger);
    let front = Arc::new(front);

    let mut handles = Vec::new();
    for i in 0..16 {
        let ledger = ledger.clone();
        let front = front.clone();
        handles.push(tokio::spawn(async move {
            ledger.book(&front.request(i, at(14, 0)), None).await
        }));
    }

    let mut booked = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => booked += 1,
            Err(e) => assert!(is_staff_conflict(&e), "unexpected error: {e}"),
        }
    }
    assert_eq!(booked, 1);
    assert_eq!(ledger.appointments_for_staff(front.staff).len(), 1);
}

#[tokio::test]
async fn outside_shift_is_bad_request() {
    let (ledger, front, _) = seeded("shift", 1).await;
    let err = ledger.book(&front.request(0, at(17, 0)), None).await.unwrap_err();
    assert!(matches!(err, BookingError::BadRequest(_)), "{err:?}");
    assert!(ledger.appointments_for_staff(front.staff).is_empty());
}

#[tokio::test]
async fn oversized_label_rejected() {
    let (ledger, front, _) = seeded("label", 1).await;
    let label = "x".repeat(slotguard::limits::MAX_LABEL_LEN + 1);
    let err = ledger.book(&front.request(0, at(10, 0)), Some(label)).await.unwrap_err();
    assert!(matches!(err, BookingError::BadRequest(_)));
}

// ── Lifecycle ────────────────────────────────────────────────

#[tokio::test]
async fn cancelling_frees_the_slot() {
    let (ledger, front, _) = seeded("cancel", 2).await;
    let appt = assert_ok!(ledger.book(&front.request(0, at(11, 0)), None).await);
    assert_err!(ledger.book(&front.request(1, at(11, 0)), None).await);

    let cancelled = assert_ok!(ledger.cancel(appt.id).await);
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_ok!(ledger.book(&front.request(1, at(11, 0)), None).await);
}

#[tokio::test]
async fn no_show_frees_but_completed_keeps_the_slot() {
    let (ledger, front, _) = seeded("status", 3).await;

    let a = assert_ok!(ledger.book(&front.request(0, at(9, 0)), None).await);
    assert_ok!(ledger.complete(a.id).await);
    assert_err!(ledger.book(&front.request(1, at(9, 0)), None).await);

    let b = ledger.book(&front.request(1, at(12, 0)), None).await.unwrap();
    ledger.mark_no_show(b.id).await.unwrap();
    ledger.book(&front.request(2, at(12, 0)), None).await.unwrap();
}

#[tokio::test]
async fn only_scheduled_appointments_change_status() {
    let (ledger, front, _) = seeded("final", 1).await;
    let appt = ledger.book(&front.request(0, at(15, 0)), None).await.unwrap();
    ledger.complete(appt.id).await.unwrap();

    let err = ledger.cancel(appt.id).await.unwrap_err();
    assert!(matches!(err, BookingError::BadRequest(_)));
    assert_eq!(ledger.get_appointment(appt.id).unwrap().status, AppointmentStatus::Completed);

    let err = ledger.cancel(Ulid::new()).await.unwrap_err();
    assert!(matches!(err, BookingError::NotFound { .. }));
}

#[tokio::test]
async fn reschedule_revalidates_without_self_conflict() {
    let (ledger, front, _) = seeded("resched", 2).await;
    let mine = ledger.book(&front.request(0, at(10, 0)), None).await.unwrap();
    ledger.book(&front.request(1, at(11, 0)), None).await.unwrap();

    // Overlaps only its own old span.
    let moved = ledger.reschedule(mine.id, at(10, 15)).await.unwrap();
    assert_eq!(moved.span, Span::new(at(10, 15), at(10, 45)));

    let err = ledger.reschedule(mine.id, at(10, 45)).await.unwrap_err();
    assert!(is_staff_conflict(&err), "{err:?}");

    let err = ledger.reschedule(mine.id, at(18, 0)).await.unwrap_err();
    assert!(matches!(err, BookingError::BadRequest(_)));

    // The old span is released.
    let staff = ledger.appointments_for_staff(front.staff);
    assert_eq!(staff.len(), 2);
    assert!(staff.iter().all(|a| a.span.start != at(10, 0)));

    ledger.cancel(mine.id).await.unwrap();
    let err = ledger.reschedule(mine.id, at(13, 0)).await.unwrap_err();
    assert!(matches!(err, BookingError::BadRequest(_)));
}

// ── External provider ────────────────────────────────────────

#[tokio::test]
async fn linked_shop_needs_a_published_slot() {
    let path = wal_path("external");
    let front = Shopfront::new(2, Some("LOC-9"));
    let provider = Arc::new(FixedAvailability::new(2));
    for start in [at(9, 0), at(9, 30), at(10, 0), at(13, 0)] {
        provider.publish(ExternalSlot {
            location_id: "LOC-9".into(),
            service_ref: "SVC-TRIM".into(),
            staff_ref: None,
            start,
        });
    }
    let config = ValidatorConfig {
        external_failure_policy: FailurePolicy::Closed,
        ..Default::default()
    };
    let ledger = Ledger::open(path, provider, &config).unwrap();
    ledger.load_seed(&front.seed).await.unwrap();

    // Second page of two-slot pages.
    ledger.book(&front.request(0, at(13, 0)), None).await.unwrap();

    let err = ledger.book(&front.request(1, at(11, 0)), None).await.unwrap_err();
    assert!(
        matches!(err, BookingError::Conflict { reason, .. } if reason == SLOT_UNAVAILABLE_EXTERNALLY),
        "{err:?}"
    );
}

/// Answers every page slowly and always claims there is another one.
struct StallingProvider {
    per_page: Duration,
}

#[async_trait]
impl ExternalAvailability for StallingProvider {
    async fn search(&self, _query: &SlotSearch, cursor: Option<String>) -> Result<SlotPage, ExternalError> {
        tokio::time::sleep(self.per_page).await;
        let next = cursor.map_or(1, |c| c.parse::<u32>().unwrap_or(0) + 1);
        Ok(SlotPage {
            starts: Vec::new(),
            cursor: Some(next.to_string()),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn degraded_provider_does_not_serialize_a_shop() {
    let front = Arc::new(Shopfront::new(4, Some("LOC-SLOW")));
    let provider = Arc::new(StallingProvider {
        per_page: Duration::from_millis(100),
    });
    let config = ValidatorConfig {
        external_timeout: Duration::from_millis(150),
        ..Default::default()
    };
    let ledger = Arc::new(Ledger::open(wal_path("stall"), provider, &config).unwrap());
    ledger.load_seed(&front.seed).await.unwrap();

    // Each booking pages through the full cap (about a second) before
    // failing open.
    let started = Instant::now();
    let mut handles = Vec::new();
    for i in 0..4 {
        let ledger = ledger.clone();
        let front = front.clone();
        handles.push(tokio::spawn(async move {
            let mut req = front.request(i, at(9 + i as u32, 0));
            req.staff_id = None;
            ledger.book(&req, None).await
        }));
    }
    for h in handles {
        assert_ok!(h.await.unwrap());
    }
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(2500), "bookings ran one after another: {elapsed:?}");
}

#[tokio::test]
async fn slot_taken_while_checking_provider_is_still_caught() {
    let (ledger, front, _) = seeded("recheck", 2).await;
    let a = front.request(0, at(16, 0));
    let b = front.request(1, at(16, 0));
    let (ra, rb) = tokio::join!(ledger.book(&a, None), ledger.book(&b, None));
    assert!(ra.is_ok() ^ rb.is_ok(), "{ra:?} / {rb:?}");
}

// ── Catalog ──────────────────────────────────────────────────

#[tokio::test]
async fn catalog_writes_are_checked() {
    let (ledger, front, _) = seeded("catalog", 1).await;

    let bad_zone = Shop {
        id: Ulid::new(),
        name: None,
        external_location_id: None,
        time_zone: Some("Mars/Olympus_Mons".into()),
    };
    assert!(matches!(ledger.put_shop(bad_zone).await, Err(BookingError::BadRequest(_))));

    let zero = Service {
        id: Ulid::new(),
        shop_id: front.shop,
        name: "Nothing".into(),
        duration_minutes: 0,
        external_ref: None,
        external_version: None,
    };
    assert!(matches!(ledger.put_service(zero).await, Err(BookingError::BadRequest(_))));

    let orphan = Staff {
        id: Ulid::new(),
        shop_id: Ulid::new(),
        name: "Nobody".into(),
        external_ref: None,
        active: true,
    };
    assert!(matches!(ledger.put_staff(orphan).await, Err(BookingError::NotFound { .. })));

    let inverted = WorkingHours {
        shop_id: front.shop,
        staff_id: front.staff,
        weekday: Weekday::Tue,
        start: "17:00".parse().unwrap(),
        end: "09:00".parse().unwrap(),
    };
    assert!(matches!(ledger.set_working_hours(inverted).await, Err(BookingError::BadRequest(_))));
}

#[tokio::test]
async fn time_off_and_cleared_hours_block_bookings() {
    let (ledger, front, _) = seeded("timeoff", 2).await;
    let block = TimeOff {
        id: Ulid::new(),
        shop_id: front.shop,
        staff_id: front.staff,
        span: Span::new(at(12, 0), at(13, 0)),
        reason: Some("dentist".into()),
    };
    ledger.add_time_off(block.clone()).await.unwrap();
    assert!(ledger.book(&front.request(0, at(12, 30)), None).await.is_err());
    ledger.book(&front.request(0, at(13, 0)), None).await.unwrap();

    ledger.remove_time_off(front.staff, block.id).await.unwrap();
    ledger.book(&front.request(1, at(12, 0)), None).await.unwrap();

    ledger.clear_working_hours(front.staff, Weekday::Mon).await.unwrap();
    let err = ledger.book(&front.request(1, at(15, 0)), None).await.unwrap_err();
    assert!(matches!(err, BookingError::BadRequest(_)));
}

#[tokio::test]
async fn seed_parses_from_json() {
    let shop = Ulid::new();
    let staff = Ulid::new();
    let json = format!(
        r#"{{
            "shops": [{{ "id": "{shop}", "name": "Corner", "external_location_id": null, "time_zone": "Europe/Berlin" }}],
            "staff": [{{ "id": "{staff}", "shop_id": "{shop}", "name": "Jon", "external_ref": null, "active": true }}],
            "working_hours": [{{ "shop_id": "{shop}", "staff_id": "{staff}", "weekday": "Mon", "start": "08:30", "end": "12:00" }}]
        }}"#
    );
    let seed: Seed = serde_json::from_str(&json).unwrap();
    assert_eq!(seed.working_hours[0].start.to_string(), "08:30");
    assert!(seed.services.is_empty());

    let ledger = open(&wal_path("seedjson"));
    ledger.load_seed(&seed).await.unwrap();
    assert_eq!(ledger.store().shop_count(), 1);
}

// ── Durability ───────────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let (ledger, front, path) = seeded("reopen", 2).await;
    let kept = ledger.book(&front.request(0, at(10, 0)), Some("regular".into())).await.unwrap();
    let gone = ledger.book(&front.request(1, at(11, 0)), None).await.unwrap();
    ledger.cancel(gone.id).await.unwrap();
    ledger.reschedule(kept.id, at(10, 30)).await.unwrap();
    drop(ledger);

    let ledger = open(&path);
    let kept = ledger.get_appointment(kept.id).unwrap();
    assert_eq!(kept.span, Span::new(at(10, 30), at(11, 0)));
    assert_eq!(kept.label.as_deref(), Some("regular"));
    assert_eq!(ledger.get_appointment(gone.id).unwrap().status, AppointmentStatus::Cancelled);

    // Catalog and schedules come back too.
    let err = ledger.book(&front.request(1, at(10, 45)), None).await.unwrap_err();
    assert!(is_staff_conflict(&err), "{err:?}");
}

#[tokio::test]
async fn compaction_keeps_state_and_resets_counter() {
    let (ledger, front, path) = seeded("compact", 3).await;
    let a = ledger.book(&front.request(0, at(9, 0)), None).await.unwrap();
    let b = ledger.book(&front.request(1, at(9, 30)), None).await.unwrap();
    ledger.mark_no_show(b.id).await.unwrap();
    assert!(ledger.wal_appends_since_compact().await > 0);

    ledger.compact().await.unwrap();
    assert_eq!(ledger.wal_appends_since_compact().await, 0);
    let c = ledger.book(&front.request(2, at(10, 0)), None).await.unwrap();
    drop(ledger);

    let ledger = open(&path);
    assert_eq!(ledger.get_appointment(a.id).unwrap().status, AppointmentStatus::Scheduled);
    assert_eq!(ledger.get_appointment(b.id).unwrap().status, AppointmentStatus::NoShow);
    assert!(ledger.get_appointment(c.id).is_some());
    assert_eq!(ledger.store().shop_count(), 1);
    assert_eq!(ledger.appointments_for_staff(front.staff).len(), 3);
}

#[tokio::test]
async fn replayed_backlog_counts_toward_compaction() {
    let (ledger, front, path) = seeded("backlog", 1).await;
    ledger.book(&front.request(0, at(9, 0)), None).await.unwrap();
    let before = ledger.wal_appends_since_compact().await;
    assert!(before > 0);
    drop(ledger);

    let ledger = open(&path);
    assert_eq!(ledger.wal_appends_since_compact().await, before);
    assert!(slotguard::compactor::compact_if_due(&ledger, before).await);
    assert_eq!(ledger.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn compactor_runs_only_past_threshold() {
    let (ledger, front, _) = seeded("compactor", 1).await;
    ledger.book(&front.request(0, at(9, 0)), None).await.unwrap();
    assert!(!slotguard::compactor::compact_if_due(&ledger, 10_000).await);
    assert!(slotguard::compactor::compact_if_due(&ledger, 1).await);
    assert_eq!(ledger.wal_appends_since_compact().await, 0);
}
