use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Weekday;
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{error, info};
use ulid::Ulid;

use crate::config::ValidatorConfig;
use crate::engine::{BookingError, BookingRequest, BookingValidator, EntityKind, Ports};
use crate::limits::*;
use crate::model::*;
use crate::observability::{LEDGER_WRITES_TOTAL, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::ports::ExternalAvailability;
use crate::store::{ExternalSlot, InMemoryStore};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that arrive while a flush is pending share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// All or nothing: a failed batch is cut back off the log, since every
/// caller in it is told the write failed.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mark = wal.mark();
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = result {
        if let Err(undo) = wal.rollback(mark) {
            error!("WAL rollback after failed batch failed: {undo}");
        }
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Catalog import format for offline runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub shops: Vec<Shop>,
    pub services: Vec<Service>,
    pub staff: Vec<Staff>,
    pub customers: Vec<Customer>,
    pub working_hours: Vec<WorkingHours>,
    pub time_off: Vec<TimeOff>,
    pub external_slots: Vec<ExternalSlot>,
}

/// The only writer of appointments.
///
/// Validation and the appointment write happen inside one per-shop critical
/// section, so two concurrent requests for the same slot can't both pass.
/// Every change is logged to the WAL before it is applied to the store.
pub struct Ledger {
    store: Arc<InMemoryStore>,
    validator: BookingValidator,
    wal_tx: mpsc::Sender<WalCommand>,
    shop_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Appends hold it shared; compaction holds it exclusively so the
    /// snapshot can't miss an event that is already on disk.
    commit_gate: RwLock<()>,
}

impl Ledger {
    /// Replay `wal_path` and start the WAL writer. Must run inside a Tokio runtime.
    pub fn open(
        wal_path: PathBuf,
        external: Arc<dyn ExternalAvailability>,
        config: &ValidatorConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let store = Arc::new(InMemoryStore::new());
        for event in &events {
            store.apply_event(event);
        }
        let wal = Wal::resume(&wal_path, events.len() as u64)?;
        info!(path = %wal.path().display(), events = events.len(), "ledger replayed");
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ports = Ports {
            shops: store.clone(),
            services: store.clone(),
            customers: store.clone(),
            staff: store.clone(),
            appointments: store.clone(),
            working_hours: store.clone(),
            time_off: store.clone(),
            external,
        };
        Ok(Self {
            validator: BookingValidator::new(ports, config),
            store,
            wal_tx,
            shop_locks: DashMap::new(),
            commit_gate: RwLock::new(()),
        })
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    pub fn validator(&self) -> &BookingValidator {
        &self.validator
    }

    /// Only shops that exist get a lock entry.
    fn shop_lock(&self, shop_id: Ulid) -> Result<Arc<Mutex<()>>, BookingError> {
        self.require_shop(shop_id)?;
        Ok(self.shop_locks.entry(shop_id).or_default().clone())
    }

    async fn wal_append(&self, event: &Event) -> Result<(), BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| BookingError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()))
    }

    async fn persist_and_apply(&self, op: &'static str, event: Event) -> Result<(), BookingError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        self.store.apply_event(&event);
        metrics::counter!(LEDGER_WRITES_TOTAL, "op" => op).increment(1);
        Ok(())
    }

    // ── Catalog ──────────────────────────────────────────────

    pub async fn put_shop(&self, shop: Shop) -> Result<(), BookingError> {
        check_name(shop.name.as_deref())?;
        if let Some(ref zone) = shop.time_zone {
            zone.parse::<Tz>()
                .map_err(|_| BookingError::bad_request(format!("unknown time zone: {zone}")))?;
        }
        self.persist_and_apply("put_shop", Event::ShopSaved(shop)).await
    }

    pub async fn put_service(&self, service: Service) -> Result<(), BookingError> {
        self.require_shop(service.shop_id)?;
        check_name(Some(&service.name))?;
        if service.duration_minutes <= 0 || service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(BookingError::bad_request("service duration out of range"));
        }
        self.persist_and_apply("put_service", Event::ServiceSaved(service)).await
    }

    pub async fn put_staff(&self, staff: Staff) -> Result<(), BookingError> {
        self.require_shop(staff.shop_id)?;
        check_name(Some(&staff.name))?;
        self.persist_and_apply("put_staff", Event::StaffSaved(staff)).await
    }

    pub async fn put_customer(&self, customer: Customer) -> Result<(), BookingError> {
        self.require_shop(customer.shop_id)?;
        check_name(customer.name.as_deref())?;
        self.persist_and_apply("put_customer", Event::CustomerSaved(customer)).await
    }

    /// Replaces any existing row for the same staff member and weekday.
    pub async fn set_working_hours(&self, hours: WorkingHours) -> Result<(), BookingError> {
        self.require_staff_in_shop(hours.staff_id, hours.shop_id).await?;
        if hours.start >= hours.end {
            return Err(BookingError::bad_request(format!(
                "working hours start {} must be before end {}",
                hours.start, hours.end
            )));
        }
        self.persist_and_apply("set_working_hours", Event::WorkingHoursSet(hours)).await
    }

    pub async fn clear_working_hours(&self, staff_id: Ulid, weekday: Weekday) -> Result<(), BookingError> {
        self.persist_and_apply(
            "clear_working_hours",
            Event::WorkingHoursCleared { staff_id, weekday },
        )
        .await
    }

    pub async fn add_time_off(&self, block: TimeOff) -> Result<(), BookingError> {
        self.require_staff_in_shop(block.staff_id, block.shop_id).await?;
        if block.span.start >= block.span.end {
            return Err(BookingError::bad_request("time off must end after it starts"));
        }
        if let Some(ref r) = block.reason
            && r.len() > MAX_LABEL_LEN
        {
            return Err(BookingError::bad_request("time off reason too long"));
        }
        self.persist_and_apply("add_time_off", Event::TimeOffAdded(block)).await
    }

    pub async fn remove_time_off(&self, staff_id: Ulid, id: Ulid) -> Result<(), BookingError> {
        self.persist_and_apply("remove_time_off", Event::TimeOffRemoved { id, staff_id })
            .await
    }

    /// Write every catalog record in `seed`, parents before children.
    /// External slots are left to the caller.
    pub async fn load_seed(&self, seed: &Seed) -> Result<(), BookingError> {
        for shop in &seed.shops {
            self.put_shop(shop.clone()).await?;
        }
        for service in &seed.services {
            self.put_service(service.clone()).await?;
        }
        for staff in &seed.staff {
            self.put_staff(staff.clone()).await?;
        }
        for customer in &seed.customers {
            self.put_customer(customer.clone()).await?;
        }
        for hours in &seed.working_hours {
            self.set_working_hours(hours.clone()).await?;
        }
        for block in &seed.time_off {
            self.add_time_off(block.clone()).await?;
        }
        Ok(())
    }

    fn require_shop(&self, shop_id: Ulid) -> Result<(), BookingError> {
        self.store
            .shop(&shop_id)
            .map(|_| ())
            .ok_or(BookingError::not_found(EntityKind::Shop, shop_id))
    }

    async fn require_staff_in_shop(&self, staff_id: Ulid, shop_id: Ulid) -> Result<(), BookingError> {
        use crate::ports::StaffLookup;
        let staff = self
            .store
            .get_staff(staff_id)
            .await?
            .ok_or(BookingError::not_found(EntityKind::Staff, staff_id))?;
        if staff.shop_id != shop_id {
            return Err(BookingError::bad_request("staff does not belong to shop"));
        }
        Ok(())
    }

    // ── Appointments ─────────────────────────────────────────

    /// Validate and create an appointment in one step.
    pub async fn book(&self, req: &BookingRequest, label: Option<String>) -> Result<Appointment, BookingError> {
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(BookingError::bad_request("label too long"));
        }
        // The provider is asked outside the shop lock; local checks repeat inside it.
        self.validator.validate(req).await?;
        let lock = self.shop_lock(req.shop_id)?;
        let _guard = lock.lock().await;

        let validated = self.validator.check_local(req, None).await?;
        let appt = Appointment {
            id: Ulid::new(),
            shop_id: validated.entities.shop.id,
            service_id: validated.entities.service.id,
            customer_id: validated.entities.customer.id,
            staff_id: validated.entities.staff.as_ref().map(|s| s.id),
            span: validated.span,
            status: AppointmentStatus::Scheduled,
            label,
        };
        self.persist_and_apply("book", Event::AppointmentBooked(appt.clone()))
            .await?;
        info!(appointment = %appt.id, shop = %appt.shop_id, start = appt.span.start, "appointment booked");
        Ok(appt)
    }

    /// Move a scheduled appointment, re-running every check as if it were new
    /// but without colliding with itself.
    pub async fn reschedule(&self, id: Ulid, new_start: Ms) -> Result<Appointment, BookingError> {
        let req = Self::reschedule_request(&self.load_appointment(id)?, new_start)?;
        self.validator.validate_excluding(&req, Some(id)).await?;

        let lock = self.shop_lock(req.shop_id)?;
        let _guard = lock.lock().await;
        let req = Self::reschedule_request(&self.load_appointment(id)?, new_start)?;
        let validated = self.validator.check_local(&req, Some(id)).await?;
        self.persist_and_apply(
            "reschedule",
            Event::AppointmentRescheduled {
                id,
                span: validated.span,
            },
        )
        .await?;
        self.load_appointment(id)
    }

    fn reschedule_request(current: &Appointment, new_start: Ms) -> Result<BookingRequest, BookingError> {
        if current.status != AppointmentStatus::Scheduled {
            return Err(BookingError::bad_request(format!(
                "cannot reschedule a {} appointment",
                current.status
            )));
        }
        Ok(BookingRequest {
            shop_id: current.shop_id,
            service_id: current.service_id,
            customer_id: current.customer_id,
            staff_id: current.staff_id,
            start: new_start,
        })
    }

    pub async fn complete(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.transition(id, AppointmentStatus::Completed).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.transition(id, AppointmentStatus::NoShow).await
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.transition(id, AppointmentStatus::Cancelled).await
    }

    /// Only scheduled appointments move; every other status is final.
    async fn transition(&self, id: Ulid, to: AppointmentStatus) -> Result<Appointment, BookingError> {
        let current = self.load_appointment(id)?;
        let lock = self.shop_lock(current.shop_id)?;
        let _guard = lock.lock().await;

        let current = self.load_appointment(id)?;
        if current.status != AppointmentStatus::Scheduled {
            return Err(BookingError::bad_request(format!(
                "cannot move appointment from {} to {to}",
                current.status
            )));
        }
        self.persist_and_apply("status", Event::AppointmentStatusChanged { id, status: to })
            .await?;
        info!(appointment = %id, status = %to, "appointment status changed");
        self.load_appointment(id)
    }

    fn load_appointment(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.store
            .appointment(&id)
            .ok_or(BookingError::not_found(EntityKind::Appointment, id))
    }

    pub fn get_appointment(&self, id: Ulid) -> Option<Appointment> {
        self.store.appointment(&id)
    }

    pub fn appointments_for_staff(&self, staff_id: Ulid) -> Vec<Appointment> {
        self.store.schedule(SubjectKind::Staff, staff_id)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild the current state.
    pub async fn compact(&self) -> Result<(), BookingError> {
        let _gate = self.commit_gate.write().await;
        let events = self.store.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| BookingError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn check_name(name: Option<&str>) -> Result<(), BookingError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(BookingError::bad_request("name too long")),
        _ => Ok(()),
    }
}
