use async_trait::async_trait;
use chrono::{DateTime, Weekday};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{BookingError, ExternalError, first_overlapping};
use crate::model::*;
use crate::ports::*;

/// One subject's appointments (a staff member's or a customer's), sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub appointments: Vec<Appointment>,
}

impl Schedule {
    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, appt: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appt.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appt);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn set_status(&mut self, id: Ulid, status: AppointmentStatus) {
        if let Some(a) = self.appointments.iter_mut().find(|a| a.id == id) {
            a.status = status;
        }
    }
}

/// DashMap-backed catalog and appointment book. Implements every read port.
///
/// Mutation goes through `apply_event` only, so state can be rebuilt from the WAL.
#[derive(Default)]
pub struct InMemoryStore {
    shops: DashMap<Ulid, Shop>,
    services: DashMap<Ulid, Service>,
    staff: DashMap<Ulid, Staff>,
    customers: DashMap<Ulid, Customer>,
    working_hours: DashMap<(Ulid, Weekday), WorkingHours>,
    time_off: DashMap<Ulid, Vec<TimeOff>>,
    appointments: DashMap<Ulid, Appointment>,
    schedules: DashMap<(SubjectKind, Ulid), Schedule>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn appointment(&self, id: &Ulid) -> Option<Appointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    pub fn schedule(&self, kind: SubjectKind, subject: Ulid) -> Vec<Appointment> {
        self.schedules
            .get(&(kind, subject))
            .map(|s| s.appointments.clone())
            .unwrap_or_default()
    }

    pub fn shop_count(&self) -> usize {
        self.shops.len()
    }

    pub fn shop(&self, id: &Ulid) -> Option<Shop> {
        self.shops.get(id).map(|e| e.value().clone())
    }

    /// Events that recreate the current state, catalog first.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        events.extend(self.shops.iter().map(|e| Event::ShopSaved(e.value().clone())));
        events.extend(self.services.iter().map(|e| Event::ServiceSaved(e.value().clone())));
        events.extend(self.staff.iter().map(|e| Event::StaffSaved(e.value().clone())));
        events.extend(self.customers.iter().map(|e| Event::CustomerSaved(e.value().clone())));
        events.extend(
            self.working_hours
                .iter()
                .map(|e| Event::WorkingHoursSet(e.value().clone())),
        );
        for entry in self.time_off.iter() {
            events.extend(entry.value().iter().cloned().map(Event::TimeOffAdded));
        }
        let mut appts: Vec<Appointment> = self.appointments.iter().map(|e| e.value().clone()).collect();
        appts.sort_by_key(|a| a.id);
        events.extend(appts.into_iter().map(Event::AppointmentBooked));
        events
    }

    fn schedule_keys(appt: &Appointment) -> impl Iterator<Item = (SubjectKind, Ulid)> {
        std::iter::once((SubjectKind::Customer, appt.customer_id))
            .chain(appt.staff_id.map(|s| (SubjectKind::Staff, s)))
    }

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::ShopSaved(shop) => {
                self.shops.insert(shop.id, shop.clone());
            }
            Event::ServiceSaved(service) => {
                self.services.insert(service.id, service.clone());
            }
            Event::StaffSaved(staff) => {
                self.staff.insert(staff.id, staff.clone());
            }
            Event::CustomerSaved(customer) => {
                self.customers.insert(customer.id, customer.clone());
            }
            Event::WorkingHoursSet(hours) => {
                self.working_hours
                    .insert((hours.staff_id, hours.weekday), hours.clone());
            }
            Event::WorkingHoursCleared { staff_id, weekday } => {
                self.working_hours.remove(&(*staff_id, *weekday));
            }
            Event::TimeOffAdded(block) => {
                self.time_off
                    .entry(block.staff_id)
                    .or_default()
                    .push(block.clone());
            }
            Event::TimeOffRemoved { id, staff_id } => {
                if let Some(mut blocks) = self.time_off.get_mut(staff_id) {
                    blocks.retain(|b| b.id != *id);
                }
            }
            Event::AppointmentBooked(appt) => {
                for key in Self::schedule_keys(appt) {
                    self.schedules.entry(key).or_default().insert(appt.clone());
                }
                self.appointments.insert(appt.id, appt.clone());
            }
            Event::AppointmentRescheduled { id, span } => {
                let Some(mut appt) = self.appointments.get_mut(id) else {
                    return;
                };
                appt.span = *span;
                let updated = appt.clone();
                drop(appt);
                for key in Self::schedule_keys(&updated) {
                    let mut schedule = self.schedules.entry(key).or_default();
                    schedule.remove(*id);
                    schedule.insert(updated.clone());
                }
            }
            Event::AppointmentStatusChanged { id, status } => {
                let Some(mut appt) = self.appointments.get_mut(id) else {
                    return;
                };
                appt.status = *status;
                let updated = appt.clone();
                drop(appt);
                for key in Self::schedule_keys(&updated) {
                    if let Some(mut schedule) = self.schedules.get_mut(&key) {
                        schedule.set_status(*id, *status);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ShopLookup for InMemoryStore {
    async fn get_shop(&self, id: Ulid) -> Result<Option<Shop>, BookingError> {
        Ok(self.shop(&id))
    }
}

#[async_trait]
impl ServiceLookup for InMemoryStore {
    async fn get_service(&self, id: Ulid) -> Result<Option<Service>, BookingError> {
        Ok(self.services.get(&id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl CustomerLookup for InMemoryStore {
    async fn get_customer(&self, id: Ulid) -> Result<Option<Customer>, BookingError> {
        Ok(self.customers.get(&id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl StaffLookup for InMemoryStore {
    async fn get_staff(&self, id: Ulid) -> Result<Option<Staff>, BookingError> {
        Ok(self.staff.get(&id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl AppointmentQuery for InMemoryStore {
    async fn find_active_conflict(
        &self,
        subject: Ulid,
        kind: SubjectKind,
        span: Span,
        ignore: Option<Ulid>,
    ) -> Result<Option<ConflictRecord>, BookingError> {
        let hit = match self.schedules.get(&(kind, subject)) {
            Some(schedule) => first_overlapping(&schedule.appointments, &span, ignore).cloned(),
            None => None,
        };
        let Some(hit) = hit else { return Ok(None) };

        let (staff_name, service_name) = match kind {
            SubjectKind::Staff => (self.staff.get(&subject).map(|s| s.name.clone()), None),
            SubjectKind::Customer => (None, self.services.get(&hit.service_id).map(|s| s.name.clone())),
        };
        Ok(Some(ConflictRecord {
            appointment_id: hit.id,
            span: hit.span,
            staff_name,
            service_name,
        }))
    }
}

#[async_trait]
impl WorkingHoursQuery for InMemoryStore {
    async fn get_working_hours(
        &self,
        staff_id: Ulid,
        weekday: Weekday,
    ) -> Result<Option<WorkingHours>, BookingError> {
        Ok(self
            .working_hours
            .get(&(staff_id, weekday))
            .map(|e| e.value().clone()))
    }
}

#[async_trait]
impl TimeOffQuery for InMemoryStore {
    async fn find_covering(&self, staff_id: Ulid, instant: Ms) -> Result<Vec<TimeOff>, BookingError> {
        Ok(self
            .time_off
            .get(&staff_id)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.span.contains_instant(instant))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ── Static external provider ─────────────────────────────────────

/// A slot published by the external provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSlot {
    pub location_id: String,
    pub service_ref: String,
    pub staff_ref: Option<String>,
    pub start: Ms,
}

/// `ExternalAvailability` served from a fixed slot table, paginated with an
/// offset cursor. Stands in for the provider in offline runs.
pub struct FixedAvailability {
    slots: DashMap<(String, String), Vec<(Option<String>, Ms)>>,
    page_size: usize,
}

impl FixedAvailability {
    pub fn new(page_size: usize) -> Self {
        Self {
            slots: DashMap::new(),
            page_size: page_size.max(1),
        }
    }

    pub fn publish(&self, slot: ExternalSlot) {
        let mut list = self
            .slots
            .entry((slot.location_id, slot.service_ref))
            .or_default();
        let pos = list.partition_point(|(_, s)| *s <= slot.start);
        list.insert(pos, (slot.staff_ref, slot.start));
    }
}

#[async_trait]
impl ExternalAvailability for FixedAvailability {
    async fn search(&self, query: &SlotSearch, cursor: Option<String>) -> Result<SlotPage, ExternalError> {
        let offset: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| ExternalError::Malformed(format!("bad cursor {c:?}")))?,
            None => 0,
        };
        let key = (query.location_id.clone(), query.service_ref.clone());
        let matching: Vec<Ms> = self
            .slots
            .get(&key)
            .map(|list| {
                list.iter()
                    .filter(|(staff, start)| {
                        let same_day = DateTime::from_timestamp_millis(*start)
                            .is_some_and(|t| t.date_naive() == query.date);
                        let staff_ok = match (&query.staff_ref, staff) {
                            (Some(want), Some(have)) => want == have,
                            _ => true,
                        };
                        same_day && staff_ok
                    })
                    .map(|(_, start)| *start)
                    .collect()
            })
            .unwrap_or_default();

        let end = (offset + self.page_size).min(matching.len());
        let starts = matching.get(offset..end).map(<[Ms]>::to_vec).unwrap_or_default();
        let cursor = (end < matching.len()).then(|| end.to_string());
        Ok(SlotPage { starts, cursor })
    }
}
