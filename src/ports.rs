//! Read-only boundaries the validation engine depends on.
//!
//! Storage and the external provider live behind these traits so the engine
//! can run against `InMemoryStore`, a database adapter, or test fakes.

use async_trait::async_trait;
use chrono::{NaiveDate, Weekday};
use ulid::Ulid;

use crate::engine::{BookingError, ExternalError};
use crate::model::*;

#[async_trait]
pub trait ShopLookup: Send + Sync {
    async fn get_shop(&self, id: Ulid) -> Result<Option<Shop>, BookingError>;
}

#[async_trait]
pub trait ServiceLookup: Send + Sync {
    async fn get_service(&self, id: Ulid) -> Result<Option<Service>, BookingError>;
}

#[async_trait]
pub trait CustomerLookup: Send + Sync {
    async fn get_customer(&self, id: Ulid) -> Result<Option<Customer>, BookingError>;
}

#[async_trait]
pub trait StaffLookup: Send + Sync {
    async fn get_staff(&self, id: Ulid) -> Result<Option<Staff>, BookingError>;
}

#[async_trait]
pub trait AppointmentQuery: Send + Sync {
    /// First slot-holding appointment of `subject` overlapping `span`,
    /// skipping `ignore` (the appointment being rescheduled, if any).
    ///
    /// Overlap is half-open: `a.start < span.end && span.start < a.end`.
    /// An appointment that only touches `span` must not be returned, and
    /// must not hide a later one that does overlap.
    async fn find_active_conflict(
        &self,
        subject: Ulid,
        kind: SubjectKind,
        span: Span,
        ignore: Option<Ulid>,
    ) -> Result<Option<ConflictRecord>, BookingError>;
}

#[async_trait]
pub trait WorkingHoursQuery: Send + Sync {
    async fn get_working_hours(
        &self,
        staff_id: Ulid,
        weekday: Weekday,
    ) -> Result<Option<WorkingHours>, BookingError>;
}

#[async_trait]
pub trait TimeOffQuery: Send + Sync {
    /// Time-off blocks with `start <= instant < end`.
    async fn find_covering(&self, staff_id: Ulid, instant: Ms) -> Result<Vec<TimeOff>, BookingError>;
}

/// One availability search against the external provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSearch {
    pub location_id: String,
    pub service_ref: String,
    pub staff_ref: Option<String>,
    /// UTC calendar day to search.
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPage {
    /// Candidate slot start instants.
    pub starts: Vec<Ms>,
    /// Opaque cursor for the next page; `None` on the last page.
    pub cursor: Option<String>,
}

#[async_trait]
pub trait ExternalAvailability: Send + Sync {
    async fn search(&self, query: &SlotSearch, cursor: Option<String>) -> Result<SlotPage, ExternalError>;
}
