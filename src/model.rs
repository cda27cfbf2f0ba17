use std::fmt;
use std::str::FromStr;

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shop {
    pub id: Ulid,
    pub name: Option<String>,
    /// Location id on the external scheduling provider.
    pub external_location_id: Option<String>,
    /// IANA zone, e.g. `America/New_York`.
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub name: String,
    pub duration_minutes: i64,
    pub external_ref: Option<String>,
    pub external_version: Option<i64>,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub name: String,
    pub external_ref: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub name: Option<String>,
    pub external_ref: Option<String>,
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    NoShow,
    Cancelled,
}

impl AppointmentStatus {
    /// Whether an appointment in this status still occupies its slot.
    pub fn holds_slot(self) -> bool {
        match self {
            AppointmentStatus::Scheduled | AppointmentStatus::Completed => true,
            AppointmentStatus::NoShow | AppointmentStatus::Cancelled => false,
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppointmentStatus::Scheduled => "SCHEDULED",
            AppointmentStatus::Completed => "COMPLETED",
            AppointmentStatus::NoShow => "NO_SHOW",
            AppointmentStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub service_id: Ulid,
    pub customer_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub span: Span,
    pub status: AppointmentStatus,
    pub label: Option<String>,
}

/// Whose calendar a conflict query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    Staff,
    Customer,
}

/// The first committed appointment found overlapping a proposed span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub appointment_id: Ulid,
    pub span: Span,
    /// Staff display name for staff conflicts.
    pub staff_name: Option<String>,
    /// Service name for customer conflicts.
    pub service_name: Option<String>,
}

// ── Shifts ───────────────────────────────────────────────────────

/// Local wall-clock time of day with minute precision.
///
/// Ordering matches the lexicographic order of the zero-padded `HH:MM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime {
    minutes: u16,
}

impl ClockTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            minutes: (hour * 60 + minute) as u16,
        })
    }

    pub fn hour(&self) -> u32 {
        u32::from(self.minutes / 60)
    }

    pub fn minute(&self) -> u32 {
        u32::from(self.minutes % 60)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid clock time {s:?}, expected HH:MM");
        let (h, m) = s.split_once(':').ok_or_else(bad)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(bad());
        }
        let hour: u32 = h.parse().map_err(|_| bad())?;
        let minute: u32 = m.parse().map_err(|_| bad())?;
        ClockTime::new(hour, minute).ok_or_else(bad)
    }
}

impl TryFrom<String> for ClockTime {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ClockTime> for String {
    fn from(t: ClockTime) -> Self {
        t.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub shop_id: Ulid,
    pub staff_id: Ulid,
    pub weekday: Weekday,
    pub start: ClockTime,
    pub end: ClockTime,
}

impl WorkingHours {
    /// Start-inclusive, end-exclusive.
    pub fn covers(&self, t: ClockTime) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOff {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub staff_id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
}

/// Ledger events, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ShopSaved(Shop),
    ServiceSaved(Service),
    StaffSaved(Staff),
    CustomerSaved(Customer),
    WorkingHoursSet(WorkingHours),
    WorkingHoursCleared {
        staff_id: Ulid,
        weekday: Weekday,
    },
    TimeOffAdded(TimeOff),
    TimeOffRemoved {
        id: Ulid,
        staff_id: Ulid,
    },
    AppointmentBooked(Appointment),
    AppointmentRescheduled {
        id: Ulid,
        span: Span,
    },
    AppointmentStatusChanged {
        id: Ulid,
        status: AppointmentStatus,
    },
}
