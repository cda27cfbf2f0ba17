use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;
use crate::ports::AppointmentQuery;

use super::error::BookingError;

/// Double-booking check against committed appointments.
pub struct OverlapDetector {
    appointments: Arc<dyn AppointmentQuery>,
}

impl OverlapDetector {
    pub fn new(appointments: Arc<dyn AppointmentQuery>) -> Self {
        Self { appointments }
    }

    pub async fn find_conflict(
        &self,
        subject: Ulid,
        kind: SubjectKind,
        span: Span,
        ignore: Option<Ulid>,
    ) -> Result<Option<ConflictRecord>, BookingError> {
        self.appointments
            .find_active_conflict(subject, kind, span, ignore)
            .await
    }
}

/// First slot-holding appointment in `appointments` overlapping `span`.
///
/// `appointments` must be sorted by `span.start`; everything starting at or
/// after `span.end` is skipped by binary search.
pub fn first_overlapping<'a>(
    appointments: &'a [Appointment],
    span: &Span,
    ignore: Option<Ulid>,
) -> Option<&'a Appointment> {
    let right_bound = appointments.partition_point(|a| a.span.start < span.end);
    appointments[..right_bound].iter().find(|a| {
        a.status.holds_slot() && Some(a.id) != ignore && a.span.end > span.start
    })
}
