mod error;
mod external;
mod overlap;
mod resolver;
mod working_hours;

pub use error::{BookingError, EntityKind, ExternalError};
pub use external::{ExternalAvailabilityVerifier, SlotCheck};
pub use overlap::{OverlapDetector, first_overlapping};
pub use resolver::{EntityResolver, ResolvedEntities};
pub use working_hours::{LocalParts, WorkingHoursEvaluator, local_parts};

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::config::ValidatorConfig;
use crate::limits::*;
use crate::model::*;
use crate::observability::{VALIDATIONS_TOTAL, VALIDATION_DURATION_SECONDS};
use crate::ports::*;

pub const STAFF_ALREADY_BOOKED: &str = "staff already booked";
pub const CUSTOMER_ALREADY_BOOKED: &str = "customer already has an appointment";
pub const SLOT_UNAVAILABLE_EXTERNALLY: &str = "slot no longer available externally";
pub const STAFF_NOT_WORKING: &str = "staff not working at requested time";

/// A proposed appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub shop_id: Ulid,
    pub service_id: Ulid,
    pub customer_id: Ulid,
    pub staff_id: Option<Ulid>,
    /// Requested start, UTC ms.
    pub start: Ms,
}

/// What a successful validation hands back to the caller that persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBooking {
    pub entities: ResolvedEntities,
    pub span: Span,
}

/// Everything the validator reads from.
#[derive(Clone)]
pub struct Ports {
    pub shops: Arc<dyn ShopLookup>,
    pub services: Arc<dyn ServiceLookup>,
    pub customers: Arc<dyn CustomerLookup>,
    pub staff: Arc<dyn StaffLookup>,
    pub appointments: Arc<dyn AppointmentQuery>,
    pub working_hours: Arc<dyn WorkingHoursQuery>,
    pub time_off: Arc<dyn TimeOffQuery>,
    pub external: Arc<dyn ExternalAvailability>,
}

/// Decides whether a booking request may be persisted.
///
/// Checks run in a fixed order and the first failure wins:
/// entity resolution, staff shift hours, staff overlap, customer overlap,
/// external availability. Nothing is written.
pub struct BookingValidator {
    resolver: EntityResolver,
    overlap: OverlapDetector,
    hours: WorkingHoursEvaluator,
    external: ExternalAvailabilityVerifier,
}

impl BookingValidator {
    pub fn new(ports: Ports, config: &ValidatorConfig) -> Self {
        Self {
            resolver: EntityResolver::new(ports.shops, ports.services, ports.customers, ports.staff),
            overlap: OverlapDetector::new(ports.appointments),
            hours: WorkingHoursEvaluator::new(ports.working_hours, ports.time_off),
            external: ExternalAvailabilityVerifier::new(
                ports.external,
                config.external_failure_policy,
                config.max_external_pages,
                config.external_timeout,
            ),
        }
    }

    pub fn working_hours(&self) -> &WorkingHoursEvaluator {
        &self.hours
    }

    pub async fn validate(&self, req: &BookingRequest) -> Result<ValidatedBooking, BookingError> {
        self.validate_excluding(req, None).await
    }

    /// Validate while treating appointment `ignore` as absent (rescheduling).
    pub async fn validate_excluding(
        &self,
        req: &BookingRequest,
        ignore: Option<Ulid>,
    ) -> Result<ValidatedBooking, BookingError> {
        let started = Instant::now();
        let result = self.run(req, ignore).await;
        metrics::histogram!(VALIDATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(e) => e.kind_label(),
        };
        metrics::counter!(VALIDATIONS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Ok(v) => debug!(shop = %req.shop_id, start = v.span.start, end = v.span.end, "booking accepted"),
            Err(e) => info!(shop = %req.shop_id, customer = %req.customer_id, "booking rejected: {e}"),
        }
        result
    }

    async fn run(&self, req: &BookingRequest, ignore: Option<Ulid>) -> Result<ValidatedBooking, BookingError> {
        let validated = self.check_local(req, ignore).await?;
        self.check_external(&validated).await?;
        Ok(validated)
    }

    /// Every check that reads only local state: entities, shift hours and
    /// both overlap checks. Callers that already ran the external check use
    /// this to re-validate inside their critical section.
    pub async fn check_local(
        &self,
        req: &BookingRequest,
        ignore: Option<Ulid>,
    ) -> Result<ValidatedBooking, BookingError> {
        if req.start < MIN_VALID_TIMESTAMP_MS || req.start > MAX_VALID_TIMESTAMP_MS {
            return Err(BookingError::bad_request("start out of range"));
        }

        let entities = self
            .resolver
            .resolve(req.shop_id, req.service_id, req.customer_id, req.staff_id)
            .await?;

        let span = Span::new(req.start, req.start + entities.service.duration_ms());

        if let Some(ref staff) = entities.staff {
            let working = self
                .hours
                .is_working(entities.shop.id, staff.id, span.start, entities.shop.time_zone.as_deref())
                .await?;
            if !working {
                return Err(BookingError::bad_request(STAFF_NOT_WORKING));
            }

            if let Some(c) = self
                .overlap
                .find_conflict(staff.id, SubjectKind::Staff, span, ignore)
                .await?
            {
                return Err(BookingError::Conflict {
                    reason: STAFF_ALREADY_BOOKED,
                    conflicting: Some(c.span),
                    with: c.staff_name.or_else(|| Some(staff.name.clone())),
                });
            }
        }

        if let Some(c) = self
            .overlap
            .find_conflict(entities.customer.id, SubjectKind::Customer, span, ignore)
            .await?
        {
            return Err(BookingError::Conflict {
                reason: CUSTOMER_ALREADY_BOOKED,
                conflicting: Some(c.span),
                with: c.service_name,
            });
        }

        Ok(ValidatedBooking { entities, span })
    }

    async fn check_external(&self, validated: &ValidatedBooking) -> Result<(), BookingError> {
        let ValidatedBooking { entities, span } = validated;
        let slot_open = self
            .external
            .verify_slot(SlotCheck {
                location_id: entities.shop.external_location_id.as_deref(),
                service_ref: entities.service.external_ref.as_deref(),
                staff_ref: entities.staff.as_ref().and_then(|s| s.external_ref.as_deref()),
                start: span.start,
            })
            .await;
        if !slot_open {
            return Err(BookingError::Conflict {
                reason: SLOT_UNAVAILABLE_EXTERNALLY,
                conflicting: None,
                with: None,
            });
        }
        Ok(())
    }
}
