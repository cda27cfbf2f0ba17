use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use tracing::{debug, warn};

use crate::config::FailurePolicy;
use crate::model::Ms;
use crate::observability::EXTERNAL_CHECKS_TOTAL;
use crate::ports::{ExternalAvailability, SlotSearch};

use super::error::ExternalError;

/// External references a slot check needs. Missing location or service
/// references mean the entities aren't linked to the provider yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotCheck<'a> {
    pub location_id: Option<&'a str>,
    pub service_ref: Option<&'a str>,
    pub staff_ref: Option<&'a str>,
    pub start: Ms,
}

/// Confirms a slot against the provider's live calendar.
pub struct ExternalAvailabilityVerifier {
    provider: Arc<dyn ExternalAvailability>,
    policy: FailurePolicy,
    max_pages: usize,
    timeout: Duration,
}

impl ExternalAvailabilityVerifier {
    pub fn new(
        provider: Arc<dyn ExternalAvailability>,
        policy: FailurePolicy,
        max_pages: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            policy,
            max_pages,
            timeout,
        }
    }

    /// `true` if the slot may be booked. Provider errors never propagate;
    /// they resolve according to the configured `FailurePolicy`.
    pub async fn verify_slot(&self, check: SlotCheck<'_>) -> bool {
        let (Some(location_id), Some(service_ref)) = (check.location_id, check.service_ref) else {
            debug!("external check skipped: shop or service not linked");
            metrics::counter!(EXTERNAL_CHECKS_TOTAL, "outcome" => "skipped").increment(1);
            return true;
        };

        let result = self
            .search_for(location_id, service_ref, check.staff_ref, check.start)
            .await;
        match result {
            Ok(found) => {
                let outcome = if found { "available" } else { "unavailable" };
                metrics::counter!(EXTERNAL_CHECKS_TOTAL, "outcome" => outcome).increment(1);
                found
            }
            Err(e) => match self.policy {
                FailurePolicy::Open => {
                    warn!(location_id, service_ref, start = check.start, "external availability check failed, allowing booking: {e}");
                    metrics::counter!(EXTERNAL_CHECKS_TOTAL, "outcome" => "failed_open").increment(1);
                    true
                }
                FailurePolicy::Closed => {
                    warn!(location_id, service_ref, start = check.start, "external availability check failed, rejecting booking: {e}");
                    metrics::counter!(EXTERNAL_CHECKS_TOTAL, "outcome" => "failed_closed").increment(1);
                    false
                }
            },
        }
    }

    /// Page through the provider's slots for the UTC day of `start` looking
    /// for an exact start-instant match.
    async fn search_for(
        &self,
        location_id: &str,
        service_ref: &str,
        staff_ref: Option<&str>,
        start: Ms,
    ) -> Result<bool, ExternalError> {
        let date = DateTime::from_timestamp_millis(start)
            .ok_or_else(|| ExternalError::Malformed(format!("start out of range: {start}")))?
            .date_naive();
        let query = SlotSearch {
            location_id: location_id.to_string(),
            service_ref: service_ref.to_string(),
            staff_ref: staff_ref.map(str::to_string),
            date,
        };

        let mut cursor = None;
        for page_no in 0..self.max_pages {
            let page = tokio::time::timeout(self.timeout, self.provider.search(&query, cursor.take()))
                .await
                .map_err(|_| ExternalError::Timeout)??;
            if page.starts.contains(&start) {
                debug!(page_no, "external slot confirmed");
                return Ok(true);
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(false),
            }
        }
        Err(ExternalError::PageLimit(self.max_pages))
    }
}
