use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::ports::{TimeOffQuery, WorkingHoursQuery};

use super::error::BookingError;

/// An instant as seen on the shop's wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalParts {
    pub date: NaiveDate,
    pub weekday: Weekday,
    pub time: ClockTime,
}

/// Convert `instant` to local date parts in the IANA zone `zone`.
///
/// With no zone the UTC parts are taken as already local.
pub fn local_parts(instant: Ms, zone: Option<&str>) -> Result<LocalParts, BookingError> {
    let utc = DateTime::<Utc>::from_timestamp_millis(instant)
        .ok_or_else(|| BookingError::bad_request(format!("instant out of range: {instant}")))?;
    let local = match zone {
        Some(name) => {
            let tz: Tz = name
                .parse()
                .map_err(|_| BookingError::bad_request(format!("unknown time zone: {name}")))?;
            utc.with_timezone(&tz).naive_local()
        }
        None => utc.naive_utc(),
    };
    let time = ClockTime::new(local.hour(), local.minute())
        .ok_or_else(|| BookingError::bad_request("local time out of range"))?;
    Ok(LocalParts {
        date: local.date(),
        weekday: local.weekday(),
        time,
    })
}

/// Answers whether a staff member is on shift at an instant.
pub struct WorkingHoursEvaluator {
    hours: Arc<dyn WorkingHoursQuery>,
    time_off: Arc<dyn TimeOffQuery>,
}

impl WorkingHoursEvaluator {
    pub fn new(hours: Arc<dyn WorkingHoursQuery>, time_off: Arc<dyn TimeOffQuery>) -> Self {
        Self { hours, time_off }
    }

    /// Shift hours are `[start, end)` on the local weekday; time-off blocks
    /// are `[start, end)` in UTC and win over shift hours.
    pub async fn is_working(
        &self,
        shop_id: Ulid,
        staff_id: Ulid,
        instant: Ms,
        shop_time_zone: Option<&str>,
    ) -> Result<bool, BookingError> {
        let local = local_parts(instant, shop_time_zone)?;

        let Some(hours) = self
            .hours
            .get_working_hours(staff_id, local.weekday)
            .await?
            .filter(|h| h.shop_id == shop_id)
        else {
            debug!(%staff_id, weekday = %local.weekday, "no working hours for day");
            return Ok(false);
        };

        if !hours.covers(local.time) {
            debug!(
                %staff_id,
                local_time = %local.time,
                start = %hours.start,
                end = %hours.end,
                "outside shift"
            );
            return Ok(false);
        }

        let covering = self.time_off.find_covering(staff_id, instant).await?;
        if let Some(block) = covering.iter().find(|t| t.span.contains_instant(instant)) {
            debug!(%staff_id, time_off = %block.id, "on time off");
            return Ok(false);
        }

        Ok(true)
    }
}
