use ulid::Ulid;

use crate::model::Span;

/// Which catalog record a lookup failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Shop,
    Service,
    Customer,
    Staff,
    Appointment,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Shop => "shop",
            EntityKind::Service => "service",
            EntityKind::Customer => "customer",
            EntityKind::Staff => "staff",
            EntityKind::Appointment => "appointment",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    NotFound {
        entity: EntityKind,
        id: Ulid,
    },
    BadRequest(String),
    Conflict {
        reason: &'static str,
        conflicting: Option<Span>,
        /// Staff name or service name of the clashing appointment.
        with: Option<String>,
    },
    Storage(String),
}

impl BookingError {
    pub fn not_found(entity: EntityKind, id: Ulid) -> Self {
        BookingError::NotFound { entity, id }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        BookingError::BadRequest(reason.into())
    }

    /// Short label for metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            BookingError::NotFound { .. } => "not_found",
            BookingError::BadRequest(_) => "bad_request",
            BookingError::Conflict { .. } => "conflict",
            BookingError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            BookingError::BadRequest(reason) => write!(f, "bad request: {reason}"),
            BookingError::Conflict {
                reason,
                conflicting,
                with,
            } => {
                write!(f, "conflict: {reason}")?;
                if let Some(name) = with {
                    write!(f, " ({name})")?;
                }
                if let Some(span) = conflicting {
                    write!(f, " [{}, {})", span.start, span.end)?;
                }
                Ok(())
            }
            BookingError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}

/// Failure talking to the external availability provider. Never escapes the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    Transport(String),
    Malformed(String),
    PageLimit(usize),
    Timeout,
}

impl std::fmt::Display for ExternalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExternalError::Transport(e) => write!(f, "transport error: {e}"),
            ExternalError::Malformed(e) => write!(f, "malformed response: {e}"),
            ExternalError::PageLimit(n) => write!(f, "pagination not exhausted after {n} pages"),
            ExternalError::Timeout => write!(f, "provider timed out"),
        }
    }
}

impl std::error::Error for ExternalError {}
