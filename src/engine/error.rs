use ulid::Ulid;

use crate::model::PropertyId;

/// Why a date range was rejected. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    StartAfterEnd,
    StartBeforeToday,
    EndBeforeToday,
}

impl std::fmt::Display for RangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeError::StartAfterEnd => f.write_str("start after end"),
            RangeError::StartBeforeToday => f.write_str("start before today"),
            RangeError::EndBeforeToday => f.write_str("end before today"),
        }
    }
}

/// The existing allocation a requested range ran into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    Booking(Ulid),
    Block { id: Ulid, property_id: PropertyId },
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Conflict::Booking(id) => write!(f, "requested dates overlap existing booking {id}"),
            Conflict::Block { property_id, .. } => {
                write!(f, "requested dates overlap block on property {property_id}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Booking,
    Block,
    /// Block listing for a property came back empty.
    PropertyBlocks,
    /// Guest-name lookup came back empty.
    GuestBookings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidRange(RangeError),
    InvalidTransition(&'static str),
    Conflict(Conflict),
    NotFound(Entity, String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn booking_not_found(id: Ulid) -> Self {
        EngineError::NotFound(Entity::Booking, id.to_string())
    }

    pub(crate) fn block_not_found(id: Ulid) -> Self {
        EngineError::NotFound(Entity::Block, id.to_string())
    }

    /// Caller-correctable input problems. Conflicts count: the caller has to
    /// pick different dates.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidRange(_) | EngineError::InvalidTransition(_) | EngineError::Conflict(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(reason) => write!(f, "invalid date range: {reason}"),
            EngineError::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            EngineError::Conflict(c) => write!(f, "conflict: {c}"),
            EngineError::NotFound(Entity::Booking, id) => write!(f, "booking not found: {id}"),
            EngineError::NotFound(Entity::Block, id) => write!(f, "block not found: {id}"),
            EngineError::NotFound(Entity::PropertyBlocks, pid) => {
                write!(f, "blocks not found for property: {pid}")
            }
            EngineError::NotFound(Entity::GuestBookings, name) => {
                write!(f, "no active bookings found for guest: {name}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
