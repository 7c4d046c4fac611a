use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::{Conflict, RangeError};
use super::EngineError;

/// Reject ranges that are inverted or already (partly) in the past.
/// Runs on every mutation, so a range accepted yesterday can fail today.
pub fn validate_range(range: &DateRange, today: NaiveDate) -> Result<(), EngineError> {
    if range.start > range.end {
        return Err(EngineError::InvalidRange(RangeError::StartAfterEnd));
    }
    if range.start < today {
        return Err(EngineError::InvalidRange(RangeError::StartBeforeToday));
    }
    if range.end < today {
        return Err(EngineError::InvalidRange(RangeError::EndBeforeToday));
    }
    Ok(())
}

pub(crate) fn validate_range_width(range: &DateRange) -> Result<(), EngineError> {
    if range.days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

pub(crate) fn validate_property_id(property_id: &str) -> Result<(), EngineError> {
    if property_id.len() > MAX_PROPERTY_ID_LEN {
        return Err(EngineError::LimitExceeded("property id too long"));
    }
    Ok(())
}

pub(crate) fn validate_booking_request(req: &BookingRequest) -> Result<(), EngineError> {
    validate_property_id(&req.property_id)?;
    if req.guest_name.len() > MAX_GUEST_NAME_LEN {
        return Err(EngineError::LimitExceeded("guest name too long"));
    }
    if req.guest_email.len() > MAX_GUEST_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("guest email too long"));
    }
    Ok(())
}

pub(crate) fn validate_block_request(req: &BlockRequest) -> Result<(), EngineError> {
    validate_property_id(&req.property_id)?;
    if let Some(ref r) = req.reason
        && r.len() > MAX_REASON_LEN
    {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

/// First non-canceled booking on the property overlapping `range`, skipping
/// `ignore`. Deleted bookings still count.
fn first_overlapping_booking(
    state: &PropertyState,
    range: &DateRange,
    ignore: Option<Ulid>,
) -> Option<Conflict> {
    state
        .bookings
        .iter()
        .filter(|b| b.status != BookingStatus::Canceled)
        .filter(|b| Some(b.id) != ignore)
        .find(|b| b.range.overlaps(range))
        .map(|b| Conflict::Booking(b.id))
}

/// Full check used by booking mutations: bookings first, then blocks.
/// Within each list the first match in storage order wins.
pub fn find_conflict(
    state: &PropertyState,
    range: &DateRange,
    ignore_booking_id: Option<Ulid>,
) -> Option<Conflict> {
    if let Some(conflict) = first_overlapping_booking(state, range, ignore_booking_id) {
        return Some(conflict);
    }
    state
        .blocks
        .iter()
        .find(|b| b.range.overlaps(range))
        .map(|b| Conflict::Block {
            id: b.id,
            property_id: b.property_id.clone(),
        })
}

/// Check used by block mutations. Blocks may overlap other blocks.
pub fn find_booking_conflict(state: &PropertyState, range: &DateRange) -> Option<Conflict> {
    first_overlapping_booking(state, range, None)
}

pub(crate) fn check_no_conflict(
    state: &PropertyState,
    range: &DateRange,
    ignore_booking_id: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(state, range, ignore_booking_id) {
        Some(conflict) => Err(EngineError::Conflict(conflict)),
        None => Ok(()),
    }
}

pub(crate) fn check_no_booking_conflict(
    state: &PropertyState,
    range: &DateRange,
) -> Result<(), EngineError> {
    match find_booking_conflict(state, range) {
        Some(conflict) => Err(EngineError::Conflict(conflict)),
        None => Ok(()),
    }
}
