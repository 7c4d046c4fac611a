use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque property identifier. Conflicts are scoped to one property.
pub type PropertyId = String;

/// Closed date range `[start, end]`, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Number of calendar days covered, counting both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// A range ending on day N and one starting on day N overlap.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        !(self.end < other.start || self.start > other.end)
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Canceled,
    Deleted,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub guest_name: String,
    pub guest_email: String,
    pub property_id: PropertyId,
    pub range: DateRange,
    pub status: BookingStatus,
}

/// An administrator-declared exclusion period. Existence is its active state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub property_id: PropertyId,
    pub range: DateRange,
    pub reason: Option<String>,
}

/// Fields supplied by the caller when creating, updating or rebooking a booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub guest_name: String,
    pub guest_email: String,
    pub property_id: PropertyId,
    pub range: DateRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub property_id: PropertyId,
    pub range: DateRange,
    pub reason: Option<String>,
}

/// Everything stored for one property. Both lists keep insertion order,
/// which is the order conflict checks walk them in.
#[derive(Debug, Clone)]
pub struct PropertyState {
    pub property_id: PropertyId,
    pub bookings: Vec<Booking>,
    pub blocks: Vec<Block>,
}

impl PropertyState {
    pub fn new(property_id: PropertyId) -> Self {
        Self {
            property_id,
            bookings: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.bookings.len() + self.blocks.len()
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn block(&self, id: Ulid) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Replace the booking in place, or append it if it is new here.
    pub fn upsert_booking(&mut self, booking: Booking) {
        match self.bookings.iter_mut().find(|b| b.id == booking.id) {
            Some(slot) => *slot = booking,
            None => self.bookings.push(booking),
        }
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn upsert_block(&mut self, block: Block) {
        match self.blocks.iter_mut().find(|b| b.id == block.id) {
            Some(slot) => *slot = block,
            None => self.blocks.push(block),
        }
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<Block> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }
}

/// One event per storage write. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingSaved { booking: Booking },
    BlockSaved { block: Block },
    BlockDeleted { id: Ulid, property_id: PropertyId },
}

impl Event {
    pub fn property_id(&self) -> &str {
        match self {
            Event::BookingSaved { booking } => &booking.property_id,
            Event::BlockSaved { block } => &block.property_id,
            Event::BlockDeleted { property_id, .. } => property_id,
        }
    }
}
