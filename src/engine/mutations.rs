use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_no_booking_conflict, check_no_conflict, validate_block_request,
    validate_booking_request, validate_range, validate_range_width,
};
use super::{Engine, EngineError, PropertyTxn, WalCommand};

impl Engine {
    fn validate_booking(&self, req: &BookingRequest) -> Result<(), EngineError> {
        validate_range(&req.range, self.today())?;
        validate_range_width(&req.range)?;
        validate_booking_request(req)
    }

    fn validate_block(&self, req: &BlockRequest) -> Result<(), EngineError> {
        validate_range(&req.range, self.today())?;
        validate_range_width(&req.range)?;
        validate_block_request(req)
    }

    /// Refuse to grow a property past its entry limit. Only called when a
    /// new entity lands on the target property.
    fn check_capacity(txn: &PropertyTxn) -> Result<(), EngineError> {
        if txn.target().entry_count() >= MAX_ENTRIES_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many entries on property"));
        }
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        self.validate_booking(&req)?;

        let mut txn = self.store.lock(&req.property_id, None).await;
        Self::check_capacity(&txn)?;
        check_no_conflict(txn.target(), &req.range, None)?;

        let booking = Booking {
            id: self.next_id(),
            guest_name: req.guest_name,
            guest_email: req.guest_email,
            property_id: req.property_id,
            range: req.range,
            status: BookingStatus::Active,
        };
        self.persist_and_apply(&mut txn, Event::BookingSaved { booking: booking.clone() })
            .await?;
        Ok(booking)
    }

    /// Replace the guest details, property and dates. Status is untouched.
    pub async fn update_booking(
        &self,
        id: Ulid,
        req: BookingRequest,
    ) -> Result<Booking, EngineError> {
        if self.store.property_of_booking(&id).is_none() {
            return Err(EngineError::booking_not_found(id));
        }
        self.validate_booking(&req)?;

        let (existing, mut txn) = self.lock_booking(id, Some(&req.property_id)).await?;
        if existing.property_id != req.property_id {
            Self::check_capacity(&txn)?;
        }
        check_no_conflict(txn.target(), &req.range, Some(id))?;

        let booking = Booking {
            id,
            guest_name: req.guest_name,
            guest_email: req.guest_email,
            property_id: req.property_id,
            range: req.range,
            status: existing.status,
        };
        self.persist_and_apply(&mut txn, Event::BookingSaved { booking: booking.clone() })
            .await?;
        Ok(booking)
    }

    /// Idempotent. Any other status, Deleted included, becomes Canceled.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (mut booking, mut txn) = self.lock_booking(id, None).await?;
        if booking.status == BookingStatus::Canceled {
            return Ok(booking);
        }
        booking.status = BookingStatus::Canceled;
        self.persist_and_apply(&mut txn, Event::BookingSaved { booking: booking.clone() })
            .await?;
        Ok(booking)
    }

    /// Reactivate a canceled booking with (possibly) new details.
    pub async fn rebook_booking(
        &self,
        id: Ulid,
        req: BookingRequest,
    ) -> Result<Booking, EngineError> {
        // An oversized property id is refused below; never create it here.
        let target = (req.property_id.len() <= MAX_PROPERTY_ID_LEN)
            .then_some(req.property_id.as_str());
        let (existing, mut txn) = self.lock_booking(id, target).await?;
        if existing.status != BookingStatus::Canceled {
            return Err(EngineError::InvalidTransition(
                "only canceled bookings can be rebooked",
            ));
        }
        validate_booking_request(&req)?;
        validate_range(&req.range, self.today())?;
        validate_range_width(&req.range)?;
        if existing.property_id != req.property_id {
            Self::check_capacity(&txn)?;
        }
        check_no_conflict(txn.target(), &req.range, Some(id))?;

        let booking = Booking {
            id,
            guest_name: req.guest_name,
            guest_email: req.guest_email,
            property_id: req.property_id,
            range: req.range,
            status: BookingStatus::Active,
        };
        self.persist_and_apply(&mut txn, Event::BookingSaved { booking: booking.clone() })
            .await?;
        Ok(booking)
    }

    /// Soft delete: the record keeps its id and stays readable.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (mut booking, mut txn) = self.lock_booking(id, None).await?;
        if booking.status == BookingStatus::Deleted {
            return Ok(booking);
        }
        booking.status = BookingStatus::Deleted;
        self.persist_and_apply(&mut txn, Event::BookingSaved { booking: booking.clone() })
            .await?;
        Ok(booking)
    }

    // ── Blocks ───────────────────────────────────────────────

    pub async fn create_block(&self, req: BlockRequest) -> Result<Block, EngineError> {
        self.validate_block(&req)?;

        let mut txn = self.store.lock(&req.property_id, None).await;
        Self::check_capacity(&txn)?;
        check_no_booking_conflict(txn.target(), &req.range)?;

        let block = Block {
            id: self.next_id(),
            property_id: req.property_id,
            range: req.range,
            reason: req.reason,
        };
        self.persist_and_apply(&mut txn, Event::BlockSaved { block: block.clone() })
            .await?;
        Ok(block)
    }

    /// Replace every field of the block, re-checking it like a new one.
    pub async fn update_block(&self, id: Ulid, req: BlockRequest) -> Result<Block, EngineError> {
        if self.store.property_of_block(&id).is_none() {
            return Err(EngineError::block_not_found(id));
        }
        self.validate_block(&req)?;

        let (existing, mut txn) = self.lock_block(id, Some(&req.property_id)).await?;
        if existing.property_id != req.property_id {
            Self::check_capacity(&txn)?;
        }
        check_no_booking_conflict(txn.target(), &req.range)?;

        let block = Block {
            id,
            property_id: req.property_id,
            range: req.range,
            reason: req.reason,
        };
        self.persist_and_apply(&mut txn, Event::BlockSaved { block: block.clone() })
            .await?;
        Ok(block)
    }

    pub async fn delete_block(&self, id: Ulid) -> Result<(), EngineError> {
        let (block, mut txn) = self.lock_block(id, None).await?;
        let event = Event::BlockDeleted {
            id,
            property_id: block.property_id,
        };
        self.persist_and_apply(&mut txn, event).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as one save event per live record.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No mutation is between WAL append and apply while frozen, so the
        // snapshot matches the log it replaces.
        let _frozen = self.store.freeze().await;

        let mut events = Vec::new();
        for rs in self.store.property_states() {
            let guard = rs.read().await;
            events.extend(
                guard
                    .bookings
                    .iter()
                    .map(|b| Event::BookingSaved { booking: b.clone() }),
            );
            events.extend(
                guard
                    .blocks
                    .iter()
                    .map(|b| Event::BlockSaved { block: b.clone() }),
            );
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
