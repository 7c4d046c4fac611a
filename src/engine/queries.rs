use ulid::Ulid;

use crate::model::*;

use super::error::Entity;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        loop {
            let pid = self
                .store
                .property_of_booking(&id)
                .ok_or_else(|| EngineError::booking_not_found(id))?;
            let rs = self
                .store
                .get_property(&pid)
                .ok_or_else(|| EngineError::booking_not_found(id))?;
            let guard = rs.read().await;
            if let Some(b) = guard.booking(id) {
                return Ok(b.clone());
            }
            // Moved to another property between lookup and read.
        }
    }

    pub async fn get_block(&self, id: Ulid) -> Result<Block, EngineError> {
        loop {
            let pid = self
                .store
                .property_of_block(&id)
                .ok_or_else(|| EngineError::block_not_found(id))?;
            let rs = self
                .store
                .get_property(&pid)
                .ok_or_else(|| EngineError::block_not_found(id))?;
            let guard = rs.read().await;
            if let Some(b) = guard.block(id) {
                return Ok(b.clone());
            }
        }
    }

    /// Case-insensitive exact match on guest name across every property.
    /// Only canceled bookings are excluded. Ordered by id.
    pub async fn find_active_bookings_by_guest_name(
        &self,
        guest_name: &str,
    ) -> Result<Vec<Booking>, EngineError> {
        let wanted = guest_name.to_lowercase();
        let mut found = Vec::new();
        for rs in self.store.property_states() {
            let guard = rs.read().await;
            found.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status != BookingStatus::Canceled)
                    .filter(|b| b.guest_name.to_lowercase() == wanted)
                    .cloned(),
            );
        }
        if found.is_empty() {
            return Err(EngineError::NotFound(
                Entity::GuestBookings,
                guest_name.to_string(),
            ));
        }
        found.sort_by_key(|b| b.id);
        Ok(found)
    }

    /// Blocks on the property in storage order. Empty is `NotFound`.
    pub async fn list_blocks(&self, property_id: &str) -> Result<Vec<Block>, EngineError> {
        let not_found = || EngineError::NotFound(Entity::PropertyBlocks, property_id.to_string());
        let rs = self.store.get_property(property_id).ok_or_else(not_found)?;
        let guard = rs.read().await;
        if guard.blocks.is_empty() {
            return Err(not_found());
        }
        Ok(guard.blocks.clone())
    }

    /// Every booking on the property, any status. Empty is fine.
    pub async fn list_bookings(&self, property_id: &str) -> Vec<Booking> {
        match self.store.get_property(property_id) {
            Some(rs) => rs.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }
}
