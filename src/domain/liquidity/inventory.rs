//! Liquidity inventory assets and reservation lifecycle (spec.md §3).
//!
//! `holding_id = platform:asset_id`; the latest snapshot wins for asset
//! valuation. At most one reservation may be `active` (`reserved` or
//! `in_settlement`) per holding at a time; `reserved -> in_settlement ->
//! {released, refunded, withdrawn}` and `reserved -> {released, refunded,
//! withdrawn}` are both legal, everything else is a `CONSTRAINT_VIOLATION`.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub holding_id: String,
    pub platform: String,
    pub asset_id: String,
    pub quantity: f64,
    pub value_usd: f64,
    pub recorded_at: String,
}

pub fn holding_id(platform: &str, asset_id: &str) -> String {
    format!("{platform}:{asset_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    InSettlement,
    Released,
    Refunded,
    Withdrawn,
}

impl ReservationStatus {
    fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Reserved | ReservationStatus::InSettlement)
    }

    fn legal_transition(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Reserved, InSettlement)
                | (Reserved, Released)
                | (Reserved, Refunded)
                | (Reserved, Withdrawn)
                | (InSettlement, Released)
                | (InSettlement, Refunded)
                | (InSettlement, Withdrawn)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub holding_id: String,
    pub status: ReservationStatus,
    pub quantity: f64,
}

#[derive(Default)]
pub struct InventoryStore {
    pub snapshots: HashMap<String, InventorySnapshot>,
    pub reservations: HashMap<String, Reservation>,
}

impl InventoryStore {
    pub fn upsert_snapshot(&mut self, snapshot: InventorySnapshot) {
        // Latest snapshot wins; callers supply the holding's current recorded_at.
        self.snapshots.insert(snapshot.holding_id.clone(), snapshot);
    }

    fn active_reservation_for_holding(&self, holding_id: &str) -> Option<&Reservation> {
        self.reservations
            .values()
            .find(|r| r.holding_id == holding_id && r.status.is_active())
    }

    /// Reserve `quantity` against `holding_id` under a caller-supplied
    /// `reservation_id`. Fails `CONFLICT` if another reservation is already
    /// active for this holding.
    pub fn reserve(
        &mut self,
        reservation_id: &str,
        holding_id: &str,
        quantity: f64,
    ) -> CoreResult<Reservation> {
        if self.reservations.contains_key(reservation_id) {
            return Err(CoreError::conflict("liquidity_inventory_reservation_id_reused"));
        }
        if self.active_reservation_for_holding(holding_id).is_some() {
            return Err(CoreError::conflict(
                "liquidity_inventory_reservation_conflict",
            ));
        }
        let reservation = Reservation {
            reservation_id: reservation_id.to_string(),
            holding_id: holding_id.to_string(),
            status: ReservationStatus::Reserved,
            quantity,
        };
        self.reservations
            .insert(reservation_id.to_string(), reservation.clone());
        Ok(reservation)
    }

    pub fn transition(
        &mut self,
        reservation_id: &str,
        next: ReservationStatus,
    ) -> CoreResult<Reservation> {
        let reservation = self
            .reservations
            .get_mut(reservation_id)
            .ok_or_else(|| CoreError::not_found("liquidity_inventory_reservation_not_found"))?;
        if !reservation.status.legal_transition(next) {
            return Err(CoreError::constraint_violation(
                "liquidity_inventory_reservation_illegal_transition",
            ));
        }
        reservation.status = next;
        Ok(reservation.clone())
    }

    pub fn active_count(&self, holding_id: &str) -> usize {
        self.reservations
            .values()
            .filter(|r| r.holding_id == holding_id && r.status.is_active())
            .count()
    }
}
