//! Slot records and their state machine

use serde::{Deserialize, Serialize};

/// Funding side of the ladder. Buy orders commit quote asset, sell orders
/// commit base asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub const BOTH: [Side; 2] = [Side::Buy, Side::Sell];
}

/// A pair of values indexed by side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SidePair<T> {
    pub buy: T,
    pub sell: T,
}

impl<T> SidePair<T> {
    pub fn new(buy: T, sell: T) -> Self {
        Self { buy, sell }
    }

    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    pub fn set(&mut self, side: Side, value: T) {
        *self.get_mut(side) = value;
    }
}

impl<T: Copy> SidePair<T> {
    pub fn splat(value: T) -> Self {
        Self { buy: value, sell: value }
    }
}

/// Role of a slot within the ladder partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotRole {
    Buy,
    Sell,
    /// Placeholder in the gap zone around the reference price
    Spread,
}

impl SlotRole {
    /// The funding side this role commits, if any.
    pub fn side(&self) -> Option<Side> {
        match self {
            SlotRole::Buy => Some(Side::Buy),
            SlotRole::Sell => Some(Side::Sell),
            SlotRole::Spread => None,
        }
    }

    pub fn from_side(side: Side) -> Self {
        match side {
            Side::Buy => SlotRole::Buy,
            Side::Sell => SlotRole::Sell,
        }
    }
}

/// Discriminant of [`SlotState`], used for indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    Virtual,
    Active,
    Partial,
}

/// On-chain presence of a slot.
///
/// `Active` and `Partial` carry the chain order id, so a virtual slot with
/// a dangling id is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    /// Not on chain
    Virtual,
    /// On chain at full intended size
    Active { chain_id: String },
    /// On chain with reduced remaining size after a partial fill
    Partial { chain_id: String },
}

impl SlotState {
    pub fn kind(&self) -> StateKind {
        match self {
            SlotState::Virtual => StateKind::Virtual,
            SlotState::Active { .. } => StateKind::Active,
            SlotState::Partial { .. } => StateKind::Partial,
        }
    }

    pub fn chain_id(&self) -> Option<&str> {
        match self {
            SlotState::Virtual => None,
            SlotState::Active { chain_id } | SlotState::Partial { chain_id } => Some(chain_id),
        }
    }

    pub fn is_on_chain(&self) -> bool {
        !matches!(self, SlotState::Virtual)
    }
}

/// Bookkeeping for a partial that absorbed residual capital from outer
/// partials during consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeTracker {
    /// Residual capital folded into this order
    pub merged_size: f64,
    /// Fill volume accumulated since the consolidation refill
    pub filled_since_refill: f64,
}

impl MergeTracker {
    pub fn new(merged_size: f64) -> Self {
        Self { merged_size, filled_since_refill: 0.0 }
    }
}

/// A fixed position in the ladder.
///
/// The price is assigned at grid creation and never changes; only state,
/// size, chain id, and role mutate over the slot's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    /// Stable identifier, never reused while the grid lives
    pub id: String,
    pub price: f64,
    pub role: SlotRole,
    #[serde(flatten)]
    pub state: SlotState,
    /// Intended or remaining size: base units for Sell, quote units for
    /// Buy, zero for Spread
    pub size: f64,
    /// Present while the slot is a consolidation double order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeTracker>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_rotation: bool,
}

impl Slot {
    pub fn new_virtual(id: impl Into<String>, price: f64, role: SlotRole, size: f64) -> Self {
        Self {
            id: id.into(),
            price,
            role,
            state: SlotState::Virtual,
            size,
            merge: None,
            pending_rotation: false,
        }
    }

    pub fn chain_id(&self) -> Option<&str> {
        self.state.chain_id()
    }

    pub fn is_on_chain(&self) -> bool {
        self.state.is_on_chain()
    }

    /// The funding side committed by this slot, if any.
    pub fn side(&self) -> Option<Side> {
        self.role.side()
    }

    pub fn is_double_order(&self) -> bool {
        self.merge.is_some()
    }

    /// Convert a fully filled or retired slot back into a spread
    /// placeholder. The id and price survive; everything else resets.
    pub fn make_spread_placeholder(&mut self) {
        self.role = SlotRole::Spread;
        self.state = SlotState::Virtual;
        self.size = 0.0;
        self.merge = None;
        self.pending_rotation = false;
    }

    /// Mark the slot active on chain at its full intended size.
    pub fn mark_active(&mut self, chain_id: impl Into<String>) {
        self.state = SlotState::Active { chain_id: chain_id.into() };
    }

    /// Mark the slot partially filled on chain.
    pub fn mark_partial(&mut self, chain_id: impl Into<String>) {
        self.state = SlotState::Partial { chain_id: chain_id.into() };
    }

    /// Take the slot off chain, keeping its role and size.
    pub fn mark_virtual(&mut self) {
        self.state = SlotState::Virtual;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_carries_chain_id() {
        let mut slot = Slot::new_virtual("buy-3", 0.95, SlotRole::Buy, 10.0);
        assert_eq!(slot.chain_id(), None);
        assert!(!slot.is_on_chain());

        slot.mark_active("1.7.100");
        assert_eq!(slot.chain_id(), Some("1.7.100"));
        assert_eq!(slot.state.kind(), StateKind::Active);

        slot.mark_partial("1.7.100");
        assert_eq!(slot.state.kind(), StateKind::Partial);
        assert_eq!(slot.chain_id(), Some("1.7.100"));

        slot.mark_virtual();
        assert_eq!(slot.chain_id(), None);
    }

    #[test]
    fn test_spread_placeholder_resets_everything() {
        let mut slot = Slot::new_virtual("sell-1", 1.1, SlotRole::Sell, 5.0);
        slot.mark_active("1.7.9");
        slot.merge = Some(MergeTracker::new(1.5));
        slot.pending_rotation = true;

        slot.make_spread_placeholder();
        assert_eq!(slot.role, SlotRole::Spread);
        assert_eq!(slot.state, SlotState::Virtual);
        assert_eq!(slot.size, 0.0);
        assert!(slot.merge.is_none());
        assert!(!slot.pending_rotation);
        // identity survives
        assert_eq!(slot.id, "sell-1");
        assert!((slot.price - 1.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_slot_serialization_round_trip() {
        let mut slot = Slot::new_virtual("buy-7", 0.82, SlotRole::Buy, 12.5);
        slot.mark_partial("1.7.4711");
        slot.merge = Some(MergeTracker::new(0.75));

        let json = serde_json::to_string(&slot).unwrap();
        let loaded: Slot = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, slot);
    }

    #[test]
    fn test_side_pair_indexing() {
        let mut pair = SidePair::new(1.0, 2.0);
        assert_eq!(*pair.get(Side::Buy), 1.0);
        *pair.get_mut(Side::Sell) += 1.0;
        assert_eq!(pair.sell, 3.0);
    }
}
