//! In-memory order store
//!
//! Owns every slot record for one ladder. Engines read logical copies and
//! propose updates through [`OrderStore::update_order`], which re-indexes
//! the slot and reports whether a funds recalculation is due. A
//! reference-counted pause defers that recalculation across batches.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use log::warn;

use crate::consts::LOCK_TIMEOUT;

use super::slot::{Slot, SlotRole, StateKind};

/// Order store: primary map plus secondary indexes and the cooperative
/// per-slot lock table.
#[derive(Debug)]
pub struct OrderStore {
    slots: HashMap<String, Slot>,
    /// Slot ids sorted by ascending price; fixed after initialization
    ladder: Vec<String>,
    by_state: HashMap<StateKind, BTreeSet<String>>,
    by_role: HashMap<SlotRole, BTreeSet<String>>,
    by_chain_id: HashMap<String, String>,
    locks: HashMap<String, Instant>,
    lock_timeout: Duration,
    pause_depth: u32,
    recalc_pending: bool,
}

impl OrderStore {
    /// Build a store from an initialized ladder.
    pub fn new(mut slots: Vec<Slot>) -> Self {
        slots.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        let ladder: Vec<String> = slots.iter().map(|s| s.id.clone()).collect();

        let mut store = Self {
            slots: HashMap::new(),
            ladder,
            by_state: HashMap::new(),
            by_role: HashMap::new(),
            by_chain_id: HashMap::new(),
            locks: HashMap::new(),
            lock_timeout: LOCK_TIMEOUT,
            pause_depth: 0,
            recalc_pending: false,
        };
        for slot in slots {
            store.index(&slot);
            store.slots.insert(slot.id.clone(), slot);
        }
        store
    }

    #[cfg(test)]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.ladder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ladder.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Slot> {
        self.slots.get(id)
    }

    /// Logical copy for engines to mutate and hand back.
    pub fn get_cloned(&self, id: &str) -> Option<Slot> {
        self.slots.get(id).cloned()
    }

    /// Slot ids in ascending price order.
    pub fn ladder_ids(&self) -> &[String] {
        &self.ladder
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.ladder.iter().position(|s| s == id)
    }

    pub fn slot_at(&self, idx: usize) -> Option<&Slot> {
        self.ladder.get(idx).and_then(|id| self.slots.get(id))
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.ladder.iter().filter_map(|id| self.slots.get(id))
    }

    pub fn ids_in_state(&self, kind: StateKind) -> impl Iterator<Item = &String> {
        self.by_state.get(&kind).into_iter().flatten()
    }

    pub fn ids_with_role(&self, role: SlotRole) -> impl Iterator<Item = &String> {
        self.by_role.get(&role).into_iter().flatten()
    }

    pub fn find_by_chain_id(&self, chain_id: &str) -> Option<&Slot> {
        self.by_chain_id.get(chain_id).and_then(|id| self.slots.get(id))
    }

    /// Insert or overwrite a slot by id and re-index it.
    ///
    /// Returns true when the caller should run a funds recalculation now;
    /// inside a paused batch the recalculation is deferred to the final
    /// resume instead. Prices of existing slots are immutable: an update
    /// carrying a different price keeps the stored price and logs.
    pub fn update_order(&mut self, mut slot: Slot) -> bool {
        if let Some(existing) = self.slots.get(&slot.id).cloned() {
            if (existing.price - slot.price).abs() > f64::EPSILON {
                warn!(
                    "slot {} price change {} -> {} rejected, prices are fixed",
                    slot.id, existing.price, slot.price
                );
                slot.price = existing.price;
            }
            self.unindex(&existing);
        } else {
            // A brand new id would change the ladder shape; slots are only
            // created by the initializer.
            warn!("update_order for unknown slot {}", slot.id);
            self.ladder.push(slot.id.clone());
            self.ladder.sort_by(|a, b| {
                let pa = if a == &slot.id { slot.price } else { self.slots[a].price };
                let pb = if b == &slot.id { slot.price } else { self.slots[b].price };
                pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        if let Some(chain_id) = slot.chain_id() {
            let owner = self.by_chain_id.get(chain_id).cloned();
            if let Some(owner) = owner.filter(|o| o != &slot.id) {
                warn!(
                    "chain order {} already owned by slot {}, reassigning to {}",
                    chain_id, owner, slot.id
                );
                if let Some(mut other) = self.slots.get(&owner).cloned() {
                    self.unindex(&other);
                    other.mark_virtual();
                    self.index(&other);
                    self.slots.insert(other.id.clone(), other);
                }
            }
        }

        self.index(&slot);
        self.slots.insert(slot.id.clone(), slot);

        if self.pause_depth > 0 {
            self.recalc_pending = true;
            false
        } else {
            true
        }
    }

    fn index(&mut self, slot: &Slot) {
        self.by_state
            .entry(slot.state.kind())
            .or_default()
            .insert(slot.id.clone());
        self.by_role
            .entry(slot.role)
            .or_default()
            .insert(slot.id.clone());
        if let Some(chain_id) = slot.chain_id() {
            self.by_chain_id.insert(chain_id.to_string(), slot.id.clone());
        }
    }

    fn unindex(&mut self, slot: &Slot) {
        if let Some(set) = self.by_state.get_mut(&slot.state.kind()) {
            set.remove(&slot.id);
        }
        if let Some(set) = self.by_role.get_mut(&slot.role) {
            set.remove(&slot.id);
        }
        if let Some(chain_id) = slot.chain_id() {
            if self.by_chain_id.get(chain_id).map(String::as_str) == Some(slot.id.as_str()) {
                self.by_chain_id.remove(chain_id);
            }
        }
    }

    /// Defer funds recalculation until the matching resume. Nests.
    pub fn pause_funds_recalc(&mut self) {
        self.pause_depth += 1;
    }

    /// Returns true when the outermost resume finds deferred work, in
    /// which case the caller runs the recalculation exactly once.
    pub fn resume_funds_recalc(&mut self) -> bool {
        if self.pause_depth == 0 {
            warn!("resume_funds_recalc without matching pause");
            return false;
        }
        self.pause_depth -= 1;
        if self.pause_depth == 0 && self.recalc_pending {
            self.recalc_pending = false;
            true
        } else {
            false
        }
    }

    pub fn is_recalc_paused(&self) -> bool {
        self.pause_depth > 0
    }

    /// Acquire (or refresh) cooperative locks on the given slot ids.
    pub fn lock<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Instant::now();
        for id in ids {
            self.locks.insert(id.as_ref().to_string(), now);
        }
    }

    pub fn unlock<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            self.locks.remove(id.as_ref());
        }
    }

    /// True while a lock is held and has not expired.
    pub fn is_locked(&self, id: &str) -> bool {
        self.locks
            .get(id)
            .map(|at| at.elapsed() < self.lock_timeout)
            .unwrap_or(false)
    }

    /// Refresh every currently held lock. Run at half the lock timeout
    /// while a long operation is in flight.
    pub fn refresh_locks(&mut self) {
        let now = Instant::now();
        for at in self.locks.values_mut() {
            *at = now;
        }
    }

    pub fn locked_ids(&self) -> Vec<String> {
        self.locks
            .iter()
            .filter(|(_, at)| at.elapsed() < self.lock_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn release_all_locks(&mut self) {
        self.locks.clear();
    }
}
