//! Collision rules
//!
//! Rules are shared (`Arc`) between the code editing them and the manager
//! evaluating them, so they mutate through `&self`. Edits take effect for
//! queries of the next tick, or immediately after
//! [`CollisionManager::invalidate`](super::CollisionManager::invalidate).

use std::collections::HashSet;

use parking_lot::RwLock;
use sourcebind_sdk::EntityIndex;

use crate::rules::{PairTable, RuleMode, SetMap};

/// A pluggable collision verdict
pub trait CollisionRules: Send + Sync {
    fn mode(&self) -> RuleMode;

    /// Only judge traces with solid contents
    fn solid_only(&self) -> bool;

    /// `false` vetoes the collision between `entity` and `other`
    fn should_collide(&self, entity: EntityIndex, other: EntityIndex) -> bool;

    /// Forget everything about a deleted entity
    fn purge(&self, index: EntityIndex);

    /// Forget everything, e.g. on level shutdown
    fn clear(&self);
}

/// Explicit unordered entity pairs
#[derive(Debug, Default)]
pub struct CollisionPairs {
    mode: RuleMode,
    solid_only: bool,
    pairs: RwLock<PairTable>,
}

impl CollisionPairs {
    pub fn new(mode: RuleMode, solid_only: bool) -> Self {
        Self {
            mode,
            solid_only,
            pairs: RwLock::default(),
        }
    }

    pub fn add_pair(&self, a: EntityIndex, b: EntityIndex) -> bool {
        self.pairs.write().insert(a, b)
    }

    pub fn remove_pair(&self, a: EntityIndex, b: EntityIndex) -> bool {
        self.pairs.write().remove(a, b)
    }

    /// Remove every pair involving `index`
    pub fn remove_pairs(&self, index: EntityIndex) {
        self.pairs.write().purge(index);
    }

    pub fn has_pair(&self, a: EntityIndex, b: EntityIndex) -> bool {
        self.pairs.read().contains(a, b)
    }

    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CollisionRules for CollisionPairs {
    fn mode(&self) -> RuleMode {
        self.mode
    }

    fn solid_only(&self) -> bool {
        self.solid_only
    }

    fn should_collide(&self, entity: EntityIndex, other: EntityIndex) -> bool {
        let pairs = self.pairs.read();
        self.mode.allows(
            pairs.contains(entity, other),
            pairs.references(entity) || pairs.references(other),
        )
    }

    fn purge(&self, index: EntityIndex) {
        self.remove_pairs(index);
    }

    fn clear(&self) {
        self.pairs.write().clear();
    }
}

/// Group of entities judged among themselves
///
/// Prevent: members never collide with each other. Allow: members only
/// collide with each other.
#[derive(Debug, Default)]
pub struct CollisionSet {
    mode: RuleMode,
    solid_only: bool,
    members: RwLock<HashSet<EntityIndex>>,
}

impl CollisionSet {
    pub fn new(mode: RuleMode, solid_only: bool) -> Self {
        Self {
            mode,
            solid_only,
            members: RwLock::default(),
        }
    }

    pub fn add(&self, index: EntityIndex) -> bool {
        self.members.write().insert(index)
    }

    pub fn remove(&self, index: EntityIndex) -> bool {
        self.members.write().remove(&index)
    }

    pub fn contains(&self, index: EntityIndex) -> bool {
        self.members.read().contains(&index)
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CollisionRules for CollisionSet {
    fn mode(&self) -> RuleMode {
        self.mode
    }

    fn solid_only(&self) -> bool {
        self.solid_only
    }

    fn should_collide(&self, entity: EntityIndex, other: EntityIndex) -> bool {
        let members = self.members.read();
        let (a, b) = (members.contains(&entity), members.contains(&other));
        self.mode.allows(a && b, a || b)
    }

    fn purge(&self, index: EntityIndex) {
        self.remove(index);
    }

    fn clear(&self) {
        self.members.write().clear();
    }
}

/// Per-entity sets of related entities
///
/// A relationship is listed when either side has the other in its set.
#[derive(Debug, Default)]
pub struct CollisionMap {
    mode: RuleMode,
    solid_only: bool,
    map: RwLock<SetMap>,
}

impl CollisionMap {
    pub fn new(mode: RuleMode, solid_only: bool) -> Self {
        Self {
            mode,
            solid_only,
            map: RwLock::default(),
        }
    }

    pub fn add(&self, entity: EntityIndex, other: EntityIndex) -> bool {
        self.map.write().insert(entity, other)
    }

    pub fn remove(&self, entity: EntityIndex, other: EntityIndex) -> bool {
        self.map.write().remove(entity, other)
    }

    /// Drop `entity`'s whole set
    pub fn remove_entity(&self, entity: EntityIndex) -> bool {
        self.map.write().remove_key(entity)
    }

    /// Entities in `entity`'s set, ascending
    pub fn get(&self, entity: EntityIndex) -> Vec<EntityIndex> {
        self.map.read().get(entity)
    }

    pub fn contains(&self, entity: EntityIndex, other: EntityIndex) -> bool {
        self.map.read().contains(entity, other)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CollisionRules for CollisionMap {
    fn mode(&self) -> RuleMode {
        self.mode
    }

    fn solid_only(&self) -> bool {
        self.solid_only
    }

    fn should_collide(&self, entity: EntityIndex, other: EntityIndex) -> bool {
        let map = self.map.read();
        self.mode.allows(
            map.contains(entity, other) || map.contains(other, entity),
            map.has_key(entity) || map.has_key(other),
        )
    }

    fn purge(&self, index: EntityIndex) {
        self.map.write().purge(index);
    }

    fn clear(&self) {
        self.map.write().clear();
    }
}
