//! Transmit rules
//!
//! Relationships are directed: an entity is transmitted to a client.

use std::collections::HashSet;

use parking_lot::RwLock;
use sourcebind_sdk::EntityIndex;

use crate::rules::{PairTable, RuleMode, SetMap};

/// A pluggable transmit verdict
pub trait TransmitRules: Send + Sync {
    fn mode(&self) -> RuleMode;

    /// `false` hides `entity` from `client`
    fn should_transmit(&self, client: EntityIndex, entity: EntityIndex) -> bool;

    fn purge(&self, index: EntityIndex);

    fn clear(&self);
}

/// Explicit (client, entity) pairs, stored unordered
#[derive(Debug, Default)]
pub struct TransmitPairs {
    mode: RuleMode,
    pairs: RwLock<PairTable>,
}

impl TransmitPairs {
    pub fn new(mode: RuleMode) -> Self {
        Self {
            mode,
            pairs: RwLock::default(),
        }
    }

    pub fn add_pair(&self, a: EntityIndex, b: EntityIndex) -> bool {
        self.pairs.write().insert(a, b)
    }

    pub fn remove_pair(&self, a: EntityIndex, b: EntityIndex) -> bool {
        self.pairs.write().remove(a, b)
    }

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

impl TransmitRules for TransmitPairs {
    fn mode(&self) -> RuleMode {
        self.mode
    }

    fn should_transmit(&self, client: EntityIndex, entity: EntityIndex) -> bool {
        let pairs = self.pairs.read();
        self.mode
            .allows(pairs.contains(client, entity), pairs.references(entity))
    }

    fn purge(&self, index: EntityIndex) {
        self.remove_pairs(index);
    }

    fn clear(&self) {
        self.pairs.write().clear();
    }
}

/// Group of entities and clients judged among themselves
///
/// Prevent: members are hidden from member clients. Allow: members are
/// only transmitted to member clients.
#[derive(Debug, Default)]
pub struct TransmitSet {
    mode: RuleMode,
    members: RwLock<HashSet<EntityIndex>>,
}

impl TransmitSet {
    pub fn new(mode: RuleMode) -> Self {
        Self {
            mode,
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

impl TransmitRules for TransmitSet {
    fn mode(&self) -> RuleMode {
        self.mode
    }

    fn should_transmit(&self, client: EntityIndex, entity: EntityIndex) -> bool {
        let members = self.members.read();
        let listed = members.contains(&entity);
        self.mode.allows(listed && members.contains(&client), listed)
    }

    fn purge(&self, index: EntityIndex) {
        self.remove(index);
    }

    fn clear(&self) {
        self.members.write().clear();
    }
}

/// Entity to the clients it concerns
#[derive(Debug, Default)]
pub struct TransmitMap {
    mode: RuleMode,
    map: RwLock<SetMap>,
}

impl TransmitMap {
    pub fn new(mode: RuleMode) -> Self {
        Self {
            mode,
            map: RwLock::default(),
        }
    }

    pub fn add(&self, entity: EntityIndex, client: EntityIndex) -> bool {
        self.map.write().insert(entity, client)
    }

    pub fn remove(&self, entity: EntityIndex, client: EntityIndex) -> bool {
        self.map.write().remove(entity, client)
    }

    pub fn remove_entity(&self, entity: EntityIndex) -> bool {
        self.map.write().remove_key(entity)
    }

    /// Clients listed for `entity`, ascending
    pub fn get(&self, entity: EntityIndex) -> Vec<EntityIndex> {
        self.map.read().get(entity)
    }

    pub fn contains(&self, entity: EntityIndex, client: EntityIndex) -> bool {
        self.map.read().contains(entity, client)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransmitRules for TransmitMap {
    fn mode(&self) -> RuleMode {
        self.mode
    }

    fn should_transmit(&self, client: EntityIndex, entity: EntityIndex) -> bool {
        let map = self.map.read();
        self.mode
            .allows(map.contains(entity, client), map.has_key(entity))
    }

    fn purge(&self, index: EntityIndex) {
        self.map.write().purge(index);
    }

    fn clear(&self) {
        self.map.write().clear();
    }
}
