//! Relationship storage shared by collision and transmit rules
//!
//! A rule only judges relationships involving entities it references:
//!
//! | mode | listed relationship | unlisted, entity referenced | entity not referenced |
//! |---|---|---|---|
//! | [`RuleMode::Prevent`] | veto | pass | pass |
//! | [`RuleMode::Allow`] | pass | veto | pass |

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use sourcebind_sdk::EntityIndex;

new_key_type! {
    /// Key of a registered rule or listener
    pub struct RuleKey;
}

/// How a rule treats the relationships it lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    /// Only listed relationships are allowed for referenced entities
    Allow,
    /// Listed relationships are vetoed
    #[default]
    Prevent,
}

impl RuleMode {
    /// Verdict for a relationship: `listed` in the rule, `referenced` entity
    pub fn allows(self, listed: bool, referenced: bool) -> bool {
        match self {
            RuleMode::Prevent => !listed,
            RuleMode::Allow => listed || !referenced,
        }
    }
}

impl fmt::Display for RuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleMode::Allow => f.write_str("allow"),
            RuleMode::Prevent => f.write_str("prevent"),
        }
    }
}

impl FromStr for RuleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(RuleMode::Allow),
            "prevent" => Ok(RuleMode::Prevent),
            other => Err(format!("unknown rule mode: {}", other)),
        }
    }
}

fn ordered(a: EntityIndex, b: EntityIndex) -> (EntityIndex, EntityIndex) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Unordered entity pairs with a reference count per entity
#[derive(Debug, Default, Clone)]
pub(crate) struct PairTable {
    pairs: HashSet<(EntityIndex, EntityIndex)>,
    references: HashMap<EntityIndex, usize>,
}

impl PairTable {
    pub fn insert(&mut self, a: EntityIndex, b: EntityIndex) -> bool {
        if !self.pairs.insert(ordered(a, b)) {
            return false;
        }
        *self.references.entry(a).or_default() += 1;
        if a != b {
            *self.references.entry(b).or_default() += 1;
        }
        true
    }

    pub fn remove(&mut self, a: EntityIndex, b: EntityIndex) -> bool {
        if !self.pairs.remove(&ordered(a, b)) {
            return false;
        }
        self.release(a);
        if a != b {
            self.release(b);
        }
        true
    }

    fn release(&mut self, index: EntityIndex) {
        if let Some(count) = self.references.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                self.references.remove(&index);
            }
        }
    }

    pub fn contains(&self, a: EntityIndex, b: EntityIndex) -> bool {
        self.pairs.contains(&ordered(a, b))
    }

    pub fn references(&self, index: EntityIndex) -> bool {
        self.references.contains_key(&index)
    }

    /// Drop every pair involving `index`
    pub fn purge(&mut self, index: EntityIndex) {
        if self.references.remove(&index).is_none() {
            return;
        }
        let stale: Vec<_> = self
            .pairs
            .iter()
            .filter(|(a, b)| *a == index || *b == index)
            .copied()
            .collect();
        for (a, b) in stale {
            self.pairs.remove(&(a, b));
            let other = if a == index { b } else { a };
            if other != index {
                self.release(other);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.references.clear();
    }
}

/// Entity index to set of related indices
#[derive(Debug, Default, Clone)]
pub(crate) struct SetMap {
    entries: HashMap<EntityIndex, HashSet<EntityIndex>>,
}

impl SetMap {
    pub fn insert(&mut self, key: EntityIndex, other: EntityIndex) -> bool {
        self.entries.entry(key).or_default().insert(other)
    }

    pub fn remove(&mut self, key: EntityIndex, other: EntityIndex) -> bool {
        let Some(set) = self.entries.get_mut(&key) else {
            return false;
        };
        let removed = set.remove(&other);
        if set.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    /// Remove `key` and its whole set
    pub fn remove_key(&mut self, key: EntityIndex) -> bool {
        self.entries.remove(&key).is_some()
    }

    pub fn contains(&self, key: EntityIndex, other: EntityIndex) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|set| set.contains(&other))
    }

    pub fn has_key(&self, key: EntityIndex) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn get(&self, key: EntityIndex) -> Vec<EntityIndex> {
        let mut members: Vec<_> = self
            .entries
            .get(&key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Drop `index` as a key and from every set
    pub fn purge(&mut self, index: EntityIndex) {
        self.entries.remove(&index);
        self.entries.retain(|_, set| {
            set.remove(&index);
            !set.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_verdicts() {
        assert!(!RuleMode::Prevent.allows(true, true));
        assert!(RuleMode::Prevent.allows(false, true));
        assert!(RuleMode::Prevent.allows(false, false));

        assert!(RuleMode::Allow.allows(true, true));
        assert!(!RuleMode::Allow.allows(false, true));
        assert!(RuleMode::Allow.allows(false, false));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("ALLOW".parse(), Ok(RuleMode::Allow));
        assert_eq!("prevent".parse(), Ok(RuleMode::Prevent));
        assert!("block".parse::<RuleMode>().is_err());
        assert_eq!(RuleMode::default(), RuleMode::Prevent);
    }

    #[test]
    fn test_pairs_are_unordered() {
        let mut pairs = PairTable::default();
        assert!(pairs.insert(3, 1));
        assert!(!pairs.insert(1, 3));
        assert!(pairs.contains(1, 3));
        assert!(pairs.references(3));
        assert!(!pairs.references(2));

        assert!(pairs.remove(3, 1));
        assert!(!pairs.references(1));
        assert_eq!(pairs.len(), 0);
    }

    #[test]
    fn test_pair_purge_releases_partners() {
        let mut pairs = PairTable::default();
        pairs.insert(1, 2);
        pairs.insert(2, 3);
        pairs.insert(4, 4);
        pairs.purge(2);

        assert!(!pairs.references(2));
        assert!(!pairs.references(1));
        assert!(!pairs.references(3));
        assert!(pairs.contains(4, 4));
        assert_eq!(pairs.len(), 1);

        pairs.purge(4);
        assert_eq!(pairs.len(), 0);
        assert!(!pairs.references(4));
    }

    #[test]
    fn test_set_map_purge() {
        let mut map = SetMap::default();
        map.insert(1, 2);
        map.insert(1, 3);
        map.insert(5, 2);
        assert_eq!(map.get(1), vec![2, 3]);

        map.purge(2);
        assert!(!map.has_key(5));
        assert_eq!(map.get(1), vec![3]);

        assert!(map.remove(1, 3));
        assert!(!map.has_key(1));
        assert_eq!(map.len(), 0);
    }
}
