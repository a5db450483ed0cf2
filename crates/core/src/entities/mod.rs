//! Engine entity lookups used by the rule managers
//!
//! The managers never touch engine entity structures themselves. Everything
//! engine-specific (how an `IHandleEntity*` or an edict maps to an index,
//! which slots are players, the current simulation tick) sits behind
//! [`EntityBridge`], which the host installs once it knows the engine.
//!
//! ```ignore
//! use sourcebind_core::entities::EntityBridge;
//!
//! struct Engine;
//!
//! impl EntityBridge for Engine {
//!     fn max_clients(&self) -> usize { 64 }
//!     fn index_from_handle_entity(&self, entity: Pointer) -> Option<EntityIndex> { ... }
//!     fn index_from_edict(&self, edict: Pointer) -> Option<EntityIndex> { ... }
//!     fn tick(&self) -> u64 { ... }
//! }
//!
//! init_runtime(CoreConfig::default()).set_entity_bridge(Arc::new(Engine));
//! ```

mod cache;

use std::sync::Arc;

use parking_lot::RwLock;
use sourcebind_memory::Pointer;
use sourcebind_sdk::{EntityIndex, MAX_EDICTS, WORLD_INDEX};

pub use cache::EpochCache;

/// Engine-specific entity queries
pub trait EntityBridge: Send + Sync {
    /// Number of entity slots caches are sized for
    fn max_entities(&self) -> usize {
        MAX_EDICTS
    }

    /// Number of player slots; players use indices `1..=max_clients`
    fn max_clients(&self) -> usize;

    /// Index of the entity behind an `IHandleEntity*`
    fn index_from_handle_entity(&self, entity: Pointer) -> Option<EntityIndex>;

    /// Index of the entity owning an edict
    fn index_from_edict(&self, edict: Pointer) -> Option<EntityIndex>;

    fn is_player(&self, index: EntityIndex) -> bool {
        index != WORLD_INDEX && (index as usize) <= self.max_clients()
    }

    /// Current simulation tick, the epoch of every per-tick cache
    fn tick(&self) -> u64;
}

/// Slot holding the installed bridge, shared by the managers of a context
#[derive(Default)]
pub struct BridgeCell {
    bridge: RwLock<Option<Arc<dyn EntityBridge>>>,
}

impl BridgeCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, bridge: Arc<dyn EntityBridge>) {
        *self.bridge.write() = Some(bridge);
    }

    pub fn clear(&self) {
        *self.bridge.write() = None;
    }

    pub fn get(&self) -> Option<Arc<dyn EntityBridge>> {
        self.bridge.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.bridge.read().is_some()
    }
}

impl std::fmt::Debug for BridgeCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeCell")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Bridge whose handle entities and edicts are their own index
    pub struct TestBridge {
        pub max_clients: usize,
        pub tick: AtomicU64,
    }

    impl TestBridge {
        pub fn new(max_clients: usize) -> Arc<Self> {
            Arc::new(Self {
                max_clients,
                tick: AtomicU64::new(1),
            })
        }

        pub fn advance(&self) {
            self.tick.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl EntityBridge for TestBridge {
        fn max_entities(&self) -> usize {
            256
        }

        fn max_clients(&self) -> usize {
            self.max_clients
        }

        fn index_from_handle_entity(&self, entity: Pointer) -> Option<EntityIndex> {
            (entity.address() < self.max_entities()).then_some(entity.address() as EntityIndex)
        }

        fn index_from_edict(&self, edict: Pointer) -> Option<EntityIndex> {
            self.index_from_handle_entity(edict)
        }

        fn tick(&self) -> u64 {
            self.tick.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestBridge;
    use super::*;

    #[test]
    fn test_is_player_excludes_world() {
        let bridge = TestBridge::new(4);
        assert!(!bridge.is_player(0));
        assert!(bridge.is_player(1));
        assert!(bridge.is_player(4));
        assert!(!bridge.is_player(5));
    }

    #[test]
    fn test_bridge_cell() {
        let cell = BridgeCell::new();
        assert!(cell.get().is_none());
        cell.set(TestBridge::new(2));
        assert_eq!(cell.get().map(|b| b.max_clients()), Some(2));
        cell.clear();
        assert!(!cell.is_set());
    }
}
