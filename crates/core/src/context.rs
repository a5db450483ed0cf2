//! Process-wide native runtime
//!
//! [`NativeRuntimeContext`] owns every registry the framework needs: loaded
//! binary images, installed hooks, the entity bridge and both rule managers.
//! The plugin layer uses the shared instance from [`runtime`]; tests build
//! their own contexts.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use sourcebind_memory::BinaryImageRegistry;
use sourcebind_sdk::EntityIndex;
use tracing::{info, warn};

use crate::collisions::CollisionManager;
use crate::config::{gamedata_dir, CoreConfig};
use crate::entities::{BridgeCell, EntityBridge};
use crate::gamedata::{Gamedata, GamedataError};
use crate::hooks::HookManager;
use crate::rtti::{self, RttiBackend};
use crate::transmit::TransmitManager;

/// Owner of all native registries
pub struct NativeRuntimeContext {
    config: CoreConfig,
    images: BinaryImageRegistry,
    hooks: Arc<HookManager>,
    bridge: Arc<BridgeCell>,
    collisions: CollisionManager,
    transmit: TransmitManager,
    gamedata: RwLock<Option<Arc<Gamedata>>>,
}

impl NativeRuntimeContext {
    /// Build a context with the platform RTTI backend
    pub fn new(config: CoreConfig) -> Self {
        let rtti = match rtti::platform() {
            Ok(backend) => Some(Arc::new(backend) as Arc<dyn RttiBackend>),
            Err(e) => {
                warn!("RTTI unavailable, trace filters will not be intercepted: {}", e);
                None
            }
        };
        Self::with_rtti(config, rtti)
    }

    /// Build a context with an explicit RTTI backend
    pub fn with_rtti(config: CoreConfig, rtti: Option<Arc<dyn RttiBackend>>) -> Self {
        let hooks = Arc::new(HookManager::new());
        let bridge = Arc::new(BridgeCell::new());

        let collisions = CollisionManager::new(
            Arc::clone(&hooks),
            Arc::clone(&bridge),
            rtti,
            config.collision.clone(),
        );
        let transmit =
            TransmitManager::new(Arc::clone(&hooks), Arc::clone(&bridge), config.transmit.clone());

        Self {
            config,
            images: BinaryImageRegistry::new(),
            hooks,
            bridge,
            collisions,
            transmit,
            gamedata: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn images(&self) -> &BinaryImageRegistry {
        &self.images
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    pub fn collisions(&self) -> &CollisionManager {
        &self.collisions
    }

    pub fn transmit(&self) -> &TransmitManager {
        &self.transmit
    }

    pub fn gamedata(&self) -> Option<Arc<Gamedata>> {
        self.gamedata.read().clone()
    }

    /// Install the engine lookups used by the rule managers
    pub fn set_entity_bridge(&self, bridge: Arc<dyn EntityBridge>) {
        self.bridge.set(bridge);
        self.collisions.invalidate();
        self.transmit.invalidate();
        info!("Entity bridge installed");
    }

    pub fn clear_entity_bridge(&self) {
        self.bridge.clear();
    }

    pub fn has_entity_bridge(&self) -> bool {
        self.bridge.is_set()
    }

    pub fn on_entity_deleted(&self, index: EntityIndex) {
        self.collisions.on_entity_deleted(index);
        self.transmit.on_entity_deleted(index);
    }

    pub fn on_level_shutdown(&self) {
        self.collisions.on_level_shutdown();
        self.transmit.on_level_shutdown();
    }

    /// Load the configured gamedata directory and wire the manager hooks
    pub fn load_gamedata(&self) -> Result<Arc<Gamedata>, GamedataError> {
        let dir = gamedata_dir(&self.config.gamedata_path)?;
        self.load_gamedata_from(&dir)
    }

    /// Load gamedata from `dir` and wire the manager hooks
    pub fn load_gamedata_from(&self, dir: &Path) -> Result<Arc<Gamedata>, GamedataError> {
        let gamedata = Arc::new(Gamedata::load_from_dir(dir)?);
        self.apply_gamedata(&gamedata);
        *self.gamedata.write() = Some(Arc::clone(&gamedata));
        Ok(gamedata)
    }

    /// Register the configured trace and transmit functions
    ///
    /// Entries that fail to resolve are logged and skipped; the returned
    /// count is the number registered.
    pub fn apply_gamedata(&self, gamedata: &Gamedata) -> usize {
        let mut registered = 0;

        for trace in &self.config.collision.traces {
            let result = gamedata
                .function(&trace.function, &self.images)
                .and_then(|function| {
                    self.collisions
                        .register_hook(function, trace.filter_arg, trace.mask_arg)
                        .map_err(|e| GamedataError::ScanFailed(format!("{}: {}", trace.function, e)))
                });
            match result {
                Ok(()) => registered += 1,
                Err(e) => warn!("Trace hook {} unavailable: {}", trace.function, e),
            }
        }

        let name = &self.config.transmit.check_transmit;
        if gamedata.has_function(name) {
            let result = gamedata.function(name, &self.images).and_then(|function| {
                self.transmit
                    .set_check_transmit(function)
                    .map_err(|e| GamedataError::ScanFailed(format!("{}: {}", name, e)))
            });
            match result {
                Ok(()) => registered += 1,
                Err(e) => warn!("Transmit hook {} unavailable: {}", name, e),
            }
        }

        info!("Registered {} gamedata hooks", registered);
        registered
    }

    /// Remove every hook this context installed
    pub fn shutdown(&self) {
        self.on_level_shutdown();
        self.hooks.unhook_all();
        self.bridge.clear();
        info!("Native runtime shut down");
    }
}

impl std::fmt::Debug for NativeRuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRuntimeContext")
            .field("images", &self.images.len())
            .field("hooks", &self.hooks.hooks().len())
            .field("bridge", &self.bridge)
            .field("collisions", &self.collisions)
            .field("transmit", &self.transmit)
            .finish()
    }
}

static RUNTIME: OnceLock<NativeRuntimeContext> = OnceLock::new();

/// Create the shared context, or return it if it already exists
pub fn init_runtime(config: CoreConfig) -> &'static NativeRuntimeContext {
    RUNTIME.get_or_init(|| NativeRuntimeContext::new(config))
}

/// The shared context, if [`init_runtime`] has run
pub fn runtime() -> Option<&'static NativeRuntimeContext> {
    RUNTIME.get()
}
