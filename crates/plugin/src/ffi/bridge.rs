//! Entity lookups supplied by the host as C function pointers

use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicU64, Ordering};

use sourcebind_core::entities::EntityBridge;
use sourcebind_core::memory::Pointer;
use sourcebind_sdk::{EntityIndex, MAX_EDICTS};

/// Index lookup; a negative result means "no entity"
pub type IndexLookupFn = unsafe extern "C" fn(*mut c_void) -> c_int;

/// Engine callbacks the rule managers need
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SourcebindEntityBridge {
    /// Number of entity slots, 0 for the engine default
    pub max_entities: c_int,
    /// Number of player slots
    pub max_clients: c_int,
    /// `IHandleEntity*` to entity index
    pub index_from_handle_entity: Option<IndexLookupFn>,
    /// `edict_t*` to entity index
    pub index_from_edict: Option<IndexLookupFn>,
}

/// Game frames seen through `sourcebind_on_game_frame`
static FRAME: AtomicU64 = AtomicU64::new(1);

pub(crate) fn advance_frame() -> u64 {
    FRAME.fetch_add(1, Ordering::AcqRel) + 1
}

/// [`EntityBridge`] over a [`SourcebindEntityBridge`]
pub struct FfiEntityBridge {
    raw: SourcebindEntityBridge,
}

impl FfiEntityBridge {
    /// Both lookups are required
    pub fn new(raw: SourcebindEntityBridge) -> Option<Self> {
        if raw.index_from_handle_entity.is_none() || raw.index_from_edict.is_none() {
            return None;
        }
        if raw.max_clients < 0 || raw.max_entities < 0 {
            return None;
        }
        Some(Self { raw })
    }

    fn lookup(function: Option<IndexLookupFn>, pointer: Pointer) -> Option<EntityIndex> {
        let function = function?;
        if pointer.is_null() {
            return None;
        }
        let index = unsafe { function(pointer.as_mut_ptr()) };
        EntityIndex::try_from(index).ok()
    }
}

impl EntityBridge for FfiEntityBridge {
    fn max_entities(&self) -> usize {
        match self.raw.max_entities {
            0 => MAX_EDICTS,
            n => n as usize,
        }
    }

    fn max_clients(&self) -> usize {
        self.raw.max_clients as usize
    }

    fn index_from_handle_entity(&self, entity: Pointer) -> Option<EntityIndex> {
        Self::lookup(self.raw.index_from_handle_entity, entity)
    }

    fn index_from_edict(&self, edict: Pointer) -> Option<EntityIndex> {
        Self::lookup(self.raw.index_from_edict, edict)
    }

    fn tick(&self) -> u64 {
        FRAME.load(Ordering::Acquire)
    }
}
