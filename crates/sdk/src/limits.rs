//! Engine-wide limits and masks
//!
//! Derived from the Source SDK headers (`const.h`, `bspflags.h`).

/// Entity index bits (11 bits = 2048 networked entities)
pub const MAX_EDICT_BITS: u32 = 11;

/// Maximum number of networked entities
pub const MAX_EDICTS: usize = 1 << MAX_EDICT_BITS;

/// Maximum number of player slots
pub const MAX_PLAYERS: usize = 64;

/// Index of the world entity
pub const WORLD_INDEX: u32 = 0;

/// Entity slot index
pub type EntityIndex = u32;

/// Contents flags used by trace masks
pub mod contents {
    pub const EMPTY: u32 = 0x0;
    pub const SOLID: u32 = 0x1;
    pub const WINDOW: u32 = 0x2;
    pub const AUX: u32 = 0x4;
    pub const GRATE: u32 = 0x8;
    pub const SLIME: u32 = 0x10;
    pub const WATER: u32 = 0x20;
    pub const MOVEABLE: u32 = 0x4000;
    pub const PLAYERCLIP: u32 = 0x10000;
    pub const MONSTERCLIP: u32 = 0x20000;
    pub const MONSTER: u32 = 0x2000000;
    pub const DEBRIS: u32 = 0x4000000;
    pub const HITBOX: u32 = 0x40000000;
}

/// Contents that make a trace "solid" for solid-only rules
pub const MASK_SOLID_CONTENTS: u32 =
    contents::SOLID | contents::WINDOW | contents::GRATE | contents::MOVEABLE;
