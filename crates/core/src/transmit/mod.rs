//! Transmit manager
//!
//! Hides entities from clients by clearing bits in the engine's transmit
//! bit vector after `CheckTransmit` filled it.
//!
//! ```text
//! CCheckTransmitInfo
//! ┌──────────────────────┐
//! │ client edict*        │ ← client_offset
//! │ …                    │
//! │ CBitVec* transmit    │ ← transmit_bits_offset
//! └──────────────────────┘
//! ```
//!
//! For every set bit the verdict is taken from, in order, the transmit
//! hooks, the rules and the listeners; the first veto clears the bit. The
//! world is always transmitted and a client always receives itself.
//! Verdicts are cached per client for the current tick.

mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sourcebind_memory::Pointer;
use sourcebind_sdk::{EntityIndex, Phase, TypeTag, WORLD_INDEX};

use crate::call::CallableFunction;
use crate::config::TransmitConfig;
use crate::entities::{BridgeCell, EntityBridge, EpochCache};
use crate::hooks::{HookAction, HookCallback, HookContext, HookError, HookHandle, HookManager};
use crate::registry::{OrderedRegistry, Registration};
use crate::rules::RuleKey;

pub use rules::{TransmitMap, TransmitPairs, TransmitRules, TransmitSet};

/// One transmit question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitQuery {
    pub client: EntityIndex,
    pub entity: EntityIndex,
}

/// Callback deciding a transmission; `false` hides the entity
pub type TransmitCallback = Arc<dyn Fn(&TransmitQuery) -> bool + Send + Sync>;

#[derive(Default)]
struct State {
    references: usize,
    check_transmit: Option<CallableFunction>,
    handle: Option<HookHandle>,
}

struct Inner {
    hooks: Arc<HookManager>,
    bridge: Arc<BridgeCell>,
    config: TransmitConfig,
    state: Mutex<State>,
    rules: Mutex<OrderedRegistry<RuleKey, Arc<dyn TransmitRules>>>,
    transmit_hooks: Mutex<OrderedRegistry<RuleKey, TransmitCallback>>,
    listeners: Mutex<OrderedRegistry<RuleKey, TransmitCallback>>,
    caches: Mutex<HashMap<EntityIndex, EpochCache>>,
}

/// Rule-based entity visibility over the engine's transmit check
pub struct TransmitManager {
    inner: Arc<Inner>,
}

impl TransmitManager {
    pub fn new(hooks: Arc<HookManager>, bridge: Arc<BridgeCell>, config: TransmitConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                hooks,
                bridge,
                config,
                state: Mutex::default(),
                rules: Mutex::default(),
                transmit_hooks: Mutex::default(),
                listeners: Mutex::default(),
                caches: Mutex::default(),
            }),
        }
    }

    /// Use `function` as the engine's `CheckTransmit`
    ///
    /// Replaces a previous function; hooked immediately when enabled.
    pub fn set_check_transmit(&self, function: CallableFunction) -> Result<(), HookError> {
        let info_arg = self.inner.config.check_transmit_info_arg;
        if function.signature().args().get(info_arg) != Some(&TypeTag::Pointer) {
            return Err(HookError::ArgumentIndex(info_arg));
        }

        let mut state = self.inner.state.lock();
        if let Some(handle) = state.handle.take() {
            self.inner.hooks.remove_hook(&handle);
        }
        if state.references > 0 {
            state.handle = Some(Inner::install(&self.inner, &function)?);
        }
        tracing::debug!("CheckTransmit set to {}", function.address());
        state.check_transmit = Some(function);
        Ok(())
    }

    /// Register a rule; dropping the registration unregisters it
    pub fn register_rule(&self, rule: Arc<dyn TransmitRules>) -> Registration {
        let key = self.inner.rules.lock().insert(rule);
        self.inner.acquire();
        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.rules.lock().remove(key);
                inner.release();
            }
        })
    }

    /// Callback consulted before any rule
    pub fn add_transmit_hook<F>(&self, callback: F) -> Registration
    where
        F: Fn(&TransmitQuery) -> bool + Send + Sync + 'static,
    {
        self.listen(|inner| &inner.transmit_hooks, Arc::new(callback))
    }

    /// Callback consulted after the rules
    pub fn add_listener<F>(&self, callback: F) -> Registration
    where
        F: Fn(&TransmitQuery) -> bool + Send + Sync + 'static,
    {
        self.listen(|inner| &inner.listeners, Arc::new(callback))
    }

    fn listen(
        &self,
        list: fn(&Inner) -> &Mutex<OrderedRegistry<RuleKey, TransmitCallback>>,
        callback: TransmitCallback,
    ) -> Registration {
        let key = list(&self.inner).lock().insert(callback);
        self.inner.acquire();
        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                list(&inner).lock().remove(key);
                inner.release();
            }
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().references > 0
    }

    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().references
    }

    pub fn rule_count(&self) -> usize {
        self.inner.rules.lock().len()
    }

    /// Verdict for sending `entity` to `client` in the current tick
    pub fn should_transmit(&self, client: EntityIndex, entity: EntityIndex) -> bool {
        match self.inner.bridge.get() {
            Some(bridge) => self.inner.evaluate(&*bridge, client, entity),
            None => true,
        }
    }

    /// Clear the bits of entities hidden from `client`
    ///
    /// # Safety
    /// `bits` must point to a transmit bit vector covering the bridge's
    /// `max_entities`.
    pub unsafe fn filter_transmit_bits(&self, client: EntityIndex, bits: Pointer) {
        if let Some(bridge) = self.inner.bridge.get() {
            self.inner.filter_bits(&*bridge, client, bits);
        }
    }

    /// Drop every cached verdict, e.g. after editing a rule
    pub fn invalidate(&self) {
        self.inner.caches.lock().clear();
    }

    pub fn on_entity_deleted(&self, index: EntityIndex) {
        let rules = self.inner.rules.lock().snapshot();
        for rule in rules {
            rule.purge(index);
        }
        let mut caches = self.inner.caches.lock();
        caches.remove(&index);
        for cache in caches.values_mut() {
            cache.invalidate(index);
        }
    }

    pub fn on_level_shutdown(&self) {
        let rules = self.inner.rules.lock().snapshot();
        for rule in rules {
            rule.clear();
        }
        self.inner.caches.lock().clear();
    }
}

impl Inner {
    fn acquire(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.references += 1;
        if state.references == 1 {
            if let Some(function) = state.check_transmit.clone() {
                match Self::install(self, &function) {
                    Ok(handle) => state.handle = Some(handle),
                    Err(e) => tracing::error!(
                        "Failed to hook CheckTransmit {}: {}",
                        function.address(),
                        e
                    ),
                }
            }
            tracing::info!("Transmit manager enabled");
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.references = state.references.saturating_sub(1);
        if state.references == 0 {
            if let Some(handle) = state.handle.take() {
                self.hooks.remove_hook(&handle);
            }
            self.caches.lock().clear();
            tracing::info!("Transmit manager disabled");
        }
    }

    fn install(this: &Arc<Self>, function: &CallableFunction) -> Result<HookHandle, HookError> {
        let weak = Arc::downgrade(this);
        let callback: HookCallback = Arc::new(move |ctx: &mut HookContext<'_>| {
            if let Some(inner) = weak.upgrade() {
                inner.check_transmit(ctx);
            }
            HookAction::Continue
        });
        this.hooks.add_hook(function, Phase::Post, callback)
    }

    fn check_transmit(&self, ctx: &HookContext<'_>) {
        let Some(bridge) = self.bridge.get() else {
            return;
        };
        let Some(info) = ctx
            .argument(self.config.check_transmit_info_arg)
            .ok()
            .and_then(|v| v.as_pointer())
            .filter(|p| !p.is_null())
        else {
            return;
        };

        // SAFETY: CheckTransmit received a live CCheckTransmitInfo
        let (client, bits) = unsafe {
            let Ok(edict) = info.get_pointer(self.config.client_offset) else {
                return;
            };
            let Ok(bits) = info.get_pointer(self.config.transmit_bits_offset) else {
                return;
            };
            (edict, bits)
        };
        let Some(client) = bridge.index_from_edict(client) else {
            return;
        };
        if bits.is_null() {
            return;
        }

        unsafe { self.filter_bits(&*bridge, client, bits) };
    }

    unsafe fn filter_bits(&self, bridge: &dyn EntityBridge, client: EntityIndex, bits: Pointer) {
        let words = bridge.max_entities().div_ceil(32);
        for word_index in 0..words {
            let offset = (word_index * 4) as isize;
            let Ok(word) = bits.get::<u32>(offset) else {
                return;
            };
            if word == 0 {
                continue;
            }

            let mut kept = word;
            let mut pending = word;
            while pending != 0 {
                let bit = pending.trailing_zeros();
                pending &= pending - 1;
                let entity = (word_index * 32) as EntityIndex + bit;
                if !self.evaluate(bridge, client, entity) {
                    kept &= !(1 << bit);
                }
            }

            if kept != word {
                if let Err(e) = bits.set::<u32>(kept, offset) {
                    tracing::warn!("Failed to update transmit bits: {}", e);
                    return;
                }
            }
        }
    }

    fn evaluate(&self, bridge: &dyn EntityBridge, client: EntityIndex, entity: EntityIndex) -> bool {
        if entity == WORLD_INDEX || entity == client {
            return true;
        }

        let epoch = bridge.tick();
        if let Some(cached) = self
            .caches
            .lock()
            .get_mut(&client)
            .and_then(|cache| cache.get(entity, epoch))
        {
            return cached;
        }

        let query = TransmitQuery { client, entity };
        let verdict = self.decide(&query);

        self.caches
            .lock()
            .entry(client)
            .or_insert_with(|| EpochCache::new(bridge.max_entities()))
            .set(entity, verdict, epoch);
        verdict
    }

    fn decide(&self, query: &TransmitQuery) -> bool {
        let hooks = self.transmit_hooks.lock().snapshot();
        if !hooks.iter().all(|hook| hook(query)) {
            return false;
        }

        let rules = self.rules.lock().snapshot();
        if !rules
            .iter()
            .all(|rule| rule.should_transmit(query.client, query.entity))
        {
            return false;
        }

        let listeners = self.listeners.lock().snapshot();
        listeners.iter().all(|listener| listener(query))
    }
}

impl std::fmt::Debug for TransmitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransmitManager")
            .field("references", &state.references)
            .field("hooked", &state.handle.is_some())
            .finish()
    }
}
