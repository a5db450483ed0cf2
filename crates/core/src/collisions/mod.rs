//! Collision manager
//!
//! Decides whether two entities may collide during engine traces.
//!
//! ```text
//! TraceRay(…, mask, filter, …)          pre:  push CollisionScope
//!   └─ filter->ShouldHitEntity(other)   pre:  should_collide(pass, other)
//!                                              └─ false: return false, skip original
//! TraceRay returns                      post: pop CollisionScope
//! ```
//!
//! A trace is only intercepted when its filter is a `CTraceFilterSimple`
//! (checked once per filter vtable through RTTI) with a valid pass entity.
//! Verdicts are evaluated in this order, the first veto wins:
//! 1. collision hooks
//! 2. rules, in registration order
//! 3. player listeners, when both entities are players
//! 4. entity listeners
//!
//! Results are cached per (pass entity, solid trace) for the current tick.
//! Hooks are installed while at least one rule or callback is registered.

mod rules;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use sourcebind_memory::Pointer;
use sourcebind_sdk::{EntityIndex, Phase, TypeTag};

use crate::call::{CallableFunction, DynValue};
use crate::config::CollisionConfig;
use crate::entities::{BridgeCell, EntityBridge, EpochCache};
use crate::hooks::{HookAction, HookCallback, HookContext, HookError, HookHandle, HookManager};
use crate::registry::{OrderedRegistry, Registration};
use crate::rtti::RttiBackend;
use crate::rules::RuleKey;

pub use rules::{CollisionMap, CollisionPairs, CollisionRules, CollisionSet};

/// Signature of `ShouldHitEntity(this, IHandleEntity*, contentsMask) -> bool`
const SHOULD_HIT_ENTITY: &str = "ppi)B";

/// One collision question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionQuery {
    /// Pass entity of the trace
    pub entity: EntityIndex,
    pub other: EntityIndex,
    pub mask: u32,
    pub solid: bool,
}

/// Callback deciding a collision; `false` vetoes
pub type CollisionCallback = Arc<dyn Fn(&CollisionQuery) -> bool + Send + Sync>;

/// State of one intercepted trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CollisionScope {
    skip: bool,
    filter: Pointer,
    entity: EntityIndex,
    mask: u32,
    solid: bool,
}

impl CollisionScope {
    const SKIPPED: CollisionScope = CollisionScope {
        skip: true,
        filter: Pointer::NULL,
        entity: 0,
        mask: 0,
        solid: false,
    };
}

/// A hooked trace entry point
struct TraceHook {
    function: CallableFunction,
    filter_arg: usize,
    mask_arg: usize,
    handles: Vec<HookHandle>,
}

#[derive(Default)]
struct State {
    references: usize,
    traces: Vec<TraceHook>,
    /// Hooked `ShouldHitEntity` implementations
    filters: HashMap<Pointer, HookHandle>,
}

struct Inner {
    hooks: Arc<HookManager>,
    bridge: Arc<BridgeCell>,
    rtti: Option<Arc<dyn RttiBackend>>,
    config: CollisionConfig,
    state: Mutex<State>,
    rules: Mutex<OrderedRegistry<RuleKey, Arc<dyn CollisionRules>>>,
    collision_hooks: Mutex<OrderedRegistry<RuleKey, CollisionCallback>>,
    player_listeners: Mutex<OrderedRegistry<RuleKey, CollisionCallback>>,
    entity_listeners: Mutex<OrderedRegistry<RuleKey, CollisionCallback>>,
    caches: Mutex<HashMap<(EntityIndex, bool), EpochCache>>,
    /// Whether a filter vtable belongs to the intercepted filter class
    verdicts: Mutex<HashMap<Pointer, bool>>,
    scopes: Mutex<HashMap<ThreadId, Vec<CollisionScope>>>,
}

/// Rule-based collision filtering over hooked engine traces
pub struct CollisionManager {
    inner: Arc<Inner>,
}

impl CollisionManager {
    pub fn new(
        hooks: Arc<HookManager>,
        bridge: Arc<BridgeCell>,
        rtti: Option<Arc<dyn RttiBackend>>,
        config: CollisionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hooks,
                bridge,
                rtti,
                config,
                state: Mutex::default(),
                rules: Mutex::default(),
                collision_hooks: Mutex::default(),
                player_listeners: Mutex::default(),
                entity_listeners: Mutex::default(),
                caches: Mutex::default(),
                verdicts: Mutex::default(),
                scopes: Mutex::default(),
            }),
        }
    }

    /// Intercept traces through `function`
    ///
    /// `filter_arg` and `mask_arg` are the argument indices of the trace
    /// filter pointer and the contents mask. The hooks are installed now if
    /// the manager is enabled, otherwise on enable.
    pub fn register_hook(
        &self,
        function: CallableFunction,
        filter_arg: usize,
        mask_arg: usize,
    ) -> Result<(), HookError> {
        let args = function.signature().args();
        match args.get(filter_arg) {
            Some(TypeTag::Pointer) => {}
            _ => return Err(HookError::ArgumentIndex(filter_arg)),
        }
        match args.get(mask_arg) {
            Some(tag) if tag.is_integer() => {}
            _ => return Err(HookError::ArgumentIndex(mask_arg)),
        }

        let mut state = self.inner.state.lock();
        if state
            .traces
            .iter()
            .any(|t| t.function.address() == function.address())
        {
            return Ok(());
        }

        let mut trace = TraceHook {
            function,
            filter_arg,
            mask_arg,
            handles: Vec::new(),
        };
        if state.references > 0 {
            trace.handles = Inner::install_trace(&self.inner, &trace)?;
        }
        tracing::debug!("Registered collision trace hook {}", trace.function.address());
        state.traces.push(trace);
        Ok(())
    }

    /// Stop intercepting traces through `address`
    pub fn unregister_hook(&self, address: Pointer) -> bool {
        let mut state = self.inner.state.lock();
        let Some(position) = state
            .traces
            .iter()
            .position(|t| t.function.address() == address)
        else {
            return false;
        };
        let trace = state.traces.remove(position);
        for handle in &trace.handles {
            self.inner.hooks.remove_hook(handle);
        }
        true
    }

    /// Register a rule; dropping the registration unregisters it
    pub fn register_rule(&self, rule: Arc<dyn CollisionRules>) -> Registration {
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
    pub fn add_collision_hook<F>(&self, callback: F) -> Registration
    where
        F: Fn(&CollisionQuery) -> bool + Send + Sync + 'static,
    {
        self.listen(|inner| &inner.collision_hooks, Arc::new(callback))
    }

    /// Callback consulted when both entities are players
    pub fn add_player_listener<F>(&self, callback: F) -> Registration
    where
        F: Fn(&CollisionQuery) -> bool + Send + Sync + 'static,
    {
        self.listen(|inner| &inner.player_listeners, Arc::new(callback))
    }

    /// Callback consulted for every pair that passed the rules
    pub fn add_entity_listener<F>(&self, callback: F) -> Registration
    where
        F: Fn(&CollisionQuery) -> bool + Send + Sync + 'static,
    {
        self.listen(|inner| &inner.entity_listeners, Arc::new(callback))
    }

    fn listen(
        &self,
        list: fn(&Inner) -> &Mutex<OrderedRegistry<RuleKey, CollisionCallback>>,
        callback: CollisionCallback,
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

    /// Whether the hooks are installed
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().references > 0
    }

    /// Registered rules and callbacks
    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().references
    }

    pub fn rule_count(&self) -> usize {
        self.inner.rules.lock().len()
    }

    /// Verdict for `entity` tracing against `other` in the current tick
    ///
    /// Without an entity bridge nothing is vetoed.
    pub fn should_collide(&self, entity: EntityIndex, other: EntityIndex, mask: u32) -> bool {
        match self.inner.bridge.get() {
            Some(bridge) => {
                let solid = self.inner.is_solid(mask);
                self.inner.evaluate(&*bridge, entity, other, mask, solid)
            }
            None => true,
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
        caches.retain(|(entity, _), _| *entity != index);
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

    #[cfg(test)]
    fn scope_depth(&self) -> usize {
        self.inner.scopes.lock().values().map(Vec::len).sum()
    }
}

impl Inner {
    fn acquire(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.references += 1;
        if state.references == 1 {
            self.enable(&mut state);
        }
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.references = state.references.saturating_sub(1);
        if state.references == 0 {
            self.disable(&mut state);
        }
    }

    fn enable(self: &Arc<Self>, state: &mut State) {
        for trace in &mut state.traces {
            match Self::install_trace(self, trace) {
                Ok(handles) => trace.handles = handles,
                Err(e) => tracing::error!(
                    "Failed to hook collision trace {}: {}",
                    trace.function.address(),
                    e
                ),
            }
        }
        tracing::info!("Collision manager enabled");
    }

    fn disable(&self, state: &mut State) {
        for trace in &mut state.traces {
            for handle in trace.handles.drain(..) {
                self.hooks.remove_hook(&handle);
            }
        }
        for (_, handle) in state.filters.drain() {
            self.hooks.remove_hook(&handle);
        }
        self.caches.lock().clear();
        self.scopes.lock().clear();
        tracing::info!("Collision manager disabled");
    }

    fn install_trace(this: &Arc<Self>, trace: &TraceHook) -> Result<Vec<HookHandle>, HookError> {
        let (filter_arg, mask_arg) = (trace.filter_arg, trace.mask_arg);

        let weak = Arc::downgrade(this);
        let enter: HookCallback = Arc::new(move |ctx: &mut HookContext<'_>| {
            if let Some(inner) = weak.upgrade() {
                inner.enter_trace(ctx, filter_arg, mask_arg);
            }
            HookAction::Continue
        });
        let weak = Arc::downgrade(this);
        let leave: HookCallback = Arc::new(move |_: &mut HookContext<'_>| {
            if let Some(inner) = weak.upgrade() {
                inner.leave_trace();
            }
            HookAction::Continue
        });

        let pre = this.hooks.add_hook(&trace.function, Phase::Pre, enter)?;
        match this.hooks.add_hook(&trace.function, Phase::Post, leave) {
            Ok(post) => Ok(vec![pre, post]),
            Err(e) => {
                this.hooks.remove_hook(&pre);
                Err(e)
            }
        }
    }

    fn is_solid(&self, mask: u32) -> bool {
        mask & self.config.solid_mask == self.config.solid_mask
    }

    fn enter_trace(self: &Arc<Self>, ctx: &HookContext<'_>, filter_arg: usize, mask_arg: usize) {
        let scope = self
            .open_scope(ctx, filter_arg, mask_arg)
            .unwrap_or(CollisionScope::SKIPPED);
        self.scopes
            .lock()
            .entry(thread::current().id())
            .or_default()
            .push(scope);
    }

    fn leave_trace(&self) {
        let mut scopes = self.scopes.lock();
        let id = thread::current().id();
        if let Some(stack) = scopes.get_mut(&id) {
            stack.pop();
            if stack.is_empty() {
                scopes.remove(&id);
            }
        }
    }

    fn current_scope(&self) -> Option<CollisionScope> {
        self.scopes
            .lock()
            .get(&thread::current().id())
            .and_then(|stack| stack.last().copied())
    }

    fn open_scope(
        self: &Arc<Self>,
        ctx: &HookContext<'_>,
        filter_arg: usize,
        mask_arg: usize,
    ) -> Option<CollisionScope> {
        let bridge = self.bridge.get()?;
        let filter = ctx.argument(filter_arg).ok()?.as_pointer()?;
        let mask = ctx.argument(mask_arg).ok()?.as_u64()? as u32;
        if filter.is_null() {
            return None;
        }

        // SAFETY: the trace received `filter` as a live filter object
        let vtable = unsafe { filter.get_pointer(0) }.ok()?;
        if vtable.is_null() || !self.is_intercepted_filter(vtable) {
            return None;
        }
        let pass = unsafe { filter.get_pointer(self.config.pass_entity_offset) }.ok()?;
        if pass.is_null() {
            return None;
        }
        let entity = bridge.index_from_handle_entity(pass)?;

        let slot = (self.config.should_hit_entity_index * std::mem::size_of::<usize>()) as isize;
        let should_hit = unsafe { vtable.get_pointer(slot) }.ok()?;
        self.hook_filter(should_hit).ok()?;

        Some(CollisionScope {
            skip: false,
            filter,
            entity,
            mask,
            solid: self.is_solid(mask),
        })
    }

    /// RTTI check, once per vtable
    fn is_intercepted_filter(&self, vtable: Pointer) -> bool {
        if let Some(verdict) = self.verdicts.lock().get(&vtable) {
            return *verdict;
        }

        let verdict = match &self.rtti {
            // SAFETY: read from a live object's first slot
            Some(rtti) => match unsafe { rtti.resolve_vtable(vtable) } {
                Ok(info) => info.is_derived_from(&self.config.filter_class),
                Err(e) => {
                    tracing::debug!("No type information for filter vtable {}: {}", vtable, e);
                    false
                }
            },
            None => false,
        };
        tracing::debug!(
            "Filter vtable {} is{} a {}",
            vtable,
            if verdict { "" } else { " not" },
            self.config.filter_class
        );
        self.verdicts.lock().insert(vtable, verdict);
        verdict
    }

    fn hook_filter(self: &Arc<Self>, should_hit: Pointer) -> Result<(), HookError> {
        let mut state = self.state.lock();
        if state.references == 0 || state.filters.contains_key(&should_hit) {
            return Ok(());
        }

        let function = CallableFunction::parse(
            should_hit,
            sourcebind_sdk::CallingConvention::Thiscall,
            SHOULD_HIT_ENTITY,
        )?;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let callback: HookCallback = Arc::new(move |ctx: &mut HookContext<'_>| {
            weak.upgrade()
                .map_or(HookAction::Continue, |inner| inner.should_hit_entity(ctx))
        });
        let handle = self.hooks.add_hook(&function, Phase::Pre, callback)?;
        state.filters.insert(should_hit, handle);
        Ok(())
    }

    fn should_hit_entity(&self, ctx: &HookContext<'_>) -> HookAction {
        let Some(scope) = self.current_scope().filter(|scope| !scope.skip) else {
            return HookAction::Continue;
        };
        // A nested trace with another filter
        if ctx.argument(0).ok().and_then(|v| v.as_pointer()) != Some(scope.filter) {
            return HookAction::Continue;
        }
        let Some(bridge) = self.bridge.get() else {
            return HookAction::Continue;
        };
        let Some(other) = ctx
            .argument(1)
            .ok()
            .and_then(|v| v.as_pointer())
            .filter(|p| !p.is_null())
            .and_then(|p| bridge.index_from_handle_entity(p))
        else {
            return HookAction::Continue;
        };

        if self.evaluate(&*bridge, scope.entity, other, scope.mask, scope.solid) {
            HookAction::Continue
        } else {
            tracing::trace!("Collision {} -> {} vetoed", scope.entity, other);
            HookAction::Override(DynValue::Bool(false))
        }
    }

    fn evaluate(
        &self,
        bridge: &dyn EntityBridge,
        entity: EntityIndex,
        other: EntityIndex,
        mask: u32,
        solid: bool,
    ) -> bool {
        let epoch = bridge.tick();
        if let Some(cached) = self
            .caches
            .lock()
            .get_mut(&(entity, solid))
            .and_then(|cache| cache.get(other, epoch))
        {
            return cached;
        }

        let query = CollisionQuery {
            entity,
            other,
            mask,
            solid,
        };
        let verdict = self.decide(bridge, &query);

        self.caches
            .lock()
            .entry((entity, solid))
            .or_insert_with(|| EpochCache::new(bridge.max_entities()))
            .set(other, verdict, epoch);
        verdict
    }

    fn decide(&self, bridge: &dyn EntityBridge, query: &CollisionQuery) -> bool {
        let hooks = self.collision_hooks.lock().snapshot();
        if !hooks.iter().all(|hook| hook(query)) {
            return false;
        }

        let rules = self.rules.lock().snapshot();
        let rules_pass = rules
            .iter()
            .filter(|rule| query.solid || !rule.solid_only())
            .all(|rule| rule.should_collide(query.entity, query.other));
        if !rules_pass {
            return false;
        }

        if bridge.is_player(query.entity) && bridge.is_player(query.other) {
            let listeners = self.player_listeners.lock().snapshot();
            if !listeners.iter().all(|listener| listener(query)) {
                return false;
            }
        }

        let listeners = self.entity_listeners.lock().snapshot();
        listeners.iter().all(|listener| listener(query))
    }
}

impl std::fmt::Debug for CollisionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CollisionManager")
            .field("references", &state.references)
            .field("traces", &state.traces.len())
            .field("filters", &state.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::testing::TestBridge;
    use crate::rules::RuleMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(bridge: Arc<TestBridge>) -> CollisionManager {
        let cell = Arc::new(BridgeCell::new());
        cell.set(bridge);
        CollisionManager::new(
            Arc::new(HookManager::new()),
            cell,
            None,
            CollisionConfig::default(),
        )
    }

    const SOLID: u32 = sourcebind_sdk::MASK_SOLID_CONTENTS;

    /// Rule that counts how often it is asked
    struct Counting {
        calls: AtomicUsize,
        verdict: bool,
    }

    impl CollisionRules for Counting {
        fn mode(&self) -> RuleMode {
            RuleMode::Prevent
        }
        fn solid_only(&self) -> bool {
            false
        }
        fn should_collide(&self, _: EntityIndex, _: EntityIndex) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }
        fn purge(&self, _: EntityIndex) {}
        fn clear(&self) {}
    }

    /// Rule that unregisters itself when purged or cleared
    #[derive(Default)]
    struct SelfRemoving {
        registration: Mutex<Option<Registration>>,
    }

    impl CollisionRules for SelfRemoving {
        fn mode(&self) -> RuleMode {
            RuleMode::Prevent
        }
        fn solid_only(&self) -> bool {
            false
        }
        fn should_collide(&self, _: EntityIndex, _: EntityIndex) -> bool {
            true
        }
        fn purge(&self, _: EntityIndex) {
            self.registration.lock().take();
        }
        fn clear(&self) {
            self.registration.lock().take();
        }
    }

    fn run_with_timeout(f: impl FnOnce() + Send + 'static) {
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            f();
            let _ = tx.send(());
        });
        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("rule list stayed locked");
    }

    #[test]
    fn test_rule_can_unregister_during_level_shutdown() {
        let manager = Arc::new(manager(TestBridge::new(4)));
        let rule = Arc::new(SelfRemoving::default());
        let registration = manager.register_rule(rule.clone());
        *rule.registration.lock() = Some(registration);
        assert_eq!(manager.ref_count(), 1);

        let shared = Arc::clone(&manager);
        run_with_timeout(move || shared.on_level_shutdown());
        assert_eq!(manager.rule_count(), 0);
        assert_eq!(manager.ref_count(), 0);
    }

    #[test]
    fn test_rule_can_unregister_during_entity_purge() {
        let manager = Arc::new(manager(TestBridge::new(4)));
        let rule = Arc::new(SelfRemoving::default());
        let other = Arc::new(CollisionPairs::new(RuleMode::Prevent, false));
        let registration = manager.register_rule(rule.clone());
        let _other = manager.register_rule(other);
        *rule.registration.lock() = Some(registration);

        let shared = Arc::clone(&manager);
        run_with_timeout(move || shared.on_entity_deleted(3));
        assert_eq!(manager.rule_count(), 1);
        assert_eq!(manager.ref_count(), 1);
    }

    #[test]
    fn test_rules_run_in_order_and_short_circuit() {
        let manager = manager(TestBridge::new(8));
        let allow = Arc::new(CollisionPairs::new(RuleMode::Allow, false));
        allow.add_pair(10, 11);
        let second = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            verdict: true,
        });
        let _a = manager.register_rule(allow.clone());
        let _b = manager.register_rule(second.clone());

        // Listed pair passes the allow rule and reaches the second rule
        assert!(manager.should_collide(10, 11, SOLID));
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);

        // 10 is referenced but (10, 12) is not listed: vetoed by the first rule
        assert!(!manager.should_collide(10, 12, SOLID));
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_rolls_over_with_tick() {
        let bridge = TestBridge::new(8);
        let manager = manager(bridge.clone());
        let rule = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            verdict: false,
        });
        let _r = manager.register_rule(rule.clone());

        assert!(!manager.should_collide(1, 2, SOLID));
        assert!(!manager.should_collide(1, 2, SOLID));
        assert_eq!(rule.calls.load(Ordering::SeqCst), 1);

        // Non-solid traces are cached separately
        manager.should_collide(1, 2, 0);
        assert_eq!(rule.calls.load(Ordering::SeqCst), 2);

        bridge.advance();
        manager.should_collide(1, 2, SOLID);
        assert_eq!(rule.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_solid_only_rules_skip_other_traces() {
        let manager = manager(TestBridge::new(8));
        let rule = Arc::new(CollisionPairs::new(RuleMode::Prevent, true));
        rule.add_pair(3, 4);
        let _r = manager.register_rule(rule);

        assert!(!manager.should_collide(3, 4, SOLID));
        assert!(manager.should_collide(3, 4, sourcebind_sdk::contents::WATER));
    }

    #[test]
    fn test_evaluation_order() {
        let manager = manager(TestBridge::new(4));
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = order.clone();
        let _e = manager.add_entity_listener(move |_| {
            log.lock().push("entity");
            true
        });
        let log = order.clone();
        let _p = manager.add_player_listener(move |_| {
            log.lock().push("player");
            true
        });
        let log = order.clone();
        let _h = manager.add_collision_hook(move |_| {
            log.lock().push("hook");
            true
        });

        assert!(manager.should_collide(1, 2, SOLID));
        assert_eq!(*order.lock(), vec!["hook", "player", "entity"]);

        // 9 is not a player slot
        order.lock().clear();
        assert!(manager.should_collide(1, 9, SOLID));
        assert_eq!(*order.lock(), vec!["hook", "entity"]);
    }

    #[test]
    fn test_hook_veto_skips_rules() {
        let manager = manager(TestBridge::new(4));
        let rule = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            verdict: true,
        });
        let _r = manager.register_rule(rule.clone());
        let _h = manager.add_collision_hook(|query| query.other != 7);

        assert!(!manager.should_collide(1, 7, SOLID));
        assert_eq!(rule.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_entity_deletion_purges_rules_and_cache() {
        let manager = manager(TestBridge::new(8));
        let rule = Arc::new(CollisionPairs::new(RuleMode::Prevent, false));
        rule.add_pair(5, 6);
        let _r = manager.register_rule(rule.clone());

        assert!(!manager.should_collide(5, 6, SOLID));
        assert!(!manager.should_collide(6, 5, SOLID));

        manager.on_entity_deleted(6);
        assert!(rule.is_empty());
        // Same tick, but neither cache direction may still hold the old verdict
        assert!(manager.should_collide(5, 6, SOLID));
        assert!(manager.should_collide(6, 5, SOLID));
    }

    #[test]
    fn test_level_shutdown_clears_rules() {
        let manager = manager(TestBridge::new(8));
        let rule = Arc::new(CollisionSet::new(RuleMode::Prevent, false));
        rule.add(1);
        rule.add(2);
        let _r = manager.register_rule(rule.clone());

        manager.on_level_shutdown();
        assert!(rule.is_empty());
        assert!(manager.should_collide(1, 2, SOLID));
    }

    #[test]
    fn test_registrations_toggle_enabled() {
        let manager = manager(TestBridge::new(8));
        assert!(!manager.is_enabled());

        let rule = manager.register_rule(Arc::new(CollisionSet::default()));
        let listener = manager.add_entity_listener(|_| true);
        assert!(manager.is_enabled());
        assert_eq!(manager.ref_count(), 2);
        assert_eq!(manager.rule_count(), 1);

        drop(rule);
        assert_eq!(manager.rule_count(), 0);
        assert!(manager.is_enabled());
        listener.unregister();
        assert!(!manager.is_enabled());
    }

    #[test]
    fn test_without_bridge_nothing_is_vetoed() {
        let manager = CollisionManager::new(
            Arc::new(HookManager::new()),
            Arc::new(BridgeCell::new()),
            None,
            CollisionConfig::default(),
        );
        let _h = manager.add_collision_hook(|_| false);
        assert!(manager.should_collide(1, 2, SOLID));
    }

    #[test]
    fn test_register_hook_validates_arguments() {
        let manager = manager(TestBridge::new(8));
        let function = CallableFunction::parse(
            Pointer::new(0x1000),
            sourcebind_sdk::CallingConvention::Cdecl,
            "pi)B",
        )
        .unwrap();
        assert!(matches!(
            manager.register_hook(function.clone(), 1, 1),
            Err(HookError::ArgumentIndex(1))
        ));
        assert!(matches!(
            manager.register_hook(function, 0, 2),
            Err(HookError::ArgumentIndex(2))
        ));
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    mod native {
        use super::*;
        use crate::codegen::testing::assemble_function;
        use crate::rtti::ItaniumRtti;
        use iced_x86::code_asm::*;
        use std::ffi::c_char;

        const CLASS: usize = 0x1000;

        #[repr(C)]
        struct ClassInfo {
            kind: usize,
            name: *const c_char,
        }

        /// `trace(filter, mask)`: asks `filter->ShouldHitEntity(7, mask)`
        fn trace_function() -> usize {
            assemble_function(|a| {
                a.push(rbx)?;
                a.mov(edx, esi)?;
                a.mov(esi, 7u32)?;
                a.mov(rax, qword_ptr(rdi))?;
                a.call(qword_ptr(rax))?;
                a.pop(rbx)?;
                a.ret()
            })
        }

        /// `ShouldHitEntity` that always hits
        fn should_hit_function() -> usize {
            assemble_function(|a| {
                a.mov(eax, 1u32)?;
                a.ret()
            })
        }

        #[test]
        fn test_trace_is_filtered() {
            let info = Box::leak(Box::new(ClassInfo {
                kind: CLASS,
                name: c"18CTraceFilterSimple".as_ptr(),
            }));
            let vtable: &'static [usize; 3] = Box::leak(Box::new([
                0,
                info as *const ClassInfo as usize,
                should_hit_function(),
            ]));
            // vtable address point, pass entity (index 1)
            let filter = [&vtable[2] as *const usize as usize, 1usize];

            let rtti = ItaniumRtti::new(Pointer::new(CLASS), Pointer::new(0x2000), Pointer::new(0x3000));
            let cell = Arc::new(BridgeCell::new());
            cell.set(TestBridge::new(8));
            let hooks = Arc::new(HookManager::new());
            let manager = CollisionManager::new(
                hooks.clone(),
                cell,
                Some(Arc::new(rtti)),
                CollisionConfig::default(),
            );

            let trace = CallableFunction::parse(
                Pointer::new(trace_function()),
                sourcebind_sdk::CallingConvention::Cdecl,
                "pi)B",
            )
            .unwrap();
            manager.register_hook(trace.clone(), 0, 1).unwrap();
            assert!(!hooks.is_hooked(trace.address()));

            let rule = Arc::new(CollisionPairs::new(RuleMode::Prevent, false));
            let registration = manager.register_rule(rule.clone());
            assert!(hooks.is_hooked(trace.address()));

            let args = [
                DynValue::Pointer(Pointer::from_ptr(filter.as_ptr())),
                DynValue::UInt(SOLID as u64),
            ];
            assert_eq!(unsafe { trace.call(&args) }.unwrap(), DynValue::Bool(true));
            assert!(hooks.is_hooked(Pointer::new(vtable[2])));
            assert_eq!(manager.scope_depth(), 0);

            rule.add_pair(1, 7);
            manager.invalidate();
            assert_eq!(unsafe { trace.call(&args) }.unwrap(), DynValue::Bool(false));
            assert_eq!(manager.scope_depth(), 0);

            drop(registration);
            assert!(!hooks.is_hooked(trace.address()));
            assert!(!hooks.is_hooked(Pointer::new(vtable[2])));
            assert_eq!(unsafe { trace.call(&args) }.unwrap(), DynValue::Bool(true));
        }
    }
}
