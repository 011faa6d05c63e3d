//! Burst protection for state change storms
//!
//! Counts incoming state changes per interval. After `repeat_intervals`
//! consecutive intervals above `value_threshold` every backend stateChange
//! subscription except the system pattern is dropped. Once the cooldown has
//! passed the subscriptions still tracked by the registry are restored.

use crate::acl::ADMIN_USER;
use crate::backend::{CallContext, StateStore};
use crate::config::BurstConfig;
use crate::patterns::SubscriptionType;
use crate::server::hooks::GatewayHooks;
use crate::server::subscriptions::SubscriptionRegistry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct BurstState {
    /// Consecutive overloaded intervals
    accidents: u32,
    active: bool,
    activated_at: Option<Instant>,
    last_rate: u64,
}

enum Transition {
    Activate,
    Deactivate,
}

pub struct BurstGuard {
    config: BurstConfig,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn StateStore>,
    hooks: Arc<dyn GatewayHooks>,
    events: AtomicU64,
    state: Mutex<BurstState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BurstGuard {
    pub fn new(
        config: BurstConfig,
        registry: Arc<SubscriptionRegistry>,
        store: Arc<dyn StateStore>,
        hooks: Arc<dyn GatewayHooks>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            hooks,
            events: AtomicU64::new(0),
            state: Mutex::new(BurstState::default()),
            task: Mutex::new(None),
        }
    }

    /// Count one incoming state change
    pub fn record_event(&self) {
        if self.config.enabled {
            self.events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Events counted in the last completed interval
    pub fn last_rate(&self) -> u64 {
        self.state.lock().last_rate
    }

    /// Close the current interval
    pub async fn tick(&self) {
        let count = self.events.swap(0, Ordering::Relaxed);

        let transition = {
            let mut state = self.state.lock();
            state.last_rate = count;
            if state.active {
                let cooled = state
                    .activated_at
                    .map_or(true, |at| at.elapsed() >= self.config.cooldown());
                cooled.then_some(Transition::Deactivate)
            } else {
                if count > self.config.value_threshold {
                    state.accidents += 1;
                    debug!(rate = count, accidents = state.accidents, "State change rate above threshold");
                } else {
                    state.accidents = 0;
                }
                (state.accidents >= self.config.repeat_intervals).then_some(Transition::Activate)
            }
        };

        match transition {
            Some(Transition::Activate) => {
                self.activate().await;
            }
            Some(Transition::Deactivate) => {
                self.deactivate().await;
            }
            None => {}
        }
    }

    /// Drop backend stateChange subscriptions except the system pattern.
    ///
    /// Returns false if protection was already active.
    pub async fn activate(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.active {
                return false;
            }
            state.active = true;
            state.accidents = 0;
            state.activated_at = Some(Instant::now());
        }
        self.registry.set_state_suspended(true);

        let ctx = CallContext::new(ADMIN_USER);
        let tracked = self.registry.tracked(SubscriptionType::StateChange);
        warn!(
            patterns = tracked.len(),
            threshold = self.config.value_threshold,
            "State change burst detected, suspending subscriptions"
        );
        for (pattern, aux) in tracked {
            if pattern == self.config.system_pattern {
                continue;
            }
            if let Err(e) = self
                .store
                .unsubscribe(SubscriptionType::StateChange, &pattern, aux.as_deref(), &ctx)
                .await
            {
                warn!(pattern = %pattern, error = %e, "Failed to suspend subscription");
            }
        }

        self.hooks.on_threshold_changed(true);
        true
    }

    /// Restore every tracked stateChange subscription.
    ///
    /// Returns false if protection was not active.
    pub async fn deactivate(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !state.active {
                return false;
            }
            state.active = false;
            state.accidents = 0;
            state.activated_at = None;
        }
        // Cleared before the snapshot so no new subscription falls between the two
        self.registry.set_state_suspended(false);

        let ctx = CallContext::new(ADMIN_USER);
        let tracked = self.registry.tracked(SubscriptionType::StateChange);
        info!(patterns = tracked.len(), "Burst over, restoring subscriptions");
        for (pattern, aux) in tracked {
            if pattern == self.config.system_pattern {
                continue;
            }
            if let Err(e) = self
                .store
                .subscribe(SubscriptionType::StateChange, &pattern, aux.as_deref(), &ctx)
                .await
            {
                warn!(pattern = %pattern, error = %e, "Failed to restore subscription");
            }
        }
        if let Err(e) = self
            .store
            .subscribe(SubscriptionType::StateChange, &self.config.system_pattern, None, &ctx)
            .await
        {
            warn!(pattern = %self.config.system_pattern, error = %e, "Failed to restore system subscription");
        }

        self.hooks.on_threshold_changed(false);
        true
    }

    /// Start the sampling loop
    pub fn spawn(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let guard = Arc::downgrade(self);
        let period = self.config.interval();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(guard) = guard.upgrade() else {
                    break;
                };
                guard.tick().await;
            }
        }));
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::server::relay::InstanceMessageRelay;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const STATE: SubscriptionType = SubscriptionType::StateChange;

    #[derive(Default)]
    struct RecordingHooks {
        on: AtomicUsize,
        off: AtomicUsize,
    }

    impl GatewayHooks for RecordingHooks {
        fn on_threshold_changed(&self, active: bool) {
            let counter = if active { &self.on } else { &self.off };
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> BurstConfig {
        BurstConfig {
            value_threshold: 10,
            repeat_intervals: 2,
            cooldown_ms: 5_000,
            ..BurstConfig::default()
        }
    }

    async fn setup() -> (BurstGuard, Arc<SubscriptionRegistry>, Arc<MemoryBackend>, Arc<RecordingHooks>) {
        let mem = Arc::new(MemoryBackend::new());
        let relay = Arc::new(InstanceMessageRelay::new(mem.clone()));
        let registry =
            Arc::new(SubscriptionRegistry::new(mem.clone(), relay).with_system_pattern(config().system_pattern));
        registry.subscribe(None, STATE, "system.adapter.*", None).await;
        registry.subscribe(None, STATE, "hm-rpc.0.*", None).await;
        registry.subscribe(None, STATE, "zigbee.0.*", None).await;
        mem.clear_calls();

        let hooks = Arc::new(RecordingHooks::default());
        let guard = BurstGuard::new(config(), registry.clone(), mem.clone(), hooks.clone());
        (guard, registry, mem, hooks)
    }

    fn flood(guard: &BurstGuard, n: usize) {
        for _ in 0..n {
            guard.record_event();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_spike_does_not_activate() {
        let (guard, _registry, mem, _hooks) = setup().await;
        flood(&guard, 50);
        guard.tick().await;
        flood(&guard, 3);
        guard.tick().await;
        flood(&guard, 50);
        guard.tick().await;

        assert!(!guard.is_active());
        assert!(mem.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_overload_activates_and_cools_down() {
        let (guard, registry, mem, hooks) = setup().await;

        flood(&guard, 50);
        guard.tick().await;
        flood(&guard, 50);
        guard.tick().await;

        assert!(guard.is_active());
        assert!(registry.is_state_suspended());
        assert_eq!(mem.unsubscribe_calls(STATE, "hm-rpc.0.*"), 1);
        assert_eq!(mem.unsubscribe_calls(STATE, "zigbee.0.*"), 1);
        assert_eq!(mem.unsubscribe_calls(STATE, "system.adapter.*"), 0);
        assert_eq!(hooks.on.load(Ordering::SeqCst), 1);

        // Still hot, before the cooldown
        tokio::time::advance(Duration::from_secs(2)).await;
        guard.tick().await;
        assert!(guard.is_active());

        // Dropped during the burst, must not come back
        registry.unsubscribe(None, STATE, Some("zigbee.0.*"), None).await;
        assert_eq!(mem.unsubscribe_calls(STATE, "zigbee.0.*"), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        guard.tick().await;
        assert!(!guard.is_active());
        assert!(!registry.is_state_suspended());
        assert_eq!(mem.subscribe_calls(STATE, "hm-rpc.0.*"), 1);
        assert_eq!(mem.subscribe_calls(STATE, "zigbee.0.*"), 0);
        assert_eq!(mem.subscribe_calls(STATE, "system.adapter.*"), 1);
        assert_eq!(hooks.off.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_loop_still_runs() {
        let mem = Arc::new(MemoryBackend::new());
        let relay = Arc::new(InstanceMessageRelay::new(mem.clone()));
        let registry = Arc::new(SubscriptionRegistry::new(mem.clone(), relay));
        let hooks = Arc::new(RecordingHooks::default());
        let zero = BurstConfig {
            interval_ms: 0,
            ..config()
        };
        let guard = Arc::new(BurstGuard::new(zero, registry, mem, hooks));

        guard.spawn();
        flood(&guard, 50);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let running = guard.task.lock().as_ref().map(|h| !h.is_finished());
        assert_eq!(running, Some(true));
        // One hot interval followed by quiet ones
        assert!(!guard.is_active());
        guard.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_idempotent() {
        let (guard, _registry, mem, hooks) = setup().await;
        assert!(!guard.deactivate().await);
        assert!(guard.activate().await);
        assert!(!guard.activate().await);
        assert_eq!(mem.unsubscribe_calls(STATE, "hm-rpc.0.*"), 1);
        assert_eq!(hooks.on.load(Ordering::SeqCst), 1);

        assert!(guard.deactivate().await);
        assert!(!guard.deactivate().await);
        assert_eq!(hooks.off.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_pattern_stays_live_while_active() {
        let (guard, registry, mem, _hooks) = setup().await;
        registry.unsubscribe(None, STATE, Some("system.adapter.*"), None).await;
        mem.clear_calls();
        assert!(guard.activate().await);

        // First holder arrives during the burst
        registry.subscribe(None, STATE, "system.adapter.*", None).await;
        assert_eq!(mem.subscribe_calls(STATE, "system.adapter.*"), 1);

        // Other patterns stay bookkeeping-only
        registry.subscribe(None, STATE, "knx.0.*", None).await;
        assert_eq!(mem.subscribe_calls(STATE, "knx.0.*"), 0);

        // Last holder leaves during the burst
        registry.unsubscribe(None, STATE, Some("system.adapter.*"), None).await;
        assert_eq!(mem.unsubscribe_calls(STATE, "system.adapter.*"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_samples() {
        let (guard, _registry, _mem, _hooks) = setup().await;
        let guard = Arc::new(guard);
        guard.spawn();

        flood(&guard, 20);
        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(guard.last_rate(), 20);

        guard.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_guard_counts_nothing() {
        let mem = Arc::new(MemoryBackend::new());
        let relay = Arc::new(InstanceMessageRelay::new(mem.clone()));
        let registry = Arc::new(SubscriptionRegistry::new(mem.clone(), relay));
        let config = BurstConfig {
            enabled: false,
            ..config()
        };
        let guard = BurstGuard::new(config, registry, mem, Arc::new(RecordingHooks::default()));

        for _ in 0..5 {
            flood(&guard, 100);
            guard.tick().await;
        }
        assert!(!guard.is_active());
    }
}
