// Per-document debounced scheduler for snapshot writes.
//
// Every `schedule` call for an id re-arms a quiet-period timer. The effect
// registered last runs once the id has been quiet for `quiet`, or once
// `max_wait` has elapsed since the first call of the burst, whichever comes
// first. Effects for a single id never overlap.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Default quiet period before a burst is written.
const DEFAULT_QUIET_MS: u64 = 3_000;
/// Default cap on how long a burst may delay its write.
const DEFAULT_MAX_WAIT_MS: u64 = 10_000;

pub type EffectFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type Effect = Box<dyn FnOnce() -> EffectFuture + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceConfig {
    pub quiet: Duration,
    pub max_wait: Duration,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            quiet: Duration::from_millis(DEFAULT_QUIET_MS),
            max_wait: Duration::from_millis(DEFAULT_MAX_WAIT_MS),
        }
    }
}

impl CoalesceConfig {
    /// The wait cap is raised to at least the quiet period.
    pub fn new(quiet: Duration, max_wait: Duration) -> Self {
        Self { quiet, max_wait: max_wait.max(quiet) }
    }
}

enum SlotState {
    Idle,
    Pending { burst: u64, first_at: Instant, last_at: Instant, effect: Effect },
}

struct Slot {
    state: Mutex<SlotState>,
    run_lock: tokio::sync::Mutex<()>,
    bursts: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
            run_lock: tokio::sync::Mutex::new(()),
            bursts: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending(&self) -> Option<Effect> {
        match std::mem::replace(&mut *self.state(), SlotState::Idle) {
            SlotState::Pending { effect, .. } => Some(effect),
            SlotState::Idle => None,
        }
    }

    async fn run(&self, effect: Effect) {
        let _running = self.run_lock.lock().await;
        effect().await;
    }
}

/// Debounces persistence effects independently per document id.
pub struct UpdateCoalescer {
    config: CoalesceConfig,
    runtime: Handle,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl UpdateCoalescer {
    /// Must be called from within a tokio runtime; timers are spawned on it.
    pub fn new(config: CoalesceConfig) -> Self {
        Self::with_handle(config, Handle::current())
    }

    pub fn with_handle(config: CoalesceConfig, runtime: Handle) -> Self {
        Self { config, runtime, slots: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> CoalesceConfig {
        self.config
    }

    /// Register `effect` as the pending write for `id`.
    ///
    /// Safe to call from synchronous code (CRDT observers); it never blocks
    /// on I/O and never runs the effect inline.
    pub fn schedule(&self, id: &str, effect: Effect) {
        let slot = self.slot(id);
        let now = Instant::now();

        let mut state = slot.state();
        if let SlotState::Pending { last_at, effect: pending, .. } = &mut *state {
            *last_at = now;
            *pending = effect;
            return;
        }

        let burst = slot.bursts.fetch_add(1, Ordering::Relaxed) + 1;
        *state = SlotState::Pending { burst, first_at: now, last_at: now, effect };
        drop(state);

        debug!(doc_id = %id, burst, "coalesced write armed");
        self.runtime.spawn(drive(Arc::clone(&slot), self.config, id.to_owned(), burst));
    }

    /// Drop the pending effect for `id` without running it.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(slot) = self.existing_slot(id) else {
            return false;
        };
        slot.take_pending().is_some()
    }

    /// Run `work` while holding the run lock for `id`, so it cannot interleave
    /// with a coalesced effect for the same document.
    pub async fn run_exclusive<F>(&self, id: &str, work: F) -> F::Output
    where
        F: Future,
    {
        let slot = self.slot(id);
        let _running = slot.run_lock.lock().await;
        work.await
    }

    /// Run every pending effect now. Returns how many ran.
    pub async fn flush_all(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        let mut running = JoinSet::new();
        for slot in slots {
            if let Some(effect) = slot.take_pending() {
                running.spawn_on(async move { slot.run(effect).await }, &self.runtime);
            }
        }

        let mut flushed = 0;
        while running.join_next().await.is_some() {
            flushed += 1;
        }
        flushed
    }

    /// Forget the state for `id` once nothing is pending and no timer task,
    /// running effect or exclusive work still holds the slot.
    pub fn release(&self, id: &str) {
        let mut slots = self.slots();
        let idle = slots.get(id).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && matches!(*slot.state(), SlotState::Idle)
        });
        if idle {
            slots.remove(id);
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        let Some(slot) = self.existing_slot(id) else {
            return false;
        };
        let state = slot.state();
        matches!(*state, SlotState::Pending { .. })
    }

    pub fn tracked_ids(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: &str) -> Arc<Slot> {
        let mut slots = self.slots();
        if let Some(slot) = slots.get(id) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Slot::new());
        slots.insert(id.to_owned(), Arc::clone(&slot));
        slot
    }

    fn existing_slot(&self, id: &str) -> Option<Arc<Slot>> {
        self.slots().get(id).cloned()
    }
}

enum Step {
    Wait(Instant),
    Fire(Effect),
    Done,
}

/// Timer task for one burst. Exits as soon as the burst it was spawned for
/// is no longer pending (fired, flushed or cancelled).
async fn drive(slot: Arc<Slot>, config: CoalesceConfig, id: String, burst: u64) {
    loop {
        match next_step(&slot, config, burst) {
            Step::Wait(due) => sleep_until(due).await,
            Step::Fire(effect) => {
                debug!(doc_id = %id, burst, "coalesced write firing");
                slot.run(effect).await;
                return;
            }
            Step::Done => return,
        }
    }
}

fn next_step(slot: &Slot, config: CoalesceConfig, burst: u64) -> Step {
    let mut state = slot.state();
    let due = match &*state {
        SlotState::Pending { burst: current, first_at, last_at, .. } if *current == burst => {
            (*last_at + config.quiet).min(*first_at + config.max_wait)
        }
        _ => return Step::Done,
    };

    if Instant::now() < due {
        return Step::Wait(due);
    }

    match std::mem::replace(&mut *state, SlotState::Idle) {
        SlotState::Pending { effect, .. } => Step::Fire(effect),
        SlotState::Idle => Step::Done,
    }
}
