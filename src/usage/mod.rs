pub mod cooldown;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::NaiveDate;
use tokio::sync::{Mutex as TokioMutex, Notify, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::clock::{Clock, until_local_midnight};
use crate::config::{ProviderKeys, Settings};
use crate::error::ErrorKind;
use crate::pricing;
use crate::usage::cooldown::{Cooldown, UsageCounters, UsageDelta};
use crate::usage::store::{KeySnapshot, Snapshot, fingerprint};

/// Why `select_key` came back empty. Both resolve to `None` at the caller
/// boundary; operators see the distinction in counters and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoKey {
    /// Every configured key for the provider was already tried.
    Exhausted,
    /// The deadline elapsed waiting for a lock or a cooldown expiry.
    Deadline,
}

/// All lifecycle state for one credential.
///
/// The semaphore is the shared-use gate: up to `max_concurrent_models_per_key`
/// simultaneous uses, each for a distinct model (distinctness enforced by
/// the per-model mutexes inside). The interior mutex guards only short
/// bookkeeping sections and is never held across an await.
struct KeyState {
    secret: String,
    fingerprint: String,
    provider: String,
    gate: Arc<Semaphore>,
    inner: StdMutex<KeyInner>,
}

#[derive(Default)]
struct KeyInner {
    /// Lazily created per-model exclusivity locks. tokio mutexes queue
    /// waiters FIFO, which is the ordering guarantee selection relies on.
    model_locks: HashMap<String, Arc<TokioMutex<()>>>,
    cooldowns: HashMap<String, Cooldown>,
    lockout_until: Option<Instant>,
    /// Models this key has failed auth on inside the current lockout window.
    failed_models: HashSet<String>,
    usage_today: UsageCounters,
    usage_total: UsageCounters,
    last_used: Option<Instant>,
}

impl KeyState {
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, KeyInner> {
        self.inner.lock().expect("key state lock poisoned")
    }
}

/// Release token for a selected key. Owns the shared-use permit and the
/// per-model guard; releasing is idempotent and `Drop` releases, so a
/// panicking task cannot strand a key.
pub struct Lease {
    key: Arc<KeyState>,
    model: String,
    clock: Arc<dyn Clock>,
    held: Option<(OwnedSemaphorePermit, OwnedMutexGuard<()>)>,
}

impl Lease {
    pub fn secret(&self) -> &str {
        &self.key.secret
    }

    pub fn fingerprint(&self) -> &str {
        &self.key.fingerprint
    }

    pub fn provider(&self) -> &str {
        &self.key.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Return the permit and guard to the pool. Second and later calls are
    /// no-ops.
    pub fn release(&mut self) {
        if self.held.take().is_some() {
            self.key.lock_inner().last_used = Some(self.clock.now());
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("fingerprint", &self.key.fingerprint)
            .field("provider", &self.key.provider)
            .field("model", &self.model)
            .field("held", &self.held.is_some())
            .finish()
    }
}

struct Candidate {
    idx: usize,
    lock: Arc<TokioMutex<()>>,
    in_flight: usize,
    last_used: Option<Instant>,
}

/// Owns every key's lifecycle state: selection, cooldown accounting,
/// usage counters, daily reset, snapshot production.
pub struct UsageManager {
    keys: Vec<Arc<KeyState>>,
    by_provider: HashMap<String, Vec<usize>>,
    by_fingerprint: HashMap<String, usize>,
    clock: Arc<dyn Clock>,
    settings: Settings,
    /// Date of the last daily rollover.
    last_reset: StdMutex<NaiveDate>,
    dirty: Notify,
    exhausted_selections: AtomicU64,
    deadline_selections: AtomicU64,
}

impl UsageManager {
    pub fn new(pools: &[ProviderKeys], settings: Settings, clock: Arc<dyn Clock>) -> Self {
        let mut keys = Vec::new();
        let mut by_provider: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_fingerprint = HashMap::new();

        for pool in pools {
            for secret in &pool.keys {
                let index = keys.len();
                let fp = fingerprint(secret);
                by_provider.entry(pool.provider.clone()).or_default().push(index);
                by_fingerprint.insert(fp.clone(), index);
                keys.push(Arc::new(KeyState {
                    secret: secret.clone(),
                    fingerprint: fp,
                    provider: pool.provider.clone(),
                    gate: Arc::new(Semaphore::new(settings.max_concurrent_models_per_key)),
                    inner: StdMutex::new(KeyInner::default()),
                }));
            }
        }

        let today = clock.local_date();
        Self {
            keys,
            by_provider,
            by_fingerprint,
            clock,
            settings,
            last_reset: StdMutex::new(today),
            dirty: Notify::new(),
            exhausted_selections: AtomicU64::new(0),
            deadline_selections: AtomicU64::new(0),
        }
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.by_provider.contains_key(provider)
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.by_provider.keys().map(String::as_str)
    }

    /// Any configured key for the provider, ignoring eligibility. Used for
    /// model discovery, where a cooled-down key can still list models.
    pub fn any_key(&self, provider: &str) -> Option<String> {
        let indices = self.by_provider.get(provider)?;
        indices.first().map(|&idx| self.keys[idx].secret.clone())
    }

    /// Select the best eligible key for `(provider, model)`.
    ///
    /// Tier 1 takes the first candidate (ordered by fewest in-flight uses,
    /// then least recent use, then configured index) whose gate permit and
    /// per-model mutex are both free right now. Tier 2 waits on the
    /// least-loaded candidate, bounded by the deadline. When nothing is
    /// eligible yet, sleeps until the earliest cooldown/lockout expiry and
    /// rescans; callers get `NoKey::Deadline` at the deadline, not before.
    pub async fn select_key(
        &self,
        provider: &str,
        model: &str,
        deadline: Instant,
        exclude: &HashSet<String>,
    ) -> Result<Lease, NoKey> {
        loop {
            self.daily_reset_if_needed();
            let now = self.clock.now();

            let Some(indices) = self.by_provider.get(provider) else {
                self.exhausted_selections.fetch_add(1, Ordering::Relaxed);
                return Err(NoKey::Exhausted);
            };

            let mut eligible: Vec<Candidate> = Vec::new();
            let mut earliest_retry: Option<Instant> = None;
            let mut any_untried = false;

            for &idx in indices {
                let key = &self.keys[idx];
                if exclude.contains(&key.fingerprint) {
                    continue;
                }
                any_untried = true;

                let mut inner = key.lock_inner();
                if let Some(until) = inner.lockout_until {
                    if until > now {
                        earliest_retry = min_instant(earliest_retry, until);
                        continue;
                    }
                    inner.lockout_until = None;
                }
                if let Some(cd) = inner.cooldowns.get(model)
                    && !cd.expired(now)
                {
                    earliest_retry = min_instant(earliest_retry, cd.until);
                    continue;
                }
                let lock = inner
                    .model_locks
                    .entry(model.to_string())
                    .or_insert_with(|| Arc::new(TokioMutex::new(())))
                    .clone();
                let in_flight =
                    self.settings.max_concurrent_models_per_key - key.gate.available_permits();
                let last_used = inner.last_used;
                drop(inner);

                eligible.push(Candidate {
                    idx,
                    lock,
                    in_flight,
                    last_used,
                });
            }

            if !any_untried {
                self.exhausted_selections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(provider, model, "selection: all keys already tried");
                return Err(NoKey::Exhausted);
            }

            if eligible.is_empty() {
                // Untried keys exist but every one is cooling down. Wait for
                // the earliest expiry, or the deadline, whichever is first.
                let wake = earliest_retry.unwrap_or(deadline);
                if wake >= deadline {
                    self.clock.sleep_until(deadline).await;
                    self.deadline_selections.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(provider, model, "selection: deadline while all on cooldown");
                    return Err(NoKey::Deadline);
                }
                self.clock.sleep_until(wake).await;
                continue;
            }

            eligible.sort_by(|a, b| {
                a.in_flight
                    .cmp(&b.in_flight)
                    // None sorts first: a never-used key is the least recent.
                    .then_with(|| a.last_used.cmp(&b.last_used))
                    .then_with(|| a.idx.cmp(&b.idx))
            });

            // Tier 1: anything acquirable without waiting.
            for cand in &eligible {
                let key = &self.keys[cand.idx];
                let Ok(permit) = key.gate.clone().try_acquire_owned() else {
                    continue;
                };
                if let Ok(guard) = cand.lock.clone().try_lock_owned() {
                    return Ok(self.lease(cand.idx, model, permit, guard));
                }
                drop(permit);
            }

            // Tier 2: queue on the least-loaded candidate's model mutex.
            let cand = &eligible[0];
            let key = &self.keys[cand.idx];

            let guard = tokio::select! {
                guard = cand.lock.clone().lock_owned() => guard,
                _ = self.clock.sleep_until(deadline) => {
                    self.deadline_selections.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(provider, model, "selection: deadline waiting for model lock");
                    return Err(NoKey::Deadline);
                }
            };
            let permit = tokio::select! {
                permit = key.gate.clone().acquire_owned() => {
                    permit.expect("shared-use gate never closed")
                }
                _ = self.clock.sleep_until(deadline) => {
                    self.deadline_selections.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(provider, model, "selection: deadline waiting for key gate");
                    return Err(NoKey::Deadline);
                }
            };

            // A failure may have landed a cooldown while we queued; those
            // writes must be visible to the next selection, so re-check.
            let now = self.clock.now();
            let still_eligible = {
                let inner = key.lock_inner();
                !inner.lockout_until.is_some_and(|u| u > now)
                    && !inner.cooldowns.get(model).is_some_and(|cd| !cd.expired(now))
            };
            if !still_eligible {
                drop(guard);
                drop(permit);
                continue;
            }
            return Ok(self.lease(cand.idx, model, permit, guard));
        }
    }

    fn lease(
        &self,
        idx: usize,
        model: &str,
        permit: OwnedSemaphorePermit,
        guard: OwnedMutexGuard<()>,
    ) -> Lease {
        let key = Arc::clone(&self.keys[idx]);
        tracing::debug!(
            fingerprint = %key.fingerprint,
            provider = %key.provider,
            model,
            "selected key"
        );
        Lease {
            key,
            model: model.to_string(),
            clock: Arc::clone(&self.clock),
            held: Some((permit, guard)),
        }
    }

    /// Fold one completed request into the key's daily counters and wake
    /// the snapshot writer.
    pub fn record_success(
        &self,
        fingerprint: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) {
        let Some(&idx) = self.by_fingerprint.get(fingerprint) else {
            return;
        };
        let delta = UsageDelta {
            prompt_tokens,
            completion_tokens,
            cost_usd: pricing::approx_cost(model, prompt_tokens, completion_tokens),
        };
        self.keys[idx].lock_inner().usage_today.add(&delta);
        self.dirty.notify_one();
    }

    /// Apply the cooldown policy for a failed request. Transient and
    /// request-shape failures leave the key untouched.
    pub fn record_failure(&self, fingerprint: &str, model: &str, kind: ErrorKind) {
        let Some(&idx) = self.by_fingerprint.get(fingerprint) else {
            return;
        };
        let key = &self.keys[idx];
        let now = self.clock.now();
        let mut inner = key.lock_inner();

        match kind {
            ErrorKind::RateLimit => {
                let cd = inner.cooldowns.entry(model.to_string()).or_default();
                cd.strike(now, 1, self.settings.base_cooldown, self.settings.strike_cap);
                tracing::info!(
                    fingerprint,
                    model,
                    strikes = cd.strikes,
                    "rate limited — cooling down"
                );
            }
            ErrorKind::Authentication => {
                let cd = inner.cooldowns.entry(model.to_string()).or_default();
                cd.strike(now, 2, self.settings.base_cooldown, self.settings.strike_cap);
                let strikes = cd.strikes;
                inner.failed_models.insert(model.to_string());
                tracing::warn!(fingerprint, model, strikes, "auth failure — cooling down");
            }
            ErrorKind::QuotaExhausted => {
                let until = now + until_local_midnight(self.clock.local_now());
                inner.cooldowns.entry(model.to_string()).or_default().until = until;
                tracing::warn!(fingerprint, model, "quota exhausted — cooling down to midnight");
            }
            // Not the key's fault, or retried in place.
            _ => return,
        }

        // Lockout trips atomically with the failure that crossed the line.
        if inner.failed_models.len() >= self.settings.distinct_failure_threshold {
            inner.lockout_until = Some(now + self.settings.lockout_window);
            inner.failed_models.clear();
            tracing::warn!(
                fingerprint,
                window_secs = self.settings.lockout_window.as_secs(),
                "distinct-model failure threshold reached — key locked out"
            );
        }
    }

    /// Roll the day over once the local date advances. Idempotent; called
    /// at the top of every selection and from the midnight ticker.
    pub fn daily_reset_if_needed(&self) {
        let today = self.clock.local_date();
        let mut last = self.last_reset.lock().expect("reset date lock poisoned");
        if *last >= today {
            return;
        }
        *last = today;

        for key in &self.keys {
            let mut inner = key.lock_inner();
            inner.cooldowns.clear();
            inner.failed_models.clear();
            inner.lockout_until = None;
            let finished_day = std::mem::take(&mut inner.usage_today);
            inner.usage_total.absorb(&finished_day);
        }
        self.dirty.notify_one();
        tracing::info!(date = %today, "daily reset applied");
    }

    /// Produce the persistable view of current usage.
    pub fn snapshot(&self) -> Snapshot {
        let last_reset = *self.last_reset.lock().expect("reset date lock poisoned");
        let mut keys = HashMap::new();
        for key in &self.keys {
            let inner = key.lock_inner();
            keys.insert(
                key.fingerprint.clone(),
                KeySnapshot {
                    provider: key.provider.clone(),
                    usage_today: inner.usage_today,
                    usage_total: inner.usage_total,
                },
            );
        }
        Snapshot {
            last_reset_date: Some(last_reset),
            keys,
        }
    }

    /// Seed counters from a persisted snapshot. Unknown fingerprints are
    /// ignored (the key left the pool). A stale `last_reset_date` is kept
    /// as-is so the next `daily_reset_if_needed` archives the old day.
    pub fn restore(&self, snapshot: &Snapshot) {
        for (fp, persisted) in &snapshot.keys {
            let Some(&idx) = self.by_fingerprint.get(fp) else {
                continue;
            };
            let mut inner = self.keys[idx].lock_inner();
            inner.usage_today = persisted.usage_today;
            inner.usage_total = persisted.usage_total;
        }
        if let Some(date) = snapshot.last_reset_date {
            let mut last = self.last_reset.lock().expect("reset date lock poisoned");
            if date < *last {
                *last = date;
            }
        }
    }

    /// Usage counters for one key, for observability and tests.
    pub fn usage_of(&self, fingerprint: &str) -> Option<(UsageCounters, UsageCounters)> {
        let &idx = self.by_fingerprint.get(fingerprint)?;
        let inner = self.keys[idx].lock_inner();
        Some((inner.usage_today, inner.usage_total))
    }

    /// Cooldown horizon and strikes for one (key, model), if any.
    pub fn cooldown_of(&self, fingerprint: &str, model: &str) -> Option<(Instant, u32)> {
        let &idx = self.by_fingerprint.get(fingerprint)?;
        let inner = self.keys[idx].lock_inner();
        inner.cooldowns.get(model).map(|cd| (cd.until, cd.strikes))
    }

    pub fn exhausted_selection_count(&self) -> u64 {
        self.exhausted_selections.load(Ordering::Relaxed)
    }

    pub fn deadline_selection_count(&self) -> u64 {
        self.deadline_selections.load(Ordering::Relaxed)
    }

    /// Park until `record_success`/`record_failure`/reset marks state dirty.
    pub(crate) async fn dirty_wait(&self) {
        self.dirty.notified().await;
    }
}

fn min_instant(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(match current {
        Some(existing) => existing.min(candidate),
        None => candidate,
    })
}
