//! Core rate limiter implementation.
//!
//! The limiter is stateless between calls. Each decision reads the identity's
//! record from the store, runs [`transition`] over it and writes the result
//! back. Anything that goes wrong on the way to the store ends in a deny.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use super::clock::{Clock, SystemClock};
use super::policy::TierPolicy;
use super::record::RateLimitRecord;
use crate::store::{bounded, KeyValueStore, StoreError};

/// Retention set on every record write.
const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(10);
/// Upper bound on a single store call.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);
/// Compare-and-set attempts before a decision gives up.
const DEFAULT_MAX_RETRIES: u32 = 16;

/// Outcome of a rate limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request
    Allow,
    /// Reject the request as over limit
    Deny,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// A decision plus the record to persist, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// What to tell the caller
    pub decision: Decision,
    /// Record to write back; `None` leaves storage untouched
    pub next: Option<RateLimitRecord>,
}

impl Transition {
    fn write(decision: Decision, next: RateLimitRecord) -> Self {
        Self {
            decision,
            next: Some(next),
        }
    }

    fn deny_unchanged() -> Self {
        Self {
            decision: Decision::Deny,
            next: None,
        }
    }
}

/// Compute the decision and next record for one request at `now`.
///
/// `tier` only matters for a new record; an existing record keeps the tier it
/// was created with.
pub fn transition(
    current: Option<&RateLimitRecord>,
    identity: &str,
    tier: u8,
    now: i64,
    policy: &TierPolicy,
) -> Transition {
    let Some(current) = current else {
        let remaining = policy.budget(tier).saturating_sub(1);
        let window_end = now.saturating_add(policy.window_secs());
        let record = RateLimitRecord::new(identity, tier, remaining, window_end);
        return Transition::write(Decision::Allow, record);
    };

    let mut next = current.clone();

    if next.is_blocked() {
        if now < next.blocked_until {
            return Transition::deny_unchanged();
        }
        // Lifting the block does not renew the window by itself.
        next.blocked_until = 0;
    }

    if next.remaining > 0 {
        next.remaining -= 1;
        return Transition::write(Decision::Allow, next);
    }

    if now >= next.window_end {
        // The renewing request is admitted without spending the fresh budget.
        next.window_end = now.saturating_add(policy.window_secs());
        next.remaining = policy.budget(next.tier);
        next.blocked_until = 0;
        return Transition::write(Decision::Allow, next);
    }

    next.blocked_until = now.saturating_add(policy.block_secs(next.tier));
    Transition::write(Decision::Deny, next)
}

/// How read-modify-write cycles are protected against concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    /// Optimistic compare-and-set with bounded retries
    #[default]
    Atomic,
    /// Plain get then set; concurrent requests for one identity may oversell
    /// the budget
    Relaxed,
}

impl FromStr for ConsistencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "atomic" => Ok(ConsistencyMode::Atomic),
            "relaxed" => Ok(ConsistencyMode::Relaxed),
            other => Err(format!("unknown consistency mode '{}'", other)),
        }
    }
}

/// Storage behaviour of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterOptions {
    /// Retention set on every record write
    pub record_ttl: Duration,
    /// Upper bound on a single store call
    pub store_timeout: Duration,
    /// Concurrency protection for the read-modify-write cycle
    pub consistency: ConsistencyMode,
    /// Compare-and-set attempts before denying
    pub max_retries: u32,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            record_ttl: DEFAULT_RECORD_TTL,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            consistency: ConsistencyMode::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// The fixed-window-with-block rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks. It
/// takes no process-wide lock; concurrent decisions for the same identity are
/// reconciled in the store.
pub struct RateLimiter {
    /// Where records live
    store: Arc<dyn KeyValueStore>,
    /// Source of `now` for [`RateLimiter::decide`]
    clock: Arc<dyn Clock>,
    /// Budgets and block durations per tier
    policy: RwLock<TierPolicy>,
    options: LimiterOptions,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &*self.policy.read())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter with the system clock and default settings.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(
            store,
            Arc::new(SystemClock),
            TierPolicy::default(),
            LimiterOptions::default(),
        )
    }

    /// Create a limiter with explicit clock, policy and options.
    pub fn with_config(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        policy: TierPolicy,
        options: LimiterOptions,
    ) -> Self {
        Self {
            store,
            clock,
            policy: RwLock::new(policy),
            options,
        }
    }

    /// Replace the tier policy. Decisions already in flight keep the old one.
    pub fn set_policy(&self, policy: TierPolicy) {
        debug!(policy = ?policy, "Updating tier policy");
        *self.policy.write() = policy;
    }

    /// Get the current tier policy.
    pub fn policy(&self) -> TierPolicy {
        self.policy.read().clone()
    }

    /// Get the storage options.
    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Decide whether `identity` may make a request now.
    pub async fn decide(&self, identity: &str, tier: u8) -> Decision {
        self.decide_at(identity, tier, self.clock.now()).await
    }

    /// Decide whether `identity` may make a request at `now` unix seconds.
    pub async fn decide_at(&self, identity: &str, tier: u8, now: i64) -> Decision {
        if identity.is_empty() {
            warn!(tier, "Refusing to rate limit an empty identity");
            return Decision::Deny;
        }

        trace!(identity, tier, now, "Checking rate limit");

        let outcome = match self.options.consistency {
            ConsistencyMode::Atomic => self.decide_atomic(identity, tier, now).await,
            ConsistencyMode::Relaxed => self.decide_relaxed(identity, tier, now).await,
        };

        match outcome {
            Ok(decision) => {
                if decision == Decision::Deny {
                    debug!(identity, tier, "Rate limit exceeded");
                }
                decision
            }
            Err(e) => {
                error!(identity, tier, error = %e, "Rate limit store failure, denying request");
                Decision::Deny
            }
        }
    }

    /// Read the raw value and decoded record for `identity`.
    async fn load(
        &self,
        identity: &str,
    ) -> Result<Option<(String, RateLimitRecord)>, StoreError> {
        let raw = bounded(self.options.store_timeout, self.store.get(identity)).await?;
        raw.map(|raw| RateLimitRecord::decode(&raw).map(|record| (raw, record)))
            .transpose()
    }

    fn plan(
        &self,
        current: Option<&RateLimitRecord>,
        identity: &str,
        tier: u8,
        now: i64,
    ) -> Transition {
        trace!(identity, state = ?RateLimitRecord::state(current, now), "Loaded record");
        let policy = self.policy.read();
        transition(current, identity, tier, now, &policy)
    }

    async fn decide_relaxed(
        &self,
        identity: &str,
        tier: u8,
        now: i64,
    ) -> Result<Decision, StoreError> {
        let current = self.load(identity).await?;
        let step = self.plan(current.as_ref().map(|(_, r)| r), identity, tier, now);

        if let Some(next) = step.next {
            let encoded = next.encode()?;
            bounded(
                self.options.store_timeout,
                self.store.set(identity, &encoded, self.options.record_ttl),
            )
            .await?;
        }
        Ok(step.decision)
    }

    async fn decide_atomic(
        &self,
        identity: &str,
        tier: u8,
        now: i64,
    ) -> Result<Decision, StoreError> {
        let attempts = self.options.max_retries.max(1);

        for attempt in 1..=attempts {
            let current = self.load(identity).await?;
            let (raw, record) = match &current {
                Some((raw, record)) => (Some(raw.as_str()), Some(record)),
                None => (None, None),
            };
            let step = self.plan(record, identity, tier, now);

            let Some(next) = step.next else {
                return Ok(step.decision);
            };
            let encoded = next.encode()?;

            let swapped = bounded(
                self.options.store_timeout,
                self.store
                    .compare_and_set(identity, raw, &encoded, self.options.record_ttl),
            )
            .await?;
            if swapped {
                return Ok(step.decision);
            }
            trace!(identity, attempt, "Lost compare-and-set race, retrying");
        }

        Err(StoreError::Contention {
            key: identity.to_string(),
            attempts,
        })
    }
}
