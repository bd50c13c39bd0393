//! Per-tier budgets and block durations.
//!
//! The policy is resolved once from configuration at startup and handed to
//! the limiter. Lookups never fail: a tier with no configured limit falls back
//! to a conservative default.

use std::collections::BTreeMap;
use std::time::Duration;

/// Highest tier a token may select.
pub const MAX_TIER: u8 = 4;

/// Budget for address-based identities when none is configured.
pub const DEFAULT_ADDRESS_BUDGET: u64 = 5;
/// Budget for token tiers when none is configured.
pub const DEFAULT_TOKEN_BUDGET: u64 = 10;
/// Block duration when none is configured.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(1);
/// Window length when none is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Limits applied to one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimit {
    /// Requests allowed per window
    pub budget: u64,
    /// How long an identity stays blocked after exhausting its budget
    pub block_duration: Duration,
}

impl TierLimit {
    /// Create a tier limit.
    pub fn new(budget: u64, block_duration: Duration) -> Self {
        Self {
            budget,
            block_duration,
        }
    }

    /// The fallback limit for a tier.
    pub fn default_for(tier: u8) -> Self {
        let budget = if tier == 0 {
            DEFAULT_ADDRESS_BUDGET
        } else {
            DEFAULT_TOKEN_BUDGET
        };
        Self::new(budget, DEFAULT_BLOCK_DURATION)
    }
}

/// Window length plus the limit for every tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    window: Duration,
    limits: BTreeMap<u8, TierLimit>,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl TierPolicy {
    /// Create a policy where every tier uses its default limit.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            limits: BTreeMap::new(),
        }
    }

    /// Set the limit for one tier.
    pub fn with_tier(mut self, tier: u8, limit: TierLimit) -> Self {
        self.limits.insert(tier, limit);
        self
    }

    /// The limit for `tier`, falling back to the tier default.
    pub fn limit(&self, tier: u8) -> TierLimit {
        self.limits
            .get(&tier)
            .copied()
            .unwrap_or_else(|| TierLimit::default_for(tier))
    }

    /// Requests allowed per window for `tier`.
    pub fn budget(&self, tier: u8) -> u64 {
        self.limit(tier).budget
    }

    /// Block duration for `tier`.
    pub fn block_duration(&self, tier: u8) -> Duration {
        self.limit(tier).block_duration
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in whole seconds, never less than one.
    pub fn window_secs(&self) -> i64 {
        whole_secs(self.window).max(1)
    }

    /// Block duration for `tier` in whole seconds.
    pub fn block_secs(&self, tier: u8) -> i64 {
        whole_secs(self.block_duration(tier))
    }
}

/// Round a duration up to whole seconds. Records store second resolution,
/// so a sub-second block must still cover at least one tick.
fn whole_secs(duration: Duration) -> i64 {
    let secs = duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0));
    i64::try_from(secs).unwrap_or(i64::MAX)
}
