//! Persisted per-identity rate limit record.

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Tier used for identities keyed by network address.
pub const ADDRESS_TIER: u8 = 0;

/// The state kept in storage for one identity.
///
/// Field names on the wire are kept compatible with records written by the
/// previous generation of this gateway, so both can share a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Rate limit key: an IP literal or an API token
    #[serde(rename = "id")]
    pub identity: String,
    /// Budget tier, 0 for address-based identities
    #[serde(rename = "level")]
    pub tier: u8,
    /// Requests left in the current window
    #[serde(rename = "accessRemain")]
    pub remaining: u64,
    /// Unix seconds after which the window may be renewed
    #[serde(rename = "initTime")]
    pub window_end: i64,
    /// Unix seconds until which every request is denied, 0 when not blocked
    #[serde(rename = "blockedUntil")]
    pub blocked_until: i64,
}

/// Where a record sits in its lifecycle at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Never seen, or expired out of the store
    Absent,
    /// Has budget left
    Active,
    /// Out of budget, waiting for the window to end
    Exhausted,
    /// Denied until the block lifts
    Blocked,
}

impl RateLimitRecord {
    /// Create an unblocked record.
    pub fn new(identity: impl Into<String>, tier: u8, remaining: u64, window_end: i64) -> Self {
        Self {
            identity: identity.into(),
            tier,
            remaining,
            window_end,
            blocked_until: 0,
        }
    }

    /// Whether a block has been recorded, lifted or not.
    pub fn is_blocked(&self) -> bool {
        self.blocked_until != 0
    }

    /// Whether the block is still in force at `now`.
    pub fn is_blocked_at(&self, now: i64) -> bool {
        self.is_blocked() && now < self.blocked_until
    }

    /// Classify an optional record at `now`.
    pub fn state(record: Option<&Self>, now: i64) -> RecordState {
        match record {
            None => RecordState::Absent,
            Some(r) if r.is_blocked_at(now) => RecordState::Blocked,
            Some(r) if r.remaining > 0 => RecordState::Active,
            Some(_) => RecordState::Exhausted,
        }
    }

    /// Encode for storage.
    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Decode a stored value.
    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Codec(e.to_string()))
    }
}
