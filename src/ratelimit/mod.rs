//! Rate limiting logic and state management.

mod backend;
mod clock;
mod limiter;
mod policy;
mod record;

pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{transition, ConsistencyMode, Decision, LimiterOptions, RateLimiter, Transition};
pub use policy::{TierLimit, TierPolicy, MAX_TIER};
pub use record::{RateLimitRecord, RecordState, ADDRESS_TIER};
