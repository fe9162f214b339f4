//! Sliding window rate limiting and its window stores.

mod backend;
mod clock;
mod decision;
mod facade;
mod limiter;
mod local;
mod remote;

pub use backend::{BackendKind, WindowCount, WindowStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::LimitDecision;
pub use facade::{BackendSelection, FailurePolicy, LimiterStats, RateLimitFacade};
pub use limiter::{CountingMode, Quota, SlidingWindowLimiter};
pub use local::LocalWindowStore;
pub use remote::RemoteWindowStore;
