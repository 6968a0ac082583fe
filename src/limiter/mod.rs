pub mod composite;
pub mod key;
pub mod window;

pub use composite::{CompositeLimiter, QuotaPlan, Tier, TierStatus};
pub use key::{CallerIdentity, RateLimitKey, Scope, WindowTier};
pub use window::{Admission, WindowAccountant};
