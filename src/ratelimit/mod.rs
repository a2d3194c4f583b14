//! Rate limiting logic and state management.

mod backend;
mod counter;
mod distributed;
mod identifier;
mod limiter;
mod local;
mod rules;
mod sweeper;

pub use backend::WindowStore;
pub use counter::{RateLimitResult, WindowEntry, WindowSnapshot};
pub use distributed::{Backend, DistributedConfig, DistributedStore, RedisWindow, RemoteWindow};
pub use identifier::{FnIdentifier, IdentifierFn, IdentifierResolver, UNKNOWN_IDENTIFIER};
pub use limiter::RateLimiter;
pub use local::LocalStore;
pub use rules::{RateLimitConfig, Tier, TierRegistry, TierSpec};
pub use sweeper::{sweep_interval, Sweeper, SweeperHandle};
