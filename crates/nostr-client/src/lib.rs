//! Client-side relay plumbing: a relay connection with publish and
//! subscribe, a pool that fans queries and subscriptions across relays,
//! a process-wide subscription registry, and a synchronous topic-based
//! event bus for in-process notifications.

pub mod bus;
pub mod error;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod subscription;

pub use bus::{BusHandle, BusStats, EventBus};
pub use error::{ClientError, Result};
pub use pool::{MultiSubscription, PoolConfig, RelayPool};
pub use registry::{RegisterOptions, RegistryConfig, RegistryStats, SubscriptionRegistry};
pub use relay::{AuthSigner, ConnectionState, PublishConfirmation, Relay, RelayConfig};
pub use subscription::{Subscription, SubscriptionState, generate_subscription_id};
