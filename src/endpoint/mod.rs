//! Endpoints
//!
//! An [`Endpoint`] is one node of the deployment. It owns an interactive
//! bridge and, when subscriptions are enabled, a subscription bridge; tracks
//! the node's replication role and health; and runs the reconnect loop when
//! a bridge loses its connection.

pub mod address;
pub mod backoff;
pub mod health;
pub mod node;

pub use address::EndpointAddr;
pub use backoff::{BackoffPolicy, ConstantBackoff, ExponentialBackoff};
pub use health::{HealthState, Role, TimeoutCounters};
pub use node::{Endpoint, EndpointContext, EndpointStatus};
