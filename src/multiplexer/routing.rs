//! Endpoint selection.
//!
//! The multiplexer does not know how keys map to nodes. It hands the
//! command, its routing key and a snapshot of every endpoint to a
//! [`RoutingOracle`], which names the endpoint that owns the command and
//! says whether replicas of it may serve the read. Read preferences are
//! then applied on top of that answer by the multiplexer.

use crate::endpoint::{EndpointAddr, HealthState, Role};
use crate::protocol::{Command, ReadPreference};

/// What routing may know about an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointView {
    pub address: EndpointAddr,
    pub role: Role,
    pub health: HealthState,
}

/// The oracle's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub endpoint: EndpointAddr,
    pub replica_read_allowed: bool,
}

pub trait RoutingOracle: Send + Sync {
    /// Picks the endpoint for `command`, or `None` if nothing can serve it.
    fn route(&self, command: &Command, key: Option<&[u8]>, endpoints: &[EndpointView])
        -> Option<Route>;
}

/// Routes everything to the primary of a single primary/replica group.
///
/// Preference order: a usable primary, a usable endpoint whose role is
/// unknown, any primary, any endpoint. Replica reads are allowed only for
/// read-only commands that do not demand the primary.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrimaryReplicaRouter;

impl RoutingOracle for PrimaryReplicaRouter {
    fn route(
        &self,
        command: &Command,
        _key: Option<&[u8]>,
        endpoints: &[EndpointView],
    ) -> Option<Route> {
        let usable = |role: Role| {
            endpoints
                .iter()
                .find(|e| e.role == role && e.health.is_usable())
        };
        let chosen = usable(Role::Primary)
            .or_else(|| usable(Role::Unknown))
            .or_else(|| endpoints.iter().find(|e| e.role == Role::Primary))
            .or_else(|| endpoints.first())?;

        Some(Route {
            endpoint: chosen.address.clone(),
            replica_read_allowed: command.is_read_only()
                && command.read_preference() != ReadPreference::DemandPrimary,
        })
    }
}
