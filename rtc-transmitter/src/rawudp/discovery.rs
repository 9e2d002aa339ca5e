use crate::stream::{DiscoveryId, DiscoveryRequest};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Server reflexive discoveries waiting for an answer from the application.
#[derive(Debug, Default)]
pub(crate) struct DiscoveryTracker {
    pending: BTreeMap<DiscoveryId, DiscoveryRequest>,
    next_id: DiscoveryId,
}

impl DiscoveryTracker {
    /// Registers a discovery for the socket at `local_addr` of a component.
    pub(crate) fn start(
        &mut self,
        component_id: u16,
        server: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
        timeout: Duration,
    ) -> DiscoveryRequest {
        self.next_id += 1;
        let request = DiscoveryRequest {
            id: self.next_id,
            component_id,
            server,
            local_addr,
            deadline: now + timeout,
        };
        log::debug!(
            "discovery {} for component {component_id} via {server}, deadline in {timeout:?}",
            request.id
        );
        self.pending.insert(request.id, request.clone());
        request
    }

    pub(crate) fn get(&self, id: DiscoveryId) -> Option<&DiscoveryRequest> {
        self.pending.get(&id)
    }

    pub(crate) fn finish(&mut self, id: DiscoveryId) -> Option<DiscoveryRequest> {
        self.pending.remove(&id)
    }

    /// Removes and returns every discovery whose deadline is at or before `now`.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<DiscoveryRequest> {
        let expired: Vec<DiscoveryId> = self
            .pending
            .values()
            .filter(|request| request.deadline <= now)
            .map(|request| request.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|request| request.deadline).min()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
