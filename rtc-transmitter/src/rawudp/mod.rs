//! Unicast UDP transport.
//!
//! Each stream binds one socket per component on consecutive ports, reports
//! host candidates (or a server reflexive one when a discovery server is
//! configured) and sends to the single remote candidate given for each
//! component. There are no connectivity checks: a component becomes active
//! as soon as it has a local candidate and a remote candidate.

#[cfg(test)]
mod rawudp_test;

mod discovery;

use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::candidate_related::CandidateRelatedConfig;
use crate::candidate::{Candidate, CandidateConfig, CandidateType};
use crate::config::{StreamTransmitterConfig, TransmitterConfig};
use crate::gate::DirectionGate;
use crate::pool::{EndpointPool, EndpointRef, EndpointRequest};
use crate::stream::negotiation::{Negotiation, RemoteMode};
use crate::stream::{
    ComponentState, DiscoveryId, StreamTransmitter, StreamTransmitterEvent,
};
use crate::transmitter::{Transmitter, TransmitterType, check_component, new_pool};
use discovery::DiscoveryTracker;
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportProtocol};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// First port tried for component 1 when no preferred port is given.
pub(crate) const DEFAULT_PORT: u16 = 7078;

/// Session level unicast UDP transport.
pub struct RawUdpTransmitter {
    config: TransmitterConfig,
    pool: EndpointPool,
}

impl RawUdpTransmitter {
    pub fn new(config: TransmitterConfig) -> Result<Self> {
        let pool = new_pool(&config)?;
        Ok(Self { config, pool })
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }
}

impl Transmitter for RawUdpTransmitter {
    fn transmitter_type(&self) -> TransmitterType {
        TransmitterType::RawUdp
    }

    fn config(&self) -> &TransmitterConfig {
        &self.config
    }

    fn new_stream_transmitter(
        &mut self,
        config: StreamTransmitterConfig,
    ) -> Result<Box<dyn StreamTransmitter>> {
        let stream = RawUdpStreamTransmitter::new(self.pool.clone(), &self.config, config)?;
        Ok(Box::new(stream))
    }

    fn send(&self, component_id: u16, payload: &[u8]) -> Result<usize> {
        check_component(&self.config, component_id)?;
        self.pool.send(component_id, payload)
    }

    fn recv(&self, component_id: u16) -> Result<Option<TaggedBytesMut>> {
        check_component(&self.config, component_id)?;
        self.pool.recv(component_id)
    }
}

/// Unicast negotiation towards one participant.
pub struct RawUdpStreamTransmitter {
    negotiation: Negotiation,
    gate: DirectionGate,
    preferred: Vec<Option<Candidate>>,
    endpoints: Vec<EndpointRef>,
    discovery_server: Option<SocketAddr>,
    discovery_timeout: Duration,
    discoveries: DiscoveryTracker,
}

impl RawUdpStreamTransmitter {
    pub fn new(
        pool: EndpointPool,
        transmitter_config: &TransmitterConfig,
        config: StreamTransmitterConfig,
    ) -> Result<Self> {
        let components = transmitter_config.components;
        let preferred = preferred_candidates(transmitter_config, &config.preferred_local_candidates)?;
        let mut endpoints = acquire_endpoints(&pool, components, &preferred)?;

        let mut negotiation = Negotiation::new(components);
        let gate = DirectionGate::new(config.sending, config.receiving);
        for endpoint in &mut endpoints {
            if gate.attach(endpoint)? {
                negotiation.push_event(StreamTransmitterEvent::KeyFrameRequested(
                    endpoint.key().component_id,
                ));
            }
        }

        Ok(Self {
            negotiation,
            gate,
            preferred,
            endpoints,
            discovery_server: config.discovery_server(),
            discovery_timeout: config.discovery_timeout,
            discoveries: DiscoveryTracker::default(),
        })
    }

    /// The socket address each component is bound to.
    pub fn local_addr(&self, component_id: u16) -> Option<SocketAddr> {
        self.endpoint(component_id).map(EndpointRef::local_addr)
    }

    fn endpoint(&self, component_id: u16) -> Option<&EndpointRef> {
        self.endpoints
            .iter()
            .find(|e| e.key().component_id == component_id)
    }

    fn endpoint_mut(&mut self, component_id: u16) -> Option<&mut EndpointRef> {
        self.endpoints
            .iter_mut()
            .find(|e| e.key().component_id == component_id)
    }

    fn preferred_ip(&self, component_id: u16) -> Option<IpAddr> {
        self.preferred
            .get(usize::from(component_id).wrapping_sub(1))
            .and_then(Option::as_ref)
            .and_then(|c| c.ip().ok())
            .filter(|ip| !ip.is_unspecified())
    }

    fn port(&self, component_id: u16) -> Result<u16> {
        self.local_addr(component_id)
            .map(|addr| addr.port())
            .ok_or(Error::ErrInvalidComponent(component_id))
    }

    fn host_candidate(component_id: u16, ip: IpAddr, port: u16) -> Result<Candidate> {
        CandidateHostConfig {
            base_config: CandidateConfig {
                component: component_id,
                address: ip.to_string(),
                port,
                ..Default::default()
            },
        }
        .new_candidate_host()
    }

    /// Reports host candidates for every usable local address, then pairs.
    fn gather_host_candidates(&mut self, component_id: u16) -> Result<()> {
        let port = self.port(component_id)?;
        let addresses = match self.preferred_ip(component_id) {
            Some(ip) => vec![ip],
            None => host_addresses()?,
        };

        if addresses.is_empty() {
            return self
                .negotiation
                .fail(component_id, &Error::ErrNoLocalAddress);
        }
        for ip in addresses {
            let candidate = Self::host_candidate(component_id, ip, port)?;
            self.negotiation.add_local_candidate(candidate)?;
        }
        self.negotiation.mark_prepared(component_id)?;
        self.pair(component_id)
    }

    fn set_remote(&mut self, remote: Candidate) -> Result<()> {
        let component_id = remote.component();
        if let Some(current) = self.negotiation.remote(component_id) {
            if current == &remote {
                return Ok(());
            }
            if current.are_equal(&remote) {
                // same path, only the description changed
                log::trace!("component {component_id} keeps its path to {remote}");
                return self.negotiation.set_remote(remote);
            }
        }

        let destination = remote.addr()?;
        if let Some(endpoint) = self.endpoint_mut(component_id) {
            endpoint.set_destination(Some(destination))?;
        }
        self.negotiation.set_remote(remote)?;
        self.pair(component_id)
    }

    fn pair(&mut self, component_id: u16) -> Result<()> {
        if self
            .negotiation
            .state(component_id)
            .is_none_or(ComponentState::is_terminal)
        {
            return Ok(());
        }
        let Some(local) = self.negotiation.local_candidates(component_id).first().cloned() else {
            return Ok(());
        };
        let Some(remote) = self.negotiation.remote(component_id).cloned() else {
            return Ok(());
        };
        if self
            .negotiation
            .active_pair(component_id)
            .is_some_and(|pair| pair.remote.are_equal(&remote))
        {
            return Ok(());
        }

        self.negotiation.activate(CandidatePair::new(local, remote))
    }

    fn validate_remote(&self, candidate: &Candidate) -> Result<()> {
        candidate.validate()?;
        self.negotiation.check_component(candidate.component())?;
        if candidate.port() == 0 {
            return Err(Error::ErrInvalidArguments(format!(
                "remote candidate {candidate} has no port"
            )));
        }

        if candidate.transport_protocol() != TransportProtocol::UDP {
            return Err(Error::ErrInvalidArguments(format!(
                "rawudp needs udp remote candidates, got {candidate}"
            )));
        }
        if candidate.candidate_type() == CandidateType::Multicast {
            return Err(Error::ErrInvalidArguments(format!(
                "rawudp can't use multicast candidate {candidate}"
            )));
        }
        candidate.addr()?;
        Ok(())
    }

    /// The address a server reflexive candidate was derived from.
    fn base_address(&self, component_id: u16, local_addr: SocketAddr) -> Result<IpAddr> {
        if let Some(ip) = self.preferred_ip(component_id) {
            return Ok(ip);
        }
        if !local_addr.ip().is_unspecified() {
            return Ok(local_addr.ip());
        }
        Ok(host_addresses()?
            .into_iter()
            .next()
            .unwrap_or(local_addr.ip()))
    }
}

impl StreamTransmitter for RawUdpStreamTransmitter {
    fn gather_local_candidates(&mut self) -> Result<()> {
        self.negotiation.start_gathering()?;
        let now = Instant::now();

        for component_id in self.negotiation.component_ids() {
            match (self.preferred_ip(component_id), self.discovery_server) {
                (None, Some(server)) => {
                    let local_addr = self
                        .local_addr(component_id)
                        .ok_or(Error::ErrInvalidComponent(component_id))?;
                    let request = self.discoveries.start(
                        component_id,
                        server,
                        local_addr,
                        now,
                        self.discovery_timeout,
                    );
                    self.negotiation
                        .push_event(StreamTransmitterEvent::DiscoveryRequested(request));
                }
                _ => self.gather_host_candidates(component_id)?,
            }
        }

        Ok(())
    }

    fn add_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<()> {
        self.negotiation.ensure_active()?;
        for candidate in candidates {
            self.validate_remote(candidate)?;
        }
        self.negotiation.set_remote_mode(RemoteMode::Added)?;

        for candidate in candidates {
            self.set_remote(candidate.clone())?;
        }
        Ok(())
    }

    fn force_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<()> {
        self.negotiation.ensure_active()?;

        for candidate in candidates {
            self.validate_remote(candidate)?;
        }
        let forced = self.negotiation.forced_remotes(candidates)?;
        self.negotiation.set_remote_mode(RemoteMode::Forced)?;

        for candidate in forced.into_values() {
            self.set_remote(candidate.clone())?;
        }
        Ok(())
    }

    fn set_sending(&mut self, sending: bool) -> Result<()> {
        self.negotiation.ensure_active()?;
        let started = self.gate.set_sending(sending, self.endpoints.iter_mut())?;
        for component_id in started {
            self.negotiation
                .push_event(StreamTransmitterEvent::KeyFrameRequested(component_id));
        }
        Ok(())
    }

    fn sending(&self) -> bool {
        self.gate.sending()
    }

    fn set_receiving(&mut self, receiving: bool) -> Result<()> {
        self.negotiation.ensure_active()?;
        self.gate.set_receiving(receiving, self.endpoints.iter_mut())
    }

    fn receiving(&self) -> bool {
        self.gate.receiving()
    }

    fn component_state(&self, component_id: u16) -> Option<ComponentState> {
        self.negotiation.state(component_id)
    }

    fn local_candidates(&self, component_id: u16) -> &[Candidate] {
        self.negotiation.local_candidates(component_id)
    }

    fn active_pair(&self, component_id: u16) -> Option<&CandidatePair> {
        self.negotiation.active_pair(component_id)
    }

    fn complete_discovery(&mut self, id: DiscoveryId, result: Result<SocketAddr>) -> Result<()> {
        if self.negotiation.is_stopped() {
            log::debug!("dropping discovery {id} completion, stream is stopped");
            return Ok(());
        }
        let Some(request) = self.discoveries.get(id).cloned() else {
            log::debug!("dropping completion of unknown or expired discovery {id}");
            return Ok(());
        };

        let mapped = match result {
            Ok(mapped) => mapped,
            Err(err) => {
                log::warn!("discovery {id} failed, waiting for another answer: {err}");
                self.negotiation
                    .push_error(&Error::ErrDiscoveryFailed(err.to_string()));
                return Ok(());
            }
        };
        self.discoveries.finish(id);

        let component_id = request.component_id;
        let base = self.base_address(component_id, request.local_addr)?;
        let candidate = CandidateRelatedConfig {
            base_config: CandidateConfig {
                component: component_id,
                address: mapped.ip().to_string(),
                port: mapped.port(),
                ..Default::default()
            },
            rel_addr: base.to_string(),
            rel_port: request.local_addr.port(),
        }
        .new_candidate_server_reflexive()?;

        self.negotiation.add_local_candidate(candidate)?;
        self.negotiation.mark_prepared(component_id)?;
        self.pair(component_id)
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.negotiation.ensure_active()?;

        for request in self.discoveries.expire(now) {
            let err = Error::ErrDiscoveryTimeout(self.discovery_timeout);
            log::warn!(
                "discovery {} for component {} timed out, falling back to host candidates",
                request.id,
                request.component_id
            );
            self.negotiation.push_error(&err);
            self.gather_host_candidates(request.component_id)?;
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        self.discoveries.next_deadline()
    }

    fn poll_event(&mut self) -> Option<StreamTransmitterEvent> {
        self.negotiation.poll_event()
    }

    fn stop(&mut self) -> Result<()> {
        self.negotiation.stop()?;
        self.discoveries.clear();

        let detached = self.gate.detach(self.endpoints.iter_mut());
        for endpoint in self.endpoints.drain(..) {
            endpoint.release()?;
        }
        log::debug!("rawudp stream stopped");
        detached
    }

    fn is_stopped(&self) -> bool {
        self.negotiation.is_stopped()
    }
}

/// Indexes the preferred local candidates by component, rejecting unusable
/// ones.
fn preferred_candidates(
    config: &TransmitterConfig,
    candidates: &[Candidate],
) -> Result<Vec<Option<Candidate>>> {
    let mut preferred = vec![None; usize::from(config.components)];
    for candidate in candidates {
        if candidate.transport_protocol() != TransportProtocol::UDP {
            return Err(Error::ErrInvalidArguments(format!(
                "rawudp needs udp preferred candidates, got {candidate}"
            )));
        }
        check_component(config, candidate.component())?;
        candidate.ip()?;

        let slot = &mut preferred[usize::from(candidate.component() - 1)];
        if slot.is_some() {
            return Err(Error::ErrDuplicatePreferredCandidate(candidate.component()));
        }
        *slot = Some(candidate.clone());
    }
    Ok(preferred)
}

/// Binds one socket per component on consecutive ports.
///
/// Component 1 starts at its preferred port or [`DEFAULT_PORT`]. When a
/// component without a preferred port doesn't get its consecutive port, the
/// whole block is released and the search starts again `components` ports
/// higher.
fn acquire_endpoints(
    pool: &EndpointPool,
    components: u16,
    preferred: &[Option<Candidate>],
) -> Result<Vec<EndpointRef>> {
    let preferred_port = |component_id: u16| {
        preferred[usize::from(component_id - 1)]
            .as_ref()
            .map(Candidate::port)
            .filter(|port| *port != 0)
    };
    let preferred_ip = |component_id: u16| {
        preferred[usize::from(component_id - 1)]
            .as_ref()
            .and_then(|c| c.ip().ok())
            .filter(|ip| !ip.is_unspecified())
    };

    let start = preferred_port(1).unwrap_or(DEFAULT_PORT);
    let mut base = start;
    'block: loop {
        let mut endpoints = Vec::with_capacity(usize::from(components));
        for component_id in 1..=components {
            let fixed = preferred_port(component_id);
            let port = match fixed {
                Some(port) => port,
                None => base
                    .checked_add(component_id - 1)
                    .ok_or(Error::ErrNoPortAvailable(start))?,
            };
            let endpoint = pool.acquire(&EndpointRequest::unicast(
                component_id,
                preferred_ip(component_id),
                port,
            ))?;

            if fixed.is_none() && endpoint.local_addr().port() != port {
                log::debug!(
                    "component {component_id} got port {} instead of {port}, retrying",
                    endpoint.local_addr().port()
                );
                drop(endpoint);
                drop(endpoints);
                base = base
                    .checked_add(components)
                    .ok_or(Error::ErrNoPortAvailable(start))?;
                continue 'block;
            }
            endpoints.push(endpoint);
        }

        log::debug!(
            "rawudp stream bound to {:?}",
            endpoints.iter().map(EndpointRef::local_addr).collect::<Vec<_>>()
        );
        return Ok(endpoints);
    }
}

/// Local interface addresses for host candidates, loopback only when there
/// is nothing else.
fn host_addresses() -> Result<Vec<IpAddr>> {
    let addresses = shared::ifaces::local_addresses(false)?;
    if !addresses.is_empty() {
        return Ok(addresses);
    }
    log::debug!("no non-loopback interface, using loopback addresses");
    shared::ifaces::local_addresses(true)
}
