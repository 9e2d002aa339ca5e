//! IP multicast transport.
//!
//! Every participant of a session joins the same group for each component,
//! so there is nothing to discover: the local candidate is the interface
//! joining the group and the remote candidate is the group itself. Pairing is
//! immediate once both are known.


use crate::candidate::candidate_multicast::{CandidateMulticastConfig, DEFAULT_MULTICAST_TTL};
use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::{Candidate, CandidateConfig, CandidateType};
use crate::config::{StreamTransmitterConfig, TransmitterConfig};
use crate::gate::DirectionGate;
use crate::pool::{EndpointPool, EndpointRef, EndpointRequest};
use crate::stream::negotiation::{Negotiation, RemoteMode};
use crate::stream::{ComponentState, StreamTransmitter, StreamTransmitterEvent};
use crate::transmitter::{Transmitter, TransmitterType, check_component, new_pool};
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportProtocol};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;

/// Session level multicast transport.
pub struct MulticastTransmitter {
    config: TransmitterConfig,
    pool: EndpointPool,
}

impl MulticastTransmitter {
    pub fn new(config: TransmitterConfig) -> Result<Self> {
        let pool = new_pool(&config)?;
        Ok(Self { config, pool })
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }
}

impl Transmitter for MulticastTransmitter {
    fn transmitter_type(&self) -> TransmitterType {
        TransmitterType::Multicast
    }

    fn config(&self) -> &TransmitterConfig {
        &self.config
    }

    fn new_stream_transmitter(
        &mut self,
        config: StreamTransmitterConfig,
    ) -> Result<Box<dyn StreamTransmitter>> {
        let stream = MulticastStreamTransmitter::new(self.pool.clone(), &self.config, config)?;
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

/// Multicast negotiation towards one participant.
pub struct MulticastStreamTransmitter {
    pool: EndpointPool,
    negotiation: Negotiation,
    gate: DirectionGate,
    /// Interface joining the group, per component.
    interfaces: Vec<Option<Ipv4Addr>>,
    endpoints: Vec<Option<EndpointRef>>,
}

impl MulticastStreamTransmitter {
    pub fn new(
        pool: EndpointPool,
        transmitter_config: &TransmitterConfig,
        config: StreamTransmitterConfig,
    ) -> Result<Self> {
        let components = transmitter_config.components;
        let mut interfaces = vec![None; usize::from(components)];

        for candidate in &config.preferred_local_candidates {
            if candidate.transport_protocol() != TransportProtocol::UDP {
                return Err(Error::ErrInvalidArguments(format!(
                    "multicast needs udp preferred candidates, got {candidate}"
                )));
            }
            check_component(transmitter_config, candidate.component())?;

            let slot = &mut interfaces[usize::from(candidate.component() - 1)];
            if slot.is_some() {
                return Err(Error::ErrDuplicatePreferredCandidate(candidate.component()));
            }
            match candidate.ip()? {
                IpAddr::V4(ip) => *slot = Some(ip),
                IpAddr::V6(ip) => {
                    return Err(Error::ErrInvalidArguments(format!(
                        "multicast needs an IPv4 interface, got {ip}"
                    )));
                }
            }
        }

        Ok(Self {
            pool,
            negotiation: Negotiation::new(components),
            gate: DirectionGate::new(config.sending, config.receiving),
            interfaces,
            endpoints: (0..components).map(|_| None).collect(),
        })
    }

    fn local_candidate(&self, component_id: u16) -> Result<Candidate> {
        let index = usize::from(component_id - 1);
        let address = self.interfaces[index].unwrap_or(Ipv4Addr::UNSPECIFIED);
        let (port, ttl) = match self.negotiation.remote(component_id) {
            Some(remote) => (remote.port(), remote.ttl().unwrap_or(DEFAULT_MULTICAST_TTL)),
            None => (0, DEFAULT_MULTICAST_TTL),
        };

        CandidateMulticastConfig {
            base_config: CandidateConfig {
                component: component_id,
                address: address.to_string(),
                port,
                ..Default::default()
            },
            ttl,
        }
        .new_candidate_multicast()
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
                "multicast needs udp remote candidates, got {candidate}"
            )));
        }
        if candidate.candidate_type() != CandidateType::Multicast {
            return Err(Error::ErrInvalidArguments(format!(
                "the remote candidate must be of type multicast, got {candidate}"
            )));
        }
        match candidate.ip()? {
            IpAddr::V4(group) if group.is_multicast() => Ok(()),
            ip => Err(Error::ErrNotMulticastAddress(ip.to_string())),
        }
    }

    /// Joins the group of `remote`, leaving the previous one only after the
    /// new endpoint is ready.
    fn set_remote(&mut self, remote: Candidate) -> Result<()> {
        let component_id = remote.component();
        if self.negotiation.remote(component_id) == Some(&remote) {
            log::trace!("component {component_id} re-set to the same group {remote}");
            return Ok(());
        }

        let index = usize::from(component_id - 1);
        let request = EndpointRequest::multicast(
            component_id,
            self.interfaces[index].map(IpAddr::V4),
            remote.ip()?,
            remote.port(),
            remote.ttl().unwrap_or(DEFAULT_MULTICAST_TTL),
        );
        let mut endpoint = self.pool.acquire(&request)?;
        if self.gate.attach(&mut endpoint)? {
            self.negotiation
                .push_event(StreamTransmitterEvent::KeyFrameRequested(component_id));
        }
        if let Some(previous) = self.endpoints[index].replace(endpoint) {
            previous.release()?;
        }

        self.negotiation.set_remote(remote)?;
        self.pair(component_id)
    }

    fn pair(&mut self, component_id: u16) -> Result<()> {
        if !self.negotiation.is_prepared(component_id)
            || self
                .negotiation
                .state(component_id)
                .is_none_or(ComponentState::is_terminal)
        {
            return Ok(());
        }
        let Some(remote) = self.negotiation.remote(component_id).cloned() else {
            return Ok(());
        };

        let local = self.local_candidate(component_id)?;
        self.negotiation.replace_local_candidate(local.clone())?;
        self.negotiation.activate(CandidatePair::new(local, remote))
    }
}

impl StreamTransmitter for MulticastStreamTransmitter {
    fn gather_local_candidates(&mut self) -> Result<()> {
        self.negotiation.start_gathering()?;

        for component_id in self.negotiation.component_ids() {
            let candidate = self.local_candidate(component_id)?;
            self.negotiation.add_local_candidate(candidate)?;
            self.negotiation.mark_prepared(component_id)?;
        }
        for component_id in self.negotiation.component_ids() {
            self.pair(component_id)?;
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
        let started = self
            .gate
            .set_sending(sending, self.endpoints.iter_mut().flatten())?;

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
        self.gate
            .set_receiving(receiving, self.endpoints.iter_mut().flatten())
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

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        self.negotiation.ensure_active()
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        None
    }

    fn poll_event(&mut self) -> Option<StreamTransmitterEvent> {
        self.negotiation.poll_event()
    }

    fn stop(&mut self) -> Result<()> {
        self.negotiation.stop()?;

        let detached = self.gate.detach(self.endpoints.iter_mut().flatten());
        for endpoint in self.endpoints.iter_mut().filter_map(Option::take) {
            endpoint.release()?;
        }
        log::debug!("multicast stream stopped");
        detached
    }

    fn is_stopped(&self) -> bool {
        self.negotiation.is_stopped()
    }
}
