//! Shared memory transport between processes of one host.
//!
//! Each component of a stream is a unix datagram socket bound at a
//! filesystem path. Gathering reports a single host candidate per component
//! whose address is that path, and a component pairs as soon as the remote
//! path is known. Nothing goes through the UDP endpoint pool.

#[cfg(test)]
mod shm_test;

mod link;

use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::{Candidate, CandidateConfig, CandidateType};
use crate::config::{StreamTransmitterConfig, TransmitterConfig};
use crate::gate::{DirectionGate, GatedEndpoint};
use crate::stream::negotiation::{Negotiation, RemoteMode};
use crate::stream::{ComponentState, StreamTransmitter, StreamTransmitterEvent};
use crate::transmitter::{Transmitter, TransmitterType, check_component};
use link::{ShmHub, ShmLink, default_path};
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportProtocol};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Session level shared memory transport.
pub struct ShmTransmitter {
    config: TransmitterConfig,
    hub: ShmHub,
}

impl ShmTransmitter {
    pub fn new(config: TransmitterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            hub: ShmHub::default(),
        })
    }

    /// Number of sockets bound by the streams of this transmitter.
    pub fn link_count(&self) -> Result<usize> {
        self.hub.len()
    }
}

impl Transmitter for ShmTransmitter {
    fn transmitter_type(&self) -> TransmitterType {
        TransmitterType::Shm
    }

    fn config(&self) -> &TransmitterConfig {
        &self.config
    }

    fn new_stream_transmitter(
        &mut self,
        config: StreamTransmitterConfig,
    ) -> Result<Box<dyn StreamTransmitter>> {
        let stream = ShmStreamTransmitter::new(&self.hub, &self.config, config)?;
        Ok(Box::new(stream))
    }

    fn send(&self, component_id: u16, payload: &[u8]) -> Result<usize> {
        check_component(&self.config, component_id)?;
        self.hub.send(component_id, payload)
    }

    fn recv(&self, component_id: u16) -> Result<Option<TaggedBytesMut>> {
        check_component(&self.config, component_id)?;
        self.hub.recv(component_id)
    }
}

/// Shared memory negotiation towards one participant.
pub struct ShmStreamTransmitter {
    negotiation: Negotiation,
    gate: DirectionGate,
    links: Vec<ShmLink>,
}

impl ShmStreamTransmitter {
    pub(crate) fn new(
        hub: &ShmHub,
        transmitter_config: &TransmitterConfig,
        config: StreamTransmitterConfig,
    ) -> Result<Self> {
        let components = transmitter_config.components;
        let mut paths = preferred_paths(transmitter_config, &config.preferred_local_candidates)?;

        let mut links = Vec::with_capacity(usize::from(components));
        for component_id in 1..=components {
            let path = paths[usize::from(component_id - 1)]
                .take()
                .unwrap_or_else(|| default_path(component_id));
            links.push(hub.bind(component_id, path)?);
        }

        let mut negotiation = Negotiation::new(components);
        let gate = DirectionGate::new(config.sending, config.receiving);
        for link in &mut links {
            if gate.attach(link)? {
                negotiation.push_event(StreamTransmitterEvent::KeyFrameRequested(
                    link.component_id(),
                ));
            }
        }

        Ok(Self {
            negotiation,
            gate,
            links,
        })
    }

    /// The path each component's socket is bound at.
    pub fn local_path(&self, component_id: u16) -> Option<&Path> {
        self.link(component_id).map(ShmLink::path)
    }

    /// The path each component sends to, once a remote is known.
    pub fn remote_path(&self, component_id: u16) -> Option<&Path> {
        self.link(component_id).and_then(ShmLink::remote)
    }

    fn link(&self, component_id: u16) -> Option<&ShmLink> {
        self.links.get(usize::from(component_id).wrapping_sub(1))
    }

    fn link_mut(&mut self, component_id: u16) -> Option<&mut ShmLink> {
        self.links.get_mut(usize::from(component_id).wrapping_sub(1))
    }

    fn local_candidate(&self, component_id: u16) -> Result<Candidate> {
        let path = self
            .local_path(component_id)
            .ok_or(Error::ErrInvalidComponent(component_id))?;
        let address = path.to_str().ok_or_else(|| {
            Error::ErrInvalidArguments(format!("socket path {} is not utf-8", path.display()))
        })?;

        CandidateHostConfig {
            base_config: CandidateConfig {
                component: component_id,
                address: address.to_owned(),
                ..Default::default()
            },
        }
        .new_candidate_host()
    }

    fn validate_remote(&self, candidate: &Candidate) -> Result<()> {
        candidate.validate()?;
        self.negotiation.check_component(candidate.component())?;

        if candidate.transport_protocol() != TransportProtocol::UDP {
            return Err(Error::ErrInvalidArguments(format!(
                "shm needs udp remote candidates, got {candidate}"
            )));
        }
        if candidate.candidate_type() == CandidateType::Multicast {
            return Err(Error::ErrInvalidArguments(format!(
                "shm can't use multicast candidate {candidate}"
            )));
        }
        Ok(())
    }

    fn set_remote(&mut self, remote: Candidate) -> Result<()> {
        let component_id = remote.component();
        if let Some(current) = self.negotiation.remote(component_id) {
            if current == &remote {
                return Ok(());
            }
            if current.address() == remote.address() {
                log::trace!("component {component_id} keeps its path to {remote}");
                return self.negotiation.set_remote(remote);
            }
        }

        let path = PathBuf::from(remote.address());
        if let Some(link) = self.link_mut(component_id) {
            link.set_remote(path)?;
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
        let Some(local) = self.negotiation.local_candidates(component_id).first().cloned() else {
            return Ok(());
        };
        let Some(remote) = self.negotiation.remote(component_id).cloned() else {
            return Ok(());
        };
        if self
            .negotiation
            .active_pair(component_id)
            .is_some_and(|pair| pair.remote.address() == remote.address())
        {
            return Ok(());
        }

        self.negotiation.activate(CandidatePair::new(local, remote))
    }
}

impl StreamTransmitter for ShmStreamTransmitter {
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
        let started = self.gate.set_sending(sending, self.links.iter_mut())?;
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
        self.gate.set_receiving(receiving, self.links.iter_mut())
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

        let detached = self.gate.detach(self.links.iter_mut());
        for link in self.links.drain(..) {
            link.release()?;
        }
        log::debug!("shm stream stopped");
        detached
    }

    fn is_stopped(&self) -> bool {
        self.negotiation.is_stopped()
    }
}

/// Socket paths of the preferred local candidates, by component.
fn preferred_paths(
    config: &TransmitterConfig,
    candidates: &[Candidate],
) -> Result<Vec<Option<PathBuf>>> {
    let mut paths = vec![None; usize::from(config.components)];
    for candidate in candidates {
        if candidate.transport_protocol() != TransportProtocol::UDP {
            return Err(Error::ErrInvalidArguments(format!(
                "shm needs udp preferred candidates, got {candidate}"
            )));
        }
        check_component(config, candidate.component())?;
        if candidate.address().is_empty() {
            return Err(Error::ErrInvalidArguments(format!(
                "preferred candidate {candidate} has no socket path"
            )));
        }

        let slot = &mut paths[usize::from(candidate.component() - 1)];
        if slot.is_some() {
            return Err(Error::ErrDuplicatePreferredCandidate(candidate.component()));
        }
        *slot = Some(PathBuf::from(candidate.address()));
    }
    Ok(paths)
}
