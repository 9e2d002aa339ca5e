use super::{ComponentState, ConnectionState, StreamTransmitterEvent};
use crate::candidate::Candidate;
use crate::candidate::candidate_pair::CandidatePair;
use shared::error::{Error, Result};
use std::collections::{BTreeMap, VecDeque};

/// How remote candidates reach the stream. Fixed by the first call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RemoteMode {
    Added,
    Forced,
}

#[derive(Debug, Default)]
struct ComponentNegotiation {
    state: ComponentState,
    reported: Option<ConnectionState>,
    prepared: bool,
    local_candidates: Vec<Candidate>,
    remote: Option<Candidate>,
    active_pair: Option<CandidatePair>,
}

/// Negotiation bookkeeping shared by every stream transmitter: component
/// states, candidates, the active pairs and the event queue.
#[derive(Debug)]
pub(crate) struct Negotiation {
    components: Vec<ComponentNegotiation>,
    remote_mode: Option<RemoteMode>,
    prepared_reported: bool,
    events: VecDeque<StreamTransmitterEvent>,
    stopped: bool,
}

impl Negotiation {
    pub(crate) fn new(components: u16) -> Self {
        Self {
            components: (0..components)
                .map(|_| ComponentNegotiation::default())
                .collect(),
            remote_mode: None,
            prepared_reported: false,
            events: VecDeque::new(),
            stopped: false,
        }
    }

    pub(crate) fn component_count(&self) -> u16 {
        self.components.len() as u16
    }

    pub(crate) fn component_ids(&self) -> impl Iterator<Item = u16> + use<> {
        1..=self.component_count()
    }

    fn index(&self, component_id: u16) -> Result<usize> {
        if component_id == 0 || component_id > self.component_count() {
            return Err(Error::ErrInvalidComponent(component_id));
        }
        Ok(usize::from(component_id - 1))
    }

    fn component(&self, component_id: u16) -> Result<&ComponentNegotiation> {
        let index = self.index(component_id)?;
        Ok(&self.components[index])
    }

    fn component_mut(&mut self, component_id: u16) -> Result<&mut ComponentNegotiation> {
        let index = self.index(component_id)?;
        Ok(&mut self.components[index])
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Fails with [`Error::ErrDisposed`] once the stream is stopped.
    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.stopped {
            Err(Error::ErrDisposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_component(&self, component_id: u16) -> Result<()> {
        self.index(component_id).map(|_| ())
    }

    pub(crate) fn state(&self, component_id: u16) -> Option<ComponentState> {
        self.component(component_id).ok().map(|c| c.state)
    }

    /// Moves a component to `next`, reporting the readiness change if any.
    pub(crate) fn transition(&mut self, component_id: u16, next: ComponentState) -> Result<()> {
        let component = self.component_mut(component_id)?;
        let current = component.state;
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(Error::ErrInvalidStateTransition(format!(
                "{current} -> {next} for component {component_id}"
            )));
        }
        component.state = next;
        log::trace!("component {component_id}: {current} -> {next}");

        if let Some(connection_state) = next.connection_state() {
            self.report(component_id, connection_state);
        }
        if next == ComponentState::Active
            && self
                .components
                .iter()
                .all(|c| c.state == ComponentState::Active)
        {
            for id in self.component_ids() {
                self.report(id, ConnectionState::Ready);
            }
        }

        Ok(())
    }

    /// Queues a `StateChanged` only when readiness strictly increases, or on
    /// the first failure.
    fn report(&mut self, component_id: u16, state: ConnectionState) {
        let Ok(component) = self.component_mut(component_id) else {
            return;
        };
        let report = match component.reported {
            Some(ConnectionState::Failed) => false,
            Some(_) if state == ConnectionState::Failed => true,
            Some(previous) => state > previous,
            None => true,
        };
        if report {
            component.reported = Some(state);
            self.events
                .push_back(StreamTransmitterEvent::StateChanged(component_id, state));
        }
    }

    /// Starts gathering on every component.
    pub(crate) fn start_gathering(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self
            .components
            .iter()
            .any(|c| c.state != ComponentState::Idle)
        {
            return Err(Error::ErrAlreadyGathering);
        }
        for id in self.component_ids() {
            self.transition(id, ComponentState::Gathering)?;
        }
        Ok(())
    }

    /// Records and reports one local candidate.
    pub(crate) fn add_local_candidate(&mut self, candidate: Candidate) -> Result<()> {
        let component = self.component_mut(candidate.component())?;
        component.local_candidates.push(candidate.clone());
        log::debug!("new local candidate {candidate}");
        self.events
            .push_back(StreamTransmitterEvent::NewLocalCandidate(candidate));
        Ok(())
    }

    pub(crate) fn local_candidates(&self, component_id: u16) -> &[Candidate] {
        self.component(component_id)
            .map_or(&[], |c| c.local_candidates.as_slice())
    }

    pub(crate) fn replace_local_candidate(&mut self, candidate: Candidate) -> Result<()> {
        let component = self.component_mut(candidate.component())?;
        component.local_candidates = vec![candidate];
        Ok(())
    }

    /// Marks a component as done gathering. `LocalCandidatesPrepared` is
    /// queued once every component is done.
    pub(crate) fn mark_prepared(&mut self, component_id: u16) -> Result<()> {
        let component = self.component_mut(component_id)?;
        if component.prepared {
            return Ok(());
        }
        component.prepared = true;
        if component.state == ComponentState::Gathering {
            self.transition(component_id, ComponentState::Prepared)?;
        }

        self.report_prepared();
        Ok(())
    }

    /// Queues `LocalCandidatesPrepared` the first time every component is
    /// either prepared or failed.
    fn report_prepared(&mut self) {
        if self.prepared_reported {
            return;
        }
        if self
            .components
            .iter()
            .all(|c| c.prepared || c.state == ComponentState::Failed)
        {
            self.prepared_reported = true;
            self.events
                .push_back(StreamTransmitterEvent::LocalCandidatesPrepared);
        }
    }

    pub(crate) fn is_prepared(&self, component_id: u16) -> bool {
        self.component(component_id).is_ok_and(|c| c.prepared)
    }

    /// Fixes how remote candidates are supplied, rejecting the other way.
    pub(crate) fn set_remote_mode(&mut self, mode: RemoteMode) -> Result<()> {
        match (self.remote_mode, mode) {
            (Some(RemoteMode::Forced), RemoteMode::Added) => Err(Error::ErrRemoteCandidatesForced),
            (Some(RemoteMode::Added), RemoteMode::Forced) => Err(Error::ErrRemoteCandidatesAdded),
            _ => {
                self.remote_mode = Some(mode);
                Ok(())
            }
        }
    }

    /// Groups forced remote candidates by component. A component takes one
    /// remote, and a component already set keeps its remote.
    pub(crate) fn forced_remotes<'c>(
        &self,
        candidates: &'c [Candidate],
    ) -> Result<BTreeMap<u16, &'c Candidate>> {
        let mut forced: BTreeMap<u16, &'c Candidate> = BTreeMap::new();
        for candidate in candidates {
            let component_id = candidate.component();
            let previous = forced
                .get(&component_id)
                .copied()
                .or(self.remote(component_id));
            if previous.is_some_and(|previous| previous != candidate) {
                return Err(Error::ErrAlreadyForced(component_id));
            }
            forced.insert(component_id, candidate);
        }
        Ok(forced)
    }

    pub(crate) fn remote(&self, component_id: u16) -> Option<&Candidate> {
        self.component(component_id)
            .ok()
            .and_then(|c| c.remote.as_ref())
    }

    pub(crate) fn set_remote(&mut self, candidate: Candidate) -> Result<()> {
        let component = self.component_mut(candidate.component())?;
        component.remote = Some(candidate);
        Ok(())
    }

    pub(crate) fn active_pair(&self, component_id: u16) -> Option<&CandidatePair> {
        self.component(component_id)
            .ok()
            .and_then(|c| c.active_pair.as_ref())
    }

    /// Selects `pair` for its component and reports it once.
    pub(crate) fn activate(&mut self, pair: CandidatePair) -> Result<()> {
        let component_id = pair.component();
        if self.active_pair(component_id) == Some(&pair) {
            return Ok(());
        }

        self.transition(component_id, ComponentState::Pairing)?;
        self.component_mut(component_id)?.active_pair = Some(pair.clone());
        log::debug!("component {component_id} active pair {pair}");
        self.events
            .push_back(StreamTransmitterEvent::NewActiveCandidatePair(pair));
        self.transition(component_id, ComponentState::Active)
    }

    /// Moves a component to `Failed` and reports why. A failed component no
    /// longer holds back `LocalCandidatesPrepared`.
    pub(crate) fn fail(&mut self, component_id: u16, err: &Error) -> Result<()> {
        log::warn!("component {component_id} failed: {err}");
        self.transition(component_id, ComponentState::Failed)?;
        self.push_error(err);
        self.report_prepared();
        Ok(())
    }

    pub(crate) fn push_error(&mut self, err: &Error) {
        self.events
            .push_back(StreamTransmitterEvent::Error(err.kind(), err.to_string()));
    }

    pub(crate) fn push_event(&mut self, event: StreamTransmitterEvent) {
        if !self.stopped {
            self.events.push_back(event);
        }
    }

    pub(crate) fn poll_event(&mut self) -> Option<StreamTransmitterEvent> {
        self.events.pop_front()
    }

    /// Moves every component to `Stopped` and drops pending events. Only the
    /// first call succeeds.
    pub(crate) fn stop(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.stopped = true;
        for component in &mut self.components {
            component.state = ComponentState::Stopped;
        }
        self.events.clear();
        Ok(())
    }
}
