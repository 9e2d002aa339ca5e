//! Per peer negotiation of the transport path of one stream.
//!
//! A [`StreamTransmitter`] gathers local candidates, accepts remote candidates
//! from the signaling channel and reports the active candidate pair of each
//! component. It performs no I/O on its own schedule: the application calls
//! its operations, feeds it time through
//! [`handle_timeout`](StreamTransmitter::handle_timeout) and drains
//! [`StreamTransmitterEvent`]s with [`poll_event`](StreamTransmitter::poll_event).
//!
//! ```rust,ignore
//! stream.gather_local_candidates()?;
//! while let Some(event) = stream.poll_event() {
//!     match event {
//!         StreamTransmitterEvent::NewLocalCandidate(candidate) => {
//!             signaling.send(candidate.marshal());
//!         }
//!         StreamTransmitterEvent::NewActiveCandidatePair(pair) => {
//!             println!("component {} uses {pair}", pair.component());
//!         }
//!         _ => {}
//!     }
//! }
//! ```


pub(crate) mod negotiation;

use crate::candidate::Candidate;
use crate::candidate::candidate_pair::CandidatePair;
use shared::error::{Error, ErrorKind, Result};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Negotiation state of one component.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ComponentState {
    #[default]
    Idle,
    /// Local candidates are being discovered.
    Gathering,
    /// Every local candidate has been reported.
    Prepared,
    /// A local endpoint and a remote candidate are being paired.
    Pairing,
    /// The component has an active candidate pair.
    Active,
    Failed,
    Stopped,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Idle => "Idle",
            Self::Gathering => "Gathering",
            Self::Prepared => "Prepared",
            Self::Pairing => "Pairing",
            Self::Active => "Active",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
        };
        write!(f, "{s}")
    }
}

impl ComponentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ComponentState) -> bool {
        match (self, next) {
            (_, Self::Stopped) => true,
            (current, Self::Failed) => !current.is_terminal(),
            (Self::Idle, Self::Gathering)
            | (Self::Gathering, Self::Prepared)
            | (Self::Gathering | Self::Prepared, Self::Pairing)
            | (Self::Pairing, Self::Active)
            | (Self::Active, Self::Pairing) => true,
            _ => false,
        }
    }

    /// The readiness reported for a component in this state, if any.
    pub(crate) fn connection_state(self) -> Option<ConnectionState> {
        match self {
            Self::Idle => Some(ConnectionState::Idle),
            Self::Gathering => Some(ConnectionState::Gathering),
            Self::Pairing => Some(ConnectionState::Connecting),
            Self::Active => Some(ConnectionState::Connected),
            Self::Failed => Some(ConnectionState::Failed),
            Self::Prepared | Self::Stopped => None,
        }
    }
}

/// Readiness of a component as reported through
/// [`StreamTransmitterEvent::StateChanged`].
///
/// Reported values only ever increase along the declaration order, except
/// that `Failed` may follow any of them.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    #[default]
    Idle,
    Gathering,
    Connecting,
    Connected,
    /// Every component of the stream is connected.
    Ready,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Idle => "Idle",
            Self::Gathering => "Gathering",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Identifies a pending server reflexive discovery.
pub type DiscoveryId = u64;

/// Asks the application to resolve the public address of a local socket.
///
/// The answer goes back through
/// [`StreamTransmitter::complete_discovery`]. Without an answer before
/// `deadline` the stream falls back to host candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub id: DiscoveryId,
    pub component_id: u16,
    /// The discovery server to query.
    pub server: SocketAddr,
    /// The pooled socket whose mapped address is wanted.
    pub local_addr: SocketAddr,
    pub deadline: Instant,
}

/// Notifications of a stream transmitter, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamTransmitterEvent {
    /// One newly discovered local candidate.
    NewLocalCandidate(Candidate),
    /// No more local candidates will be reported. Emitted once per stream.
    LocalCandidatesPrepared,
    /// A component selected the pair it sends and receives with.
    NewActiveCandidatePair(CandidatePair),
    /// The readiness of a component changed.
    StateChanged(u16, ConnectionState),
    /// A component's socket got its first sender; downstream should start
    /// with a key frame.
    KeyFrameRequested(u16),
    /// The application should perform a server reflexive discovery.
    DiscoveryRequested(DiscoveryRequest),
    /// An asynchronous failure, such as a discovery timeout.
    Error(ErrorKind, String),
}

/// Negotiation and direction control of one stream towards one peer.
pub trait StreamTransmitter: Send {
    /// Starts local candidate discovery. Candidates are reported as
    /// [`StreamTransmitterEvent::NewLocalCandidate`] events, followed by one
    /// [`StreamTransmitterEvent::LocalCandidatesPrepared`].
    fn gather_local_candidates(&mut self) -> Result<()>;

    /// Adds remote candidates received from the peer.
    fn add_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<()>;

    /// Uses the given remote candidates without any connectivity check, at
    /// most one per component.
    fn force_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<()>;

    fn set_sending(&mut self, sending: bool) -> Result<()>;

    fn sending(&self) -> bool;

    fn set_receiving(&mut self, receiving: bool) -> Result<()>;

    fn receiving(&self) -> bool;

    /// State of a component, `None` when the component doesn't exist.
    fn component_state(&self, component_id: u16) -> Option<ComponentState>;

    /// Local candidates reported so far for a component.
    fn local_candidates(&self, component_id: u16) -> &[Candidate];

    fn active_pair(&self, component_id: u16) -> Option<&CandidatePair>;

    /// Answers a [`StreamTransmitterEvent::DiscoveryRequested`] with the
    /// mapped address or the failure.
    fn complete_discovery(
        &mut self,
        _id: DiscoveryId,
        _result: Result<SocketAddr>,
    ) -> Result<()> {
        Err(Error::ErrNotImplemented("complete_discovery".to_owned()))
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()>;

    /// The next instant [`handle_timeout`](Self::handle_timeout) must be
    /// called at, if any.
    fn poll_timeout(&mut self) -> Option<Instant>;

    fn poll_event(&mut self) -> Option<StreamTransmitterEvent>;

    /// Releases every pooled endpoint of the stream and moves every component
    /// to [`ComponentState::Stopped`]. Pending events are discarded.
    fn stop(&mut self) -> Result<()>;

    fn is_stopped(&self) -> bool;
}
