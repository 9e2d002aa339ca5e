
use std::fmt;
use std::io;
use std::net;
use std::num::ParseIntError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    // Candidate
    #[error("candidate: component id {0} is out of range")]
    ErrInvalidComponent(u16),
    #[error("candidate: {0}")]
    ErrInvalidCandidate(String),
    #[error("candidate: attribute not long enough to be a candidate ({0} fields)")]
    ErrAttributeTooShortCandidate(usize),
    #[error("candidate: could not parse related addresses")]
    ErrParseRelatedAddr,
    #[error("candidate: unknown candidate type {0}")]
    ErrUnknownCandidateType(String),
    #[error("candidate: unknown transport protocol {0}")]
    ErrUnknownTransportProtocol(String),
    #[error("candidate: unknown extension attribute {0}")]
    ErrUnknownCandidateAttribute(String),

    // Configuration
    #[error("config: invalid number of components {0}, must be between 1 and 255")]
    ErrInvalidComponentCount(u16),
    #[error("config: more than one preferred local candidate for component {0}")]
    ErrDuplicatePreferredCandidate(u16),
    #[error("{0}")]
    ErrInvalidArguments(String),

    // Endpoint pool
    #[error("pool: {0} is not a multicast address")]
    ErrNotMulticastAddress(String),
    #[error("pool: multicast ttl must be at least 1")]
    ErrInvalidTtl,
    #[error("pool: no free port at or above {0}")]
    ErrNoPortAvailable(u16),
    #[error("pool: could not assemble endpoint: {0}")]
    ErrConstruction(String),

    // Negotiation
    #[error("stream: local candidate gathering already started")]
    ErrAlreadyGathering,
    #[error("stream: remote candidates have been forced, can't add remote candidates")]
    ErrRemoteCandidatesForced,
    #[error("stream: remote candidates have been added, can't force remote candidates")]
    ErrRemoteCandidatesAdded,
    #[error("stream: a different remote candidate was already forced for component {0}")]
    ErrAlreadyForced(u16),
    #[error("stream: no local ip address found")]
    ErrNoLocalAddress,
    #[error("stream: discovery timed out after {0:?}")]
    ErrDiscoveryTimeout(std::time::Duration),
    #[error("stream: discovery failed: {0}")]
    ErrDiscoveryFailed(String),
    #[error("stream: invalid component state transition {0}")]
    ErrInvalidStateTransition(String),
    #[error("stream: stream transmitter has been stopped")]
    ErrDisposed,
    #[error("not implemented: {0}")]
    ErrNotImplemented(String),

    // Transmitter registry
    #[error("transmitter: no transmitter named {0}")]
    ErrUnknownTransmitter(String),
    #[error("transmitter: a transmitter named {0} is already registered")]
    ErrTransmitterRegistered(String),

    //Third Party Error
    #[error("parse ip: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("{0}")]
    Io(#[source] IoError),

    #[error("mutex poison: {0}")]
    PoisonError(String),
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an [`Error`], used by callers that only need to
/// decide how to react to a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed candidate, out-of-range component or missing required address.
    InvalidArguments,
    /// Socket, bind, multicast join or send failure.
    Network,
    /// Pooled wiring or a transmitter could not be assembled.
    Construction,
    /// A different remote candidate is already forced for the component.
    AlreadyExists,
    /// The stream transmitter has been stopped.
    Disposed,
    /// The transport does not support the operation.
    NotImplemented,
    /// Lock poisoning and otherwise unclassified failures.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ErrorKind::InvalidArguments => "invalid arguments",
            ErrorKind::Network => "network",
            ErrorKind::Construction => "construction",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Disposed => "disposed",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ErrInvalidComponent(_)
            | Error::ErrInvalidCandidate(_)
            | Error::ErrAttributeTooShortCandidate(_)
            | Error::ErrParseRelatedAddr
            | Error::ErrUnknownCandidateType(_)
            | Error::ErrUnknownTransportProtocol(_)
            | Error::ErrUnknownCandidateAttribute(_)
            | Error::ErrInvalidComponentCount(_)
            | Error::ErrDuplicatePreferredCandidate(_)
            | Error::ErrInvalidArguments(_)
            | Error::ErrNotMulticastAddress(_)
            | Error::ErrInvalidTtl
            | Error::ErrAlreadyGathering
            | Error::ErrRemoteCandidatesForced
            | Error::ErrRemoteCandidatesAdded
            | Error::ParseIp(_)
            | Error::ParseInt(_) => ErrorKind::InvalidArguments,
            Error::ErrNoPortAvailable(_)
            | Error::ErrNoLocalAddress
            | Error::ErrDiscoveryTimeout(_)
            | Error::ErrDiscoveryFailed(_)
            | Error::Io(_) => ErrorKind::Network,
            Error::ErrConstruction(_) | Error::ErrUnknownTransmitter(_) => {
                ErrorKind::Construction
            }
            Error::ErrAlreadyForced(_) | Error::ErrTransmitterRegistered(_) => {
                ErrorKind::AlreadyExists
            }
            Error::ErrDisposed => ErrorKind::Disposed,
            Error::ErrNotImplemented(_) => ErrorKind::NotImplemented,
            Error::ErrInvalidStateTransition(_) | Error::PoisonError(_) | Error::Other(_) => {
                ErrorKind::Internal
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}
