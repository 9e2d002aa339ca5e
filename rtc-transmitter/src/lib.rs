//! # rtc-transmitter
//!
//! Media transport for conferencing: negotiates transport candidates with a
//! remote peer and shares a small set of real UDP sockets between many
//! streams.
//!
//! The crate is organised around four pieces:
//!
//! - [`Candidate`]: one transport address a component can be reached at, with
//!   a line and a JSON representation for the signaling channel
//! - [`EndpointPool`]: reference counted sockets, shared by every stream that
//!   asks for the same local address and port (or multicast group)
//! - [`Transmitter`]: one per session, owns the pool and exposes the fan-out
//!   ([`Transmitter::send`]) and fan-in ([`Transmitter::recv`]) points of each
//!   component
//! - [`StreamTransmitter`]: one per remote participant, runs candidate
//!   gathering and pairing and toggles sending and receiving
//!
//! Three transports are built in: `multicast`, `rawudp` and, on unix, `shm`
//! for processes of one host.
//!
//! ## Event loop
//!
//! Nothing runs in the background. The application drives each stream:
//!
//! 1. Calling operations such as `gather_local_candidates()` and
//!    `add_remote_candidates()`
//! 2. Draining notifications with `poll_event()`
//! 3. Calling `handle_timeout()` when `poll_timeout()` expires
//! 4. Answering `DiscoveryRequested` events with `complete_discovery()`
//!
//! ```rust,no_run
//! use rtc_transmitter::{
//!     StreamTransmitterConfig, StreamTransmitterEvent, TransmitterConfig, TransmitterRegistry,
//! };
//!
//! # fn main() -> rtc_transmitter::Result<()> {
//! let registry = TransmitterRegistry::default();
//! let mut transmitter = registry.create("rawudp", TransmitterConfig::default())?;
//! let mut stream = transmitter.new_stream_transmitter(StreamTransmitterConfig::default())?;
//!
//! stream.gather_local_candidates()?;
//! while let Some(event) = stream.poll_event() {
//!     if let StreamTransmitterEvent::NewLocalCandidate(candidate) = event {
//!         println!("a={}", candidate.marshal());
//!     }
//! }
//!
//! transmitter.send(1, b"payload")?;
//! while let Some(datagram) = transmitter.recv(1)? {
//!     println!("{} bytes from {}", datagram.message.len(), datagram.transport.peer_addr);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]

pub mod candidate;
pub mod config;
pub mod gate;
pub mod multicast;
pub mod pool;
pub mod rawudp;
#[cfg(unix)]
pub mod shm;
pub mod stream;
pub mod transmitter;

pub use candidate::candidate_pair::CandidatePair;
pub use candidate::{
    COMPONENT_RTCP, COMPONENT_RTP, Candidate, CandidateType, find_candidate_by_foundation,
    marshal_candidates, unmarshal_candidate, unmarshal_candidates,
};
pub use config::{StreamTransmitterConfig, TransmitterConfig};
pub use gate::{DirectionGate, GatedEndpoint};
pub use multicast::{MulticastStreamTransmitter, MulticastTransmitter};
pub use pool::{EndpointId, EndpointKey, EndpointPool, EndpointRef, EndpointRequest};
pub use rawudp::{RawUdpStreamTransmitter, RawUdpTransmitter};
#[cfg(unix)]
pub use shm::{ShmStreamTransmitter, ShmTransmitter};
pub use stream::{
    ComponentState, ConnectionState, DiscoveryId, DiscoveryRequest, StreamTransmitter,
    StreamTransmitterEvent,
};
pub use transmitter::registry::{TransmitterConstructor, TransmitterRegistry};
pub use transmitter::{Transmitter, TransmitterType};

pub use shared::error::{Error, ErrorKind, Result};
pub use shared::ifaces;
