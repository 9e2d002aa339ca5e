
pub mod registry;

use crate::config::{StreamTransmitterConfig, TransmitterConfig};
use crate::pool::EndpointPool;
use crate::stream::StreamTransmitter;
use shared::TaggedBytesMut;
use shared::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// The transports built into this crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransmitterType {
    /// Every participant joins one IP multicast group per component.
    Multicast,
    /// Plain unicast UDP towards one remote address per component.
    RawUdp,
    /// Unix datagram sockets between processes of one host, addressed by
    /// filesystem path.
    Shm,
}

impl fmt::Display for TransmitterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            TransmitterType::Multicast => "multicast",
            TransmitterType::RawUdp => "rawudp",
            TransmitterType::Shm => "shm",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TransmitterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "multicast" => Ok(TransmitterType::Multicast),
            "rawudp" => Ok(TransmitterType::RawUdp),
            "shm" => Ok(TransmitterType::Shm),
            _ => Err(Error::ErrUnknownTransmitter(s.to_owned())),
        }
    }
}

/// Per session transport: owns the pooled sockets of every component and
/// creates one [`StreamTransmitter`] per remote participant.
///
/// [`send`](Transmitter::send) and [`recv`](Transmitter::recv) are the fan-out
/// and fan-in points of each component.
pub trait Transmitter: Send {
    fn transmitter_type(&self) -> TransmitterType;

    fn config(&self) -> &TransmitterConfig;

    fn new_stream_transmitter(
        &mut self,
        config: StreamTransmitterConfig,
    ) -> Result<Box<dyn StreamTransmitter>>;

    /// Sends `payload` to every enabled destination of the component.
    /// Returns the number of datagrams sent.
    fn send(&self, component_id: u16, payload: &[u8]) -> Result<usize>;

    /// Reads one pending datagram of the component, if any.
    fn recv(&self, component_id: u16) -> Result<Option<TaggedBytesMut>>;
}

/// Shared by the transmitters of this crate.
pub(crate) fn new_pool(config: &TransmitterConfig) -> Result<EndpointPool> {
    config.validate()?;
    Ok(EndpointPool::new(config.components, config.tos))
}

/// Rejects component ids outside of the session's range.
pub(crate) fn check_component(config: &TransmitterConfig, component_id: u16) -> Result<()> {
    if component_id == 0 || component_id > config.components {
        Err(Error::ErrInvalidComponent(component_id))
    } else {
        Ok(())
    }
}
