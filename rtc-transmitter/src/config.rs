//! Configuration records for transmitters and stream transmitters.
//!
//! ```rust
//! use rtc_transmitter::{StreamTransmitterConfig, TransmitterConfig};
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//!
//! let config = TransmitterConfig::default().with_components(2).with_tos(0xb8);
//! assert!(config.validate().is_ok());
//!
//! let stream_config = StreamTransmitterConfig::default()
//!     .with_discovery_ip(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)))
//!     .with_discovery_timeout(Duration::from_secs(5));
//! assert!(stream_config.sending);
//! ```

use crate::candidate::Candidate;
use shared::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Default number of components per stream (RTP and RTCP).
pub(crate) const DEFAULT_COMPONENTS: u16 = 2;
pub(crate) const MAX_COMPONENTS: u16 = 255;

/// Default port of the discovery server.
pub(crate) const DEFAULT_DISCOVERY_PORT: u16 = 3478;

/// Default time to wait for server reflexive discovery before falling back
/// to host candidates.
pub(crate) const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Session level configuration shared by every stream of a transmitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransmitterConfig {
    /// Number of components per stream, between 1 and 255.
    pub components: u16,

    /// Type-of-service byte applied to every socket of the session.
    pub tos: Option<u8>,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            components: DEFAULT_COMPONENTS,
            tos: None,
        }
    }
}

impl TransmitterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_components(mut self, components: u16) -> Self {
        self.components = components;
        self
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = Some(tos);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.components == 0 || self.components > MAX_COMPONENTS {
            return Err(Error::ErrInvalidComponentCount(self.components));
        }
        Ok(())
    }
}

/// Per stream configuration.
#[derive(Clone, Debug)]
pub struct StreamTransmitterConfig {
    /// Local candidates to use instead of discovering them, at most one per
    /// component.
    pub preferred_local_candidates: Vec<Candidate>,

    /// Whether the stream starts sending as soon as it has a destination.
    ///
    /// Default: true
    pub sending: bool,

    /// Whether inbound data for the stream is forwarded.
    ///
    /// Default: true
    pub receiving: bool,

    /// Address of the server reflexive discovery server. Discovery is
    /// skipped when unset.
    pub discovery_ip: Option<IpAddr>,

    /// Port of the discovery server.
    ///
    /// Default: 3478
    pub discovery_port: u16,

    /// How long to wait for a discovery answer before falling back to host
    /// candidates.
    ///
    /// Default: 30 seconds
    pub discovery_timeout: Duration,
}

impl Default for StreamTransmitterConfig {
    fn default() -> Self {
        Self {
            preferred_local_candidates: vec![],
            sending: true,
            receiving: true,
            discovery_ip: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

impl StreamTransmitterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preferred_local_candidates(mut self, candidates: Vec<Candidate>) -> Self {
        self.preferred_local_candidates = candidates;
        self
    }

    pub fn with_sending(mut self, sending: bool) -> Self {
        self.sending = sending;
        self
    }

    pub fn with_receiving(mut self, receiving: bool) -> Self {
        self.receiving = receiving;
        self
    }

    pub fn with_discovery_ip(mut self, ip: IpAddr) -> Self {
        self.discovery_ip = Some(ip);
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// The discovery server, if one is configured.
    pub fn discovery_server(&self) -> Option<SocketAddr> {
        self.discovery_ip
            .map(|ip| SocketAddr::new(ip, self.discovery_port))
    }
}
