use super::{Transmitter, TransmitterType};
use crate::config::TransmitterConfig;
use crate::multicast::MulticastTransmitter;
use crate::rawudp::RawUdpTransmitter;
#[cfg(unix)]
use crate::shm::ShmTransmitter;
use shared::error::{Error, Result};
use std::collections::BTreeMap;

/// Builds a transmitter from the session configuration.
pub type TransmitterConstructor = fn(TransmitterConfig) -> Result<Box<dyn Transmitter>>;

/// Maps transport names to transmitter constructors.
///
/// ```rust
/// use rtc_transmitter::{TransmitterConfig, TransmitterRegistry};
///
/// let registry = TransmitterRegistry::default();
/// # #[cfg(unix)]
/// assert_eq!(registry.list_available(), vec!["multicast", "rawudp", "shm"]);
///
/// let transmitter = registry.create("rawudp", TransmitterConfig::default());
/// assert!(transmitter.is_ok());
/// ```
#[derive(Clone)]
pub struct TransmitterRegistry {
    constructors: BTreeMap<String, TransmitterConstructor>,
}

impl Default for TransmitterRegistry {
    fn default() -> Self {
        let mut constructors: BTreeMap<String, TransmitterConstructor> = BTreeMap::new();
        constructors.insert(TransmitterType::Multicast.to_string(), |config| {
            Ok(Box::new(MulticastTransmitter::new(config)?))
        });
        constructors.insert(TransmitterType::RawUdp.to_string(), |config| {
            Ok(Box::new(RawUdpTransmitter::new(config)?))
        });
        #[cfg(unix)]
        constructors.insert(TransmitterType::Shm.to_string(), |config| {
            Ok(Box::new(ShmTransmitter::new(config)?))
        });
        Self { constructors }
    }
}

impl TransmitterRegistry {
    /// A registry with every transport of this crate.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry without any transport.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, constructor: TransmitterConstructor) -> Result<()> {
        if self.constructors.contains_key(name) {
            return Err(Error::ErrTransmitterRegistered(name.to_owned()));
        }
        self.constructors.insert(name.to_owned(), constructor);
        Ok(())
    }

    /// Names of the registered transports, sorted.
    pub fn list_available(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn create(&self, name: &str, config: TransmitterConfig) -> Result<Box<dyn Transmitter>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::ErrUnknownTransmitter(name.to_owned()))?;
        log::debug!("creating {name} transmitter with {} components", config.components);
        constructor(config)
    }
}
