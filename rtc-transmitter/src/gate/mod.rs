
use crate::pool::EndpointRef;
use shared::error::Result;

/// A per component registration whose directions a [`DirectionGate`]
/// toggles.
pub trait GatedEndpoint {
    fn component_id(&self) -> u16;

    fn is_sending(&self) -> bool;

    fn is_receiving(&self) -> bool;

    /// Returns `true` when the registration got the first sender of its
    /// socket.
    fn set_sending(&mut self, sending: bool) -> Result<bool>;

    fn set_receiving(&mut self, receiving: bool) -> Result<()>;
}

impl GatedEndpoint for EndpointRef {
    fn component_id(&self) -> u16 {
        self.key().component_id
    }

    fn is_sending(&self) -> bool {
        EndpointRef::is_sending(self)
    }

    fn is_receiving(&self) -> bool {
        EndpointRef::is_receiving(self)
    }

    fn set_sending(&mut self, sending: bool) -> Result<bool> {
        EndpointRef::set_sending(self, sending)
    }

    fn set_receiving(&mut self, receiving: bool) -> Result<()> {
        EndpointRef::set_receiving(self, receiving)
    }
}

/// The sending and receiving wishes of one stream.
///
/// The gate toggles the stream's registration on the sockets it holds.
/// Sockets stay bound, and pooled ones stay shared with other streams,
/// whatever the flags are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionGate {
    sending: bool,
    receiving: bool,
}

impl Default for DirectionGate {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl DirectionGate {
    pub fn new(sending: bool, receiving: bool) -> Self {
        Self { sending, receiving }
    }

    pub fn sending(&self) -> bool {
        self.sending
    }

    pub fn receiving(&self) -> bool {
        self.receiving
    }

    /// Applies the current flags to a freshly acquired endpoint.
    ///
    /// Returns `true` when the endpoint's socket got its first sender.
    pub fn attach<E: GatedEndpoint>(&self, endpoint: &mut E) -> Result<bool> {
        endpoint.set_receiving(self.receiving)?;
        endpoint.set_sending(self.sending)
    }

    /// Updates the sending flag on every endpoint of the stream.
    ///
    /// Returns the components whose socket went from no sender to one sender.
    /// When an endpoint fails, the endpoints already switched are switched
    /// back and the flag keeps its previous value.
    pub fn set_sending<'a, E, I>(&mut self, sending: bool, endpoints: I) -> Result<Vec<u16>>
    where
        E: GatedEndpoint + 'a,
        I: IntoIterator<Item = &'a mut E>,
    {
        let mut endpoints: Vec<&'a mut E> = endpoints.into_iter().collect();

        let mut started = vec![];
        let mut switched = vec![];
        for index in 0..endpoints.len() {
            let endpoint = &mut *endpoints[index];
            if endpoint.is_sending() == sending {
                continue;
            }
            match endpoint.set_sending(sending) {
                Ok(first) => {
                    if first {
                        started.push(endpoint.component_id());
                    }
                    switched.push(index);
                }
                Err(err) => {
                    rollback(&mut endpoints, &switched, |e| {
                        e.set_sending(!sending).map(|_| ())
                    });
                    return Err(err);
                }
            }
        }
        self.sending = sending;
        log::trace!("sending {sending}, started components {started:?}");

        Ok(started)
    }

    /// Updates the receiving flag on every endpoint of the stream, all or
    /// nothing like [`DirectionGate::set_sending`].
    pub fn set_receiving<'a, E, I>(&mut self, receiving: bool, endpoints: I) -> Result<()>
    where
        E: GatedEndpoint + 'a,
        I: IntoIterator<Item = &'a mut E>,
    {
        let mut endpoints: Vec<&'a mut E> = endpoints.into_iter().collect();

        let mut switched = vec![];
        for index in 0..endpoints.len() {
            let endpoint = &mut *endpoints[index];
            if endpoint.is_receiving() == receiving {
                continue;
            }
            if let Err(err) = endpoint.set_receiving(receiving) {
                rollback(&mut endpoints, &switched, |e| e.set_receiving(!receiving));
                return Err(err);
            }
            switched.push(index);
        }
        self.receiving = receiving;

        Ok(())
    }

    /// Unregisters every endpoint without changing the wished flags.
    pub(crate) fn detach<'a, E, I>(&self, endpoints: I) -> Result<()>
    where
        E: GatedEndpoint + 'a,
        I: IntoIterator<Item = &'a mut E>,
    {
        for endpoint in endpoints {
            endpoint.set_sending(false)?;
            endpoint.set_receiving(false)?;
        }
        Ok(())
    }
}

/// Reverts the endpoints at the `switched` positions with `undo`.
fn rollback<E, F>(endpoints: &mut [&mut E], switched: &[usize], mut undo: F)
where
    E: GatedEndpoint,
    F: FnMut(&mut E) -> Result<()>,
{
    for &index in switched {
        let endpoint = &mut *endpoints[index];
        if let Err(err) = undo(endpoint) {
            log::warn!(
                "failed to roll back endpoint of component {}: {err}",
                endpoint.component_id()
            );
        }
    }
}
