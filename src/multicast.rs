use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::address::MulticastAddress;
use crate::error::MulticastError;

/// The carrier's side of a multicast group, as seen from one end point (the one that created or
///  resolved the group). Subscribing means this end point receives `ReceivedMulticast` events for
///  the group.
#[async_trait]
pub trait MulticastBackend: Send + Sync + 'static {
    fn address(&self) -> &MulticastAddress;

    async fn send(&self, payload: &[Bytes]) -> Result<(), MulticastError>;

    async fn subscribe(&self) -> Result<(), MulticastError>;

    async fn unsubscribe(&self);

    /// removes the group for everybody
    async fn delete(&self);
}


/// A multicast group as seen from the end point that created or resolved it.
///
/// Multicast is best effort: members that are closed while a message is sent do not get it, and
///  there is no ordering guarantee between different senders to the same group.
pub struct MulticastGroup {
    backend: Arc<dyn MulticastBackend>,
}

impl MulticastGroup {
    pub fn new(backend: Arc<dyn MulticastBackend>) -> MulticastGroup {
        MulticastGroup { backend }
    }

    pub fn address(&self) -> &MulticastAddress {
        self.backend.address()
    }

    pub async fn send(&self, payload: &[Bytes]) -> Result<(), MulticastError> {
        self.backend.send(payload).await
    }

    pub async fn subscribe(&self) -> Result<(), MulticastError> {
        self.backend.subscribe().await
    }

    pub async fn unsubscribe(&self) {
        self.backend.unsubscribe().await
    }

    pub async fn delete(&self) {
        self.backend.delete().await
    }
}
