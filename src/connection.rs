use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::address::EndPointAddress;
use crate::error::SendError;
use crate::event::Reliability;
use crate::event_queue::EventSink;

/// The carrier's side of an outbound connection, introduced to decouple the connection's
///  contract from the way a carrier moves bytes.
///
/// Implementations deliver each `send` as one `Received` event at the peer, in call order, and
///  deliver everything sent before `close` ahead of the peer's `ConnectionClosed`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionBackend: Send + Sync + 'static {
    async fn send(&self, payload: &[Bytes]) -> Result<(), SendError>;

    /// Must be idempotent: only the first call has an effect.
    async fn close(&self);
}


/// Per-call options for [crate::end_point::EndPoint::connect_with_hints]
#[derive(Clone, Debug, Default)]
pub struct ConnectHints {
    /// give up connecting after this time; `None` waits as long as the carrier does
    pub connect_timeout: Option<Duration>,
}


/// An outbound, unidirectional connection to a peer end point. Replies (if any) arrive as events
///  on the owning end point, through a separate connection the peer opens in the other direction.
pub struct Connection {
    target: EndPointAddress,
    reliability: Reliability,
    owner: EventSink,
    backend: Arc<dyn ConnectionBackend>,
}

impl Connection {
    pub fn new(target: EndPointAddress, reliability: Reliability, owner: EventSink, backend: Arc<dyn ConnectionBackend>) -> Connection {
        Connection {
            target,
            reliability,
            owner,
            backend,
        }
    }

    pub fn target(&self) -> &EndPointAddress {
        &self.target
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    /// Sends a message consisting of the given fragments. The peer receives them as a single
    ///  `Received` event with the fragment boundaries intact.
    pub async fn send(&self, payload: &[Bytes]) -> Result<(), SendError> {
        if self.owner.is_closed().await {
            return Err(SendError::EndPointClosed);
        }
        self.backend.send(payload).await
    }

    /// Closes the connection after everything sent so far. Closing a connection that is already
    ///  closed (explicitly, or because its end point was closed) has no effect.
    pub async fn close(&self) {
        self.backend.close().await
    }
}
