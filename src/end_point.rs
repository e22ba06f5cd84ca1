use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, info, warn};

use crate::address::{EndPointAddress, MulticastAddress};
use crate::connection::{ConnectHints, Connection, ConnectionBackend};
use crate::error::{ConnectError, MulticastError, ReceiveTimeout};
use crate::event::{Event, Reliability};
use crate::event_queue::{EventSink, EventSource};
use crate::multicast::{MulticastBackend, MulticastGroup};

/// This is what a carrier implements per end point: establishing outbound connections and
///  releasing carrier resources on close. Everything to do with the event queue is handled by
///  [EndPoint] itself, based on the [EventSink] the carrier delivers into.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndPointBackend: Send + Sync + 'static {
    /// Returns once the peer has registered the connection, i.e. after its `ConnectionOpened`
    ///  event was appended to the peer's queue.
    async fn connect(&self, target: &EndPointAddress, reliability: Reliability) -> Result<Arc<dyn ConnectionBackend>, ConnectError>;

    /// Closes all outbound connections, stops delivering inbound traffic and notifies the peers
    ///  of inbound connections that are still open. Called at most once per end point. The end
    ///  point's queue is closed afterwards, but a carrier may close it earlier (e.g. to collect
    ///  the peers to notify).
    async fn close(&self);

    async fn new_multicast_group(&self) -> Result<Arc<dyn MulticastBackend>, MulticastError> {
        Err(MulticastError::Unsupported)
    }

    async fn resolve_multicast_group(&self, _address: &MulticastAddress) -> Result<Arc<dyn MulticastBackend>, MulticastError> {
        Err(MulticastError::Unsupported)
    }
}


/// An addressable source and sink of traffic: it receives connections and data from peers through
///  a single ordered event queue, and it opens outbound connections to other end points.
///
/// All operations take `&self`, so an end point can be shared between tasks (e.g. a task that
///  receives and tasks that connect and send).
///
/// Dropping an end point that was not closed closes it in the background, provided there is a
///  tokio runtime to do that on.
pub struct EndPoint {
    sink: EventSink,
    source: EventSource,
    backend: Arc<dyn EndPointBackend>,
    /// set by the first call to `close`, so the backend is closed only once
    is_closing: AtomicBool,
}

impl EndPoint {
    pub fn new(sink: EventSink, source: EventSource, backend: Arc<dyn EndPointBackend>) -> EndPoint {
        EndPoint {
            sink,
            source,
            backend,
            is_closing: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &EndPointAddress {
        self.sink.address()
    }

    /// Waits for the next event. After the end point was closed, this returns
    ///  [Event::EndPointClosed] instead of waiting.
    pub async fn receive(&self) -> Event {
        self.source.next().await
    }

    /// Like [EndPoint::receive], but gives up after `timeout` without consuming anything.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Event, ReceiveTimeout> {
        tokio::time::timeout(timeout, self.source.next()).await
            .map_err(|_| ReceiveTimeout(timeout))
    }

    pub async fn connect(&self, target: &EndPointAddress, reliability: Reliability) -> Result<Connection, ConnectError> {
        self.connect_with_hints(target, reliability, ConnectHints::default()).await
    }

    /// Opens a connection to `target`, returning once the target end point registered it. The
    ///  target's `ConnectionOpened` event is in its queue by then, so it is guaranteed to precede
    ///  anything sent through the returned connection.
    pub async fn connect_with_hints(&self, target: &EndPointAddress, reliability: Reliability, hints: ConnectHints) -> Result<Connection, ConnectError> {
        if self.sink.is_closed().await {
            return Err(ConnectError::EndPointClosed);
        }

        debug!("{:?}: connecting to {:?} ({:?})", self.address(), target, reliability);
        let connecting = self.backend.connect(target, reliability);
        let backend = match hints.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connecting).await
                .map_err(|_| ConnectError::Timeout(timeout))??,
            None => connecting.await?,
        };

        Ok(Connection::new(target.clone(), reliability, self.sink.clone(), backend))
    }

    /// Closes the end point: outbound connections are closed (peers see `ConnectionClosed`), open
    ///  inbound connections end and their peers get [Event::PeerClosed], and the consumer gets
    ///  [Event::EndPointClosed] after all events that were queued before.
    ///
    /// Closing again has no effect, also while the first call is still in progress.
    pub async fn close(&self) {
        if self.is_closing.swap(true, Ordering::AcqRel) {
            debug!("{:?}: already closed", self.address());
            return;
        }

        info!("closing end point {:?}", self.address());
        self.backend.close().await;
        self.sink.close().await;
    }

    pub async fn new_multicast_group(&self) -> Result<MulticastGroup, MulticastError> {
        if self.sink.is_closed().await {
            return Err(MulticastError::EndPointClosed);
        }
        Ok(MulticastGroup::new(self.backend.new_multicast_group().await?))
    }

    pub async fn resolve_multicast_group(&self, address: &MulticastAddress) -> Result<MulticastGroup, MulticastError> {
        if self.sink.is_closed().await {
            return Err(MulticastError::EndPointClosed);
        }
        Ok(MulticastGroup::new(self.backend.resolve_multicast_group(address).await?))
    }
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        if self.is_closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("{:?} was dropped outside of a tokio runtime without being closed", self.address());
            return;
        };

        debug!("{:?} was dropped without being closed - closing it", self.address());
        let sink = self.sink.clone();
        let backend = self.backend.clone();
        runtime.spawn(async move {
            backend.close().await;
            sink.close().await;
        });
    }
}
