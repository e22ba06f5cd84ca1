use std::future::Future;

use tracing::{debug, warn, Instrument};

use crate::address::EndPointAddress;
use crate::end_point::EndPoint;
use crate::error::TransportError;

/// A [Transport] creates end points on top of some carrier (TCP, in-process queues, ...). This
///  trait is all application code needs to know about the carrier, so code written against it
///  runs unchanged on any carrier.
#[async_trait::async_trait]
pub trait Transport : Sync + Send {
    /// Creates an end point with a fresh address that does not collide with any live end point
    ///  of this transport.
    async fn new_endpoint(&self) -> Result<EndPoint, TransportError>;

    /// Closes all end points of this transport (their consumers see `EndPointClosed`) and
    ///  releases carrier resources. `new_endpoint` fails afterwards.
    async fn close_transport(&self);
}

#[async_trait::async_trait]
pub trait TransportExt: Transport {
    /// Creates an end point and runs `handler` on it in a task of its own, returning the new end
    ///  point's address without waiting for the handler. The handler owns the end point; errors
    ///  it returns are logged.
    async fn spawn<F, Fut>(&self, handler: F) -> Result<EndPointAddress, TransportError>
    where
        F: FnOnce(EndPoint) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let end_point = self.new_endpoint().await?;
        let address = end_point.address().clone();

        let span = tracing::debug_span!("spawned", address = %address);
        let task_address = address.clone();
        tokio::spawn(async move {
            match handler(end_point).await {
                Ok(()) => debug!("handler for {:?} finished", task_address),
                Err(e) => warn!("handler for {:?} failed: {}", task_address, e),
            }
        }.instrument(span));

        Ok(address)
    }
}

impl <T: Transport + ?Sized> TransportExt for T {
}
