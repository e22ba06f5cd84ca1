use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};

use crate::address::EndPointAddress;
use crate::connection::ConnectionBackend;
use crate::end_point::EndPointBackend;
use crate::error::ConnectError;
use crate::event::Reliability;
use crate::event_queue::EventSink;
use crate::tcp::tcp_control_messages::{ConnectRequest, PeerNotice};
use crate::tcp::tcp_sender::{read_peer_notice, TcpSender};
use crate::tcp::tcp_transport::TransportShared;

/// TCP end point addresses are `host:port:index`, with `host:port` being the transport's listener
pub fn format_address(socket_addr: SocketAddr, index: u64) -> EndPointAddress {
    EndPointAddress::from(format!("{}:{}", socket_addr, index))
}

pub fn parse_address(address: &EndPointAddress) -> Option<(SocketAddr, u64)> {
    let s = std::str::from_utf8(address.as_bytes()).ok()?;
    let (socket_addr, index) = s.rsplit_once(':')?;
    Some((socket_addr.parse().ok()?, index.parse().ok()?))
}


/// The part of an end point that the transport's accept loop needs to reach
pub(crate) struct EndPointShared {
    pub index: u64,
    pub sink: EventSink,
    /// stops the receivers of this end point's inbound connections, and the watchers of its
    ///  outbound connections
    pub shutdown: broadcast::Sender<()>,
    /// `None` once the end point is shut down
    outbound: Mutex<Option<Vec<Arc<TcpSender>>>>,
}

impl EndPointShared {
    pub fn new(index: u64, sink: EventSink) -> EndPointShared {
        let (shutdown, _) = broadcast::channel(1);
        EndPointShared {
            index,
            sink,
            shutdown,
            outbound: Mutex::new(Some(Vec::new())),
        }
    }

    /// Stops inbound receivers and closes outbound connections. Idempotent.
    pub async fn shut_down(&self) {
        let Some(outbound) = self.outbound.lock().await.take() else {
            return;
        };

        // no receivers just means there are no inbound connections
        let _ = self.shutdown.send(());

        debug!("{:?}: closing {} outbound connections", self.sink.address(), outbound.len());
        for sender in outbound {
            sender.close().await;
        }
    }

    /// Watches the reverse direction of an outbound stream until the peer's notice arrives, the
    ///  stream ends, or this end point shuts down.
    async fn watch_outbound(self: Arc<Self>, sender: Arc<TcpSender>, mut reader: OwnedReadHalf, mut shutdown: broadcast::Receiver<()>) {
        let notice = tokio::select! {
            _ = shutdown.recv() => return,
            notice = read_peer_notice(&mut reader) => notice,
        };

        match notice {
            Ok(Some(PeerNotice::EndPointClosed)) => self.on_peer_closed(&sender).await,
            Ok(None) => trace!("{:?}: stream to {:?} ended", self.sink.address(), sender.peer()),
            Err(e) => debug!("{:?}: error reading from stream to {:?}: {}", self.sink.address(), sender.peer(), e),
        }
    }

    /// Every open connection to the closed peer receives the notice, but only the last one of
    ///  them to be marked reports it.
    async fn on_peer_closed(&self, sender: &TcpSender) {
        let outbound = self.outbound.lock().await;
        let Some(outbound) = outbound.as_ref() else {
            return;
        };
        if !sender.mark_peer_closed() {
            return;
        }
        if outbound.iter().any(|s| s.peer() == sender.peer() && !s.is_closed()) {
            return;
        }

        self.sink.peer_closed(sender.peer().clone()).await;
    }
}


pub(crate) struct TcpEndPoint {
    pub shared: Arc<EndPointShared>,
    pub transport: Arc<TransportShared>,
}

#[async_trait]
impl EndPointBackend for TcpEndPoint {
    async fn connect(&self, target: &EndPointAddress, reliability: Reliability) -> Result<Arc<dyn ConnectionBackend>, ConnectError> {
        let (socket_addr, target_index) = parse_address(target)
            .ok_or_else(|| ConnectError::InvalidAddress(target.clone()))?;

        let request = ConnectRequest {
            target_index,
            origin: self.shared.sink.address().clone(),
            reliability,
        };
        let (sender, reader) = TcpSender::connect(socket_addr, target, &request, &self.transport.config).await?;
        let sender = Arc::new(sender);

        let mut outbound = self.shared.outbound.lock().await;
        match outbound.as_mut() {
            Some(outbound) => {
                outbound.retain(|s| !s.is_closed());
                outbound.push(sender.clone());

                // subscribing while the end point is known to be open, so the shutdown can not be
                //  missed
                let shutdown = self.shared.shutdown.subscribe();
                tokio::spawn(self.shared.clone().watch_outbound(sender.clone(), reader, shutdown));
            }
            None => {
                debug!("{:?} was closed while connecting to {:?}", self.shared.sink.address(), target);
                sender.close().await;
                return Err(ConnectError::EndPointClosed);
            }
        }

        Ok(sender)
    }

    async fn close(&self) {
        self.transport.remove_end_point(self.shared.index).await;
        self.shared.shut_down().await;
    }
}
