use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::TcpConfig;
use crate::end_point::EndPoint;
use crate::error::TransportError;
use crate::event_queue::event_queue;
use crate::tcp::tcp_control_messages::ConnectStatus;
use crate::tcp::tcp_endpoint::{format_address, EndPointShared, TcpEndPoint};
use crate::tcp::tcp_receiver::{read_connect_request, send_connect_response, TcpReceiver};
use crate::transport::Transport;

struct TransportState {
    is_open: bool,
    next_end_point_index: u64,
    end_points: FxHashMap<u64, Arc<EndPointShared>>,
}

pub(crate) struct TransportShared {
    pub config: TcpConfig,
    local_addr: SocketAddr,
    /// stops the accept loop
    shutdown: broadcast::Sender<()>,
    state: Mutex<TransportState>,
}

impl TransportShared {
    pub async fn remove_end_point(&self, index: u64) {
        self.state.lock().await
            .end_points
            .remove(&index);
    }

    /// Looks up an end point, subscribing to its shutdown signal while it is guaranteed to be
    ///  registered so that a concurrent close can not slip through.
    async fn end_point_for_inbound(&self, index: u64) -> Option<(Arc<EndPointShared>, broadcast::Receiver<()>)> {
        let state = self.state.lock().await;
        let end_point = state.end_points.get(&index)?;
        Some((end_point.clone(), end_point.shutdown.subscribe()))
    }
}


/// A carrier based on TCP. Each transport has a single listener, and its end points are
///  distinguished by an index that is part of their address (`host:port:index`).
///
/// Every connection is a TCP stream of its own: the connecting side sends a handshake, and after
///  the target confirmed it, only data and close frames. The only thing flowing back after the
///  handshake is a notice when the target end point is closed, which the connecting end point
///  reports as [crate::event::Event::PeerClosed]. This carrier
///  delivers everything reliably and in order, regardless of the requested reliability, and it
///  does not support multicast.
pub struct TcpTransport {
    shared: Arc<TransportShared>,
}

impl TcpTransport {
    pub async fn bind(config: TcpConfig) -> Result<TcpTransport, TransportError> {
        config.validate()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("TCP transport listening on {}", local_addr);

        let (shutdown, shutdown_receiver) = broadcast::channel(1);
        let shared = Arc::new(TransportShared {
            config,
            local_addr,
            shutdown,
            state: Mutex::new(TransportState {
                is_open: true,
                next_end_point_index: 0,
                end_points: FxHashMap::default(),
            }),
        });

        tokio::spawn(accept_loop(listener, shared.clone(), shutdown_receiver));

        Ok(TcpTransport { shared })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(());
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn new_endpoint(&self) -> Result<EndPoint, TransportError> {
        let mut state = self.shared.state.lock().await;
        if !state.is_open {
            return Err(TransportError::TransportClosed);
        }

        let index = state.next_end_point_index;
        state.next_end_point_index += 1;

        let address = format_address(self.shared.local_addr, index);
        let (sink, source) = event_queue(address.clone());
        let end_point_shared = Arc::new(EndPointShared::new(index, sink.clone()));
        state.end_points.insert(index, end_point_shared.clone());
        debug!("created end point {:?}", address);

        let backend = TcpEndPoint {
            shared: end_point_shared,
            transport: self.shared.clone(),
        };
        Ok(EndPoint::new(sink, source, Arc::new(backend)))
    }

    async fn close_transport(&self) {
        let end_points = {
            let mut state = self.shared.state.lock().await;
            if !state.is_open {
                return;
            }
            state.is_open = false;
            std::mem::take(&mut state.end_points)
        };

        info!("closing TCP transport on {} with {} end points", self.shared.local_addr, end_points.len());
        let _ = self.shared.shutdown.send(());
        for end_point in end_points.values() {
            end_point.shut_down().await;
            end_point.sink.close().await;
        }
    }
}


async fn accept_loop(listener: TcpListener, transport: Arc<TransportShared>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                debug!("stopping listener on {}", transport.local_addr);
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let transport = transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection_request(addr, stream, transport).await {
                        warn!("connection from {} broke with an error: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                // e.g. running out of file descriptors: keep accepting once the situation clears
                warn!("error accepting TCP connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

#[instrument(name="accepted_connection", skip_all, fields(peer = %peer_addr, correlation_id = %Uuid::new_v4()))]
async fn handle_connection_request(peer_addr: SocketAddr, mut stream: TcpStream, transport: Arc<TransportShared>) -> anyhow::Result<()> {
    debug!("received connection request");
    stream.set_nodelay(transport.config.nodelay)?;

    let request = tokio::time::timeout(transport.config.handshake_timeout, read_connect_request(&mut stream)).await
        .map_err(|_| anyhow!("no connect request within {:?}", transport.config.handshake_timeout))??;

    let Some((end_point, shutdown)) = transport.end_point_for_inbound(request.target_index).await else {
        debug!("connect request for unknown end point #{}", request.target_index);
        return send_connect_response(&mut stream, ConnectStatus::UnknownEndPoint).await;
    };

    let Some(id) = end_point.sink.open_connection(request.reliability, request.origin.clone()).await else {
        debug!("connect request for closed end point {:?}", end_point.sink.address());
        return send_connect_response(&mut stream, ConnectStatus::UnknownEndPoint).await;
    };

    if let Err(e) = send_connect_response(&mut stream, ConnectStatus::Accepted).await {
        end_point.sink.lose_connection(id).await;
        return Err(e);
    }
    debug!("initial handshake complete: {:?} from {:?} to {:?}", id, request.origin, end_point.sink.address());

    TcpReceiver::new(stream, end_point.sink.clone(), id, request.origin, transport.config.max_message_size, transport.config.handshake_timeout)
        .receive_loop(shutdown)
        .await?;
    debug!("connection closed");
    Ok(())
}
