//! A carrier that keeps all end points inside the current process. Delivering a message means
//!  appending it to the target end point's queue, so this carrier never loses or reorders
//!  anything, whatever reliability was requested.
//!
//! This is the reference carrier for testing protocols built on top of [Transport], and the only
//!  one with multicast support.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::address::{EndPointAddress, MulticastAddress};
use crate::connection::ConnectionBackend;
use crate::end_point::{EndPoint, EndPointBackend};
use crate::error::{ConnectError, MulticastError, SendError, TransportError};
use crate::event::{ConnectionId, Reliability};
use crate::event_queue::{event_queue, EventSink};
use crate::multicast::MulticastBackend;
use crate::transport::Transport;

struct TransportState {
    transport_id: Uuid,
    is_open: bool,
    next_end_point_index: u64,
    next_group_index: u64,
    end_points: FxHashMap<EndPointAddress, EventSink>,
    groups: FxHashMap<MulticastAddress, FxHashMap<EndPointAddress, EventSink>>,
}

pub struct InMemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> InMemoryTransport {
        InMemoryTransport {
            state: Arc::new(Mutex::new(TransportState {
                transport_id: Uuid::new_v4(),
                is_open: true,
                next_end_point_index: 0,
                next_group_index: 0,
                end_points: FxHashMap::default(),
                groups: FxHashMap::default(),
            })),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn new_endpoint(&self) -> Result<EndPoint, TransportError> {
        let mut state = self.state.lock().await;
        if !state.is_open {
            return Err(TransportError::TransportClosed);
        }

        let address = EndPointAddress::from(format!("mem:{}:{}", state.transport_id.simple(), state.next_end_point_index));
        state.next_end_point_index += 1;

        let (sink, source) = event_queue(address.clone());
        state.end_points.insert(address.clone(), sink.clone());
        debug!("created end point {:?}", address);

        let backend = InMemoryEndPoint {
            sink: sink.clone(),
            transport: self.state.clone(),
            outbound: Default::default(),
        };
        Ok(EndPoint::new(sink, source, Arc::new(backend)))
    }

    async fn close_transport(&self) {
        let end_points = {
            let mut state = self.state.lock().await;
            if !state.is_open {
                return;
            }
            state.is_open = false;
            state.groups.clear();
            std::mem::take(&mut state.end_points)
        };

        info!("closing in-memory transport with {} end points", end_points.len());
        for sink in end_points.values() {
            sink.close().await;
        }
    }
}


struct InMemoryEndPoint {
    sink: EventSink,
    transport: Arc<Mutex<TransportState>>,
    outbound: Mutex<Vec<Arc<InMemoryConnection>>>,
}

#[async_trait]
impl EndPointBackend for InMemoryEndPoint {
    async fn connect(&self, target: &EndPointAddress, reliability: Reliability) -> Result<Arc<dyn ConnectionBackend>, ConnectError> {
        let target_sink = self.transport.lock().await
            .end_points
            .get(target)
            .cloned()
            .ok_or_else(|| ConnectError::TargetUnreachable(target.clone(), "no such end point".to_string()))?;

        let Some(id) = target_sink.open_connection(reliability, self.sink.address().clone()).await else {
            // the target was dropped without being closed, and its cleanup did not run yet
            self.transport.lock().await
                .end_points
                .remove(target);
            return Err(ConnectError::TargetUnreachable(target.clone(), "end point is closed".to_string()));
        };

        let connection = Arc::new(InMemoryConnection {
            target: target_sink,
            id,
            is_closed: AtomicBool::new(false),
        });

        let mut outbound = self.outbound.lock().await;
        outbound.retain(|c| !c.is_closed.load(Ordering::Acquire));
        outbound.push(connection.clone());

        Ok(connection)
    }

    async fn close(&self) {
        {
            let mut state = self.transport.lock().await;
            state.end_points.remove(self.sink.address());
            for members in state.groups.values_mut() {
                members.remove(self.sink.address());
            }
        }

        // closing the queue first means no inbound connection can be opened after the peers were
        //  collected
        let peers = self.sink.close().await;
        let peer_sinks = {
            let state = self.transport.lock().await;
            peers.iter()
                .filter_map(|peer| state.end_points.get(peer).cloned())
                .collect::<Vec<_>>()
        };
        debug!("{:?}: notifying {} peers", self.sink.address(), peer_sinks.len());
        for peer in peer_sinks {
            peer.peer_closed(self.sink.address().clone()).await;
        }

        let outbound = std::mem::take(&mut *self.outbound.lock().await);
        debug!("{:?}: closing {} outbound connections", self.sink.address(), outbound.len());
        for connection in outbound {
            connection.close().await;
        }
    }

    async fn new_multicast_group(&self) -> Result<Arc<dyn MulticastBackend>, MulticastError> {
        let mut state = self.transport.lock().await;
        if !state.is_open {
            return Err(MulticastError::EndPointClosed);
        }

        let address = MulticastAddress::from(format!("mem:{}:group:{}", state.transport_id.simple(), state.next_group_index));
        state.next_group_index += 1;
        state.groups.insert(address.clone(), FxHashMap::default());
        debug!("created multicast group {:?}", address);

        Ok(Arc::new(InMemoryGroup {
            address,
            member: self.sink.clone(),
            transport: self.transport.clone(),
        }))
    }

    async fn resolve_multicast_group(&self, address: &MulticastAddress) -> Result<Arc<dyn MulticastBackend>, MulticastError> {
        if !self.transport.lock().await.groups.contains_key(address) {
            return Err(MulticastError::GroupNotFound(address.clone()));
        }

        Ok(Arc::new(InMemoryGroup {
            address: address.clone(),
            member: self.sink.clone(),
            transport: self.transport.clone(),
        }))
    }
}


struct InMemoryConnection {
    target: EventSink,
    id: ConnectionId,
    is_closed: AtomicBool,
}

#[async_trait]
impl ConnectionBackend for InMemoryConnection {
    async fn send(&self, payload: &[Bytes]) -> Result<(), SendError> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(SendError::ConnectionClosed);
        }

        if self.target.deliver(self.id, payload.to_vec()).await {
            return Ok(());
        }

        if self.target.is_closed().await {
            Err(SendError::PeerUnreachable(self.target.address().clone()))
        }
        else {
            Err(SendError::ConnectionClosed)
        }
    }

    async fn close(&self) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.target.close_connection(self.id).await;
    }
}


struct InMemoryGroup {
    address: MulticastAddress,
    /// the end point through which this group was created or resolved
    member: EventSink,
    transport: Arc<Mutex<TransportState>>,
}

#[async_trait]
impl MulticastBackend for InMemoryGroup {
    fn address(&self) -> &MulticastAddress {
        &self.address
    }

    async fn send(&self, payload: &[Bytes]) -> Result<(), MulticastError> {
        let members = self.transport.lock().await
            .groups
            .get(&self.address)
            .map(|members| members.values().cloned().collect::<Vec<_>>())
            .ok_or_else(|| MulticastError::GroupNotFound(self.address.clone()))?;

        trace!("sending multicast message to {} members of {:?}", members.len(), self.address);
        for member in members {
            member.deliver_multicast(self.address.clone(), payload.to_vec()).await;
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<(), MulticastError> {
        self.transport.lock().await
            .groups
            .get_mut(&self.address)
            .ok_or_else(|| MulticastError::GroupNotFound(self.address.clone()))?
            .insert(self.member.address().clone(), self.member.clone());
        Ok(())
    }

    async fn unsubscribe(&self) {
        if let Some(members) = self.transport.lock().await.groups.get_mut(&self.address) {
            members.remove(self.member.address());
        }
    }

    async fn delete(&self) {
        debug!("deleting multicast group {:?}", self.address);
        self.transport.lock().await
            .groups
            .remove(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::event::{ConnectionOpenedData, Event, ReceivedData, ReceivedMulticastData};
    use crate::test_util::scenarios;
    use crate::test_util::{run_with_deadline, ScenarioConfig};
    use super::*;

    fn bytes(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_connect_send_close() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();
        assert_ne!(a.address(), b.address());

        let connection = a.connect(b.address(), Reliability::ReliableOrdered).await.unwrap();
        connection.send(&[bytes("x"), bytes("yz")]).await.unwrap();
        connection.close().await;
        connection.close().await;

        let id = ConnectionId(0);
        assert_eq!(b.receive().await, Event::ConnectionOpened(ConnectionOpenedData {
            id,
            reliability: Reliability::ReliableOrdered,
            from: a.address().clone(),
        }));
        assert_eq!(b.receive().await, Event::Received(ReceivedData { id, payload: vec![bytes("x"), bytes("yz")] }));
        assert_eq!(b.receive().await, Event::ConnectionClosed(id));
        assert!(b.receive_timeout(Duration::from_millis(10)).await.is_err());

        assert!(matches!(connection.send(&[bytes("late")]).await, Err(SendError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_address() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();

        let result = a.connect(&"mem:nowhere:0".into(), Reliability::ReliableOrdered).await;
        assert!(matches!(result, Err(ConnectError::TargetUnreachable(_, _))));
    }

    #[tokio::test]
    async fn test_connect_to_closed_end_point() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();
        b.close().await;

        let result = a.connect(b.address(), Reliability::ReliableOrdered).await;
        assert!(matches!(result, Err(ConnectError::TargetUnreachable(_, _))));
    }

    #[tokio::test]
    async fn test_send_to_closed_peer() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();

        let connection = a.connect(b.address(), Reliability::ReliableOrdered).await.unwrap();
        b.close().await;

        assert!(matches!(connection.send(&[bytes("x")]).await, Err(SendError::PeerUnreachable(addr)) if &addr == b.address()));
    }

    #[tokio::test]
    async fn test_peers_are_notified_when_end_point_closes() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();
        let c = transport.new_endpoint().await.unwrap();

        let first = a.connect(b.address(), Reliability::ReliableOrdered).await.unwrap();
        let _second = a.connect(b.address(), Reliability::Unreliable).await.unwrap();
        let closed = c.connect(b.address(), Reliability::ReliableOrdered).await.unwrap();
        closed.close().await;
        b.close().await;

        assert_eq!(a.receive_timeout(Duration::from_millis(200)).await, Ok(Event::PeerClosed(b.address().clone())));
        assert!(a.receive_timeout(Duration::from_millis(10)).await.is_err());
        assert!(matches!(first.send(&[bytes("x")]).await, Err(SendError::PeerUnreachable(addr)) if &addr == b.address()));

        // c closed its connection before, so there was nothing left to notify it about
        assert!(c.receive_timeout(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_end_point_is_cleaned_up() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();
        let b_address = b.address().clone();

        let _a_to_b = a.connect(&b_address, Reliability::ReliableOrdered).await.unwrap();
        let _b_to_a = b.connect(a.address(), Reliability::ReliableOrdered).await.unwrap();
        drop(b);

        let id = ConnectionId(0);
        assert!(matches!(a.receive().await, Event::ConnectionOpened(data) if data.id == id && data.from == b_address));
        let mut rest = vec![
            a.receive_timeout(Duration::from_secs(1)).await.unwrap(),
            a.receive_timeout(Duration::from_secs(1)).await.unwrap(),
        ];
        rest.sort_by_key(|e| e.connection_id());
        assert_eq!(rest, vec![Event::PeerClosed(b_address.clone()), Event::ConnectionClosed(id)]);

        assert!(!transport.state.lock().await.end_points.contains_key(&b_address));
        let result = a.connect(&b_address, Reliability::ReliableOrdered).await;
        assert!(matches!(result, Err(ConnectError::TargetUnreachable(_, reason)) if reason == "no such end point"));
    }

    #[tokio::test]
    async fn test_closing_end_point_closes_its_connections() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();

        let connection = a.connect(b.address(), Reliability::ReliableOrdered).await.unwrap();
        connection.send(&[bytes("x")]).await.unwrap();
        a.close().await;

        assert!(matches!(b.receive().await, Event::ConnectionOpened(_)));
        assert!(matches!(b.receive().await, Event::Received(_)));
        assert_eq!(b.receive().await, Event::ConnectionClosed(ConnectionId(0)));

        assert_eq!(a.receive().await, Event::EndPointClosed);
        assert!(matches!(connection.send(&[bytes("y")]).await, Err(SendError::EndPointClosed)));
        assert!(matches!(a.connect(b.address(), Reliability::ReliableOrdered).await, Err(ConnectError::EndPointClosed)));

        // explicitly closing a connection of a closed end point is harmless
        connection.close().await;
        assert!(b.receive_timeout(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_close_transport() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();

        transport.close_transport().await;

        assert_eq!(a.receive().await, Event::EndPointClosed);
        assert_eq!(b.receive().await, Event::EndPointClosed);
        assert!(matches!(transport.new_endpoint().await, Err(TransportError::TransportClosed)));
    }

    #[tokio::test]
    async fn test_multicast() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();
        let c = transport.new_endpoint().await.unwrap();

        let group_a = a.new_multicast_group().await.unwrap();
        let group_b = b.resolve_multicast_group(group_a.address()).await.unwrap();
        let group_c = c.resolve_multicast_group(group_a.address()).await.unwrap();
        group_b.subscribe().await.unwrap();
        group_c.subscribe().await.unwrap();

        group_a.send(&[bytes("hello")]).await.unwrap();
        group_c.unsubscribe().await;
        group_a.send(&[bytes("again")]).await.unwrap();

        let expected = |s| Event::ReceivedMulticast(ReceivedMulticastData { group: group_a.address().clone(), payload: vec![bytes(s)] });
        assert_eq!(b.receive().await, expected("hello"));
        assert_eq!(b.receive().await, expected("again"));
        assert_eq!(c.receive().await, expected("hello"));
        assert!(c.receive_timeout(Duration::from_millis(10)).await.is_err());
        assert!(a.receive_timeout(Duration::from_millis(10)).await.is_err());

        group_a.delete().await;
        assert!(matches!(group_b.send(&[bytes("gone")]).await, Err(MulticastError::GroupNotFound(_))));
        assert!(matches!(c.resolve_multicast_group(group_a.address()).await, Err(MulticastError::GroupNotFound(_))));
    }

    #[tokio::test]
    async fn test_multicast_reaches_subscribed_sender() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();

        let group_a = a.new_multicast_group().await.unwrap();
        let group_b = b.resolve_multicast_group(group_a.address()).await.unwrap();
        group_a.subscribe().await.unwrap();
        group_b.subscribe().await.unwrap();

        group_a.send(&[bytes("to all")]).await.unwrap();

        let expected = Event::ReceivedMulticast(ReceivedMulticastData { group: group_a.address().clone(), payload: vec![bytes("to all")] });
        assert_eq!(a.receive().await, expected);
        assert_eq!(b.receive().await, expected);
    }

    #[tokio::test]
    async fn test_closed_end_point_leaves_multicast_groups() {
        let transport = InMemoryTransport::new();
        let a = transport.new_endpoint().await.unwrap();
        let b = transport.new_endpoint().await.unwrap();

        let group = a.new_multicast_group().await.unwrap();
        b.resolve_multicast_group(group.address()).await.unwrap()
            .subscribe().await.unwrap();
        b.close().await;

        group.send(&[bytes("x")]).await.unwrap();
        assert_eq!(b.receive().await, Event::EndPointClosed);
    }

    #[tokio::test]
    async fn test_ping_echo() {
        let transport = InMemoryTransport::new();
        let config = ScenarioConfig::default();
        run_with_deadline(config.deadline, scenarios::ping_echo(&transport, config.num_pings)).await.unwrap();
    }

    #[tokio::test]
    async fn test_end_point_isolation() {
        let transport = InMemoryTransport::new();
        let config = ScenarioConfig::default();
        run_with_deadline(config.deadline, scenarios::end_point_isolation(&transport, config.num_pings)).await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_multiplexing() {
        let transport = InMemoryTransport::new();
        let config = ScenarioConfig::default();
        run_with_deadline(config.deadline, scenarios::connection_multiplexing(&transport, config.num_pings)).await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_close() {
        let transport = InMemoryTransport::new();
        let config = ScenarioConfig::default();
        run_with_deadline(config.deadline, scenarios::partial_close(&transport, config.num_pings)).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_order() {
        let transport = InMemoryTransport::new();
        let config = ScenarioConfig::default();
        run_with_deadline(config.deadline, scenarios::send_order(&transport, config.num_pings)).await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_id_scoping() {
        let transport = InMemoryTransport::new();
        let config = ScenarioConfig::default();
        run_with_deadline(config.deadline, scenarios::connection_id_scoping(&transport, config.num_pings)).await.unwrap();
    }
}
