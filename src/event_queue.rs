use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::address::{EndPointAddress, MulticastAddress};
use crate::event::{ConnectionId, ConnectionLostData, ConnectionOpenedData, Event, ReceivedData, ReceivedMulticastData, Reliability};

/// What an end point knows about a connection that was opened *to* it
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundConnection {
    pub reliability: Reliability,
    pub from: EndPointAddress,
}

struct EndPointState {
    next_connection_id: u64,
    inbound: FxHashMap<ConnectionId, InboundConnection>,
    /// `None` once the end point is closed
    sender: Option<mpsc::UnboundedSender<Event>>,
}
impl EndPointState {
    fn append(&mut self, event: Event) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        trace!("appending event {:?}", event);
        if sender.send(event).is_err() {
            // the registry stays until close(), which hands its peers to the carrier
            debug!("end point was dropped without being closed - treating it as closed");
            self.sender = None;
            return false;
        }
        true
    }
}

/// Creates an end point's event queue, returning the writing side (shared by the carrier's
///  delivery logic) and the reading side (owned by the end point).
pub fn event_queue(address: EndPointAddress) -> (EventSink, EventSource) {
    let (sender, receiver) = mpsc::unbounded_channel();

    let sink = EventSink {
        address,
        state: Arc::new(Mutex::new(EndPointState {
            next_connection_id: 0,
            inbound: FxHashMap::default(),
            sender: Some(sender),
        })),
    };
    let source = EventSource {
        receiver: Mutex::new(receiver),
    };
    (sink, source)
}

/// The writing side of an end point's event queue, together with its registry of inbound
///  connections.
///
/// Registry changes and queue appends happen under the same lock, so the per-connection event
///  order holds no matter how many carrier tasks deliver concurrently: an id is registered when
///  its `ConnectionOpened` is appended and removed when its terminal event is appended, and
///  nothing is appended for ids that are not registered.
///
/// The appending operations return `false` (or `None`) if the event could not be appended, either
///  because the end point is closed or because the connection id is not open.
#[derive(Clone)]
pub struct EventSink {
    address: EndPointAddress,
    state: Arc<Mutex<EndPointState>>,
}

impl EventSink {
    pub fn address(&self) -> &EndPointAddress {
        &self.address
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.sender.is_none()
    }

    pub async fn num_open_connections(&self) -> usize {
        self.state.lock().await.inbound.len()
    }

    /// Registers a new inbound connection, appending its `ConnectionOpened` event.
    pub async fn open_connection(&self, reliability: Reliability, from: EndPointAddress) -> Option<ConnectionId> {
        let mut state = self.state.lock().await;
        if state.sender.is_none() {
            return None;
        }

        let id = ConnectionId(state.next_connection_id);
        state.next_connection_id += 1;

        if !state.append(Event::ConnectionOpened(ConnectionOpenedData { id, reliability, from: from.clone() })) {
            return None;
        }
        state.inbound.insert(id, InboundConnection { reliability, from });
        debug!("{:?}: opened inbound connection {:?}", self.address, id);
        Some(id)
    }

    pub async fn deliver(&self, id: ConnectionId, payload: Vec<Bytes>) -> bool {
        let mut state = self.state.lock().await;
        if !state.inbound.contains_key(&id) {
            trace!("{:?}: dropping message for connection {:?} which is not open", self.address, id);
            return false;
        }
        state.append(Event::Received(ReceivedData { id, payload }))
    }

    /// Orderly close: appends `ConnectionClosed`. Returns `false` if the connection was not open,
    ///  so each id gets at most one terminal event.
    pub async fn close_connection(&self, id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        if state.inbound.remove(&id).is_none() {
            return false;
        }
        debug!("{:?}: closing inbound connection {:?}", self.address, id);
        state.append(Event::ConnectionClosed(id))
    }

    /// The carrier lost the connection without an orderly close
    pub async fn lose_connection(&self, id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let Some(inbound) = state.inbound.remove(&id) else {
            return false;
        };
        warn!("{:?}: lost inbound connection {:?} from {:?}", self.address, id, inbound.from);
        state.append(Event::ConnectionLost(ConnectionLostData { id, from: inbound.from }))
    }

    pub async fn deliver_multicast(&self, group: MulticastAddress, payload: Vec<Bytes>) -> bool {
        self.state.lock().await
            .append(Event::ReceivedMulticast(ReceivedMulticastData { group, payload }))
    }

    /// Tells this end point that `peer` was closed while it had open connections to it
    pub async fn peer_closed(&self, peer: EndPointAddress) -> bool {
        let mut state = self.state.lock().await;
        debug!("{:?}: peer {:?} was closed", self.address, peer);
        state.append(Event::PeerClosed(peer))
    }

    /// Appends the terminal `EndPointClosed` event and refuses everything afterwards.
    ///
    /// Returns the distinct origins of the inbound connections that were still open, i.e. the
    ///  peers the carrier should notify. Calling this again returns an empty list.
    pub async fn close(&self) -> Vec<EndPointAddress> {
        let mut state = self.state.lock().await;

        let peers = state.inbound.drain()
            .map(|(_, inbound)| inbound.from)
            .collect::<FxHashSet<_>>();

        if state.sender.is_some() {
            debug!("{:?}: closing end point, {} peers have open connections to it", self.address, peers.len());
            state.append(Event::EndPointClosed);
            state.sender = None;
        }
        peers.into_iter().collect()
    }
}


/// The reading side of an end point's event queue
pub struct EventSource {
    receiver: Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl EventSource {
    /// Waits for the next event. Concurrent callers are served one at a time, and each event goes
    ///  to exactly one of them. Once the queue is closed and drained, this returns
    ///  `EndPointClosed` immediately rather than waiting forever.
    ///
    /// This is cancel safe: if the returned future is dropped, no event is lost.
    pub async fn next(&self) -> Event {
        self.receiver.lock().await
            .recv().await
            .unwrap_or(Event::EndPointClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    fn opened(id: u64, from: &'static str) -> Event {
        Event::ConnectionOpened(ConnectionOpenedData {
            id: ConnectionId(id),
            reliability: Reliability::ReliableOrdered,
            from: from.into(),
        })
    }

    fn received(id: u64, payload: &'static [u8]) -> Event {
        Event::Received(ReceivedData { id: ConnectionId(id), payload: vec![Bytes::from_static(payload)] })
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let (sink, source) = event_queue("me".into());

        let a = sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.unwrap();
        let b = sink.open_connection(Reliability::ReliableOrdered, "b".into()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(sink.num_open_connections().await, 2);

        assert!(sink.deliver(a, vec![Bytes::from_static(b"x")]).await);
        assert!(sink.close_connection(a).await);
        assert!(!sink.close_connection(a).await);
        assert!(!sink.deliver(a, vec![Bytes::from_static(b"y")]).await);
        assert!(sink.deliver(b, vec![Bytes::from_static(b"z")]).await);

        assert_eq!(source.next().await, opened(0, "a"));
        assert_eq!(source.next().await, opened(1, "b"));
        assert_eq!(source.next().await, received(0, b"x"));
        assert_eq!(source.next().await, Event::ConnectionClosed(ConnectionId(0)));
        assert_eq!(source.next().await, received(1, b"z"));
    }

    #[tokio::test]
    async fn test_ids_are_not_reused() {
        let (sink, _source) = event_queue("me".into());

        let first = sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.unwrap();
        sink.close_connection(first).await;
        let second = sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_lost_connection_is_terminal() {
        let (sink, source) = event_queue("me".into());

        let id = sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.unwrap();
        assert!(sink.lose_connection(id).await);
        assert!(!sink.close_connection(id).await);
        assert!(!sink.lose_connection(id).await);

        assert_eq!(source.next().await, opened(0, "a"));
        assert_eq!(source.next().await, Event::ConnectionLost(ConnectionLostData { id, from: "a".into() }));
    }

    #[tokio::test]
    async fn test_close() {
        let (sink, source) = event_queue("me".into());

        let id = sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.unwrap();
        assert!(sink.deliver(id, vec![]).await);
        assert_eq!(sink.close().await, vec![EndPointAddress::from("a")]);
        assert!(sink.close().await.is_empty());
        assert!(sink.is_closed().await);

        assert!(sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.is_none());
        assert!(!sink.deliver(id, vec![]).await);
        assert!(!sink.deliver_multicast(MulticastAddress::new("g"), vec![]).await);
        assert!(!sink.peer_closed("b".into()).await);

        // events appended before closing are still delivered, in order
        assert_eq!(source.next().await, opened(0, "a"));
        assert_eq!(source.next().await, Event::Received(ReceivedData { id, payload: vec![] }));
        assert_eq!(source.next().await, Event::EndPointClosed);
        assert_eq!(source.next().await, Event::EndPointClosed);
    }

    #[tokio::test]
    async fn test_close_returns_distinct_peers() {
        let (sink, _source) = event_queue("me".into());

        sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.unwrap();
        sink.open_connection(Reliability::Unreliable, "a".into()).await.unwrap();
        let closed = sink.open_connection(Reliability::ReliableOrdered, "b".into()).await.unwrap();
        sink.open_connection(Reliability::ReliableOrdered, "c".into()).await.unwrap();
        sink.close_connection(closed).await;

        let mut peers = sink.close().await;
        peers.sort();
        assert_eq!(peers, vec![EndPointAddress::from("a"), EndPointAddress::from("c")]);
    }

    #[tokio::test]
    async fn test_peer_closed() {
        let (sink, source) = event_queue("me".into());

        assert!(sink.peer_closed("a".into()).await);
        assert_eq!(source.next().await, Event::PeerClosed("a".into()));
    }

    #[tokio::test]
    async fn test_dropped_source_counts_as_closed() {
        let (sink, source) = event_queue("me".into());
        let id = sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.unwrap();
        drop(source);

        assert!(!sink.deliver(id, vec![]).await);
        assert!(sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.is_none());
        assert!(sink.is_closed().await);

        // the peer can still be notified when the end point is cleaned up
        assert_eq!(sink.close().await, vec![EndPointAddress::from("a")]);
    }

    #[tokio::test]
    async fn test_concurrent_receivers_get_distinct_events() {
        let (sink, source) = event_queue("me".into());
        let source = Arc::new(source);

        let id = sink.open_connection(Reliability::ReliableOrdered, "a".into()).await.unwrap();
        for i in 0..100u8 {
            sink.deliver(id, vec![Bytes::copy_from_slice(&[i])]).await;
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(evt) = tokio::time::timeout(Duration::from_millis(50), source.next()).await {
                    seen.push(evt);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        assert_eq!(all.len(), 101);

        let mut payloads = all.iter()
            .filter_map(|e| match e {
                Event::Received(data) => Some(data.payload[0][0]),
                _ => None,
            })
            .collect::<Vec<_>>();
        payloads.sort();
        assert_eq!(payloads, (0..100).collect::<Vec<_>>());
    }
}
