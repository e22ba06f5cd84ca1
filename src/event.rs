use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::address::{EndPointAddress, MulticastAddress};

/// Identifies an inbound connection at the end point that received it. Ids are allocated by the
///  receiving end point in ascending order and never reused while it is alive, but they mean
///  nothing anywhere else: two end points will typically hand out the same numbers for unrelated
///  connections.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(pub u64);

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The delivery guarantee requested when connecting. Carriers may provide more than was asked
///  for (TCP delivers everything reliably and in order), never less.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Reliability {
    ReliableOrdered = 0,
    ReliableUnordered = 1,
    Unreliable = 2,
}

/// The notifications an end point's consumer observes through
///  [crate::end_point::EndPoint::receive].
///
/// For a given [ConnectionId], [Event::ConnectionOpened] comes first, followed by any number of
///  [Event::Received], followed by exactly one terminal event: [Event::ConnectionClosed] for an
///  orderly close, or [Event::ConnectionLost] if the carrier lost the connection. Once the end
///  point is closed, [Event::EndPointClosed] is the last event it delivers, and it implies the
///  end of all connections that did not see their terminal event yet.
///
/// [Event::PeerClosed] is about the other direction: it is keyed by address because the
///  connections it refers to were opened by this end point, and only their targets assign ids.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    ConnectionOpened(ConnectionOpenedData),
    Received(ReceivedData),
    ConnectionClosed(ConnectionId),
    ReceivedMulticast(ReceivedMulticastData),
    ConnectionLost(ConnectionLostData),
    /// The end point at this address was closed while this end point had open connections to it.
    ///  Sending on them fails with [crate::error::SendError::PeerUnreachable] from now on. This is
    ///  delivered once per closed peer, no matter how many connections to it were open.
    PeerClosed(EndPointAddress),
    EndPointClosed,
}

impl Event {
    /// the connection an event refers to, if any
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Event::ConnectionOpened(data) => Some(data.id),
            Event::Received(data) => Some(data.id),
            Event::ConnectionClosed(id) => Some(*id),
            Event::ConnectionLost(data) => Some(data.id),
            Event::ReceivedMulticast(_) | Event::PeerClosed(_) | Event::EndPointClosed => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionOpenedData {
    pub id: ConnectionId,
    pub reliability: Reliability,
    pub from: EndPointAddress,
}

/// A message as it was passed to [crate::connection::Connection::send], fragment boundaries
///  included
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedData {
    pub id: ConnectionId,
    pub payload: Vec<Bytes>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedMulticastData {
    pub group: MulticastAddress,
    pub payload: Vec<Bytes>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionLostData {
    pub id: ConnectionId,
    pub from: EndPointAddress,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(0, Some(Reliability::ReliableOrdered))]
    #[case(1, Some(Reliability::ReliableUnordered))]
    #[case(2, Some(Reliability::Unreliable))]
    #[case(3, None)]
    fn test_reliability_from_wire(#[case] raw: u8, #[case] expected: Option<Reliability>) {
        assert_eq!(Reliability::try_from(raw).ok(), expected);
    }

    #[rstest]
    #[case::opened(Event::ConnectionOpened(ConnectionOpenedData { id: ConnectionId(3), reliability: Reliability::ReliableOrdered, from: "a".into() }), Some(ConnectionId(3)))]
    #[case::received(Event::Received(ReceivedData { id: ConnectionId(4), payload: vec![] }), Some(ConnectionId(4)))]
    #[case::closed(Event::ConnectionClosed(ConnectionId(5)), Some(ConnectionId(5)))]
    #[case::lost(Event::ConnectionLost(ConnectionLostData { id: ConnectionId(6), from: "a".into() }), Some(ConnectionId(6)))]
    #[case::multicast(Event::ReceivedMulticast(ReceivedMulticastData { group: MulticastAddress::new("g"), payload: vec![] }), None)]
    #[case::peer_closed(Event::PeerClosed("a".into()), None)]
    #[case::end_point_closed(Event::EndPointClosed, None)]
    fn test_connection_id(#[case] event: Event, #[case] expected: Option<ConnectionId>) {
        assert_eq!(event.connection_id(), expected);
    }
}
