//! An echo service: every message received on a connection is sent back to its origin, through a
//!  connection opened in the other direction. This is the canonical example of a consumer loop,
//!  and the counterpart for the ping scenarios in [crate::test_util::scenarios].

use std::ops::ControlFlow;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::end_point::EndPoint;
use crate::event::{ConnectionId, Event};

/// The echo service's state, i.e. the reply connection for every open inbound connection. Events
///  are folded into it one at a time by [EchoService::on_event].
#[derive(Default)]
pub struct EchoService {
    replies: FxHashMap<ConnectionId, Connection>,
    /// inbound connections whose origin could not be connected to
    unreachable: FxHashSet<ConnectionId>,
}

impl EchoService {
    pub fn new() -> EchoService {
        Default::default()
    }

    pub fn num_replies(&self) -> usize {
        self.replies.len()
    }

    /// Processes a single event. Returns `Break` when the end point was closed, and an error for
    ///  events that refer to a connection this service never saw being opened.
    pub async fn on_event(&mut self, end_point: &EndPoint, event: Event) -> anyhow::Result<ControlFlow<()>> {
        match event {
            Event::ConnectionOpened(data) => {
                match end_point.connect(&data.from, data.reliability).await {
                    Ok(reply) => {
                        debug!("{:?}: replying to {:?} on a new connection", data.id, data.from);
                        self.replies.insert(data.id, reply);
                    }
                    Err(e) => {
                        warn!("{:?}: cannot connect back to {:?}, ignoring its traffic: {}", data.id, data.from, e);
                        self.unreachable.insert(data.id);
                    }
                }
            }
            Event::Received(data) => {
                if let Some(reply) = self.replies.get(&data.id) {
                    trace!("echoing {} fragments on {:?}", data.payload.len(), data.id);
                    if let Err(e) = reply.send(&data.payload).await {
                        warn!("{:?}: echoing to {:?} failed: {}", data.id, reply.target(), e);
                    }
                }
                else if !self.unreachable.contains(&data.id) {
                    anyhow::bail!("received a message on unknown connection {:?}", data.id);
                }
            }
            Event::ConnectionClosed(id) => {
                if let Some(reply) = self.replies.remove(&id) {
                    reply.close().await;
                }
                else if !self.unreachable.remove(&id) {
                    anyhow::bail!("unknown connection {:?} was closed", id);
                }
            }
            Event::ConnectionLost(data) => {
                debug!("{:?}: connection from {:?} was lost", data.id, data.from);
                self.unreachable.remove(&data.id);
                if let Some(reply) = self.replies.remove(&data.id) {
                    reply.close().await;
                }
            }
            Event::PeerClosed(peer) => {
                // the inbound connections from that peer are closed separately, so their ids stay
                //  known until then
                let ids = self.replies.iter()
                    .filter(|(_, reply)| reply.target() == &peer)
                    .map(|(id, _)| *id)
                    .collect::<Vec<_>>();
                debug!("peer {:?} was closed, dropping {} reply connections", peer, ids.len());
                for id in ids {
                    if let Some(reply) = self.replies.remove(&id) {
                        reply.close().await;
                    }
                    self.unreachable.insert(id);
                }
            }
            Event::ReceivedMulticast(_) => {}
            Event::EndPointClosed => {
                debug!("end point {:?} was closed, dropping {} reply connections", end_point.address(), self.replies.len());
                self.replies.clear();
                self.unreachable.clear();
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

/// Runs an echo service on `end_point` until the end point is closed.
pub async fn echo_server(end_point: EndPoint) -> anyhow::Result<()> {
    let mut service = EchoService::new();
    loop {
        let event = end_point.receive().await;
        if let ControlFlow::Break(()) = service.on_event(&end_point, event).await? {
            return Ok(());
        }
    }
}
