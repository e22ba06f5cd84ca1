//! A message-oriented network transport abstraction: applications create end points, connect
//!  them to each other and exchange messages, without knowing which carrier moves the bytes.
//!
//! ## Design goals
//!
//! * Everything an end point observes arrives through a single ordered event queue: connections
//!   being opened, messages, connections being closed or lost, peers going away, and the end
//!   point itself being closed
//!   * consumers are written as a loop (or fold) over [event::Event], see [echo] for an example
//! * Connections are unidirectional. Replies travel through a connection the peer opens in the
//!   other direction
//!   * a connection is identified by a [event::ConnectionId] that is local to the receiving end
//!     point, so many connections can be multiplexed into one end point
//! * The abstraction is sending / receiving *messages*, each consisting of one or more fragments
//!   whose boundaries are preserved
//! * Per connection, messages are delivered in the order they were sent, and the connection's
//!   close is delivered after all of its messages
//!   * there are no guarantees across connections
//! * Carriers are pluggable behind [transport::Transport]
//!   * [inmemory::InMemoryTransport] keeps all end points in the current process, and it is the
//!     only carrier with multicast support
//!   * [tcp::TcpTransport] uses a TCP stream per connection
//! * Failures are reported as explicit results at the call that caused them. The abstraction
//!   never retries on its own
//! * explicitly *not* part of this crate: transport-level security, framing beyond message
//!   fragments, delivery guarantees that outlive a single connection
//!
//! ## Testing
//!
//! [test_util] contains scenarios that every carrier should pass, and that protocols built on top
//!  of this crate can reuse.

pub mod address;
pub mod config;
pub mod connection;
pub mod echo;
pub mod end_point;
pub mod error;
pub mod event;
pub mod event_queue;
pub mod inmemory;
pub mod multicast;
pub mod tcp;
pub mod test_util;
pub mod transport;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
