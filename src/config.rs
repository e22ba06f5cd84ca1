use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

/// Configuration of a [crate::tcp::TcpTransport].
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// The transport's listener is bound to this address, and end point addresses are derived from
    ///  it. It must therefore be an address that peers can connect to: binding to the unspecified
    ///  address (`0.0.0.0` or `::`) is rejected. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,

    /// This is the maximum size of a message in bytes, counting each fragment with an extra 4
    ///  bytes for its length prefix. Larger messages are rejected by the sender, and a receiver
    ///  encountering a larger frame treats the connection as broken.
    ///
    /// All transports that talk to each other should agree on this value.
    pub max_message_size: usize,

    /// Time to wait for the peer's part of the handshake, both when connecting and when accepting
    ///  a connection. Inbound streams that do not complete the handshake in time are dropped.
    ///
    /// This also bounds the goodbyes: sending a close frame, and telling a peer that its target
    ///  end point was closed. A peer that does not take them in time just has its stream dropped.
    pub handshake_timeout: Duration,

    pub nodelay: bool,
}

impl TcpConfig {
    /// listens on an ephemeral port on the IPV4 loopback interface
    pub fn default_localhost() -> TcpConfig {
        TcpConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_message_size: 16*1024*1024,
            handshake_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.ip().is_unspecified() {
            bail!("bind address {} is not reachable for peers", self.bind_addr.ip());
        }
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if u32::try_from(self.max_message_size).is_err() {
            bail!("max message size {} does not fit into a frame", self.max_message_size);
        }
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must be positive");
        }

        Ok(())
    }
}
