use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::address::EndPointAddress;
use crate::config::TcpConfig;
use crate::connection::ConnectionBackend;
use crate::error::{ConnectError, SendError};
use crate::tcp::frame::{encode_close_frame, encode_data_frame, message_size};
use crate::tcp::tcp_control_messages::{ConnectRequest, ConnectResponse, ConnectStatus, PeerNotice};
use crate::util::safe_converter::PrecheckedCast;


/// The sending side of a connection: a TCP stream to the peer's transport. After the initial
///  handshake, frames go out on the write half. The read half is handed to the owning end point,
///  which watches it for the peer's [PeerNotice].
pub struct TcpSender {
    peer: EndPointAddress,
    max_message_size: usize,
    /// upper bound for sending the close frame, so a peer that stopped reading can not block
    ///  closing
    close_timeout: Duration,
    /// `None` after the connection was closed or broke
    writer: Mutex<Option<OwnedWriteHalf>>,
    is_closed: AtomicBool,
    peer_closed: AtomicBool,
}

impl TcpSender {
    /// Opens a stream to `socket_addr` and performs the handshake, returning after the peer
    ///  confirmed that the target end point registered the connection.
    pub async fn connect(socket_addr: SocketAddr, peer: &EndPointAddress, request: &ConnectRequest, config: &TcpConfig) -> Result<(TcpSender, OwnedReadHalf), ConnectError> {
        let to_unreachable = |e: anyhow::Error| ConnectError::TargetUnreachable(peer.clone(), e.to_string());

        let handshake = async {
            let mut stream = TcpStream::connect(socket_addr).await?;
            stream.set_nodelay(config.nodelay)?;

            send_connect_request(&mut stream, request).await?;
            let response = read_connect_response(&mut stream).await?;
            Ok::<_, anyhow::Error>((stream, response))
        };

        let (stream, response) = tokio::time::timeout(config.handshake_timeout, handshake).await
            .map_err(|_| ConnectError::Timeout(config.handshake_timeout))?
            .map_err(to_unreachable)?;

        match response.status {
            ConnectStatus::Accepted => {}
            ConnectStatus::UnknownEndPoint => return Err(ConnectError::TargetUnreachable(peer.clone(), "no such end point".to_string())),
        }

        let (reader, writer) = stream.into_split();
        let sender = TcpSender {
            peer: peer.clone(),
            max_message_size: config.max_message_size,
            close_timeout: config.handshake_timeout,
            writer: Mutex::new(Some(writer)),
            is_closed: AtomicBool::new(false),
            peer_closed: AtomicBool::new(false),
        };
        Ok((sender, reader))
    }

    pub fn peer(&self) -> &EndPointAddress {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// Marks the connection as unusable because its target end point was closed. Returns `false`
    ///  if it was closed before.
    pub fn mark_peer_closed(&self) -> bool {
        self.peer_closed.store(true, Ordering::Release);
        !self.is_closed.swap(true, Ordering::AcqRel)
    }

    fn closed_error(&self) -> SendError {
        if self.peer_closed.load(Ordering::Acquire) {
            SendError::PeerUnreachable(self.peer.clone())
        }
        else {
            SendError::ConnectionClosed
        }
    }

    fn send_error(&self, e: std::io::Error) -> SendError {
        match e.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => SendError::PeerUnreachable(self.peer.clone()),
            _ => SendError::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl ConnectionBackend for TcpSender {
    async fn send(&self, payload: &[Bytes]) -> Result<(), SendError> {
        let size = message_size(payload);
        if size > self.max_message_size {
            return Err(SendError::MessageTooLarge { actual: size, max: self.max_message_size });
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut buf = BytesMut::new();
        encode_data_frame(payload, &mut buf);

        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(self.closed_error());
        };

        if let Err(e) = w.write_all(&buf).await {
            debug!("sending to {:?} failed, connection is broken: {}", self.peer, e);
            *writer = None;
            self.is_closed.store(true, Ordering::Release);
            return Err(self.send_error(e));
        }
        Ok(())
    }

    async fn close(&self) {
        self.is_closed.store(true, Ordering::Release);

        let closing = async {
            let Some(mut writer) = self.writer.lock().await.take() else {
                return;
            };
            if self.peer_closed.load(Ordering::Acquire) {
                return;
            }

            let mut buf = BytesMut::new();
            encode_close_frame(&mut buf);
            if let Err(e) = writer.write_all(&buf).await {
                debug!("could not send close frame to {:?}: {}", self.peer, e);
                return;
            }
            if let Err(e) = writer.shutdown().await {
                debug!("error shutting down stream to {:?}: {}", self.peer, e);
            }
        };

        if tokio::time::timeout(self.close_timeout, closing).await.is_err() {
            debug!("closing the connection to {:?} did not finish within {:?}, dropping it", self.peer, self.close_timeout);
        }
    }
}


pub(crate) async fn send_connect_request(stream: &mut TcpStream, request: &ConnectRequest) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    request.ser(&mut buf);

    let buf_len: u32 = buf.len().prechecked_cast();
    stream.write_all(buf_len.to_be_bytes().as_ref()).await?;
    stream.write_all(&buf).await?;
    Ok(())
}

pub(crate) async fn read_connect_response(stream: &mut TcpStream) -> anyhow::Result<ConnectResponse> {
    let mut buf = [0u8; ConnectResponse::SERIALIZED_LEN];
    stream.read_exact(&mut buf).await?;
    ConnectResponse::try_deser(&mut &buf[..])
}

/// Waits for the peer's notice on the reverse direction of a stream. EOF means the stream ended
///  without one.
pub(crate) async fn read_peer_notice(reader: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<Option<PeerNotice>> {
    match reader.read_u8().await {
        Ok(raw) => Ok(Some(PeerNotice::try_from(raw)?)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
