use std::time::Duration;

use anyhow::bail;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::address::EndPointAddress;
use crate::event::ConnectionId;
use crate::event_queue::EventSink;
use crate::tcp::frame::{read_frame, Frame};
use crate::tcp::tcp_control_messages::{ConnectRequest, ConnectResponse, ConnectStatus, PeerNotice};
use crate::util::safe_converter::SafeCast;

/// The receiving side of an accepted connection: reads frames from the stream and appends them to
///  the target end point's queue under the connection's id.
pub struct TcpReceiver {
    stream: TcpStream,
    sink: EventSink,
    id: ConnectionId,
    from: EndPointAddress,
    max_message_size: usize,
    notice_timeout: Duration,
}

impl TcpReceiver {
    pub fn new(stream: TcpStream, sink: EventSink, id: ConnectionId, from: EndPointAddress, max_message_size: usize, notice_timeout: Duration) -> TcpReceiver {
        TcpReceiver {
            stream,
            sink,
            id,
            from,
            max_message_size,
            notice_timeout,
        }
    }

    /// Runs until the peer closes the connection, the stream breaks, or the end point shuts down.
    ///  A stream that ends without a close frame is reported as lost. If the end point goes away
    ///  first, the peer is told so on the stream's reverse direction.
    pub async fn receive_loop(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        loop {
            let frame = tokio::select! {
                _ = shutdown.recv() => None,
                frame = read_frame(&mut self.stream, self.max_message_size) => Some(frame),
            };
            let Some(frame) = frame else {
                debug!("end point {:?} is shutting down, stopping receiver for {:?}", self.sink.address(), self.id);
                self.notify_end_point_closed().await;
                return Ok(());
            };

            match frame {
                Ok(Some(Frame::Data(payload))) => {
                    trace!("received message with {} fragments on {:?}", payload.len(), self.id);
                    if !self.sink.deliver(self.id, payload).await {
                        debug!("end point {:?} is closed, stopping receiver for {:?}", self.sink.address(), self.id);
                        self.notify_end_point_closed().await;
                        return Ok(());
                    }
                }
                Ok(Some(Frame::Close)) => {
                    debug!("{:?} from {:?} was closed", self.id, self.from);
                    self.sink.close_connection(self.id).await;
                    return Ok(());
                }
                Ok(None) => {
                    debug!("stream for {:?} from {:?} ended without a close frame", self.id, self.from);
                    self.sink.lose_connection(self.id).await;
                    return Ok(());
                }
                Err(e) => {
                    self.sink.lose_connection(self.id).await;
                    return Err(e);
                }
            }
        }
    }

    async fn notify_end_point_closed(&mut self) {
        let notify = send_peer_notice(&mut self.stream, PeerNotice::EndPointClosed);
        match tokio::time::timeout(self.notice_timeout, notify).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("could not notify {:?} that {:?} was closed: {}", self.from, self.sink.address(), e),
            Err(_) => debug!("notifying {:?} that {:?} was closed timed out", self.from, self.sink.address()),
        }
    }
}


pub(crate) async fn read_connect_request(stream: &mut TcpStream) -> anyhow::Result<ConnectRequest> {
    let msg_len: usize = stream.read_u32().await?.safe_cast();
    if msg_len > ConnectRequest::MAX_SERIALIZED_LEN {
        bail!("connect request of {} bytes exceeds the maximum of {} bytes", msg_len, ConnectRequest::MAX_SERIALIZED_LEN);
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;
    ConnectRequest::try_deser(&mut msg_buf.as_slice())
}

pub(crate) async fn send_connect_response(stream: &mut TcpStream, status: ConnectStatus) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    ConnectResponse { status }
        .ser(&mut buf);

    stream.write_all(&buf).await?;
    Ok(())
}

async fn send_peer_notice(stream: &mut TcpStream, notice: PeerNotice) -> anyhow::Result<()> {
    stream.write_u8(notice.into()).await?;
    stream.shutdown().await?;
    Ok(())
}
