use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::address::EndPointAddress;
use crate::event::Reliability;
use crate::util::buf_ext::BufExt;

/// The first thing sent on a new TCP stream, with a u32 length prefix
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectRequest {
    /// the index part of the target end point's address
    pub target_index: u64,
    pub origin: EndPointAddress,
    pub reliability: Reliability,
}

impl ConnectRequest {
    /// upper bound for the serialized length, to avoid allocating huge buffers for garbage
    pub const MAX_SERIALIZED_LEN: usize = 64*1024;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.target_index);
        self.origin.ser(buf);
        buf.put_u8(self.reliability.into());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectRequest> {
        let target_index = buf.try_read_u64()?;
        let origin = EndPointAddress::try_deser(buf)?;
        let reliability = Reliability::try_from(buf.try_read_u8()?)?;
        if buf.has_remaining() {
            bail!("{} trailing bytes after connect request", buf.remaining());
        }
        Ok(ConnectRequest {
            target_index,
            origin,
            reliability,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectStatus {
    Accepted = 0,
    UnknownEndPoint = 1,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectResponse {
    pub status: ConnectStatus,
}

impl ConnectResponse {
    pub const SERIALIZED_LEN: usize = 1;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.status.into());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectResponse> {
        let status = ConnectStatus::try_from(buf.try_read_u8()?)?;
        Ok(ConnectResponse { status })
    }
}

/// After the handshake, the reverse direction of a stream carries at most one of these, sent by
///  the target's transport right before it drops the stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PeerNotice {
    /// the target end point was closed while the connection was open
    EndPointClosed = 0,
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::ordered(0, "127.0.0.1:8888:3", Reliability::ReliableOrdered)]
    #[case::unreliable(u64::MAX, "", Reliability::Unreliable)]
    fn test_connect_request(#[case] target_index: u64, #[case] origin: &'static str, #[case] reliability: Reliability) {
        let request = ConnectRequest {
            target_index,
            origin: origin.into(),
            reliability,
        };

        let mut buf = BytesMut::new();
        request.ser(&mut buf);
        let mut b: &[u8] = &buf;
        assert_eq!(ConnectRequest::try_deser(&mut b).unwrap(), request);
    }

    #[test]
    fn test_connect_request_invalid_reliability() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        EndPointAddress::from("a").ser(&mut buf);
        buf.put_u8(99);

        let mut b: &[u8] = &buf;
        assert!(ConnectRequest::try_deser(&mut b).is_err());
    }

    #[rstest]
    #[case::accepted(vec![0], Some(ConnectStatus::Accepted))]
    #[case::unknown(vec![1], Some(ConnectStatus::UnknownEndPoint))]
    #[case::invalid(vec![2], None)]
    #[case::empty(vec![], None)]
    fn test_connect_response(#[case] raw: Vec<u8>, #[case] expected: Option<ConnectStatus>) {
        let mut b: &[u8] = &raw;
        assert_eq!(ConnectResponse::try_deser(&mut b).ok().map(|r| r.status), expected);
    }

    #[rstest]
    #[case::end_point_closed(0, Some(PeerNotice::EndPointClosed))]
    #[case::invalid(1, None)]
    fn test_peer_notice(#[case] raw: u8, #[case] expected: Option<PeerNotice>) {
        assert_eq!(PeerNotice::try_from(raw).ok(), expected);
    }
}
