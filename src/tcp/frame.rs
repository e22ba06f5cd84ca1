//! After the handshake, a TCP stream carries a sequence of frames in one direction: data frames
//!  (one per message) followed by a single close frame. All numbers are big-endian.
//!
//! ```ascii
//! 0: tag: 0 = data, 1 = close
//! data frames only:
//! 1: number of fragments (u32)
//! *: fragments, each with a u32 length prefix
//! ```
//!
//! A message's size, which is limited by the configured maximum, includes the fragments' length
//!  prefixes (see [message_size]). Both sides apply the same rule, so anything a sender accepts
//!  is accepted by the receiver.

use std::io::ErrorKind;

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::util::buf_ext::BufMutExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameTag {
    Data = 0,
    Close = 1,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Data(Vec<Bytes>),
    Close,
}

/// framing overhead that a message's fragments count against the maximum message size
pub const FRAGMENT_OVERHEAD: usize = 4;

/// Pre-allocation for a frame's fragments is capped, the rest grows as fragments actually arrive
const MAX_INITIAL_FRAGMENTS: usize = 1024;

pub fn message_size(payload: &[Bytes]) -> usize {
    payload.iter()
        .map(|f| FRAGMENT_OVERHEAD + f.len())
        .sum()
}

/// The number of fragments must fit into a u32, which [message_size] staying within a valid
///  maximum message size ensures.
pub fn encode_data_frame(payload: &[Bytes], buf: &mut BytesMut) {
    buf.reserve(5 + payload.iter().map(|f| 4 + f.len()).sum::<usize>());
    buf.put_u8(FrameTag::Data.into());
    buf.put_u32(payload.len().prechecked_cast());
    for fragment in payload {
        buf.put_blob(fragment);
    }
}

pub fn encode_close_frame(buf: &mut BytesMut) {
    buf.put_u8(FrameTag::Close.into());
}

/// Reads the next frame. EOF before the first byte of a frame is a regular end of the stream and
///  returns `None`, EOF anywhere else is an error.
pub async fn read_frame(reader: &mut (impl AsyncRead + Unpin), max_message_size: usize) -> anyhow::Result<Option<Frame>> {
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match FrameTag::try_from(tag)? {
        FrameTag::Close => Ok(Some(Frame::Close)),
        FrameTag::Data => {
            let num_fragments: usize = reader.read_u32().await?.safe_cast();
            let mut message_size = num_fragments.saturating_mul(FRAGMENT_OVERHEAD);
            if message_size > max_message_size {
                bail!("frame with {} fragments exceeds the maximum message size of {} bytes", num_fragments, max_message_size);
            }

            let mut payload = Vec::with_capacity(num_fragments.min(MAX_INITIAL_FRAGMENTS));
            for _ in 0..num_fragments {
                let len: usize = reader.read_u32().await?.safe_cast();
                message_size += len;
                if message_size > max_message_size {
                    bail!("message exceeds the maximum size of {} bytes", max_message_size);
                }

                let mut fragment = BytesMut::zeroed(len);
                reader.read_exact(&mut fragment).await?;
                payload.push(fragment.freeze());
            }
            Ok(Some(Frame::Data(payload)))
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn data_frame(fragments: &[&'static str]) -> BytesMut {
        let payload = fragments.iter()
            .map(|f| Bytes::from_static(f.as_bytes()))
            .collect::<Vec<_>>();
        let mut buf = BytesMut::new();
        encode_data_frame(&payload, &mut buf);
        buf
    }

    #[rstest]
    #[case::single(vec!["ping"])]
    #[case::no_fragments(vec![])]
    #[case::empty_fragment(vec!["seq", "", "x"])]
    #[tokio::test]
    async fn test_data_frame(#[case] fragments: Vec<&'static str>) {
        let mut buf = data_frame(&fragments);
        encode_close_frame(&mut buf);

        let mut reader: &[u8] = &buf;
        let expected = fragments.iter()
            .map(|f| Bytes::from_static(f.as_bytes()))
            .collect::<Vec<_>>();
        assert_eq!(read_frame(&mut reader, 100).await.unwrap(), Some(Frame::Data(expected)));
        assert_eq!(read_frame(&mut reader, 100).await.unwrap(), Some(Frame::Close));
        assert_eq!(read_frame(&mut reader, 100).await.unwrap(), None);
    }

    #[rstest]
    #[case::tag_only(1)]
    #[case::in_fragment_count(3)]
    #[case::in_fragment(12)]
    #[tokio::test]
    async fn test_truncated(#[case] len: usize) {
        let buf = data_frame(&["abcdefgh"]);
        let mut reader: &[u8] = &buf[..len];
        assert!(read_frame(&mut reader, 100).await.is_err());
    }

    #[rstest]
    #[case::single(vec!["abc"], 7)]
    #[case::two(vec!["abc", "def"], 14)]
    #[case::empty_fragments(vec!["", "", ""], 12)]
    #[case::no_fragments(vec![], 0)]
    fn test_message_size(#[case] fragments: Vec<&'static str>, #[case] expected: usize) {
        let payload = fragments.iter()
            .map(|f| Bytes::from_static(f.as_bytes()))
            .collect::<Vec<_>>();
        assert_eq!(message_size(&payload), expected);
    }

    #[rstest]
    #[case::fits(vec!["abc", "def"], 14, true)]
    #[case::too_large(vec!["abc", "def"], 13, false)]
    #[case::too_many_empty_fragments(vec![""; 11], 43, false)]
    #[case::many_empty_fragments(vec![""; 11], 44, true)]
    #[tokio::test]
    async fn test_message_too_large(#[case] fragments: Vec<&'static str>, #[case] max_message_size: usize, #[case] expected_ok: bool) {
        let buf = data_frame(&fragments);
        let mut reader: &[u8] = &buf;
        assert_eq!(read_frame(&mut reader, max_message_size).await.is_ok(), expected_ok);
    }

    #[tokio::test]
    async fn test_huge_fragment_count_is_rejected_before_reading_fragments() {
        let mut buf = BytesMut::new();
        buf.put_u8(FrameTag::Data.into());
        buf.put_u32(u32::MAX);

        let mut reader: &[u8] = &buf;
        let result = read_frame(&mut reader, 16*1024*1024).await;
        assert!(result.unwrap_err().to_string().contains("fragments"));
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let mut reader: &[u8] = &[7u8];
        assert!(read_frame(&mut reader, 100).await.is_err());
    }
}
