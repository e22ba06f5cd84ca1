use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};


macro_rules! read_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                bail!("buffer underflow reading {}", stringify!($ty));
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads for parsing data received from a peer: running out of data is an
///  error rather than a panic.
///
/// All numbers are in network byte order (BE).
pub trait BufExt: Buf {
    read_try_impl!(try_read_u8, u8, get_u8);
    read_try_impl!(try_read_u16, u16, get_u16);
    read_try_impl!(try_read_u32, u32, get_u32);
    read_try_impl!(try_read_u64, u64, get_u64);

    /// a blob with a u32 length prefix
    fn try_read_blob(&mut self) -> anyhow::Result<Bytes> {
        let len: usize = self.try_read_u32()?.safe_cast();
        if self.remaining() < len {
            bail!("buffer underflow: blob of length {} with only {} bytes remaining", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }
}

pub trait BufMutExt: BufMut {
    fn put_blob(&mut self, blob: &[u8]) {
        self.put_u32(blob.len().prechecked_cast());
        self.put_slice(blob);
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"")]
    #[case::short(b"abc")]
    #[case::binary(&[0u8, 255, 1, 254])]
    fn test_blob(#[case] blob: &[u8]) {
        let mut buf = BytesMut::new();
        buf.put_blob(blob);
        buf.put_u8(99);

        let mut b: &[u8] = &buf;
        assert_eq!(b.try_read_blob().unwrap().as_ref(), blob);
        assert_eq!(b.try_read_u8().unwrap(), 99);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::u8(vec![])]
    #[case::u16(vec![1])]
    #[case::u32(vec![1, 2, 3])]
    fn test_underflow(#[case] data: Vec<u8>) {
        let mut b: &[u8] = &data;
        match data.len() {
            0 => assert!(b.try_read_u8().is_err()),
            1 => assert!(b.try_read_u16().is_err()),
            _ => assert!(b.try_read_u32().is_err()),
        }
    }

    #[test]
    fn test_blob_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"abc");

        let mut b: &[u8] = &buf;
        assert!(b.try_read_blob().is_err());
    }
}
