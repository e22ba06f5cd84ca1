use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut, Bytes};

use crate::util::buf_ext::{BufExt, BufMutExt};

/// An [EndPointAddress] names an end point. It is opaque to everything except the carrier that
///  created it: applications compare, hash, store and forward addresses, but they never look
///  inside.
///
/// An address is scoped to the transport instance that allocated it, and it is unique only while
///  the end point it refers to is alive. Carriers encode whatever they need to route to the end
///  point (e.g. `host:port:index` for TCP), which makes addresses human-readable in practice -
///  but that is a debugging convenience rather than part of the contract.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EndPointAddress(Bytes);

impl EndPointAddress {
    pub fn new(raw: impl Into<Bytes>) -> EndPointAddress {
        EndPointAddress(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_blob(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<EndPointAddress> {
        Ok(EndPointAddress(buf.try_read_blob()?))
    }
}

impl Debug for EndPointAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", String::from_utf8_lossy(&self.0))
    }
}

impl Display for EndPointAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<String> for EndPointAddress {
    fn from(value: String) -> Self {
        EndPointAddress(value.into())
    }
}

impl From<&'static str> for EndPointAddress {
    fn from(value: &'static str) -> Self {
        EndPointAddress(Bytes::from_static(value.as_bytes()))
    }
}


/// Names a multicast group. Like [EndPointAddress], this is opaque and scoped to the transport
///  that created the group.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MulticastAddress(Bytes);

impl MulticastAddress {
    pub fn new(raw: impl Into<Bytes>) -> MulticastAddress {
        MulticastAddress(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for MulticastAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[multicast {}]", String::from_utf8_lossy(&self.0))
    }
}

impl From<String> for MulticastAddress {
    fn from(value: String) -> Self {
        MulticastAddress(value.into())
    }
}
