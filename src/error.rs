use std::time::Duration;

use thiserror::Error;

use crate::address::{EndPointAddress, MulticastAddress};

/// Failure to create an end point. This is recoverable in principle: callers may retry later, or
///  give up.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("the transport is closed")]
    TransportClosed,
    #[error("the carrier ran out of resources: {0}")]
    ResourceExhausted(String),
    #[error("the carrier is unavailable: {0}")]
    CarrierUnavailable(#[from] std::io::Error),
    #[error("invalid carrier configuration: {0}")]
    InvalidConfig(String),
}

/// Failure to establish a connection. The abstraction never retries on its own.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("target {0} is unreachable: {1}")]
    TargetUnreachable(EndPointAddress, String),
    #[error("{0} is not a valid address for this transport")]
    InvalidAddress(EndPointAddress),
    #[error("the local end point is closed")]
    EndPointClosed,
    #[error("connecting did not complete within {0:?}")]
    Timeout(Duration),
}

/// Failure to send on a connection. A connection that reported a carrier-level failure is dead,
///  and all further sends fail.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("the connection is closed")]
    ConnectionClosed,
    #[error("the local end point is closed")]
    EndPointClosed,
    #[error("peer {0} is unreachable")]
    PeerUnreachable(EndPointAddress),
    #[error("message of {actual} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { actual: usize, max: usize },
    #[error("sending failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum MulticastError {
    #[error("this transport does not support multicast")]
    Unsupported,
    #[error("multicast group {0:?} does not exist")]
    GroupNotFound(MulticastAddress),
    #[error("the local end point is closed")]
    EndPointClosed,
}

/// No event arrived within the caller's deadline. Nothing was consumed from the queue.
#[derive(Debug, Error, Eq, PartialEq)]
#[error("no event within {0:?}")]
pub struct ReceiveTimeout(pub Duration);
