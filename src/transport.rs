use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;

use bytes::BytesMut;

/// Type of transport protocol. Candidates are UDP only; the tag exists so
/// that datagrams from a multiplexed embedder stay self-describing.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportProtocol {
    /// UDP
    #[default]
    UDP,
    /// TCP
    TCP,
}

/// Addressing for one datagram: the local socket it was received on (or must
/// be sent from) and the peer address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContext {
    /// Local socket address, either IPv4 or IPv6
    pub local_addr: SocketAddr,
    /// Peer socket address, either IPv4 or IPv6
    pub peer_addr: SocketAddr,
    /// Type of transport protocol, either UDP or TCP
    pub protocol: TransportProtocol,
}

impl Default for TransportContext {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::from_str("0.0.0.0:0").unwrap(),
            peer_addr: SocketAddr::from_str("0.0.0.0:0").unwrap(),
            protocol: TransportProtocol::UDP,
        }
    }
}

/// A generic inbound or outbound datagram with its [TransportContext].
pub struct TransportMessage<T> {
    /// Received/sent time
    pub now: Instant,
    /// A transport context with [local_addr](TransportContext::local_addr) and [peer_addr](TransportContext::peer_addr)
    pub transport: TransportContext,
    /// Message body with generic type
    pub message: T,
}

/// BytesMut type message with [TransportContext]
pub type TaggedBytesMut = TransportMessage<BytesMut>;
