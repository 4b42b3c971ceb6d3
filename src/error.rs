use std::net;
use std::num::ParseIntError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates the agent is closed.
    #[error("the agent is closed")]
    ErrClosed,

    /// Indicates an operation named a stream id the agent does not know.
    #[error("unknown stream id")]
    ErrUnknownStream,

    /// Indicates an operation named a component id the stream does not have.
    #[error("unknown component id")]
    ErrUnknownComponent,

    /// Indicates `add_stream` was called before any local address was added.
    #[error("no local addresses added")]
    ErrNoLocalAddress,

    /// Indicates a local address without a bound port; the embedder owns
    /// socket binding, so an unbound address can never receive.
    #[error("local address must carry a bound port")]
    ErrPortZero,

    /// Indicates a stream was requested with zero components.
    #[error("a stream needs at least one component")]
    ErrNoComponents,

    /// Indicates the remote ufrag is outside the 4..=256 character range.
    #[error("remote ufrag must be 4 to 256 characters")]
    ErrRemoteUfragInvalid,

    /// Indicates the remote password is outside the 22..=256 character range.
    #[error("remote pwd must be 22 to 256 characters")]
    ErrRemotePwdInvalid,

    /// Indicates a lite agent was configured as controlling.
    #[error("lite agents cannot take the controlling role")]
    ErrLiteControlling,

    /// Indicates that non host candidates were requested for a lite agent.
    #[error("lite agents must only use host candidates")]
    ErrLiteUsingNonHostCandidates,

    /// Indicates agent does not have a valid candidate pair.
    #[error("no candidate pairs available")]
    ErrNoCandidatePairs,

    /// Indicates application data that would be mistaken for STUN on the wire.
    #[error("cannot send STUN messages as application data")]
    ErrWriteStunMessage,

    /// Indicates we were unable to parse a candidate address.
    #[error("failed to parse address")]
    ErrAddressParseFailed,

    /// Indicates an unsupported transport token in a candidate line.
    #[error("invalid transport protocol type")]
    ErrProtoType,

    #[error("attribute not long enough to be ICE candidate")]
    ErrAttributeTooShortIceCandidate,
    #[error("could not parse related addresses")]
    ErrParseRelatedAddr,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("failed to get XOR-MAPPED-ADDRESS response")]
    ErrGetXorMappedAddrResponse,
    #[error("username mismatch")]
    ErrMismatchUsername,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Stun(#[from] stun::Error),

    #[error("{0}")]
    Other(String),
}
