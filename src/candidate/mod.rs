
pub mod candidate_pair;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crc::{Crc, CRC_32_ISCSI};
use serde::Serialize;

use crate::error::*;
use crate::rand::generate_cand_id;

/// The local preference for a candidate. With a single address per
/// interface this is the maximum allowed value (RFC 5245 §4.1.2.1).
pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Indicates that the candidate is used for RTP.
pub const COMPONENT_RTP: u16 = 1;
/// Indicates that the candidate is used for RTCP.
pub const COMPONENT_RTCP: u16 = 2;

/// Represents the type of candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidateType {
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unspecified => "Unknown candidate type",
        };
        write!(f, "{s}")
    }
}

impl Default for CandidateType {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl CandidateType {
    /// Returns the preference weight of a `CandidateType`.
    ///
    /// 4.1.2.2.  Guidelines for Choosing Type and Local Preferences
    /// The RECOMMENDED values are 126 for host candidates, 100
    /// for server reflexive candidates, 110 for peer reflexive candidates,
    /// and 0 for relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay | CandidateType::Unspecified => 0,
        }
    }
}

/// One transport address a component could receive on, immutable once
/// created. UDP only.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub(crate) id: String,
    pub(crate) candidate_type: CandidateType,
    pub(crate) component: u16,
    pub(crate) addr: SocketAddr,
    pub(crate) base_addr: SocketAddr,
    pub(crate) related_address: Option<SocketAddr>,
    /// The STUN server that produced a server-reflexive candidate; part of
    /// the foundation so equivalent candidates from different sessions agree.
    pub(crate) server_addr: Option<SocketAddr>,
    pub(crate) foundation_override: String,
    pub(crate) priority_override: u32,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(related_address) = self.related_address() {
            write!(
                f,
                "udp {} {} related {}",
                self.candidate_type(),
                self.addr(),
                related_address,
            )
        } else {
            write!(f, "udp {} {}", self.candidate_type(), self.addr())
        }
    }
}

impl Candidate {
    /// An arbitrary string used in the freezing algorithm to group similar
    /// candidates: identical for two candidates with the same type, base
    /// address and STUN server.
    pub fn foundation(&self) -> String {
        if !self.foundation_override.is_empty() {
            return self.foundation_override.clone();
        }

        let mut buf = vec![];
        buf.extend_from_slice(self.candidate_type().to_string().as_bytes());
        buf.extend_from_slice(self.base_addr.ip().to_string().as_bytes());
        buf.extend_from_slice(b"udp");
        if let Some(server_addr) = &self.server_addr {
            buf.extend_from_slice(server_addr.to_string().as_bytes());
        }

        let checksum = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&buf);

        format!("{checksum}")
    }

    /// A unique identifier for just this candidate. Unlike the foundation
    /// this is different for each candidate.
    pub fn id(&self) -> String {
        self.id.clone()
    }

    /// The component this candidate belongs to (RTP=1, RTCP=2).
    pub fn component(&self) -> u16 {
        self.component
    }

    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    /// The transport address the peer would send to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The address of the local socket this candidate was derived from.
    /// Equal to `addr` for host candidates.
    pub fn base_addr(&self) -> SocketAddr {
        self.base_addr
    }

    /// A transport address related to the candidate, useful for diagnostics
    /// and other purposes.
    pub fn related_address(&self) -> Option<SocketAddr> {
        self.related_address
    }

    /// Computes the priority for this candidate per RFC 5245 §4.1.2.
    pub fn priority(&self) -> u32 {
        if self.priority_override != 0 {
            return self.priority_override;
        }

        (1 << 24) * u32::from(self.candidate_type().preference())
            + (1 << 8) * u32::from(self.local_preference())
            + (256 - u32::from(self.component()))
    }

    pub(crate) fn local_preference(&self) -> u16 {
        DEFAULT_LOCAL_PREFERENCE
    }

    /// Used to compare two candidates for redundancy.
    pub fn equal(&self, other: &Candidate) -> bool {
        self.candidate_type() == other.candidate_type()
            && self.addr() == other.addr()
            && self.base_addr() == other.base_addr()
            && self.related_address() == other.related_address()
    }

    /// Returns the candidate-attribute line for the signalling layer.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} udp {} {} {} typ {}",
            self.foundation(),
            self.component(),
            self.priority(),
            self.addr().ip(),
            self.addr().port(),
            self.candidate_type()
        );

        if let Some(related_address) = self.related_address() {
            val += format!(
                " raddr {} rport {}",
                related_address.ip(),
                related_address.port(),
            )
            .as_str();
        }

        val
    }
}

/// Collects the common arguments of the candidate constructors.
#[derive(Default)]
pub struct CandidateConfig {
    pub candidate_id: String,
    pub address: String,
    pub port: u16,
    pub component: u16,
    pub priority: u32,
    pub foundation: String,
}

impl CandidateConfig {
    fn resolve(&self) -> Result<(String, SocketAddr)> {
        let ip: IpAddr = match self.address.parse() {
            Ok(ip) => ip,
            Err(_) => return Err(Error::ErrAddressParseFailed),
        };

        let candidate_id = if self.candidate_id.is_empty() {
            generate_cand_id()
        } else {
            self.candidate_id.clone()
        };

        Ok((candidate_id, SocketAddr::new(ip, self.port)))
    }
}

/// The config required to create a new host candidate.
#[derive(Default)]
pub struct CandidateHostConfig {
    pub base_config: CandidateConfig,
}

impl CandidateHostConfig {
    /// Creates a new host candidate; its base is itself.
    pub fn new_candidate_host(self) -> Result<Candidate> {
        let (id, addr) = self.base_config.resolve()?;

        Ok(Candidate {
            id,
            candidate_type: CandidateType::Host,
            component: self.base_config.component,
            addr,
            base_addr: addr,
            related_address: None,
            server_addr: None,
            foundation_override: self.base_config.foundation,
            priority_override: self.base_config.priority,
        })
    }
}

/// The config required to create a new server-reflexive candidate.
#[derive(Default)]
pub struct CandidateServerReflexiveConfig {
    pub base_config: CandidateConfig,
    pub rel_addr: String,
    pub rel_port: u16,
    pub server_addr: Option<SocketAddr>,
}

impl CandidateServerReflexiveConfig {
    /// Creates a new server-reflexive candidate. The related address is the
    /// host base the mapping was discovered from; remote candidates received
    /// without one fall back to the mapped address itself.
    pub fn new_candidate_server_reflexive(self) -> Result<Candidate> {
        let (id, addr) = self.base_config.resolve()?;

        let base_addr = if self.rel_addr.is_empty() {
            addr
        } else {
            let ip: IpAddr = match self.rel_addr.parse() {
                Ok(ip) => ip,
                Err(_) => return Err(Error::ErrAddressParseFailed),
            };
            SocketAddr::new(ip, self.rel_port)
        };

        Ok(Candidate {
            id,
            candidate_type: CandidateType::ServerReflexive,
            component: self.base_config.component,
            addr,
            base_addr,
            related_address: if self.rel_addr.is_empty() {
                None
            } else {
                Some(base_addr)
            },
            server_addr: self.server_addr,
            foundation_override: self.base_config.foundation,
            priority_override: self.base_config.priority,
        })
    }
}

/// The config required to create a new peer-reflexive candidate.
#[derive(Default)]
pub struct CandidatePeerReflexiveConfig {
    pub base_config: CandidateConfig,
    pub rel_addr: String,
    pub rel_port: u16,
}

impl CandidatePeerReflexiveConfig {
    /// Creates a new peer-reflexive candidate. For a local candidate the
    /// related address is the base of the check that discovered it; for a
    /// remote one only the source address is known.
    pub fn new_candidate_peer_reflexive(self) -> Result<Candidate> {
        let (id, addr) = self.base_config.resolve()?;

        let base_addr = if self.rel_addr.is_empty() {
            addr
        } else {
            let ip: IpAddr = match self.rel_addr.parse() {
                Ok(ip) => ip,
                Err(_) => return Err(Error::ErrAddressParseFailed),
            };
            SocketAddr::new(ip, self.rel_port)
        };

        Ok(Candidate {
            id,
            candidate_type: CandidateType::PeerReflexive,
            component: self.base_config.component,
            addr,
            base_addr,
            related_address: if self.rel_addr.is_empty() {
                None
            } else {
                Some(base_addr)
            },
            server_addr: None,
            foundation_override: self.base_config.foundation,
            priority_override: self.base_config.priority,
        })
    }
}

/// The config required to create a new relayed candidate. Relay allocation
/// itself is out of scope; the type exists so remote relay candidates can be
/// represented and paired.
#[derive(Default)]
pub struct CandidateRelayConfig {
    pub base_config: CandidateConfig,
    pub rel_addr: String,
    pub rel_port: u16,
}

impl CandidateRelayConfig {
    pub fn new_candidate_relay(self) -> Result<Candidate> {
        let (id, addr) = self.base_config.resolve()?;

        let related_address = if self.rel_addr.is_empty() {
            None
        } else {
            let ip: IpAddr = match self.rel_addr.parse() {
                Ok(ip) => ip,
                Err(_) => return Err(Error::ErrAddressParseFailed),
            };
            Some(SocketAddr::new(ip, self.rel_port))
        };

        Ok(Candidate {
            id,
            candidate_type: CandidateType::Relay,
            component: self.base_config.component,
            addr,
            base_addr: addr,
            related_address,
            server_addr: None,
            foundation_override: self.base_config.foundation,
            priority_override: self.base_config.priority,
        })
    }
}

/// Creates a Candidate from its candidate-attribute line.
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::Other(format!(
            "{:?} ({})",
            Error::ErrAttributeTooShortIceCandidate,
            split.len()
        )));
    }

    // Foundation
    let foundation = split[0].to_owned();

    // Component
    let component: u16 = split[1].parse()?;

    // Transport
    if split[2] != "udp" && split[2] != "UDP" {
        return Err(Error::ErrProtoType);
    }

    // Priority
    let priority: u32 = split[3].parse()?;

    // Address
    let address = split[4].to_owned();

    // Port
    let port: u16 = split[5].parse()?;

    let typ = split[7];

    let mut rel_addr = String::new();
    let mut rel_port = 0;

    if split.len() > 8 {
        let split2 = &split[8..];

        if split2[0] == "raddr" {
            if split2.len() < 4 {
                return Err(Error::Other(format!(
                    "{:?}: incorrect length",
                    Error::ErrParseRelatedAddr
                )));
            }

            // RelatedAddress
            rel_addr = split2[1].to_owned();

            // RelatedPort
            rel_port = split2[3].parse()?;
        }
    }

    let base_config = CandidateConfig {
        address,
        port,
        component,
        priority,
        foundation,
        ..CandidateConfig::default()
    };

    match typ {
        "host" => CandidateHostConfig { base_config }.new_candidate_host(),
        "srflx" => CandidateServerReflexiveConfig {
            base_config,
            rel_addr,
            rel_port,
            server_addr: None,
        }
        .new_candidate_server_reflexive(),
        "prflx" => CandidatePeerReflexiveConfig {
            base_config,
            rel_addr,
            rel_port,
        }
        .new_candidate_peer_reflexive(),
        "relay" => CandidateRelayConfig {
            base_config,
            rel_addr,
            rel_port,
        }
        .new_candidate_relay(),
        _ => Err(Error::Other(format!(
            "{:?} ({})",
            Error::ErrUnknownCandidateType,
            typ
        ))),
    }
}
