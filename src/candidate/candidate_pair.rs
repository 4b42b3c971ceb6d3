use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use stun::agent::TransactionId;

/// Represents the state of one candidate pair in a check list.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidatePairState {
    /// A check is blocked until another pair with the same foundation
    /// completes.
    #[default]
    #[serde(rename = "frozen")]
    Frozen = 0,

    /// A check has not been performed for this pair yet.
    #[serde(rename = "waiting")]
    Waiting = 1,

    /// A check has been sent for this pair and the transaction is in
    /// progress.
    #[serde(rename = "in-progress")]
    InProgress = 2,

    /// The check for this pair never produced a response or produced an
    /// unrecoverable failure response.
    #[serde(rename = "failed")]
    Failed = 3,

    /// The check for this pair produced a successful result.
    #[serde(rename = "succeeded")]
    Succeeded = 4,
}

impl From<u8> for CandidatePairState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Waiting,
            2 => Self::InProgress,
            3 => Self::Failed,
            4 => Self::Succeeded,
            _ => Self::Frozen,
        }
    }
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Frozen => "frozen",
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        };

        write!(f, "{s}")
    }
}

/// The single outstanding STUN transaction of a pair. At most one exists at
/// any moment; retransmission resends `raw` byte-identical.
#[derive(Debug, Clone)]
pub(crate) struct PairTransaction {
    pub(crate) transaction_id: TransactionId,
    pub(crate) destination: SocketAddr,
    pub(crate) is_use_candidate: bool,
    /// The role we held when the request was sent; a 487 only flips our role
    /// if it has not changed since (RFC 8445 §7.2.5.1).
    pub(crate) controlling_at_send: bool,
    pub(crate) raw: Vec<u8>,
    pub(crate) attempts: u16,
    pub(crate) next_rto_at: Instant,
}

/// Represents a combination of a local and remote candidate of one
/// component, identified by a stable id that survives check-list re-sorting.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub(crate) id: u64,
    pub component_id: u16,
    /// Index into the component's local candidate list.
    pub local_index: usize,
    /// Index into the component's remote candidate list.
    pub remote_index: usize,
    pub local_priority: u32,
    pub remote_priority: u32,
    pub(crate) ice_role_controlling: bool,
    pub(crate) state: CandidatePairState,
    pub(crate) nominated: bool,
    /// Whether a check on this pair has produced a valid response.
    pub(crate) valid: bool,
    pub(crate) valid_since: Option<Instant>,
    /// Controlled side: USE-CANDIDATE arrived before the pair succeeded;
    /// install once the triggered check completes.
    pub(crate) use_candidate_pending: bool,
    pub(crate) binding_request_count: u16,
    pub(crate) transaction: Option<PairTransaction>,
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local_priority,
            self.local_index,
            self.remote_index,
            self.remote_priority,
        )
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.component_id == other.component_id
            && self.local_index == other.local_index
            && self.remote_index == other.remote_index
    }
}

impl CandidatePair {
    #[must_use]
    pub(crate) fn new(
        id: u64,
        component_id: u16,
        local_index: usize,
        remote_index: usize,
        local_priority: u32,
        remote_priority: u32,
        ice_role_controlling: bool,
    ) -> Self {
        Self {
            id,
            component_id,
            local_index,
            remote_index,
            local_priority,
            remote_priority,
            ice_role_controlling,
            state: CandidatePairState::Frozen,
            nominated: false,
            valid: false,
            valid_since: None,
            use_candidate_pending: false,
            binding_request_count: 0,
            transaction: None,
        }
    }

    /// RFC 5245 - 5.7.2.  Computing Pair Priority and Ordering Pairs
    /// Let G be the priority for the candidate provided by the controlling
    /// agent.  Let D be the priority for the candidate provided by the
    /// controlled agent.
    /// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    pub fn priority(&self) -> u64 {
        let (g, d) = if self.ice_role_controlling {
            (self.local_priority, self.remote_priority)
        } else {
            (self.remote_priority, self.local_priority)
        };

        // 1<<32 overflows uint32; and if both g && d are
        // maxUint32, this result would overflow uint64
        ((1 << 32_u64) - 1) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }

    pub fn state(&self) -> CandidatePairState {
        self.state
    }

    pub fn nominated(&self) -> bool {
        self.nominated
    }
}
