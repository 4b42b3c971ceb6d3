use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;

use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::Candidate;
use crate::state::ComponentState;

/// ICE credentials of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
}

impl Credentials {
    pub fn new(ufrag: String, pwd: String) -> Self {
        Self { ufrag, pwd }
    }
}

/// One addressable sub-stream (RTP=1, RTCP=2). Owns its candidate lists and
/// the inbound application-data queue that stands in for its sockets.
pub(crate) struct Component {
    pub(crate) id: u16,
    pub(crate) state: ComponentState,
    pub(crate) local_candidates: Vec<Candidate>,
    pub(crate) remote_candidates: Vec<Candidate>,
    /// Stable id of the nominated pair installed for media.
    pub(crate) selected_pair: Option<u64>,
    /// Stable id of the pair currently being nominated (controlling only).
    pub(crate) nominated_pair: Option<u64>,
    pub(crate) inbound: VecDeque<BytesMut>,
    pub(crate) next_keepalive_at: Option<Instant>,
}

impl Component {
    pub(crate) fn new(id: u16) -> Self {
        Self {
            id,
            state: ComponentState::Disconnected,
            local_candidates: vec![],
            remote_candidates: vec![],
            selected_pair: None,
            nominated_pair: None,
            inbound: VecDeque::new(),
            next_keepalive_at: None,
        }
    }

    /// Finds the local candidate owning the socket `addr` was delivered on.
    /// Matches on the base so reflexive candidates route to their host.
    pub(crate) fn find_local(&self, addr: SocketAddr) -> Option<usize> {
        self.local_candidates
            .iter()
            .position(|c| c.base_addr() == addr || c.addr() == addr)
    }

    pub(crate) fn find_remote(&self, addr: SocketAddr) -> Option<usize> {
        self.remote_candidates.iter().position(|c| c.addr() == addr)
    }

    pub(crate) fn has_local_equal(&self, c: &Candidate) -> bool {
        self.local_candidates.iter().any(|x| x.equal(c))
    }

    pub(crate) fn has_remote_equal(&self, c: &Candidate) -> bool {
        self.remote_candidates.iter().any(|x| x.equal(c))
    }
}

/// A named collection of components sharing ICE credentials. Owns the check
/// list and the triggered-check queue for all its components.
pub(crate) struct Stream {
    pub(crate) id: usize,
    pub(crate) local_credentials: Credentials,
    pub(crate) remote_credentials: Option<Credentials>,
    pub(crate) components: Vec<Component>,
    pub(crate) check_list: Vec<CandidatePair>,
    /// Stable pair ids, front runs first on the next tick.
    pub(crate) triggered_queue: VecDeque<u64>,
    pub(crate) initial_binding_request_received: bool,
}

impl Stream {
    pub(crate) fn new(id: usize, n_components: u16, local_credentials: Credentials) -> Self {
        Self {
            id,
            local_credentials,
            remote_credentials: None,
            components: (1..=n_components).map(Component::new).collect(),
            check_list: vec![],
            triggered_queue: VecDeque::new(),
            initial_binding_request_received: false,
        }
    }

    pub(crate) fn component(&self, component_id: u16) -> Option<&Component> {
        self.components.iter().find(|c| c.id == component_id)
    }

    pub(crate) fn component_mut(&mut self, component_id: u16) -> Option<&mut Component> {
        self.components.iter_mut().find(|c| c.id == component_id)
    }

    /// Resolves a stable pair id to its current check-list index.
    pub(crate) fn pair_index(&self, pair_id: u64) -> Option<usize> {
        self.check_list.iter().position(|p| p.id == pair_id)
    }

    pub(crate) fn find_pair(
        &self,
        component_id: u16,
        local_index: usize,
        remote_index: usize,
    ) -> Option<usize> {
        self.check_list.iter().position(|p| {
            p.component_id == component_id
                && p.local_index == local_index
                && p.remote_index == remote_index
        })
    }

    /// The pair foundation used by the freezing algorithm: the concatenated
    /// foundations of both candidates.
    pub(crate) fn pair_foundation(&self, pair: &CandidatePair) -> String {
        match self.component(pair.component_id) {
            Some(c) => format!(
                "{}:{}",
                c.local_candidates[pair.local_index].foundation(),
                c.remote_candidates[pair.remote_index].foundation()
            ),
            None => String::new(),
        }
    }
}
