pub mod agent_config;
pub mod agent_stats;

mod agent_checks;
mod agent_gather;
mod agent_selector;

#[cfg(test)]
mod agent_test;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use stun::message::*;

use agent_config::*;
use agent_gather::CandidateDiscovery;
use agent_stats::AgentStats;

use crate::candidate::candidate_pair::CandidatePairState;
use crate::candidate::*;
use crate::error::*;
use crate::rand::{generate_pwd, generate_tie_breaker, generate_ufrag};
use crate::state::ComponentState;
use crate::stream::{Credentials, Stream};
use crate::transport::{TaggedBytesMut, TransportContext, TransportProtocol};

/// Observable side effects, drained with [`Agent::poll_event`]. Events for
/// one `(stream, component)` are emitted in the order the state changes
/// occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Every local candidate is final and no discovery is outstanding.
    /// Emitted once per agent lifetime.
    CandidateGatheringDone,

    /// A local candidate was finalised.
    NewCandidate {
        stream_id: usize,
        component_id: u16,
        foundation: String,
    },

    /// A remote candidate was learned, either from signalling or
    /// peer-reflexively from an unexpected check source.
    NewRemoteCandidate {
        stream_id: usize,
        component_id: u16,
        foundation: String,
    },

    /// A component moved forward through its state machine.
    ComponentStateChanged {
        stream_id: usize,
        component_id: u16,
        state: ComponentState,
    },

    /// A nominated pair was installed; fires before the matching
    /// `ComponentStateChanged(Ready)`.
    NewSelectedPair {
        stream_id: usize,
        component_id: u16,
        local_foundation: String,
        remote_foundation: String,
    },

    /// The first authenticated Binding request arrived on this stream.
    /// Latched; fires at most once per stream.
    InitialBindingRequestReceived { stream_id: usize },
}

impl Event {
    /// The stream this event belongs to, if any.
    pub fn stream_id(&self) -> Option<usize> {
        match self {
            Event::CandidateGatheringDone => None,
            Event::NewCandidate { stream_id, .. }
            | Event::NewRemoteCandidate { stream_id, .. }
            | Event::ComponentStateChanged { stream_id, .. }
            | Event::NewSelectedPair { stream_id, .. }
            | Event::InitialBindingRequestReceived { stream_id } => Some(*stream_id),
        }
    }
}

/// Represents the ICE agent: streams of components, their candidates, the
/// check lists and the pacing timers. Performs no I/O of its own; see the
/// `handle_read`/`poll_transmit`/`poll_event`/`poll_timeout`/`handle_timeout`
/// pump.
pub struct Agent {
    pub(crate) tie_breaker: u64,
    pub(crate) is_controlling: bool,
    pub(crate) lite: bool,

    pub(crate) start_time: Instant,
    pub(crate) last_now: Instant,
    pub(crate) next_tick_at: Option<Instant>,

    pub(crate) streams: Vec<Stream>,
    next_stream_id: usize,
    pub(crate) next_pair_id: u64,

    local_addresses: Vec<SocketAddr>,

    pub(crate) discoveries: Vec<CandidateDiscovery>,
    pub(crate) gathering_started: bool,
    pub(crate) gathering_done_emitted: bool,

    // the following fields won't be changed after construction
    pub(crate) stun_server: Option<SocketAddr>,
    pub(crate) turn_server: Option<SocketAddr>,
    pub(crate) ta_interval: Duration,
    pub(crate) keepalive_interval: Duration,
    pub(crate) rto_initial: Duration,
    pub(crate) max_binding_requests: u16,
    pub(crate) nomination_min_wait: Duration,
    pub(crate) aggressive_nomination: bool,
    pub(crate) max_check_list_size: usize,

    closed: bool,

    pub(crate) events: VecDeque<Event>,
    pub(crate) transmits: VecDeque<TaggedBytesMut>,
    pub(crate) stats: AgentStats,
}

impl Agent {
    /// Creates a new Agent.
    pub fn new(config: AgentConfig) -> Result<Self> {
        if config.lite && config.is_controlling {
            return Err(Error::ErrLiteControlling);
        }
        if config.lite && config.stun_server.is_some() {
            return Err(Error::ErrLiteUsingNonHostCandidates);
        }

        let now = Instant::now();
        Ok(Self {
            tie_breaker: generate_tie_breaker(),
            is_controlling: config.is_controlling,
            lite: config.lite,

            start_time: now,
            last_now: now,
            next_tick_at: None,

            streams: vec![],
            next_stream_id: 1,
            next_pair_id: 1,

            local_addresses: vec![],

            discoveries: vec![],
            gathering_started: false,
            gathering_done_emitted: false,

            stun_server: config.stun_server,
            turn_server: config.turn_server,
            ta_interval: config.ta_interval.unwrap_or(DEFAULT_TA_INTERVAL),
            keepalive_interval: config
                .keepalive_interval
                .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL),
            rto_initial: config.rto_initial.unwrap_or(DEFAULT_RTO),
            max_binding_requests: config
                .max_binding_requests
                .unwrap_or(DEFAULT_MAX_BINDING_REQUESTS),
            nomination_min_wait: config
                .nomination_min_wait
                .unwrap_or(DEFAULT_NOMINATION_MIN_WAIT),
            aggressive_nomination: config.aggressive_nomination,
            max_check_list_size: config
                .max_check_list_size
                .unwrap_or(DEFAULT_MAX_CHECK_LIST_SIZE),

            closed: false,

            events: VecDeque::new(),
            transmits: VecDeque::new(),
            stats: AgentStats::default(),
        })
    }

    /// Registers a bound local interface address host candidates are derived
    /// from. Must be called before `add_stream`; binding is the embedder's
    /// job, so the port must be set.
    pub fn add_local_address(&mut self, addr: SocketAddr) -> Result<()> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        if addr.port() == 0 {
            return Err(Error::ErrPortZero);
        }
        if !self.local_addresses.contains(&addr) {
            self.local_addresses.push(addr);
        }
        Ok(())
    }

    /// Adds a stream of `n_components` components and starts gathering its
    /// candidates. Returns the new stream id. Either the whole stream is
    /// created or nothing is.
    pub fn add_stream(&mut self, n_components: u16) -> Result<usize> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        if n_components == 0 {
            return Err(Error::ErrNoComponents);
        }
        if self.local_addresses.is_empty() {
            return Err(Error::ErrNoLocalAddress);
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;

        let credentials = Credentials::new(generate_ufrag(), generate_pwd());
        self.streams
            .push(Stream::new(stream_id, n_components, credentials));

        log::debug!(
            "[{}]: allocated stream {} with {} component(s), starting candidate gathering",
            self.get_name(),
            stream_id,
            n_components
        );

        let stream_index = self.streams.len() - 1;
        self.gather_host_candidates(stream_index);
        self.gathering_started = true;
        self.maybe_emit_gathering_done();

        Ok(stream_id)
    }

    /// Removes a stream: its pairs, discoveries and timers are dropped and
    /// late responses to its transactions are ignored. Queued events for the
    /// stream are withdrawn.
    pub fn remove_stream(&mut self, stream_id: usize) -> Result<()> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;

        self.streams.remove(stream_index);
        self.discoveries.retain(|d| d.stream_id != stream_id);
        self.events.retain(|e| e.stream_id() != Some(stream_id));

        log::debug!("[{}]: removed stream {}", self.get_name(), stream_id);
        Ok(())
    }

    /// Returns the local user credentials of a stream.
    pub fn get_local_credentials(&self, stream_id: usize) -> Result<Credentials> {
        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;
        Ok(self.streams[stream_index].local_credentials.clone())
    }

    /// Sets the credentials of the remote agent for one stream.
    pub fn set_remote_credentials(
        &mut self,
        stream_id: usize,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        if remote_ufrag.len() < 4 || remote_ufrag.len() > 256 {
            return Err(Error::ErrRemoteUfragInvalid);
        }
        if remote_pwd.len() < 22 || remote_pwd.len() > 256 {
            return Err(Error::ErrRemotePwdInvalid);
        }

        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;
        self.streams[stream_index].remote_credentials =
            Some(Credentials::new(remote_ufrag, remote_pwd));
        Ok(())
    }

    /// Adds a new remote candidate learned from signalling.
    pub fn add_remote_candidate(&mut self, stream_id: usize, c: Candidate) -> Result<()> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;
        let component_id = c.component();

        let foundation = c.foundation();
        {
            let stream = &mut self.streams[stream_index];
            let component = stream
                .component_mut(component_id)
                .ok_or(Error::ErrUnknownComponent)?;
            if component.has_remote_equal(&c) {
                return Ok(());
            }
            component.remote_candidates.push(c);
        }

        self.events.push_back(Event::NewRemoteCandidate {
            stream_id,
            component_id,
            foundation,
        });
        self.form_pairs_for_component(stream_index, component_id);
        Ok(())
    }

    /// Replaces the remote candidate set of one component and re-forms its
    /// pairs. Passing the same list twice leaves the check list untouched.
    /// Returns the number of remote candidates in place afterwards.
    pub fn set_remote_candidates(
        &mut self,
        stream_id: usize,
        component_id: u16,
        candidates: Vec<Candidate>,
    ) -> Result<usize> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;

        let unchanged = {
            let stream = &self.streams[stream_index];
            let component = stream
                .component(component_id)
                .ok_or(Error::ErrUnknownComponent)?;
            component.remote_candidates.len() == candidates.len()
                && candidates.iter().all(|c| component.has_remote_equal(c))
        };
        if unchanged {
            return Ok(candidates.len());
        }

        {
            let stream = &mut self.streams[stream_index];
            let removed: Vec<u64> = stream
                .check_list
                .iter()
                .filter(|p| p.component_id == component_id)
                .map(|p| p.id)
                .collect();
            stream.check_list.retain(|p| p.component_id != component_id);
            stream.triggered_queue.retain(|id| !removed.contains(id));

            if let Some(component) = stream.component_mut(component_id) {
                component.remote_candidates.clear();
                if component
                    .selected_pair
                    .map(|id| removed.contains(&id))
                    .unwrap_or(false)
                {
                    log::warn!("selected pair dropped by remote candidate replacement");
                    component.selected_pair = None;
                    component.next_keepalive_at = None;
                }
                if component
                    .nominated_pair
                    .map(|id| removed.contains(&id))
                    .unwrap_or(false)
                {
                    component.nominated_pair = None;
                }
            }
        }

        let mut count = 0;
        for mut c in candidates {
            c.component = component_id;
            let foundation = c.foundation();
            let added = {
                let stream = &mut self.streams[stream_index];
                if let Some(component) = stream.component_mut(component_id) {
                    if component.has_remote_equal(&c) {
                        false
                    } else {
                        component.remote_candidates.push(c);
                        true
                    }
                } else {
                    false
                }
            };
            if added {
                count += 1;
                self.events.push_back(Event::NewRemoteCandidate {
                    stream_id,
                    component_id,
                    foundation,
                });
            }
        }

        self.form_pairs_for_component(stream_index, component_id);
        Ok(count)
    }

    /// Sends application data on the selected pair, falling back to the best
    /// pair that has not failed so media can start before nomination.
    pub fn send(&mut self, stream_id: usize, component_id: u16, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        if is_message(buf) {
            return Err(Error::ErrWriteStunMessage);
        }
        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;

        let pair_id = {
            let stream = &self.streams[stream_index];
            let component = stream
                .component(component_id)
                .ok_or(Error::ErrUnknownComponent)?;
            component
                .selected_pair
                .or_else(|| self.best_available_pair(stream_index, component_id))
        };
        let pair_id = pair_id.ok_or(Error::ErrNoCandidatePairs)?;
        let (local_addr, peer_addr) = self
            .pair_addrs(stream_index, pair_id)
            .ok_or(Error::ErrNoCandidatePairs)?;

        let now = self.last_now;
        self.queue_transmit(local_addr, peer_addr, buf, now);
        Ok(buf.len())
    }

    /// Pops the next application datagram received on a component.
    pub fn recv(&mut self, stream_id: usize, component_id: u16) -> Result<Option<BytesMut>> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;
        let component = self.streams[stream_index]
            .component_mut(component_id)
            .ok_or(Error::ErrUnknownComponent)?;
        Ok(component.inbound.pop_front())
    }

    /// Returns copies of the local candidates of one component.
    pub fn local_candidates(&self, stream_id: usize, component_id: u16) -> Result<Vec<Candidate>> {
        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;
        let component = self.streams[stream_index]
            .component(component_id)
            .ok_or(Error::ErrUnknownComponent)?;
        Ok(component.local_candidates.clone())
    }

    /// Returns copies of the remote candidates of one component.
    pub fn remote_candidates(&self, stream_id: usize, component_id: u16) -> Result<Vec<Candidate>> {
        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;
        let component = self.streams[stream_index]
            .component(component_id)
            .ok_or(Error::ErrUnknownComponent)?;
        Ok(component.remote_candidates.clone())
    }

    /// Returns the current state of one component.
    pub fn component_state(&self, stream_id: usize, component_id: u16) -> Result<ComponentState> {
        let stream_index = self
            .stream_index(stream_id)
            .ok_or(Error::ErrUnknownStream)?;
        let component = self.streams[stream_index]
            .component(component_id)
            .ok_or(Error::ErrUnknownComponent)?;
        Ok(component.state)
    }

    /// Returns copies of the selected pair's candidates, or `None` before
    /// nomination.
    pub fn selected_pair(
        &self,
        stream_id: usize,
        component_id: u16,
    ) -> Option<(Candidate, Candidate)> {
        let stream_index = self.stream_index(stream_id)?;
        let stream = &self.streams[stream_index];
        let component = stream.component(component_id)?;
        let pair_id = component.selected_pair?;
        let pair = &stream.check_list[stream.pair_index(pair_id)?];
        Some((
            component.local_candidates[pair.local_index].clone(),
            component.remote_candidates[pair.remote_index].clone(),
        ))
    }

    /// Counters for absorbed protocol failures.
    pub fn stats(&self) -> AgentStats {
        self.stats
    }

    /// Processes one inbound datagram from the embedder's receive loop.
    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        if msg.now > self.last_now {
            self.last_now = msg.now;
        }
        let now = msg.now;
        let local_addr = msg.transport.local_addr;
        let peer_addr = msg.transport.peer_addr;

        let Some((stream_index, component_id, local_index)) = self.route(local_addr) else {
            self.stats.unroutable_dropped += 1;
            log::warn!(
                "[{}]: discarded message, no local candidate for {}",
                self.get_name(),
                local_addr
            );
            return Ok(());
        };

        let buf = &msg.message;

        // The top two bits of an RTP message are the version number (2);
        // the top two bits of a STUN message are always 0.
        if !buf.is_empty() && (buf[0] & 0xC0) == 0x80 {
            self.deliver_application_data(stream_index, component_id, msg.message);
            return Ok(());
        }

        if is_message(buf) {
            let mut m = Message {
                raw: vec![],
                ..Message::default()
            };
            // Explicitly copy the raw buffer so the Message owns the memory.
            m.raw.extend_from_slice(buf);

            if let Err(err) = m.decode() {
                self.stats.malformed_stun_dropped += 1;
                log::warn!(
                    "[{}]: failed to decode STUN from {} to {}: {}",
                    self.get_name(),
                    peer_addr,
                    local_addr,
                    err
                );
                return Ok(());
            }

            if let Some(discovery_index) = self.find_discovery_by_transaction(m.transaction_id) {
                self.handle_discovery_response(discovery_index, &m, peer_addr);
                self.maybe_emit_gathering_done();
            } else {
                self.handle_inbound_stun(
                    stream_index,
                    component_id,
                    local_index,
                    &mut m,
                    peer_addr,
                    now,
                );
            }
            return Ok(());
        }

        // Neither RTP-like nor STUN; the caller decides what it is.
        self.deliver_application_data(stream_index, component_id, msg.message);
        Ok(())
    }

    /// Runs one pacing tick. Within a tick, in order: discovery retransmits,
    /// check retransmits, at most one new discovery, at most one new check,
    /// keepalives. Calls earlier than the next deadline are no-ops, which is
    /// what enforces Ta pacing.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        if now > self.last_now {
            self.last_now = now;
        }
        if let Some(next_tick_at) = self.next_tick_at {
            if now < next_tick_at {
                return;
            }
        }

        self.process_discovery_retransmits(now);
        self.process_check_retransmits(now);
        self.start_next_discovery(now);
        if !self.lite {
            self.contact(now);
        }
        self.process_keepalives(now);
        self.maybe_emit_gathering_done();

        self.next_tick_at = Some(now + self.ta_interval);
    }

    /// Returns the next instant `handle_timeout` wants to run, or `None`
    /// when the agent is idle.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }

        let mut deadline: Option<Instant> = None;
        let mut merge = |t: Instant| {
            deadline = Some(match deadline {
                Some(d) if d <= t => d,
                _ => t,
            });
        };

        if self.has_pending_work() {
            merge(self.next_tick_at.unwrap_or(self.last_now));
        }

        for stream in &self.streams {
            for component in &stream.components {
                if let Some(t) = component.next_keepalive_at {
                    merge(t);
                }
            }
        }

        deadline
    }

    /// Pops the next datagram to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.transmits.pop_front()
    }

    /// Pops the next observable event.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Cleans up the Agent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        self.closed = true;
        self.streams.clear();
        self.discoveries.clear();
        self.events.clear();
        self.transmits.clear();
        log::debug!("[{}]: closed", self.get_name());
        Ok(())
    }

    pub(crate) fn get_name(&self) -> &'static str {
        if self.is_controlling {
            "controlling"
        } else {
            "controlled"
        }
    }

    pub(crate) fn stream_index(&self, stream_id: usize) -> Option<usize> {
        self.streams.iter().position(|s| s.id == stream_id)
    }

    fn route(&self, local_addr: SocketAddr) -> Option<(usize, u16, usize)> {
        for (stream_index, stream) in self.streams.iter().enumerate() {
            for component in &stream.components {
                if let Some(local_index) = component.find_local(local_addr) {
                    return Some((stream_index, component.id, local_index));
                }
            }
        }
        None
    }

    fn deliver_application_data(
        &mut self,
        stream_index: usize,
        component_id: u16,
        data: BytesMut,
    ) {
        if let Some(component) = self.streams[stream_index].component_mut(component_id) {
            if component.inbound.len() >= MAX_INBOUND_QUEUE {
                component.inbound.pop_front();
                log::warn!("inbound queue full, dropping the oldest datagram");
            }
            component.inbound.push_back(data);
        }
    }

    pub(crate) fn queue_transmit(
        &mut self,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        raw: &[u8],
        now: Instant,
    ) {
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr,
                peer_addr,
                protocol: TransportProtocol::UDP,
            },
            message: BytesMut::from(raw),
        });
    }

    pub(crate) fn update_component_state(
        &mut self,
        stream_index: usize,
        component_id: u16,
        state: ComponentState,
    ) {
        let stream_id = self.streams[stream_index].id;
        let changed = {
            if let Some(component) = self.streams[stream_index].component_mut(component_id) {
                if component.state.can_transition(state) {
                    log::info!(
                        "[{}]: component {}/{} state {} -> {}",
                        if self.is_controlling {
                            "controlling"
                        } else {
                            "controlled"
                        },
                        stream_id,
                        component_id,
                        component.state,
                        state
                    );
                    component.state = state;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if changed {
            self.events.push_back(Event::ComponentStateChanged {
                stream_id,
                component_id,
                state,
            });
        }
    }

    pub(crate) fn pair_addrs(
        &self,
        stream_index: usize,
        pair_id: u64,
    ) -> Option<(SocketAddr, SocketAddr)> {
        let stream = &self.streams[stream_index];
        let pair = &stream.check_list[stream.pair_index(pair_id)?];
        let component = stream.component(pair.component_id)?;
        Some((
            component.local_candidates[pair.local_index].base_addr(),
            component.remote_candidates[pair.remote_index].addr(),
        ))
    }

    fn has_pending_work(&self) -> bool {
        use agent_gather::DiscoveryState;

        if self
            .discoveries
            .iter()
            .any(|d| matches!(d.state, DiscoveryState::Pending | DiscoveryState::InProgress))
        {
            return true;
        }

        self.streams.iter().any(|stream| {
            stream.remote_credentials.is_some()
                && (!stream.triggered_queue.is_empty()
                    || stream.check_list.iter().any(|p| {
                        matches!(
                            p.state,
                            CandidatePairState::Waiting | CandidatePairState::InProgress
                        ) || p.transaction.is_some()
                    })
                    || stream.components.iter().any(|c| {
                        c.selected_pair.is_none()
                            && (c.nominated_pair.is_some()
                                || (self.is_controlling
                                    && stream
                                        .check_list
                                        .iter()
                                        .any(|p| p.valid && p.component_id == c.id)))
                    }))
        })
    }
}
