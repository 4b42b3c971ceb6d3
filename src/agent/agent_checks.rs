use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use stun::agent::TransactionId;
use stun::attributes::{ATTR_USERNAME, ATTR_USE_CANDIDATE};
use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;

use super::agent_gather::DiscoveryState;
use super::*;
use crate::attributes::control::{AttrControlled, AttrControlling};
use crate::attributes::priority::PriorityAttr;
use crate::attributes::use_candidate::UseCandidateAttr;
use crate::candidate::candidate_pair::{CandidatePair, CandidatePairState, PairTransaction};
use crate::candidate::{CandidateConfig, CandidatePeerReflexiveConfig};
use crate::state::ComponentState;

impl Agent {
    /// Re-forms the pair cross product of one component after either
    /// candidate set changed, then prunes, sorts and re-applies foundation
    /// grouping to the stream's check list.
    pub(crate) fn form_pairs_for_component(&mut self, stream_index: usize, component_id: u16) {
        let controlling = self.is_controlling;
        let (n_local, n_remote) = {
            let Some(component) = self.streams[stream_index].component(component_id) else {
                return;
            };
            (
                component.local_candidates.len(),
                component.remote_candidates.len(),
            )
        };

        for local_index in 0..n_local {
            for remote_index in 0..n_remote {
                let (local_priority, remote_priority, compatible) = {
                    let stream = &self.streams[stream_index];
                    let component = match stream.component(component_id) {
                        Some(component) => component,
                        None => return,
                    };
                    let local = &component.local_candidates[local_index];
                    let remote = &component.remote_candidates[remote_index];
                    (
                        local.priority(),
                        remote.priority(),
                        local.addr().is_ipv4() == remote.addr().is_ipv4(),
                    )
                };
                if !compatible {
                    continue;
                }
                if self.streams[stream_index]
                    .find_pair(component_id, local_index, remote_index)
                    .is_some()
                {
                    continue;
                }

                let id = self.next_pair_id;
                self.next_pair_id += 1;
                self.streams[stream_index].check_list.push(CandidatePair::new(
                    id,
                    component_id,
                    local_index,
                    remote_index,
                    local_priority,
                    remote_priority,
                    controlling,
                ));
            }
        }

        self.prune_check_list(stream_index);
        self.sort_check_list(stream_index);
        self.truncate_check_list(stream_index);
        self.regroup_check_list(stream_index);
    }

    /// Drops redundant pairs: for one remote candidate and one local base
    /// only the best pair survives (RFC 5245 §5.7.3), then enforces the
    /// check-list ceiling.
    fn prune_check_list(&mut self, stream_index: usize) {
        let survivors: HashSet<u64> = {
            let stream = &self.streams[stream_index];

            // keep the best pair per (component, remote, local base)
            let mut best: HashMap<(u16, usize, SocketAddr), (u64, (bool, u8, u64))> =
                HashMap::new();
            for pair in &stream.check_list {
                let Some(component) = stream.component(pair.component_id) else {
                    continue;
                };
                let base = component.local_candidates[pair.local_index].base_addr();
                let rank = (
                    pair.nominated,
                    match pair.state {
                        CandidatePairState::Succeeded => 3,
                        CandidatePairState::InProgress => 2,
                        CandidatePairState::Waiting => 1,
                        CandidatePairState::Frozen | CandidatePairState::Failed => 0,
                    },
                    pair.priority(),
                );
                let key = (pair.component_id, pair.remote_index, base);
                match best.get(&key) {
                    Some((_, existing)) if *existing >= rank => {}
                    _ => {
                        best.insert(key, (pair.id, rank));
                    }
                }
            }
            best.values().map(|(id, _)| *id).collect()
        };

        let stream = &mut self.streams[stream_index];
        stream.check_list.retain(|p| survivors.contains(&p.id));
        stream.triggered_queue.retain(|id| survivors.contains(id));
    }

    /// Enforces the per-stream pair ceiling; lowest-priority pairs go first.
    /// Must run on a sorted check list.
    fn truncate_check_list(&mut self, stream_index: usize) {
        let max = self.max_check_list_size;
        let stream = &mut self.streams[stream_index];
        if stream.check_list.len() > max {
            let dropped: Vec<u64> = stream.check_list[max..].iter().map(|p| p.id).collect();
            log::warn!("check list truncated, dropping {} pair(s)", dropped.len());
            stream.check_list.truncate(max);
            stream.triggered_queue.retain(|id| !dropped.contains(id));
        }
    }

    pub(crate) fn sort_check_list(&mut self, stream_index: usize) {
        self.streams[stream_index]
            .check_list
            .sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.id.cmp(&b.id)));
    }

    /// Foundation grouping: per distinct pair foundation at most one pair
    /// sits in Waiting; the rest stay Frozen until a sibling succeeds.
    fn regroup_check_list(&mut self, stream_index: usize) {
        let plan: Vec<u64> = {
            let stream = &self.streams[stream_index];
            let mut active: HashSet<String> = HashSet::new();
            for pair in &stream.check_list {
                if matches!(
                    pair.state,
                    CandidatePairState::Waiting | CandidatePairState::InProgress
                ) {
                    active.insert(stream.pair_foundation(pair));
                }
            }

            let mut promote = vec![];
            for pair in &stream.check_list {
                if pair.state != CandidatePairState::Frozen {
                    continue;
                }
                let foundation = stream.pair_foundation(pair);
                if active.contains(&foundation) {
                    continue;
                }
                active.insert(foundation);
                promote.push(pair.id);
            }
            promote
        };

        let stream = &mut self.streams[stream_index];
        for pair in &mut stream.check_list {
            if plan.contains(&pair.id) {
                pair.state = CandidatePairState::Waiting;
            }
        }
    }

    /// Sends one connectivity check on a pair. Returns false when nothing
    /// was sent (missing credentials or a transaction already in flight).
    pub(crate) fn send_check(
        &mut self,
        stream_index: usize,
        pair_id: u64,
        use_candidate: bool,
        now: Instant,
    ) -> bool {
        let Some(pair_index) = self.streams[stream_index].pair_index(pair_id) else {
            return false;
        };

        let (local_ufrag, remote_ufrag, remote_pwd) = {
            let stream = &self.streams[stream_index];
            let Some(remote) = &stream.remote_credentials else {
                return false;
            };
            (
                stream.local_credentials.ufrag.clone(),
                remote.ufrag.clone(),
                remote.pwd.clone(),
            )
        };

        let (component_id, local_base, local_priority, remote_addr) = {
            let stream = &self.streams[stream_index];
            let pair = &stream.check_list[pair_index];
            if pair.transaction.is_some() {
                return false;
            }
            let Some(component) = stream.component(pair.component_id) else {
                return false;
            };
            (
                pair.component_id,
                component.local_candidates[pair.local_index].base_addr(),
                component.local_candidates[pair.local_index].priority(),
                component.remote_candidates[pair.remote_index].addr(),
            )
        };

        let username = format!("{remote_ufrag}:{local_ufrag}");
        let transaction_id = TransactionId::new();

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(BINDING_REQUEST),
            Box::new(transaction_id),
            Box::new(Username::new(ATTR_USERNAME, username)),
        ];
        if use_candidate {
            setters.push(Box::new(UseCandidateAttr::new()));
        }
        if self.is_controlling {
            setters.push(Box::new(AttrControlling(self.tie_breaker)));
        } else {
            setters.push(Box::new(AttrControlled(self.tie_breaker)));
        }
        setters.push(Box::new(PriorityAttr(local_priority)));
        setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
            remote_pwd,
        )));
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        if let Err(err) = msg.build(&setters) {
            log::error!("{err}");
            return false;
        }

        {
            let pair = &mut self.streams[stream_index].check_list[pair_index];
            if pair.state != CandidatePairState::Succeeded {
                pair.state = CandidatePairState::InProgress;
            }
            pair.binding_request_count += 1;
            pair.transaction = Some(PairTransaction {
                transaction_id,
                destination: remote_addr,
                is_use_candidate: use_candidate,
                controlling_at_send: self.is_controlling,
                raw: msg.raw.clone(),
                attempts: 1,
                next_rto_at: now + self.rto_initial,
            });
        }

        log::trace!(
            "[{}]: ping STUN from {} to {} (useCandidate: {})",
            self.get_name(),
            local_base,
            remote_addr,
            use_candidate
        );
        self.update_component_state(stream_index, component_id, ComponentState::Connecting);
        self.queue_transmit(local_base, remote_addr, &msg.raw, now);
        true
    }

    /// Retransmits outstanding checks per the RFC 5389 backoff; a pair whose
    /// transaction exhausts its retries fails.
    pub(crate) fn process_check_retransmits(&mut self, now: Instant) {
        enum Action {
            Resend {
                local_addr: SocketAddr,
                peer_addr: SocketAddr,
                raw: Vec<u8>,
            },
            Fail {
                pair_id: u64,
            },
        }

        let rto = self.rto_initial;
        let max_requests = self.max_binding_requests;

        for stream_index in 0..self.streams.len() {
            let mut actions = vec![];
            {
                let stream = &mut self.streams[stream_index];
                for pair_index in 0..stream.check_list.len() {
                    let component_id = stream.check_list[pair_index].component_id;
                    let local_index = stream.check_list[pair_index].local_index;
                    let local_base = stream
                        .component(component_id)
                        .map(|c| c.local_candidates[local_index].base_addr());

                    let pair = &mut stream.check_list[pair_index];
                    let due = pair
                        .transaction
                        .as_ref()
                        .map(|t| t.next_rto_at <= now)
                        .unwrap_or(false);
                    if !due {
                        continue;
                    }

                    let Some(transaction) = pair.transaction.as_mut() else {
                        continue;
                    };
                    if transaction.attempts >= max_requests {
                        actions.push(Action::Fail { pair_id: pair.id });
                    } else {
                        transaction.attempts += 1;
                        let delay = if transaction.attempts >= max_requests {
                            rto * FINAL_RTO_MULTIPLIER
                        } else {
                            rto * (1u32 << (transaction.attempts - 1))
                        };
                        transaction.next_rto_at = now + delay;
                        if let Some(local_addr) = local_base {
                            actions.push(Action::Resend {
                                local_addr,
                                peer_addr: transaction.destination,
                                raw: transaction.raw.clone(),
                            });
                        }
                    }
                }
            }

            for action in actions {
                match action {
                    Action::Resend {
                        local_addr,
                        peer_addr,
                        raw,
                    } => self.queue_transmit(local_addr, peer_addr, &raw, now),
                    Action::Fail { pair_id } => {
                        log::debug!(
                            "[{}]: max requests reached for pair {}, marking it as failed",
                            self.get_name(),
                            pair_id
                        );
                        self.fail_pair(stream_index, pair_id, now);
                    }
                }
            }
        }
    }

    /// Demultiplexes one decoded STUN message that did not match a discovery
    /// transaction.
    pub(crate) fn handle_inbound_stun(
        &mut self,
        stream_index: usize,
        component_id: u16,
        local_index: usize,
        m: &mut Message,
        peer_addr: SocketAddr,
        now: Instant,
    ) {
        if m.typ.method != METHOD_BINDING {
            log::trace!(
                "[{}]: unhandled STUN from {} class({}) method({})",
                self.get_name(),
                peer_addr,
                m.typ.class,
                m.typ.method
            );
            return;
        }

        if m.typ.class == CLASS_REQUEST {
            self.handle_binding_request(stream_index, component_id, local_index, m, peer_addr, now);
        } else if m.typ.class == CLASS_SUCCESS_RESPONSE || m.typ.class == CLASS_ERROR_RESPONSE {
            self.handle_binding_response(stream_index, m, peer_addr, now);
        } else if m.typ.class == CLASS_INDICATION {
            // keepalive; no response and no state change
            log::trace!(
                "[{}]: binding indication from {}",
                self.get_name(),
                peer_addr
            );
        }
    }

    /// Processes an inbound Binding request: credential checks, role
    /// conflict repair, peer-reflexive learning, the success response and
    /// the triggered check.
    fn handle_binding_request(
        &mut self,
        stream_index: usize,
        component_id: u16,
        local_index: usize,
        m: &mut Message,
        peer_addr: SocketAddr,
        now: Instant,
    ) {
        let stream_id = self.streams[stream_index].id;
        let (local_ufrag, local_pwd, remote_ufrag) = {
            let stream = &self.streams[stream_index];
            (
                stream.local_credentials.ufrag.clone(),
                stream.local_credentials.pwd.clone(),
                stream.remote_credentials.as_ref().map(|c| c.ufrag.clone()),
            )
        };

        let mut username = Username::new(ATTR_USERNAME, String::new());
        if username.get_from(m).is_err() {
            self.stats.username_check_failures += 1;
            log::warn!(
                "[{}]: discard request from {}, no USERNAME",
                self.get_name(),
                peer_addr
            );
            return;
        }
        let username = username.to_string();
        let username_ok = match &remote_ufrag {
            Some(remote_ufrag) => username == format!("{local_ufrag}:{remote_ufrag}"),
            // remote credentials not signalled yet; the local half is all we
            // can hold the peer to
            None => username.starts_with(&format!("{local_ufrag}:")),
        };
        if !username_ok {
            self.stats.username_check_failures += 1;
            log::warn!(
                "[{}]: discard request from {}, {:?} ({})",
                self.get_name(),
                peer_addr,
                Error::ErrMismatchUsername,
                username
            );
            return;
        }

        let integrity = MessageIntegrity(local_pwd.as_bytes().to_vec());
        if let Err(err) = integrity.check(m) {
            self.stats.integrity_check_failures += 1;
            log::warn!(
                "[{}]: discard request from {}, {}",
                self.get_name(),
                peer_addr,
                err
            );
            return;
        }

        // RFC 8445 §7.3.1.1, role conflict repair
        let mut controlling_attr = AttrControlling::default();
        let mut controlled_attr = AttrControlled::default();
        if self.is_controlling && controlling_attr.get_from(m).is_ok() {
            self.stats.role_conflicts += 1;
            if self.tie_breaker >= controlling_attr.0 {
                self.send_role_conflict(stream_index, component_id, local_index, m, peer_addr, now);
                return;
            }
            self.switch_role();
        } else if !self.is_controlling && controlled_attr.get_from(m).is_ok() {
            self.stats.role_conflicts += 1;
            if self.tie_breaker >= controlled_attr.0 {
                self.switch_role();
            } else {
                self.send_role_conflict(stream_index, component_id, local_index, m, peer_addr, now);
                return;
            }
        }

        let mut priority_attr = PriorityAttr::default();
        let has_priority = priority_attr.get_from(m).is_ok();

        let remote_index = {
            let stream = &self.streams[stream_index];
            stream
                .component(component_id)
                .and_then(|c| c.find_remote(peer_addr))
        };
        let remote_index = match remote_index {
            Some(remote_index) => remote_index,
            None => {
                if !has_priority {
                    self.stats.malformed_stun_dropped += 1;
                    log::warn!(
                        "[{}]: request from unknown source {} without PRIORITY",
                        self.get_name(),
                        peer_addr
                    );
                    return;
                }

                let config = CandidatePeerReflexiveConfig {
                    base_config: CandidateConfig {
                        address: peer_addr.ip().to_string(),
                        port: peer_addr.port(),
                        component: component_id,
                        priority: priority_attr.0,
                        ..CandidateConfig::default()
                    },
                    rel_addr: String::new(),
                    rel_port: 0,
                };
                let candidate = match config.new_candidate_peer_reflexive() {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        log::error!(
                            "[{}]: failed to create new remote prflx candidate ({})",
                            self.get_name(),
                            err
                        );
                        return;
                    }
                };

                log::debug!(
                    "[{}]: adding a new peer-reflexive candidate: {}",
                    self.get_name(),
                    peer_addr
                );
                let foundation = candidate.foundation();
                let remote_index = {
                    let stream = &mut self.streams[stream_index];
                    let Some(component) = stream.component_mut(component_id) else {
                        return;
                    };
                    component.remote_candidates.push(candidate);
                    component.remote_candidates.len() - 1
                };
                self.events.push_back(Event::NewRemoteCandidate {
                    stream_id,
                    component_id,
                    foundation,
                });
                self.form_pairs_for_component(stream_index, component_id);
                remote_index
            }
        };

        if !self.streams[stream_index].initial_binding_request_received {
            self.streams[stream_index].initial_binding_request_received = true;
            self.events
                .push_back(Event::InitialBindingRequestReceived { stream_id });
        }

        log::trace!(
            "[{}]: inbound STUN (Request) from {}",
            self.get_name(),
            peer_addr
        );
        self.send_binding_success(stream_index, component_id, local_index, m, peer_addr, now);

        if self.streams[stream_index]
            .find_pair(component_id, local_index, remote_index)
            .is_none()
        {
            self.form_pairs_for_component(stream_index, component_id);
        }
        let Some(pair_index) =
            self.streams[stream_index].find_pair(component_id, local_index, remote_index)
        else {
            return;
        };
        let pair_id = self.streams[stream_index].check_list[pair_index].id;

        let use_candidate = m.contains(ATTR_USE_CANDIDATE);
        if use_candidate && !self.is_controlling {
            // https://tools.ietf.org/html/rfc8445#section-7.3.1.5
            let succeeded = self.streams[stream_index].check_list[pair_index].state
                == CandidatePairState::Succeeded;
            if succeeded || self.lite {
                if self.lite {
                    // a lite agent never checks; the peer's check validated
                    // the path
                    let pair = &mut self.streams[stream_index].check_list[pair_index];
                    pair.state = CandidatePairState::Succeeded;
                    pair.valid = true;
                    if pair.valid_since.is_none() {
                        pair.valid_since = Some(now);
                    }
                }
                self.install_selected_pair(stream_index, pair_id, now);
            } else {
                self.streams[stream_index].check_list[pair_index].use_candidate_pending = true;
            }
        }

        if self.lite {
            return;
        }

        // triggered check (RFC 8445 §7.3.1.4)
        let state = self.streams[stream_index].check_list[pair_index].state;
        if matches!(
            state,
            CandidatePairState::Frozen | CandidatePairState::Waiting
        ) {
            let stream = &mut self.streams[stream_index];
            stream.check_list[pair_index].state = CandidatePairState::Waiting;
            stream.triggered_queue.retain(|id| *id != pair_id);
            stream.triggered_queue.push_front(pair_id);
        }
    }

    /// Processes a Binding response to one of our own checks.
    fn handle_binding_response(
        &mut self,
        stream_index: usize,
        m: &mut Message,
        peer_addr: SocketAddr,
        now: Instant,
    ) {
        let found = self.streams[stream_index].check_list.iter().position(|p| {
            p.transaction
                .as_ref()
                .map(|t| t.transaction_id == m.transaction_id)
                .unwrap_or(false)
        });
        let Some(pair_index) = found else {
            log::warn!(
                "[{}]: discard message from {}, unknown TransactionID 0x{:?}",
                self.get_name(),
                peer_addr,
                m.transaction_id
            );
            return;
        };

        let (pair_id, component_id, transaction) = {
            let pair = &self.streams[stream_index].check_list[pair_index];
            let Some(transaction) = pair.transaction.clone() else {
                return;
            };
            (pair.id, pair.component_id, transaction)
        };

        // Assert that NAT is not symmetric
        // https://tools.ietf.org/html/rfc8445#section-7.2.5.2.1
        if transaction.destination != peer_addr {
            log::debug!(
                "discard message: transaction source and destination does not match expected({}), actual({})",
                transaction.destination,
                peer_addr
            );
            return;
        }

        let remote_pwd = {
            let stream = &self.streams[stream_index];
            match &stream.remote_credentials {
                Some(credentials) => credentials.pwd.clone(),
                None => {
                    log::warn!(
                        "[{}]: discard response from {}, no remote credentials",
                        self.get_name(),
                        peer_addr
                    );
                    return;
                }
            }
        };
        let integrity = MessageIntegrity(remote_pwd.as_bytes().to_vec());
        if let Err(err) = integrity.check(m) {
            self.stats.integrity_check_failures += 1;
            log::warn!(
                "[{}]: discard response from {}, {}",
                self.get_name(),
                peer_addr,
                err
            );
            return;
        }

        self.streams[stream_index].check_list[pair_index].transaction = None;

        if m.typ.class == CLASS_ERROR_RESPONSE {
            let mut code = ErrorCodeAttribute::default();
            if code.get_from(m).is_ok() && code.code == CODE_ROLE_CONFLICT {
                self.stats.role_conflicts += 1;
                log::debug!(
                    "[{}]: role conflict response from {}",
                    self.get_name(),
                    peer_addr
                );
                // Only flip if our role has not changed since the check was
                // sent (RFC 8445 §7.2.5.1).
                if self.is_controlling == transaction.controlling_at_send {
                    self.switch_role();
                }
                if let Some(pair_index) = self.streams[stream_index].pair_index(pair_id) {
                    let pair = &mut self.streams[stream_index].check_list[pair_index];
                    pair.state = CandidatePairState::Waiting;
                    pair.valid = false;
                    pair.valid_since = None;
                }
            } else {
                self.fail_pair(stream_index, pair_id, now);
            }
            return;
        }

        // success response
        let mut xor_addr = XorMappedAddress::default();
        if let Err(err) = xor_addr.get_from(m) {
            log::warn!(
                "[{}]: {:?} from {}: {}",
                self.get_name(),
                Error::ErrGetXorMappedAddrResponse,
                peer_addr,
                err
            );
            self.fail_pair(stream_index, pair_id, now);
            return;
        }
        let mapped = SocketAddr::new(xor_addr.ip, xor_addr.port);

        let mapped_known = {
            let stream = &self.streams[stream_index];
            stream
                .component(component_id)
                .map(|c| c.local_candidates.iter().any(|l| l.addr() == mapped))
                .unwrap_or(false)
        };
        if !mapped_known {
            // the peer saw us from an address we did not know about yet
            let (base_addr, priority) = {
                let stream = &self.streams[stream_index];
                let pair = &stream.check_list[pair_index];
                let Some(component) = stream.component(component_id) else {
                    return;
                };
                (
                    component.local_candidates[pair.local_index].base_addr(),
                    pair.local_priority,
                )
            };

            let config = CandidatePeerReflexiveConfig {
                base_config: CandidateConfig {
                    address: mapped.ip().to_string(),
                    port: mapped.port(),
                    component: component_id,
                    priority,
                    ..CandidateConfig::default()
                },
                rel_addr: base_addr.ip().to_string(),
                rel_port: base_addr.port(),
            };
            match config.new_candidate_peer_reflexive() {
                Ok(candidate) => {
                    let stream_id = self.streams[stream_index].id;
                    let foundation = candidate.foundation();
                    let new_index = {
                        let stream = &mut self.streams[stream_index];
                        let Some(component) = stream.component_mut(component_id) else {
                            return;
                        };
                        component.local_candidates.push(candidate);
                        component.local_candidates.len() - 1
                    };
                    log::debug!(
                        "[{}]: discovered peer-reflexive local candidate {}",
                        self.get_name(),
                        mapped
                    );
                    self.events.push_back(Event::NewCandidate {
                        stream_id,
                        component_id,
                        foundation,
                    });
                    self.streams[stream_index].check_list[pair_index].local_index = new_index;
                }
                Err(err) => {
                    log::error!(
                        "[{}]: failed to create local prflx candidate ({})",
                        self.get_name(),
                        err
                    );
                }
            }
        }

        let use_candidate_pending = {
            let pair = &mut self.streams[stream_index].check_list[pair_index];
            pair.state = CandidatePairState::Succeeded;
            pair.valid = true;
            if pair.valid_since.is_none() {
                pair.valid_since = Some(now);
            }
            let pending = pair.use_candidate_pending;
            pair.use_candidate_pending = false;
            pending
        };
        log::trace!(
            "[{}]: found valid candidate pair (mapped {})",
            self.get_name(),
            mapped
        );

        self.unfreeze_same_foundation(stream_index, pair_id);
        self.update_component_state(stream_index, component_id, ComponentState::Connected);

        if (transaction.is_use_candidate && self.is_controlling)
            || (use_candidate_pending && !self.is_controlling)
        {
            self.install_selected_pair(stream_index, pair_id, now);
        }
    }

    fn send_binding_success(
        &mut self,
        stream_index: usize,
        component_id: u16,
        local_index: usize,
        m: &Message,
        peer_addr: SocketAddr,
        now: Instant,
    ) {
        let local_pwd = self.streams[stream_index].local_credentials.pwd.clone();
        let local_base = {
            let stream = &self.streams[stream_index];
            let Some(component) = stream.component(component_id) else {
                return;
            };
            component.local_candidates[local_index].base_addr()
        };

        let mut out = Message::new();
        let result = out.build(&[
            Box::new(m.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: peer_addr.ip(),
                port: peer_addr.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(local_pwd)),
            Box::new(FINGERPRINT),
        ]);

        if let Err(err) = result {
            log::warn!(
                "[{}]: failed to build success response for {}: {}",
                self.get_name(),
                peer_addr,
                err
            );
        } else {
            self.queue_transmit(local_base, peer_addr, &out.raw, now);
        }
    }

    fn send_role_conflict(
        &mut self,
        stream_index: usize,
        component_id: u16,
        local_index: usize,
        m: &Message,
        peer_addr: SocketAddr,
        now: Instant,
    ) {
        let local_pwd = self.streams[stream_index].local_credentials.pwd.clone();
        let local_base = {
            let stream = &self.streams[stream_index];
            let Some(component) = stream.component(component_id) else {
                return;
            };
            component.local_candidates[local_index].base_addr()
        };

        let mut out = Message::new();
        let result = out.build(&[
            Box::new(m.clone()),
            Box::new(BINDING_ERROR),
            Box::new(ErrorCodeAttribute {
                code: CODE_ROLE_CONFLICT,
                reason: vec![],
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(local_pwd)),
            Box::new(FINGERPRINT),
        ]);

        if let Err(err) = result {
            log::warn!(
                "[{}]: failed to build role conflict response for {}: {}",
                self.get_name(),
                peer_addr,
                err
            );
        } else {
            log::debug!(
                "[{}]: role conflict, answering 487 to {}",
                self.get_name(),
                peer_addr
            );
            self.queue_transmit(local_base, peer_addr, &out.raw, now);
        }
    }

    /// Flips the agent's role after a lost conflict. Pair priorities change
    /// with the role, so check lists are re-sorted and already-decided pairs
    /// outside Ready components go back to Waiting.
    pub(crate) fn switch_role(&mut self) {
        self.is_controlling = !self.is_controlling;
        log::info!(
            "[{}]: switched role after conflict (tie-breaker {})",
            self.get_name(),
            self.tie_breaker
        );

        let controlling = self.is_controlling;
        for stream_index in 0..self.streams.len() {
            let ready_components: Vec<u16> = self.streams[stream_index]
                .components
                .iter()
                .filter(|c| c.state == ComponentState::Ready)
                .map(|c| c.id)
                .collect();

            for pair in &mut self.streams[stream_index].check_list {
                pair.ice_role_controlling = controlling;
                if ready_components.contains(&pair.component_id) || pair.nominated {
                    continue;
                }
                if matches!(
                    pair.state,
                    CandidatePairState::Succeeded | CandidatePairState::Failed
                ) {
                    pair.state = CandidatePairState::Waiting;
                    pair.valid = false;
                    pair.valid_since = None;
                }
            }
            for component in &mut self.streams[stream_index].components {
                if component.state != ComponentState::Ready {
                    component.nominated_pair = None;
                }
            }
            self.sort_check_list(stream_index);
        }
    }

    /// Installs the nominated pair as the component's selected pair and
    /// moves the component to Ready. The pair event fires first.
    pub(crate) fn install_selected_pair(
        &mut self,
        stream_index: usize,
        pair_id: u64,
        now: Instant,
    ) {
        let stream_id = self.streams[stream_index].id;
        let Some(pair_index) = self.streams[stream_index].pair_index(pair_id) else {
            return;
        };

        let (component_id, already_selected) = {
            let stream = &mut self.streams[stream_index];
            let pair = &mut stream.check_list[pair_index];
            pair.nominated = true;
            let component_id = pair.component_id;
            let Some(component) = stream.component_mut(component_id) else {
                return;
            };
            let already = component.selected_pair == Some(pair_id);
            if !already {
                component.selected_pair = Some(pair_id);
                component.nominated_pair = None;
                component.next_keepalive_at = Some(now + self.keepalive_interval);
            }
            (component_id, already)
        };
        if already_selected {
            return;
        }

        let (local_foundation, remote_foundation) = {
            let stream = &self.streams[stream_index];
            let pair = &stream.check_list[pair_index];
            let Some(component) = stream.component(component_id) else {
                return;
            };
            (
                component.local_candidates[pair.local_index].foundation(),
                component.remote_candidates[pair.remote_index].foundation(),
            )
        };

        log::info!(
            "[{}]: selected candidate pair installed for {}/{}",
            self.get_name(),
            stream_id,
            component_id
        );
        self.events.push_back(Event::NewSelectedPair {
            stream_id,
            component_id,
            local_foundation,
            remote_foundation,
        });
        self.update_component_state(stream_index, component_id, ComponentState::Ready);
    }

    /// Moves Frozen pairs sharing the succeeded pair's foundation to
    /// Waiting.
    fn unfreeze_same_foundation(&mut self, stream_index: usize, pair_id: u64) {
        let plan: Vec<u64> = {
            let stream = &self.streams[stream_index];
            let Some(pair_index) = stream.pair_index(pair_id) else {
                return;
            };
            let foundation = stream.pair_foundation(&stream.check_list[pair_index]);
            stream
                .check_list
                .iter()
                .filter(|p| {
                    p.id != pair_id
                        && p.state == CandidatePairState::Frozen
                        && stream.pair_foundation(p) == foundation
                })
                .map(|p| p.id)
                .collect()
        };

        let stream = &mut self.streams[stream_index];
        for pair in &mut stream.check_list {
            if plan.contains(&pair.id) {
                pair.state = CandidatePairState::Waiting;
            }
        }
    }

    /// Fails one pair and, when it was the component's last hope and no
    /// discovery is pending, the component with it.
    pub(crate) fn fail_pair(&mut self, stream_index: usize, pair_id: u64, _now: Instant) {
        let stream_id = self.streams[stream_index].id;
        let Some(pair_index) = self.streams[stream_index].pair_index(pair_id) else {
            return;
        };

        let component_id = {
            let stream = &mut self.streams[stream_index];
            let pair = &mut stream.check_list[pair_index];
            pair.state = CandidatePairState::Failed;
            pair.transaction = None;
            pair.valid = false;
            pair.use_candidate_pending = false;
            let component_id = pair.component_id;
            stream.triggered_queue.retain(|id| *id != pair_id);
            component_id
        };

        {
            let stream = &mut self.streams[stream_index];
            if let Some(component) = stream.component_mut(component_id) {
                if component.nominated_pair == Some(pair_id) {
                    component.nominated_pair = None;
                }
                if component.selected_pair == Some(pair_id) {
                    log::warn!(
                        "[{}]: selected pair for {}/{} failed",
                        if self.is_controlling {
                            "controlling"
                        } else {
                            "controlled"
                        },
                        stream_id,
                        component_id
                    );
                    component.selected_pair = None;
                    component.next_keepalive_at = None;
                }
            }
        }

        let all_failed = {
            let stream = &self.streams[stream_index];
            let mut pairs = stream
                .check_list
                .iter()
                .filter(|p| p.component_id == component_id)
                .peekable();
            pairs.peek().is_some()
                && stream
                    .check_list
                    .iter()
                    .filter(|p| p.component_id == component_id)
                    .all(|p| p.state == CandidatePairState::Failed)
        };
        let discovery_pending = self.discoveries.iter().any(|d| {
            d.stream_id == stream_id
                && d.component_id == component_id
                && matches!(
                    d.state,
                    DiscoveryState::Pending | DiscoveryState::InProgress
                )
        });

        if all_failed && !discovery_pending {
            self.update_component_state(stream_index, component_id, ComponentState::Failed);
        }
    }

    /// Sends a Binding indication on each Ready component's selected pair
    /// every keepalive interval to hold NAT bindings open.
    pub(crate) fn process_keepalives(&mut self, now: Instant) {
        let mut due = vec![];
        for (stream_index, stream) in self.streams.iter().enumerate() {
            for component in &stream.components {
                if let (Some(pair_id), Some(at)) =
                    (component.selected_pair, component.next_keepalive_at)
                {
                    if at <= now {
                        due.push((stream_index, component.id, pair_id));
                    }
                }
            }
        }

        for (stream_index, component_id, pair_id) in due {
            let Some((local_addr, peer_addr)) = self.pair_addrs(stream_index, pair_id) else {
                continue;
            };

            let mut msg = Message::new();
            if let Err(err) = msg.build(&[
                Box::new(MessageType::new(METHOD_BINDING, CLASS_INDICATION)),
                Box::new(TransactionId::new()),
                Box::new(FINGERPRINT),
            ]) {
                log::error!("{err}");
                continue;
            }

            log::trace!(
                "[{}]: keepalive on {}/{} ({} -> {})",
                self.get_name(),
                self.streams[stream_index].id,
                component_id,
                local_addr,
                peer_addr
            );
            self.queue_transmit(local_addr, peer_addr, &msg.raw, now);
            if let Some(component) = self.streams[stream_index].component_mut(component_id) {
                component.next_keepalive_at = Some(now + self.keepalive_interval);
            }
        }
    }
}
