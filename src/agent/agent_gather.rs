use std::net::SocketAddr;
use std::time::Instant;

use stun::agent::TransactionId;
use stun::fingerprint::FINGERPRINT;
use stun::message::*;
use stun::xoraddr::XorMappedAddress;

use super::*;
use crate::candidate::*;
use crate::state::ComponentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiscoveryState {
    /// Waiting for a Ta tick to start.
    Pending,
    /// A Binding request is outstanding.
    InProgress,
    /// A response was processed.
    Done,
    /// Retransmissions were exhausted; discarded silently.
    Abandoned,
}

/// One outstanding server-reflexive discovery: a STUN Binding against the
/// configured server from one host candidate's socket.
pub(crate) struct CandidateDiscovery {
    pub(crate) stream_id: usize,
    pub(crate) component_id: u16,
    pub(crate) host_addr: SocketAddr,
    pub(crate) server_addr: SocketAddr,
    pub(crate) state: DiscoveryState,
    pub(crate) transaction_id: Option<TransactionId>,
    pub(crate) raw: Vec<u8>,
    pub(crate) attempts: u16,
    pub(crate) next_rto_at: Option<Instant>,
}

impl Agent {
    /// Creates a host candidate per (local address × component) of a freshly
    /// added stream and queues server-reflexive discovery for each in full
    /// mode.
    pub(crate) fn gather_host_candidates(&mut self, stream_index: usize) {
        let stream_id = self.streams[stream_index].id;
        let component_ids: Vec<u16> = self.streams[stream_index]
            .components
            .iter()
            .map(|c| c.id)
            .collect();
        let local_addresses = self.local_addresses_for_gathering();

        for addr in local_addresses {
            for &component_id in &component_ids {
                let config = CandidateHostConfig {
                    base_config: CandidateConfig {
                        address: addr.ip().to_string(),
                        port: addr.port(),
                        component: component_id,
                        ..CandidateConfig::default()
                    },
                };
                let candidate = match config.new_candidate_host() {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        log::warn!(
                            "[{}]: failed to create host candidate for {}: {}",
                            self.get_name(),
                            addr,
                            err
                        );
                        continue;
                    }
                };

                let foundation = candidate.foundation();
                {
                    let stream = &mut self.streams[stream_index];
                    let Some(component) = stream.component_mut(component_id) else {
                        continue;
                    };
                    if component.has_local_equal(&candidate) {
                        continue;
                    }
                    component.local_candidates.push(candidate);
                }

                self.update_component_state(stream_index, component_id, ComponentState::Gathering);
                self.events.push_back(Event::NewCandidate {
                    stream_id,
                    component_id,
                    foundation,
                });

                if !self.lite {
                    if let Some(server_addr) = self.stun_server {
                        self.discoveries.push(CandidateDiscovery {
                            stream_id,
                            component_id,
                            host_addr: addr,
                            server_addr,
                            state: DiscoveryState::Pending,
                            transaction_id: None,
                            raw: vec![],
                            attempts: 0,
                            next_rto_at: None,
                        });
                    }
                }
            }
        }
    }

    fn local_addresses_for_gathering(&self) -> Vec<SocketAddr> {
        self.local_addresses.clone()
    }

    /// Starts at most one pending discovery; the single-start rule is the
    /// pacing mechanism.
    pub(crate) fn start_next_discovery(&mut self, now: Instant) {
        let Some(discovery_index) = self
            .discoveries
            .iter()
            .position(|d| d.state == DiscoveryState::Pending)
        else {
            return;
        };

        let transaction_id = TransactionId::new();
        let mut msg = Message::new();
        if let Err(err) = msg.build(&[
            Box::new(BINDING_REQUEST),
            Box::new(transaction_id),
            Box::new(FINGERPRINT),
        ]) {
            log::error!("{err}");
            self.discoveries[discovery_index].state = DiscoveryState::Abandoned;
            return;
        }

        let (host_addr, server_addr) = {
            let discovery = &mut self.discoveries[discovery_index];
            discovery.state = DiscoveryState::InProgress;
            discovery.transaction_id = Some(transaction_id);
            discovery.raw = msg.raw.clone();
            discovery.attempts = 1;
            discovery.next_rto_at = Some(now + self.rto_initial);
            (discovery.host_addr, discovery.server_addr)
        };

        log::trace!(
            "[{}]: srflx discovery from {} against {}",
            self.get_name(),
            host_addr,
            server_addr
        );
        self.queue_transmit(host_addr, server_addr, &msg.raw, now);
    }

    /// Retransmits outstanding discoveries per the RFC 5389 backoff, then
    /// abandons them after the final wait.
    pub(crate) fn process_discovery_retransmits(&mut self, now: Instant) {
        let rto = self.rto_initial;
        let max_requests = self.max_binding_requests;

        for discovery_index in 0..self.discoveries.len() {
            let due = {
                let discovery = &self.discoveries[discovery_index];
                discovery.state == DiscoveryState::InProgress
                    && discovery.next_rto_at.map(|t| t <= now).unwrap_or(false)
            };
            if !due {
                continue;
            }

            let (resend, host_addr, server_addr, raw) = {
                let discovery = &mut self.discoveries[discovery_index];
                if discovery.attempts >= max_requests {
                    log::debug!(
                        "[{}]: srflx discovery against {} abandoned after {} requests",
                        if self.is_controlling {
                            "controlling"
                        } else {
                            "controlled"
                        },
                        discovery.server_addr,
                        discovery.attempts
                    );
                    discovery.state = DiscoveryState::Abandoned;
                    discovery.transaction_id = None;
                    discovery.next_rto_at = None;
                    (false, discovery.host_addr, discovery.server_addr, vec![])
                } else {
                    discovery.attempts += 1;
                    let delay = if discovery.attempts >= max_requests {
                        rto * FINAL_RTO_MULTIPLIER
                    } else {
                        rto * (1u32 << (discovery.attempts - 1))
                    };
                    discovery.next_rto_at = Some(now + delay);
                    (
                        true,
                        discovery.host_addr,
                        discovery.server_addr,
                        discovery.raw.clone(),
                    )
                }
            };

            if resend {
                self.queue_transmit(host_addr, server_addr, &raw, now);
            }
        }
    }

    pub(crate) fn find_discovery_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Option<usize> {
        self.discoveries
            .iter()
            .position(|d| d.transaction_id == Some(transaction_id))
    }

    /// Processes the server's Binding response and appends a new
    /// server-reflexive candidate when the mapping differs from the host.
    pub(crate) fn handle_discovery_response(
        &mut self,
        discovery_index: usize,
        m: &Message,
        peer_addr: SocketAddr,
    ) {
        let (stream_id, component_id, host_addr, server_addr) = {
            let discovery = &self.discoveries[discovery_index];
            if peer_addr != discovery.server_addr {
                log::debug!(
                    "discard discovery response: source {} does not match server {}",
                    peer_addr,
                    discovery.server_addr
                );
                return;
            }
            (
                discovery.stream_id,
                discovery.component_id,
                discovery.host_addr,
                discovery.server_addr,
            )
        };

        {
            let discovery = &mut self.discoveries[discovery_index];
            discovery.state = DiscoveryState::Done;
            discovery.transaction_id = None;
            discovery.next_rto_at = None;
        }

        if m.typ.class != CLASS_SUCCESS_RESPONSE {
            log::debug!(
                "[{}]: srflx discovery against {} answered {}",
                self.get_name(),
                server_addr,
                m.typ
            );
            return;
        }

        let mut xor_addr = XorMappedAddress::default();
        if let Err(err) = xor_addr.get_from(m) {
            log::warn!(
                "[{}]: {:?}: {}",
                self.get_name(),
                Error::ErrGetXorMappedAddrResponse,
                err
            );
            return;
        }
        let mapped = SocketAddr::new(xor_addr.ip, xor_addr.port);

        if mapped == host_addr {
            log::trace!(
                "[{}]: mapping for {} equals the host address, no srflx candidate",
                self.get_name(),
                host_addr
            );
            return;
        }

        let Some(stream_index) = self.stream_index(stream_id) else {
            return;
        };

        let config = CandidateServerReflexiveConfig {
            base_config: CandidateConfig {
                address: mapped.ip().to_string(),
                port: mapped.port(),
                component: component_id,
                ..CandidateConfig::default()
            },
            rel_addr: host_addr.ip().to_string(),
            rel_port: host_addr.port(),
            server_addr: Some(server_addr),
        };
        let candidate = match config.new_candidate_server_reflexive() {
            Ok(candidate) => candidate,
            Err(err) => {
                log::warn!(
                    "[{}]: failed to create server reflexive candidate {}: {}",
                    self.get_name(),
                    mapped,
                    err
                );
                return;
            }
        };

        let foundation = candidate.foundation();
        let added = {
            let stream = &mut self.streams[stream_index];
            if let Some(component) = stream.component_mut(component_id) {
                if component.has_local_equal(&candidate) {
                    false
                } else {
                    component.local_candidates.push(candidate);
                    true
                }
            } else {
                false
            }
        };
        if !added {
            return;
        }

        log::debug!(
            "[{}]: new srflx candidate {} (base {})",
            self.get_name(),
            mapped,
            host_addr
        );
        self.events.push_back(Event::NewCandidate {
            stream_id,
            component_id,
            foundation,
        });
        self.form_pairs_for_component(stream_index, component_id);
    }

    /// Emits `CandidateGatheringDone` once every queued discovery has either
    /// completed or been abandoned.
    pub(crate) fn maybe_emit_gathering_done(&mut self) {
        if !self.gathering_started || self.gathering_done_emitted {
            return;
        }
        let outstanding = self.discoveries.iter().any(|d| {
            matches!(
                d.state,
                DiscoveryState::Pending | DiscoveryState::InProgress
            )
        });
        if outstanding {
            return;
        }
        self.gathering_done_emitted = true;
        log::debug!("[{}]: candidate gathering done", self.get_name());
        self.events.push_back(Event::CandidateGatheringDone);
    }
}
