use std::time::Instant;

use super::*;
use crate::candidate::candidate_pair::CandidatePairState;

trait ControllingSelector {
    fn contact(&mut self, now: Instant);
}

trait ControlledSelector {
    fn contact(&mut self, now: Instant);
}

impl Agent {
    /// Starts at most one new check this tick: a pending nomination, a
    /// triggered check, or the best ordinary Waiting pair, in that order.
    pub(crate) fn contact(&mut self, now: Instant) {
        if self.is_controlling {
            ControllingSelector::contact(self, now);
        } else {
            ControlledSelector::contact(self, now);
        }
    }

    /// The highest-priority pair of a component that succeeded a check.
    pub(crate) fn best_valid_pair(&self, stream_index: usize, component_id: u16) -> Option<u64> {
        let stream = &self.streams[stream_index];
        let mut best: Option<(u64, u64)> = None;

        for pair in &stream.check_list {
            if pair.component_id != component_id
                || !pair.valid
                || pair.state != CandidatePairState::Succeeded
            {
                continue;
            }
            let priority = pair.priority();
            match best {
                Some((_, best_priority)) if best_priority >= priority => {}
                _ => best = Some((pair.id, priority)),
            }
        }

        best.map(|(id, _)| id)
    }

    /// The highest-priority pair of a component that has not failed yet.
    pub(crate) fn best_available_pair(
        &self,
        stream_index: usize,
        component_id: u16,
    ) -> Option<u64> {
        let stream = &self.streams[stream_index];
        let mut best: Option<(u64, u64)> = None;

        for pair in &stream.check_list {
            if pair.component_id != component_id || pair.state == CandidatePairState::Failed {
                continue;
            }
            let priority = pair.priority();
            match best {
                Some((_, best_priority)) if best_priority >= priority => {}
                _ => best = Some((pair.id, priority)),
            }
        }

        best.map(|(id, _)| id)
    }

    /// Runs the front of a triggered-check queue. Returns true when a check
    /// was sent.
    fn pop_triggered_check(&mut self, now: Instant) -> bool {
        for stream_index in 0..self.streams.len() {
            if self.streams[stream_index].remote_credentials.is_none() {
                continue;
            }
            while let Some(pair_id) = self.streams[stream_index].triggered_queue.pop_front() {
                let runnable = self.streams[stream_index]
                    .pair_index(pair_id)
                    .map(|pair_index| {
                        let pair = &self.streams[stream_index].check_list[pair_index];
                        pair.state == CandidatePairState::Waiting && pair.transaction.is_none()
                    })
                    .unwrap_or(false);
                if !runnable {
                    continue;
                }

                let use_candidate = self.aggressive_nomination && self.is_controlling;
                if self.send_check(stream_index, pair_id, use_candidate, now) {
                    return true;
                }
            }
        }
        false
    }

    /// Starts the highest-priority ordinary check across all check lists.
    fn start_ordinary_check(&mut self, now: Instant) -> bool {
        let mut best: Option<(usize, u64, u64)> = None;
        for (stream_index, stream) in self.streams.iter().enumerate() {
            if stream.remote_credentials.is_none() {
                continue;
            }
            for pair in &stream.check_list {
                if pair.state != CandidatePairState::Waiting || pair.transaction.is_some() {
                    continue;
                }
                let priority = pair.priority();
                match best {
                    Some((_, _, best_priority)) if best_priority >= priority => {}
                    _ => best = Some((stream_index, pair.id, priority)),
                }
            }
        }

        if let Some((stream_index, pair_id, _)) = best {
            let use_candidate = self.aggressive_nomination && self.is_controlling;
            self.send_check(stream_index, pair_id, use_candidate, now)
        } else {
            false
        }
    }

    /// Picks the next nomination action of the controlling agent, if any:
    /// resume an in-flight nomination or start one after the stabilisation
    /// window.
    fn nominate_pair(&mut self, now: Instant) -> bool {
        let targets: Vec<(usize, u16)> = self
            .streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.remote_credentials.is_some())
            .flat_map(|(stream_index, s)| {
                s.components
                    .iter()
                    .filter(|c| c.selected_pair.is_none())
                    .map(move |c| (stream_index, c.id))
            })
            .collect();

        for (stream_index, component_id) in targets {
            let nominated_pair = self.streams[stream_index]
                .component(component_id)
                .and_then(|c| c.nominated_pair);

            if let Some(pair_id) = nominated_pair {
                let idle = self.streams[stream_index]
                    .pair_index(pair_id)
                    .map(|pair_index| {
                        self.streams[stream_index].check_list[pair_index]
                            .transaction
                            .is_none()
                    })
                    .unwrap_or(false);
                if idle && self.send_check(stream_index, pair_id, true, now) {
                    log::trace!(
                        "[{}]: ping STUN (nominate candidate pair) {}",
                        self.get_name(),
                        pair_id
                    );
                    return true;
                }
                continue;
            }

            if self.aggressive_nomination {
                // every check already carries USE-CANDIDATE
                continue;
            }

            let Some(pair_id) = self.best_valid_pair(stream_index, component_id) else {
                continue;
            };
            let stable = self.streams[stream_index]
                .pair_index(pair_id)
                .and_then(|pair_index| self.streams[stream_index].check_list[pair_index].valid_since)
                .map(|since| now.checked_duration_since(since).unwrap_or_default()
                    >= self.nomination_min_wait)
                .unwrap_or(false);
            if !stable {
                continue;
            }

            if let Some(component) = self.streams[stream_index].component_mut(component_id) {
                component.nominated_pair = Some(pair_id);
            }
            if self.send_check(stream_index, pair_id, true, now) {
                log::trace!(
                    "[{}]: nominatable pair found, nominating {}",
                    self.get_name(),
                    pair_id
                );
                return true;
            }
        }

        false
    }
}

impl ControllingSelector for Agent {
    fn contact(&mut self, now: Instant) {
        if self.nominate_pair(now) {
            return;
        }
        if self.pop_triggered_check(now) {
            return;
        }
        self.start_ordinary_check(now);
    }
}

impl ControlledSelector for Agent {
    fn contact(&mut self, now: Instant) {
        // a controlled agent keeps checking but never nominates
        if self.pop_triggered_check(now) {
            return;
        }
        self.start_ordinary_check(now);
    }
}
