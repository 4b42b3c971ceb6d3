#[cfg(test)]
mod use_candidate_test;

use stun::attributes::ATTR_USE_CANDIDATE;
use stun::message::*;

/// Represents the USE-CANDIDATE attribute set by a nominating controlling
/// agent.
#[derive(Default)]
pub struct UseCandidateAttr;

impl Setter for UseCandidateAttr {
    /// Adds USE-CANDIDATE attribute to the message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}

impl UseCandidateAttr {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns true if the USE-CANDIDATE attribute is set on the message.
    #[must_use]
    pub fn is_set(m: &Message) -> bool {
        m.get(ATTR_USE_CANDIDATE).is_ok()
    }
}
