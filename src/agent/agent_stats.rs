/// Counters for traffic the agent absorbed without surfacing an error.
#[derive(Default, Debug, Clone, Copy)]
pub struct AgentStats {
    /// Datagrams that looked like STUN but failed to decode.
    pub malformed_stun_dropped: u64,
    /// STUN messages dropped for a wrong MESSAGE-INTEGRITY.
    pub integrity_check_failures: u64,
    /// Binding requests dropped for an unexpected USERNAME.
    pub username_check_failures: u64,
    /// Datagrams delivered for a local address no candidate owns.
    pub unroutable_dropped: u64,
    /// Role conflicts observed (487 sent or role switched).
    pub role_conflicts: u64,
}
