use std::net::SocketAddr;
use std::time::Duration;

/// The pacing interval Ta between successive gathering or checking actions
/// (RFC 5245 §B.1 for the 20 ms floor).
pub(crate) const DEFAULT_TA_INTERVAL: Duration = Duration::from_millis(20);

/// The interval Tr used to keep NAT bindings of the selected pair alive.
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Initial retransmission timeout for STUN transactions (RFC 5389 §7.2.1).
pub(crate) const DEFAULT_RTO: Duration = Duration::from_millis(500);

/// Max requests sent per STUN transaction before it is abandoned
/// (Rc, RFC 5389 §7.2.1).
pub(crate) const DEFAULT_MAX_BINDING_REQUESTS: u16 = 7;

/// The wait after the final request is Rm * RTO (RFC 5389 §7.2.1).
pub(crate) const FINAL_RTO_MULTIPLIER: u32 = 16;

/// How long a valid pair must stay valid before the controlling agent
/// nominates it (regular nomination).
pub(crate) const DEFAULT_NOMINATION_MIN_WAIT: Duration = Duration::from_millis(100);

/// Ceiling on the number of pairs kept per stream check list.
pub(crate) const DEFAULT_MAX_CHECK_LIST_SIZE: usize = 100;

/// Application datagrams buffered per component before the oldest is dropped.
pub(crate) const MAX_INBOUND_QUEUE: usize = 512;

/// Collects the arguments to `Agent` construction into a single structure,
/// for future-proofness of the interface.
#[derive(Default)]
pub struct AgentConfig {
    /// Enables server-reflexive discovery when set (full agents only).
    pub stun_server: Option<SocketAddr>,

    /// Accepted for configuration completeness; relay allocation is not
    /// driven by this agent.
    pub turn_server: Option<SocketAddr>,

    /// Initial role; determines USE-CANDIDATE authority. May flip once when
    /// a role conflict is resolved against us.
    pub is_controlling: bool,

    /// Lite agents never initiate checks and only answer them.
    pub lite: bool,

    /// Pacing interval between successive discovery/check starts.
    /// Defaults to 20 ms.
    pub ta_interval: Option<Duration>,

    /// How often a Binding indication refreshes the selected pair's NAT
    /// binding. Defaults to 15 s.
    pub keepalive_interval: Option<Duration>,

    /// Initial STUN retransmission timeout. Defaults to 500 ms.
    /// Only useful for testing.
    pub rto_initial: Option<Duration>,

    /// The max amount of binding requests sent per transaction before the
    /// pair (or discovery) is considered failed. Defaults to 7.
    pub max_binding_requests: Option<u16>,

    /// How long the controlling agent waits after a pair first becomes
    /// valid before nominating it. Defaults to 100 ms.
    pub nomination_min_wait: Option<Duration>,

    /// Set USE-CANDIDATE on every check instead of nominating after the
    /// stabilisation window.
    pub aggressive_nomination: bool,

    /// Ceiling on pairs kept per stream. Defaults to 100.
    pub max_check_list_size: Option<usize>,
}
