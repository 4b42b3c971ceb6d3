use super::*;

#[test]
fn test_component_state_forward_only() {
    use ComponentState::*;

    assert!(Disconnected.can_transition(Gathering));
    assert!(Gathering.can_transition(Connecting));
    assert!(Connecting.can_transition(Connected));
    assert!(Connected.can_transition(Ready));
    assert!(Connecting.can_transition(Failed));

    // forward jumps are legal
    assert!(Gathering.can_transition(Ready));
    assert!(Disconnected.can_transition(Failed));

    // no going back
    assert!(!Connected.can_transition(Connecting));
    assert!(!Gathering.can_transition(Disconnected));
    assert!(!Connecting.can_transition(Connecting));
}

#[test]
fn test_component_state_absorbing() {
    use ComponentState::*;

    for next in [Disconnected, Gathering, Connecting, Connected, Ready, Failed] {
        assert!(!Ready.can_transition(next), "ready must absorb {next}");
        assert!(!Failed.can_transition(next), "failed must absorb {next}");
    }
}

#[test]
fn test_component_state_from_u8() {
    for s in [
        ComponentState::Disconnected,
        ComponentState::Gathering,
        ComponentState::Connecting,
        ComponentState::Connected,
        ComponentState::Ready,
        ComponentState::Failed,
    ] {
        assert_eq!(ComponentState::from(s as u8), s);
    }
    assert_eq!(ComponentState::from(200), ComponentState::Disconnected);
}
