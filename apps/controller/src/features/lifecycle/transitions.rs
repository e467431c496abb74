//! The node state machine: a pure function of (actual, desired).

use archetype_types::{DesiredState, NodeStatus};

/// What the lifecycle manager should do with a node this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    /// Full deploy (create + start) on the resolved agent.
    Deploy,
    /// Start an existing container/domain.
    Start,
    /// Stop a running node.
    Stop,
    /// Mid-start reversal: stop what was starting.
    ReverseStart,
    /// Mid-stop reversal: start again once the stop settles.
    Restart,
    /// Bookkeeping only: record the node as stopped.
    MarkStopped,
    /// Nothing to do.
    None,
}

/// The transition table. Total over all (actual, desired) pairs and
/// deterministic; only the listed transitions are ever taken.
pub fn transition(actual: NodeStatus, desired: DesiredState) -> TransitionAction {
    use DesiredState::*;
    use NodeStatus::*;
    match (actual, desired) {
        (Undeployed, DesiredState::Running) | (Pending, DesiredState::Running) => TransitionAction::Deploy,
        (Undeployed, DesiredState::Stopped) | (Pending, DesiredState::Stopped) => TransitionAction::MarkStopped,
        (NodeStatus::Stopped, DesiredState::Running) | (Error, DesiredState::Running) => TransitionAction::Start,
        (NodeStatus::Stopped, DesiredState::Stopped) | (Error, DesiredState::Stopped) => {
            TransitionAction::None
        }
        (Starting, DesiredState::Running) => TransitionAction::None,
        (Starting, DesiredState::Stopped) => TransitionAction::ReverseStart,
        (NodeStatus::Running, DesiredState::Running) => TransitionAction::None,
        (NodeStatus::Running, DesiredState::Stopped) => TransitionAction::Stop,
        (Stopping, DesiredState::Running) => TransitionAction::Restart,
        (Stopping, DesiredState::Stopped) => TransitionAction::None,
        (Exited, DesiredState::Running) => TransitionAction::Start,
        (Exited, DesiredState::Stopped) => TransitionAction::MarkStopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archetype_types::DesiredState::*;
    use archetype_types::NodeStatus::*;

    const ALL_ACTUAL: [NodeStatus; 8] = [
        Undeployed, Pending, Starting, NodeStatus::Running, Stopping, NodeStatus::Stopped, Exited, Error,
    ];

    #[test]
    fn table_is_total_and_deterministic() {
        for actual in ALL_ACTUAL {
            for desired in [DesiredState::Running, DesiredState::Stopped] {
                let first = transition(actual, desired);
                let second = transition(actual, desired);
                assert_eq!(first, second, "{actual:?}/{desired:?} nondeterministic");
            }
        }
    }

    #[test]
    fn deploy_only_from_undeployed_or_pending() {
        for actual in ALL_ACTUAL {
            let action = transition(actual, DesiredState::Running);
            let deployish = action == TransitionAction::Deploy;
            assert_eq!(
                deployish,
                matches!(actual, Undeployed | Pending),
                "unexpected deploy decision for {actual:?}"
            );
        }
    }

    #[test]
    fn spec_table_rows() {
        assert_eq!(transition(Undeployed, DesiredState::Running), TransitionAction::Deploy);
        assert_eq!(transition(Undeployed, DesiredState::Stopped), TransitionAction::MarkStopped);
        assert_eq!(transition(Pending, DesiredState::Running), TransitionAction::Deploy);
        assert_eq!(transition(NodeStatus::Stopped, DesiredState::Running), TransitionAction::Start);
        assert_eq!(transition(Error, DesiredState::Running), TransitionAction::Start);
        assert_eq!(transition(Starting, DesiredState::Stopped), TransitionAction::ReverseStart);
        assert_eq!(transition(NodeStatus::Running, DesiredState::Stopped), TransitionAction::Stop);
        assert_eq!(transition(Stopping, DesiredState::Running), TransitionAction::Restart);
        assert_eq!(transition(Exited, DesiredState::Running), TransitionAction::Start);
        assert_eq!(transition(Exited, DesiredState::Stopped), TransitionAction::MarkStopped);
    }

    #[test]
    fn settled_states_are_noops() {
        assert_eq!(transition(NodeStatus::Running, DesiredState::Running), TransitionAction::None);
        assert_eq!(transition(NodeStatus::Stopped, DesiredState::Stopped), TransitionAction::None);
        assert_eq!(transition(Starting, DesiredState::Running), TransitionAction::None);
        assert_eq!(transition(Stopping, DesiredState::Stopped), TransitionAction::None);
    }
}
