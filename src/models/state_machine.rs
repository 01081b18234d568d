// Command status state machine with validation

use super::CommandStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Invalid status transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("Command already in terminal status: {0:?}")]
    AlreadyTerminal(CommandStatus),
}

/// Validates if a command can transition from one status to another.
///
/// A command never goes back to `Pending`, and terminal statuses accept
/// no further transitions.
pub fn can_transition(from: CommandStatus, to: CommandStatus) -> bool {
    match (from, to) {
        // From Pending
        (CommandStatus::Pending, CommandStatus::Running) => true,
        (CommandStatus::Pending, CommandStatus::Cancelled) => true, // pre-execution cancel
        (CommandStatus::Pending, CommandStatus::Failed) => true,    // spawn failed before running

        // From Running
        (CommandStatus::Running, CommandStatus::Completed) => true,
        (CommandStatus::Running, CommandStatus::Failed) => true,

        // Same state is a no-op
        (a, b) if a == b => true,

        // Everything else, including anything -> Pending, is invalid
        _ => false,
    }
}

/// Validates and performs a status transition
pub fn transition_status(
    current: CommandStatus,
    target: CommandStatus,
) -> Result<CommandStatus, StateTransitionError> {
    if is_terminal_status(current) && current != target {
        return Err(StateTransitionError::AlreadyTerminal(current));
    }
    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Check if a status is terminal
pub fn is_terminal_status(status: CommandStatus) -> bool {
    matches!(
        status,
        CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
    )
}
