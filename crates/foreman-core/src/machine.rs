// Protocol State Machine
// The transition table every status mutation goes through. Terminal states
// admit no further transitions.

use crate::error::{ForemanError, Result};
use chrono::Utc;
use foreman_types::{ProtocolRun, ProtocolStatus};

use ProtocolStatus::*;

pub fn can_transition(from: ProtocolStatus, to: ProtocolStatus) -> bool {
    matches!(
        (from, to),
        (Pending, Planning)
            | (Pending, Cancelled)
            | (Planning, Planned)
            | (Planning, Failed)
            | (Planning, Cancelled)
            | (Planned, Running)
            | (Planned, Cancelled)
            | (Planned, Paused)
            | (Running, Paused)
            | (Running, Blocked)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Paused, Running)
            | (Paused, Cancelled)
            | (Blocked, Running)
            | (Blocked, Cancelled)
            | (Blocked, Failed)
    )
}

/// Apply a transition to the run record, stamping `updated_at` and, for
/// terminal states, `ended_at`.
pub fn transition(run: &mut ProtocolRun, to: ProtocolStatus) -> Result<()> {
    if run.status == to {
        return Ok(());
    }
    if !can_transition(run.status, to) {
        return Err(ForemanError::InvalidTransition(format!(
            "{:?} -> {:?} for protocol {}",
            run.status, to, run.id
        )));
    }
    run.status = to;
    run.updated_at = Utc::now();
    if to.is_terminal() {
        run.ended_at = Some(run.updated_at);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_in(status: ProtocolStatus) -> ProtocolRun {
        let mut run = ProtocolRun::new(
            "proto-1".to_string(),
            "project-1".to_string(),
            1,
            "0001-demo".to_string(),
            "main".to_string(),
        );
        run.status = status;
        run
    }

    #[test]
    fn happy_path_transitions_are_allowed() {
        let mut run = run_in(Pending);
        for next in [Planning, Planned, Running, Completed] {
            transition(&mut run, next).unwrap();
        }
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn terminal_states_are_closed() {
        for terminal in [Completed, Failed, Cancelled] {
            let mut run = run_in(terminal);
            for target in [
                Pending, Planning, Planned, Running, Paused, Blocked, Failed, Cancelled, Completed,
            ] {
                if target == terminal {
                    continue;
                }
                assert!(
                    transition(&mut run, target).is_err(),
                    "{:?} -> {:?} must be refused",
                    terminal,
                    target
                );
            }
        }
    }

    #[test]
    fn every_non_terminal_state_can_cancel() {
        for from in [Pending, Planning, Planned, Running, Paused, Blocked] {
            let mut run = run_in(from);
            transition(&mut run, Cancelled).unwrap();
            assert_eq!(run.status, Cancelled);
        }
    }

    #[test]
    fn reservation_only_state_is_reachable_from_blocked() {
        let mut run = run_in(Blocked);
        transition(&mut run, Running).unwrap();
        assert_eq!(run.status, Running);
    }

    #[test]
    fn pending_cannot_run_directly() {
        let mut run = run_in(Pending);
        assert!(transition(&mut run, Running).is_err());
        assert_eq!(run.status, Pending);
    }

    #[test]
    fn same_state_transition_is_a_no_op() {
        let mut run = run_in(Running);
        let before = run.updated_at;
        transition(&mut run, Running).unwrap();
        assert_eq!(run.updated_at, before);
    }
}
