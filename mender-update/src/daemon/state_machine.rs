//! The deployment state machine: states, events, and the transition table
//! that drives a deployment from poll through commit or rollback. Events
//! are queued and handled one at a time; the polling triggers are
//! "deferred" events that wait in the queue until the machine is back in a
//! state that can act on them. An event no state can ever handle is a
//! programming error and takes the daemon down.

use crate::error::{self, Result};
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Success,
    Failure,
    NothingToDo,
    DeploymentPollingTriggered,
    InventoryPollingTriggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    SubmitInventory,
    PollForDeployment,
    UpdateDownload,
    UpdateInstall,
    UpdateCheckReboot,
    UpdateReboot,
    UpdateVerifyReboot,
    UpdateCommit,
    UpdateCheckRollback,
    UpdateRollback,
    UpdateCheckRollbackReboot,
    UpdateRollbackReboot,
    UpdateVerifyRollbackReboot,
    UpdateFailure,
    UpdateCleanup,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Polling triggers wait for the machine to come back to Idle instead of
/// aborting it mid-deployment.
fn is_deferred(event: StateEvent) -> bool {
    matches!(
        event,
        StateEvent::DeploymentPollingTriggered | StateEvent::InventoryPollingTriggered
    )
}

/// The full transition table.
fn transition(state: State, event: StateEvent) -> Option<State> {
    use State::*;
    use StateEvent::*;

    match (state, event) {
        (Idle, DeploymentPollingTriggered) => Some(PollForDeployment),
        (Idle, InventoryPollingTriggered) => Some(SubmitInventory),

        (SubmitInventory, Success) => Some(Idle),
        (SubmitInventory, Failure) => Some(Idle),

        (PollForDeployment, Success) => Some(UpdateDownload),
        (PollForDeployment, NothingToDo) => Some(Idle),
        (PollForDeployment, Failure) => Some(Idle),

        (UpdateDownload, Success) => Some(UpdateInstall),
        (UpdateDownload, Failure) => Some(UpdateCleanup),

        (UpdateInstall, Success) => Some(UpdateCheckReboot),
        (UpdateInstall, Failure) => Some(UpdateCheckRollback),

        (UpdateCheckReboot, Success) => Some(UpdateReboot),
        (UpdateCheckReboot, NothingToDo) => Some(UpdateCommit),
        (UpdateCheckReboot, Failure) => Some(UpdateCheckRollback),

        (UpdateReboot, Success) => Some(UpdateVerifyReboot),
        (UpdateReboot, Failure) => Some(UpdateCheckRollback),

        (UpdateVerifyReboot, Success) => Some(UpdateCommit),
        (UpdateVerifyReboot, Failure) => Some(UpdateCheckRollback),

        (UpdateCommit, Success) => Some(UpdateCleanup),
        (UpdateCommit, Failure) => Some(UpdateCheckRollback),

        (UpdateCheckRollback, Success) => Some(UpdateRollback),
        (UpdateCheckRollback, NothingToDo) => Some(UpdateFailure),
        (UpdateCheckRollback, Failure) => Some(UpdateFailure),

        (UpdateRollback, Success) => Some(UpdateCheckRollbackReboot),
        (UpdateRollback, Failure) => Some(UpdateFailure),

        (UpdateCheckRollbackReboot, Success) => Some(UpdateRollbackReboot),
        (UpdateCheckRollbackReboot, NothingToDo) => Some(UpdateFailure),
        (UpdateCheckRollbackReboot, Failure) => Some(UpdateFailure),

        (UpdateRollbackReboot, Success) => Some(UpdateVerifyRollbackReboot),
        (UpdateRollbackReboot, Failure) => Some(UpdateFailure),

        (UpdateVerifyRollbackReboot, Success) => Some(UpdateFailure),
        (UpdateVerifyRollbackReboot, Failure) => Some(UpdateRollbackReboot),

        (UpdateFailure, Success) => Some(UpdateCleanup),
        (UpdateFailure, Failure) => Some(UpdateCleanup),

        (UpdateCleanup, Success) => Some(Idle),
        (UpdateCleanup, Failure) => Some(Idle),

        _ => None,
    }
}

pub struct StateMachine {
    current: State,
    queue: VecDeque<StateEvent>,
    deferred: Vec<StateEvent>,
}

impl StateMachine {
    pub fn new(initial: State) -> Self {
        Self {
            current: initial,
            queue: VecDeque::new(),
            deferred: Vec::new(),
        }
    }

    pub fn current(&self) -> State {
        self.current
    }

    pub fn post(&mut self, event: StateEvent) {
        self.queue.push_back(event);
    }

    /// Forcibly moves the machine (used when the loop cap routes straight
    /// to cleanup). Queued events are dropped; deferred ones survive.
    pub fn force(&mut self, state: State) {
        self.queue.clear();
        self.current = state;
    }

    /// Applies queued events until one transitions the machine, returning
    /// the state entered. Deferred events that don't match are parked and
    /// retried after the next successful transition. `Ok(None)` means
    /// nothing actionable is queued.
    pub fn step(&mut self) -> Result<Option<State>> {
        while let Some(event) = self.queue.pop_front() {
            match transition(self.current, event) {
                Some(next) => {
                    self.current = next;
                    // Something changed; parked events get another chance.
                    for event in self.deferred.drain(..) {
                        self.queue.push_back(event);
                    }
                    return Ok(Some(next));
                }
                None if is_deferred(event) => {
                    self.deferred.push(event);
                }
                None => {
                    return error::ProgrammingSnafu {
                        reason: format!(
                            "state machine event {:?} was not handled in state {}",
                            event, self.current
                        ),
                    }
                    .fail();
                }
            }
        }
        Ok(None)
    }
}
