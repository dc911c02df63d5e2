//! Pure state machine for the reclaim lifecycle
//!
//! No I/O and no clocks: `transition(state, event) -> (state, actions)`.
//! The async driver in [`crate::reclaimer`] feeds events in and carries the
//! actions out.
//!
//! - `Idle -> Active` on start
//! - `Active -> Stopped` when the task finishes
//! - `Active -> Aborted` when the claim is lost or refused
//! - terminal states absorb every event unchanged

use tcproxy_core::TaskCondition;

/// Reclaimer state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimState {
    /// Constructed, not ticking yet
    Idle,
    /// Ticking; `failures` counts consecutive transient failures
    Active { reclaims: u32, failures: u32 },
    /// Task finished, reclaiming stopped
    Stopped { reclaims: u32 },
    /// Claim lost or refused; the task must abort
    Aborted { condition: TaskCondition },
}

impl ReclaimState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped { .. } | Self::Aborted { .. })
    }

    /// Condition to report to the task, if the claim was lost or refused
    pub fn condition(&self) -> Option<&TaskCondition> {
        match self {
            Self::Aborted { condition } => Some(condition),
            _ => None,
        }
    }
}

/// Events fed to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimEvent {
    /// Begin ticking
    Start,
    /// The coordinator extended the claim
    Reclaimed,
    /// Retryable failure; `claim_live` says whether the lease survives until
    /// the next tick
    TransientFailure { message: String, claim_live: bool },
    /// The coordinator refused the reclaim for good
    PermanentFailure { message: String },
    /// The lease had already lapsed when the tick fired
    ClaimExpired,
    /// The owning task finished
    StopRequested,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimAction {
    /// Swap the renewed credentials into the store
    InstallCredentials,
    /// Arm the timer for the next tick
    ScheduleNext,
    /// Report a terminal condition to the owning task
    AbortTask { condition: TaskCondition },
    /// Log activity
    LogActivity { message: String },
}

/// Pure state transition function
///
/// Never panics. Events that make no sense in the current state leave it
/// unchanged and only produce a log action.
pub fn transition(state: ReclaimState, event: ReclaimEvent) -> (ReclaimState, Vec<ReclaimAction>) {
    match (state, event) {
        // Terminal states are final
        (state, _) if state.is_terminal() => (state, vec![]),

        // From Idle
        (ReclaimState::Idle, ReclaimEvent::Start) => (
            ReclaimState::Active {
                reclaims: 0,
                failures: 0,
            },
            vec![
                ReclaimAction::LogActivity {
                    message: "Reclaimer started".to_string(),
                },
                ReclaimAction::ScheduleNext,
            ],
        ),

        (ReclaimState::Idle, ReclaimEvent::StopRequested) => (
            ReclaimState::Stopped { reclaims: 0 },
            vec![ReclaimAction::LogActivity {
                message: "Reclaimer stopped before starting".to_string(),
            }],
        ),

        // From Active
        (ReclaimState::Active { reclaims, .. }, ReclaimEvent::Reclaimed) => (
            ReclaimState::Active {
                reclaims: reclaims + 1,
                failures: 0,
            },
            vec![
                ReclaimAction::InstallCredentials,
                ReclaimAction::ScheduleNext,
            ],
        ),

        (
            ReclaimState::Active { reclaims, failures },
            ReclaimEvent::TransientFailure {
                message,
                claim_live: true,
            },
        ) => (
            ReclaimState::Active {
                reclaims,
                failures: failures + 1,
            },
            vec![
                ReclaimAction::LogActivity {
                    message: format!(
                        "Reclaim failed (attempt {}), retrying next tick: {}",
                        failures + 1,
                        message
                    ),
                },
                ReclaimAction::ScheduleNext,
            ],
        ),

        (
            ReclaimState::Active { .. },
            ReclaimEvent::TransientFailure {
                message,
                claim_live: false,
            },
        ) => abort(TaskCondition::ClaimLost {
            message: format!("claim expires before the next reclaim: {}", message),
        }),

        (ReclaimState::Active { .. }, ReclaimEvent::ClaimExpired) => {
            abort(TaskCondition::ClaimLost {
                message: "takenUntil passed without a successful reclaim".to_string(),
            })
        }

        (ReclaimState::Active { .. }, ReclaimEvent::PermanentFailure { message }) => {
            abort(TaskCondition::ClaimInvalid { message })
        }

        (ReclaimState::Active { reclaims, .. }, ReclaimEvent::StopRequested) => (
            ReclaimState::Stopped { reclaims },
            vec![ReclaimAction::LogActivity {
                message: format!("Reclaimer stopped after {} reclaims", reclaims),
            }],
        ),

        // Anything else is ignored
        (state, event) => {
            let message = format!("Ignoring {:?} in state {:?}", event, state);
            (state, vec![ReclaimAction::LogActivity { message }])
        }
    }
}

fn abort(condition: TaskCondition) -> (ReclaimState, Vec<ReclaimAction>) {
    (
        ReclaimState::Aborted {
            condition: condition.clone(),
        },
        vec![ReclaimAction::AbortTask { condition }],
    )
}
