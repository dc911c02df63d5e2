//! Async driver for the reclaim state machine
//!
//! One tokio task per claim. Every tick it extends the claim with the
//! coordinator and swaps the fresh credentials into the [`CredentialStore`].
//! The proxy never waits on this task; they share only the store.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tcproxy_core::{
    CredentialStore, ReclaimConfig, ReclaimMode, TaskClaim, TaskCondition, TaskLog,
};
use tcproxy_queue::{Coordinator, QueueError, Reclaim};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::state_machine::{transition, ReclaimAction, ReclaimEvent, ReclaimState};

/// Floor for `BeforeExpiry` delays so a short lease cannot spin the loop
const MIN_DELAY: Duration = Duration::from_secs(1);

/// When the next reclaim happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimSchedule {
    /// Every `interval`, independent of the lease
    Fixed(Duration),
    /// `margin` before the current `takenUntil`
    BeforeExpiry { margin: Duration },
}

impl ReclaimSchedule {
    pub fn from_config(config: &ReclaimConfig) -> Self {
        match config.mode {
            ReclaimMode::Fixed => Self::Fixed(config.interval()),
            ReclaimMode::BeforeExpiry => Self::BeforeExpiry {
                margin: config.margin(),
            },
        }
    }

    /// Delay until the next tick for `claim`
    pub fn next_delay(&self, claim: &TaskClaim, now: DateTime<Utc>) -> Duration {
        match *self {
            Self::Fixed(interval) => interval,
            Self::BeforeExpiry { margin } => claim
                .remaining(now)
                .and_then(|remaining| remaining.checked_sub(margin))
                .unwrap_or(MIN_DELAY)
                .max(MIN_DELAY),
        }
    }
}

/// Spawns and owns the reclaim loop for one claim
pub struct Reclaimer {
    coordinator: Arc<dyn Coordinator>,
    store: CredentialStore,
    schedule: ReclaimSchedule,
    call_timeout: Duration,
    task_log: Option<TaskLog>,
}

impl Reclaimer {
    /// Create a reclaimer that writes into `store`
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        store: CredentialStore,
        schedule: ReclaimSchedule,
        call_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            store,
            schedule,
            call_timeout,
            task_log: None,
        }
    }

    /// Report aborts to the task log as well
    pub fn with_task_log(mut self, task_log: TaskLog) -> Self {
        self.task_log = Some(task_log);
        self
    }

    /// Install the claim's credentials and start ticking
    pub fn spawn(self, claim: TaskClaim) -> ReclaimerHandle {
        self.store.set(claim.credentials.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ReclaimState::Idle);

        let join = tokio::spawn(async move { self.run(claim, stop_rx, state_tx).await });

        ReclaimerHandle {
            stop_tx,
            state_rx,
            join,
        }
    }

    async fn run(
        self,
        mut claim: TaskClaim,
        mut stop_rx: watch::Receiver<bool>,
        state_tx: watch::Sender<ReclaimState>,
    ) -> ReclaimState {
        let mut state = ReclaimState::Idle;
        let mut delay = self.schedule.next_delay(&claim, Utc::now());
        let mut renewed: Option<TaskClaim> = None;
        let mut event = ReclaimEvent::Start;

        loop {
            let (next, actions) = transition(state, event);
            state = next;

            for action in actions {
                match action {
                    ReclaimAction::InstallCredentials => {
                        if let Some(fresh) = renewed.take() {
                            claim = fresh;
                            let generation = self.store.set(claim.credentials.clone());
                            info!(
                                "Reclaimed {} until {} (credential generation {})",
                                claim, claim.taken_until, generation
                            );
                        }
                    }
                    ReclaimAction::ScheduleNext => {
                        delay = self.schedule.next_delay(&claim, Utc::now());
                        debug!("Next reclaim of {} in {:?}", claim, delay);
                    }
                    ReclaimAction::AbortTask { condition } => {
                        error!("Aborting task {}: {}", claim, condition);
                        if let Some(log) = &self.task_log {
                            log.line(format!("Aborting task: {}", condition)).await;
                        }
                    }
                    ReclaimAction::LogActivity { message } => info!("{}: {}", claim, message),
                }
            }

            state_tx.send_replace(state.clone());
            if state.is_terminal() {
                return state;
            }

            event = self
                .tick(&claim, delay, &mut stop_rx)
                .await
                .map(|outcome| self.classify(&claim, outcome, &mut renewed))
                .unwrap_or(ReclaimEvent::StopRequested);
        }
    }

    /// Sleep until the next tick and issue one reclaim call.
    ///
    /// Returns `None` if a stop was requested first; in that case no call is
    /// made, and an in-flight call is dropped.
    async fn tick(
        &self,
        claim: &TaskClaim,
        delay: Duration,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Option<TickOutcome> {
        tokio::select! {
            biased;
            _ = stop_requested(stop_rx) => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        if *stop_rx.borrow() {
            return None;
        }
        if claim.remaining(Utc::now()).is_none() {
            return Some(TickOutcome::Expired);
        }

        let call = tokio::time::timeout(self.call_timeout, self.coordinator.reclaim(claim));
        tokio::select! {
            biased;
            _ = stop_requested(stop_rx) => None,
            result = call => Some(match result {
                Ok(result) => TickOutcome::Called(result),
                Err(_) => TickOutcome::Called(Err(QueueError::Transient(format!(
                    "reclaim timed out after {:?}",
                    self.call_timeout
                )))),
            }),
        }
    }

    fn classify(
        &self,
        claim: &TaskClaim,
        outcome: TickOutcome,
        renewed: &mut Option<TaskClaim>,
    ) -> ReclaimEvent {
        match outcome {
            TickOutcome::Expired => ReclaimEvent::ClaimExpired,
            TickOutcome::Called(Ok(Reclaim {
                taken_until,
                credentials,
            })) => {
                *renewed = Some(claim.renewed(taken_until, credentials));
                ReclaimEvent::Reclaimed
            }
            TickOutcome::Called(Err(err)) if err.is_transient() => {
                let now = Utc::now();
                let next = self.schedule.next_delay(claim, now);
                warn!("Transient reclaim failure for {}: {}", claim, err);
                ReclaimEvent::TransientFailure {
                    message: err.to_string(),
                    claim_live: claim.is_live(now, next),
                }
            }
            TickOutcome::Called(Err(err)) => ReclaimEvent::PermanentFailure {
                message: err.to_string(),
            },
        }
    }
}

/// Resolves once a stop is requested or the handle is gone
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

enum TickOutcome {
    Expired,
    Called(Result<Reclaim, QueueError>),
}

/// Control handle for a running reclaimer
pub struct ReclaimerHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ReclaimState>,
    join: JoinHandle<ReclaimState>,
}

impl ReclaimerHandle {
    /// Current state
    pub fn state(&self) -> ReclaimState {
        self.state_rx.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ReclaimState> {
        self.state_rx.clone()
    }

    /// Resolve once the reclaimer reaches a terminal state on its own or
    /// after [`stop`](Self::stop)
    pub async fn wait_terminal(&self) -> ReclaimState {
        let mut rx = self.state_rx.clone();
        // A closed channel means the loop exited; its last state is terminal
        rx.wait_for(ReclaimState::is_terminal)
            .await
            .map(|state| state.clone())
            .unwrap_or_else(|_| self.state_rx.borrow().clone())
    }

    /// The abort condition, once one has been reached. Never resolves if the
    /// reclaimer stops cleanly.
    pub async fn aborted(&self) -> TaskCondition {
        match self.wait_terminal().await {
            ReclaimState::Aborted { condition } => condition,
            _ => std::future::pending().await,
        }
    }

    /// Request a stop and wait for the loop to finish
    pub async fn stop(self) -> ReclaimState {
        let _ = self.stop_tx.send(true);
        match self.join.await {
            Ok(state) => state,
            Err(e) => {
                error!("Reclaimer task failed: {}", e);
                ReclaimState::Aborted {
                    condition: TaskCondition::ClaimLost {
                        message: format!("reclaimer task failed: {}", e),
                    },
                }
            }
        }
    }
}
