//! Placement group scheduler
//!
//! [`Scheduler`] is a cheap, cloneable handle. All scheduling decisions and
//! group state changes happen on one control task that consumes caller
//! commands and lease replies in arrival order, so group and bundle state
//! never needs locking beyond the handle the caller shares with us.

use pgsched_core::{
    PgschedError, PgschedResult, PlacementGroupState, SchedulerConfig, SharedPlacementGroup,
};
use pgsched_lease::LeaseClientFactory;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::coordinator::{
    AttemptId, AttemptOutcome, AttemptRequest, AttemptResolution, CoordinatorEvent,
    LeaseCoordinator, ScheduleCallbacks,
};
use crate::placement::PolicySet;
use crate::view::NodeResourceView;

/// Counters describing what the scheduler has done so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// `schedule` calls processed
    pub attempts: u64,
    /// Attempts that ended with the group committed
    pub committed: u64,
    /// Attempts that failed before any reservation was sent
    pub failed_no_capacity: u64,
    /// Attempts rolled back because a node denied a reservation
    pub failed_reservation: u64,
    /// Attempts rolled back because a node could not be reached
    pub failed_transport: u64,
    /// Attempts rolled back because a reservation missed its deadline
    pub failed_timeout: u64,
    /// Attempts that failed on an inconsistency inside the scheduler
    pub failed_internal: u64,
    /// Calls refused because the group was invalid, already scheduling, or
    /// arrived after shutdown
    pub rejected: u64,
    /// Commits that were never acknowledged on an otherwise committed group
    pub commit_failures: u64,
    /// Attempts currently waiting on nodes
    pub in_flight: usize,
}

/// Terminal result of one `schedule` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Committed,
    Failed,
}

enum Command {
    Schedule {
        group: SharedPlacementGroup,
        callbacks: ScheduleCallbacks,
    },
    Stats(oneshot::Sender<SchedulerStats>),
    Shutdown,
}

/// Handle to the scheduler's control loop
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    /// Spawn the control loop on the current tokio runtime
    pub fn start(
        view: Arc<dyn NodeResourceView>,
        lease_clients: LeaseClientFactory,
        config: SchedulerConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            reservation_timeout_ms = config.reservation_timeout_ms,
            commit_max_attempts = config.commit_max_attempts,
            "Scheduler initialized"
        );

        let control = ControlLoop {
            view,
            policies: PolicySet::new(),
            coordinator: LeaseCoordinator::new(lease_clients, events_tx, config),
            commands: commands_rx,
            events: events_rx,
            next_attempt: 0,
            stats: SchedulerStats::default(),
        };
        tokio::spawn(control.run());

        Self {
            commands: commands_tx,
        }
    }

    /// Schedule a placement group
    ///
    /// Returns immediately. Exactly one of the callbacks is invoked later,
    /// from the control loop, with the same group handle.
    pub fn schedule<F, S>(&self, group: SharedPlacementGroup, on_failure: F, on_success: S)
    where
        F: FnOnce(SharedPlacementGroup) + Send + 'static,
        S: FnOnce(SharedPlacementGroup) + Send + 'static,
    {
        let command = Command::Schedule {
            group,
            callbacks: ScheduleCallbacks {
                on_failure: Box::new(on_failure),
                on_success: Box::new(on_success),
            },
        };

        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            warn!("Scheduler is shut down, failing placement group");
            if let Command::Schedule { group, callbacks } = command {
                // Never run the callback on the caller's stack
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move { (callbacks.on_failure)(group) });
                    }
                    Err(_) => {
                        std::thread::spawn(move || (callbacks.on_failure)(group));
                    }
                }
            }
        }
    }

    /// Schedule a group and wait for the outcome
    pub async fn schedule_and_wait(&self, group: SharedPlacementGroup) -> ScheduleOutcome {
        let (tx, rx) = oneshot::channel();
        let failure_tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let success_tx = failure_tx.clone();

        self.schedule(
            group,
            move |_| send_outcome(&failure_tx, ScheduleOutcome::Failed),
            move |_| send_outcome(&success_tx, ScheduleOutcome::Committed),
        );

        rx.await.unwrap_or(ScheduleOutcome::Failed)
    }

    /// Snapshot of the scheduler's counters
    pub async fn stats(&self) -> PgschedResult<SchedulerStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| PgschedError::SchedulerClosed)?;
        rx.await.map_err(|_| PgschedError::SchedulerClosed)
    }

    /// Stop accepting work; in-flight attempts still run to completion
    ///
    /// `schedule` calls that race with shutdown fail through `on_failure`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

fn send_outcome(
    slot: &std::sync::Mutex<Option<oneshot::Sender<ScheduleOutcome>>>,
    outcome: ScheduleOutcome,
) {
    let sender = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(sender) = sender {
        let _ = sender.send(outcome);
    }
}

/// State owned by the control task
struct ControlLoop {
    view: Arc<dyn NodeResourceView>,
    policies: PolicySet,
    coordinator: LeaseCoordinator,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    next_attempt: AttemptId,
    stats: SchedulerStats,
}

impl ControlLoop {
    async fn run(mut self) {
        let mut accepting = true;

        loop {
            tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(Command::Schedule { group, callbacks }) => {
                        self.schedule(group, callbacks).await
                    }
                    Some(Command::Stats(reply)) => self.reply_stats(reply),
                    Some(Command::Shutdown) | None => {
                        info!(in_flight = self.coordinator.in_flight(), "Scheduler shutting down");
                        accepting = false;
                        self.drain_commands();
                    }
                },
                Some(event) = self.events.recv() => {
                    if let Some(resolution) = self.coordinator.handle(event).await {
                        self.finish(resolution).await;
                    }
                }
            }

            if !accepting && self.coordinator.in_flight() == 0 {
                break;
            }
        }

        debug!("Scheduler control loop exited");
    }

    fn reply_stats(&self, reply: oneshot::Sender<SchedulerStats>) {
        let mut stats = self.stats.clone();
        stats.in_flight = self.coordinator.in_flight();
        let _ = reply.send(stats);
    }

    /// Close the command channel and fail everything still queued in it
    ///
    /// After this, `schedule` sees a closed channel and fails on its own.
    fn drain_commands(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Schedule { group, callbacks } => {
                    self.record_failure(&PgschedError::SchedulerClosed);
                    (callbacks.on_failure)(group);
                }
                // Dropping the reply reports the scheduler as closed
                Command::Stats(_) | Command::Shutdown => {}
            }
        }
    }

    /// Count a terminal failure under its kind
    fn record_failure(&mut self, error: &PgschedError) {
        let counter = match error {
            PgschedError::NoCapacity(_) => &mut self.stats.failed_no_capacity,
            PgschedError::ReservationDenied(_) => &mut self.stats.failed_reservation,
            PgschedError::Transport(_) => &mut self.stats.failed_transport,
            PgschedError::Timeout(_) => &mut self.stats.failed_timeout,
            PgschedError::InvalidGroup(_)
            | PgschedError::AlreadyScheduling(_)
            | PgschedError::SchedulerClosed => &mut self.stats.rejected,
            _ => &mut self.stats.failed_internal,
        };
        *counter += 1;
    }

    /// Start one attempt for `group`
    async fn schedule(&mut self, group: SharedPlacementGroup, callbacks: ScheduleCallbacks) {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.stats.attempts += 1;

        let (group_id, strategy, prior_state, bundle_count) = {
            let g = group.read().await;
            (g.id, g.strategy, g.state, g.bundles.len())
        };

        if self.coordinator.is_scheduling(group_id) {
            // The in-flight attempt owns the group's state
            let error = PgschedError::AlreadyScheduling(group_id.to_string());
            warn!(group_id = %group_id, error = %error, "Rejecting placement group");
            self.record_failure(&error);
            (callbacks.on_failure)(group);
            return;
        }

        if bundle_count == 0 {
            let error = PgschedError::InvalidGroup(format!("{} has no bundles", group_id));
            warn!(group_id = %group_id, error = %error, "Rejecting placement group");
            self.fail(group, prior_state, callbacks, error).await;
            return;
        }

        let snapshot = self.view.snapshot().await;
        self.coordinator.retain_clients(&snapshot);

        if snapshot.alive_count() == 0 {
            let error = PgschedError::NoCapacity("no alive nodes".to_string());
            self.fail(group, prior_state, callbacks, error).await;
            return;
        }

        // Start from scratch: nothing from an earlier placement carries over
        let (bundles, decision) = {
            let mut g = group.write().await;
            g.reset_bundles();
            let decision = self.policies.select(strategy, &g.bundles, &snapshot);
            let bundles: Vec<_> = g
                .bundles
                .iter()
                .map(|b| (g.bundle_id(b.index), b.resources.clone()))
                .collect();

            if let Some(decision) = &decision {
                for (bundle, node_id) in g.bundles.iter_mut().zip(&decision.bundle_nodes) {
                    bundle.node_id = Some(node_id.clone());
                }
                g.set_state(PlacementGroupState::Preparing);
            }
            (bundles, decision)
        };

        let Some(decision) = decision else {
            let error = PgschedError::NoCapacity(format!(
                "{} does not fit on {} alive nodes at view version {}",
                strategy,
                snapshot.alive_count(),
                snapshot.version()
            ));
            self.fail(group, prior_state, callbacks, error).await;
            return;
        };

        debug!(
            attempt,
            group_id = %group_id,
            strategy = %strategy,
            nodes = ?decision.nodes(),
            "Selected nodes"
        );

        let request = AttemptRequest {
            attempt,
            group_id,
            group: group.clone(),
            prior_state,
            bundles,
            callbacks,
        };
        if let Err(callbacks) = self.coordinator.begin(request, &decision, &snapshot) {
            let error = PgschedError::Internal(format!(
                "placement for {} does not match view version {}",
                group_id,
                snapshot.version()
            ));
            self.fail(group, prior_state, callbacks, error).await;
        }
    }

    /// Apply the result of a finished attempt and run its callback
    async fn finish(&mut self, resolution: AttemptResolution) {
        let AttemptResolution {
            attempt,
            group,
            prior_state,
            outcome,
            callbacks,
        } = resolution;

        match outcome {
            AttemptOutcome::Committed { commit_failures } => {
                let group_id = {
                    let mut g = group.write().await;
                    g.set_state(PlacementGroupState::Committed);
                    g.id
                };
                self.stats.committed += 1;
                self.stats.commit_failures += commit_failures.len() as u64;
                info!(
                    attempt,
                    group_id = %group_id,
                    commit_failures = commit_failures.len(),
                    "Placement group committed"
                );
                (callbacks.on_success)(group);
            }
            AttemptOutcome::RolledBack {
                granted,
                denied,
                cause,
            } => {
                debug!(attempt, granted, denied, "Attempt rolled back");
                self.fail(group, prior_state, callbacks, cause).await;
            }
        }
    }

    /// Revert the group to its pre-attempt placement state and report failure
    async fn fail(
        &mut self,
        group: SharedPlacementGroup,
        prior_state: PlacementGroupState,
        callbacks: ScheduleCallbacks,
        error: PgschedError,
    ) {
        let (group_id, state) = {
            let mut g = group.write().await;
            g.reset_bundles();
            g.set_state(state_after_failure(prior_state));
            (g.id, g.state)
        };
        info!(group_id = %group_id, state = ?state, error = %error, "Placement group failed");
        self.record_failure(&error);
        (callbacks.on_failure)(group);
    }
}

/// Where a group lands when an attempt fails
///
/// A group that was never placed stays pending; anything else waits to be
/// rescheduled.
fn state_after_failure(prior: PlacementGroupState) -> PlacementGroupState {
    match prior {
        PlacementGroupState::Pending => PlacementGroupState::Pending,
        _ => PlacementGroupState::Rescheduling,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsched_core::NodeAddress;
    use pgsched_lease::{LeaseClient, ManualLeaseClient};

    #[test]
    fn test_state_after_failure() {
        assert_eq!(
            state_after_failure(PlacementGroupState::Pending),
            PlacementGroupState::Pending
        );
        assert_eq!(
            state_after_failure(PlacementGroupState::Committed),
            PlacementGroupState::Rescheduling
        );
        assert_eq!(
            state_after_failure(PlacementGroupState::Rescheduling),
            PlacementGroupState::Rescheduling
        );
    }

    #[test]
    fn test_stats_default_is_zero() {
        let stats = SchedulerStats::default();
        assert_eq!(stats.attempts, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_failures_are_counted_by_kind() {
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let factory: LeaseClientFactory = Arc::new(|address: &NodeAddress| {
            Arc::new(ManualLeaseClient::new(address.clone())) as Arc<dyn LeaseClient>
        });
        let mut control = ControlLoop {
            view: Arc::new(crate::view::ClusterView::new()),
            policies: PolicySet::new(),
            coordinator: LeaseCoordinator::new(factory, events_tx, SchedulerConfig::default()),
            commands: commands_rx,
            events: events_rx,
            next_attempt: 0,
            stats: SchedulerStats::default(),
        };

        control.record_failure(&PgschedError::NoCapacity("full".into()));
        control.record_failure(&PgschedError::ReservationDenied("no".into()));
        control.record_failure(&PgschedError::Transport("down".into()));
        control.record_failure(&PgschedError::Timeout("slow".into()));
        control.record_failure(&PgschedError::AlreadyScheduling("g".into()));
        control.record_failure(&PgschedError::Internal("bug".into()));

        let stats = &control.stats;
        assert_eq!(stats.failed_no_capacity, 1);
        assert_eq!(stats.failed_reservation, 1);
        assert_eq!(stats.failed_transport, 1);
        assert_eq!(stats.failed_timeout, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.failed_internal, 1);
    }
}
