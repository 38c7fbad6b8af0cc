//! Two-phase lease coordination
//!
//! For one scheduling attempt the coordinator sends a reservation for every
//! bundle to the node chosen for it, waits for every reply, and then either
//! commits all of them or cancels the ones that were granted. Replies arrive
//! as [`CoordinatorEvent`]s on the scheduler's control loop; each
//! [`LeaseAttempt`] is the only place that knows how many replies its join
//! is still waiting for.
//!
//! A reservation that misses its deadline counts as denied, but the request
//! itself keeps running. If the node grants it later, that grant is
//! cancelled on arrival.

use pgsched_core::{
    BundleId, BundleState, NodeId, PgschedError, PgschedResult, PlacementGroupId,
    PlacementGroupState, ResourceSet, SchedulerConfig, SharedPlacementGroup,
};
use pgsched_lease::{LeaseClient, LeaseClientFactory, LeaseClientRegistry, ReservationReply};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::placement::PlacementDecision;
use crate::view::NodeSnapshot;

/// Identifier of one scheduling attempt
pub type AttemptId = u64;

/// Callback receiving the group once an attempt resolves
pub type GroupCallback = Box<dyn FnOnce(SharedPlacementGroup) + Send + 'static>;

/// The pair of callbacks for one `schedule` call; exactly one of them runs
pub(crate) struct ScheduleCallbacks {
    pub on_failure: GroupCallback,
    pub on_success: GroupCallback,
}

/// How a single reservation request ended
#[derive(Debug)]
pub enum ReservationOutcome {
    Granted,
    Denied,
    /// Transport error or missed deadline; counts as a denial
    Failed(PgschedError),
}

impl ReservationOutcome {
    /// Map a lease client reply
    pub fn from_reply(reply: PgschedResult<ReservationReply>) -> Self {
        match reply {
            Ok(ReservationReply::Granted) => ReservationOutcome::Granted,
            Ok(ReservationReply::Denied) => ReservationOutcome::Denied,
            Err(e) => ReservationOutcome::Failed(e),
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, ReservationOutcome::Granted)
    }
}

/// Replies posted back to the control loop by lease tasks
pub(crate) enum CoordinatorEvent {
    Reservation {
        attempt: AttemptId,
        bundle_index: usize,
        outcome: ReservationOutcome,
    },
    Commit {
        attempt: AttemptId,
        bundle_index: usize,
        result: PgschedResult<()>,
    },
    /// A node granted a reservation after it had already timed out
    LateGrant {
        attempt: AttemptId,
        bundle: BundleId,
        client: Arc<dyn LeaseClient>,
    },
}

/// A commit that never got acknowledged
#[derive(Debug)]
pub struct CommitFailure {
    pub bundle: BundleId,
    pub node_id: NodeId,
    pub error: PgschedError,
}

/// Final result of an attempt
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    /// Every reservation was granted and every commit resolved
    Committed { commit_failures: Vec<CommitFailure> },
    /// At least one reservation was not granted; grants were cancelled
    RolledBack {
        granted: usize,
        denied: usize,
        /// First non-granted reservation in bundle order
        cause: PgschedError,
    },
}

/// Everything needed to start an attempt
pub(crate) struct AttemptRequest {
    pub attempt: AttemptId,
    pub group_id: PlacementGroupId,
    pub group: SharedPlacementGroup,
    pub prior_state: PlacementGroupState,
    /// Each bundle's id and requirement, in group order
    pub bundles: Vec<(BundleId, ResourceSet)>,
    pub callbacks: ScheduleCallbacks,
}

/// Everything the scheduler needs to finish an attempt
pub(crate) struct AttemptResolution {
    pub attempt: AttemptId,
    pub group: SharedPlacementGroup,
    pub prior_state: PlacementGroupState,
    pub outcome: AttemptOutcome,
    pub callbacks: ScheduleCallbacks,
}

/// One bundle's reservation target within an attempt
struct BundleTarget {
    bundle: BundleId,
    node_id: NodeId,
    client: Arc<dyn LeaseClient>,
    outcome: Option<ReservationOutcome>,
    commit: Option<PgschedResult<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptPhase {
    Reserving,
    Committing,
}

/// In-flight state of one scheduling attempt
struct LeaseAttempt {
    group_id: PlacementGroupId,
    group: SharedPlacementGroup,
    prior_state: PlacementGroupState,
    targets: Vec<BundleTarget>,
    phase: AttemptPhase,
    replies: usize,
    callbacks: ScheduleCallbacks,
}

impl LeaseAttempt {
    fn all_replied(&self) -> bool {
        self.replies == self.targets.len()
    }
}

/// Drives the reserve / commit / cancel protocol for every in-flight attempt
pub struct LeaseCoordinator {
    attempts: HashMap<AttemptId, LeaseAttempt>,
    registry: LeaseClientRegistry,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    config: SchedulerConfig,
}

impl LeaseCoordinator {
    pub(crate) fn new(
        factory: LeaseClientFactory,
        events: mpsc::UnboundedSender<CoordinatorEvent>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            attempts: HashMap::new(),
            registry: LeaseClientRegistry::new(factory),
            events,
            config,
        }
    }

    /// Number of attempts waiting on replies
    pub fn in_flight(&self) -> usize {
        self.attempts.len()
    }

    /// Whether `group_id` has an attempt in flight
    pub fn is_scheduling(&self, group_id: PlacementGroupId) -> bool {
        self.attempts.values().any(|a| a.group_id == group_id)
    }

    /// Drop lease clients of nodes that are no longer alive
    pub fn retain_clients(&mut self, view: &NodeSnapshot) {
        let evicted = self.registry.retain_alive(view.alive_nodes().map(|n| &n.address));
        if evicted > 0 {
            debug!(evicted, "Evicted lease clients of dead nodes");
        }
    }

    /// Start phase one: fire a reservation for every bundle in parallel
    ///
    /// Hands the callbacks back if the decision names a node missing from
    /// `view`, in which case nothing was sent.
    pub(crate) fn begin(
        &mut self,
        request: AttemptRequest,
        decision: &PlacementDecision,
        view: &NodeSnapshot,
    ) -> Result<(), ScheduleCallbacks> {
        let AttemptRequest {
            attempt,
            group_id,
            group,
            prior_state,
            bundles,
            callbacks,
        } = request;

        let mut addresses = Vec::with_capacity(bundles.len());
        for node_id in &decision.bundle_nodes {
            match view.get(node_id) {
                Some(node) => addresses.push(node.address.clone()),
                None => {
                    error!(
                        node = %node_id,
                        group_id = %group_id,
                        "Placement chose a node missing from the view"
                    );
                    return Err(callbacks);
                }
            }
        }
        if addresses.len() != bundles.len() {
            error!(
                group_id = %group_id,
                bundles = bundles.len(),
                assigned = addresses.len(),
                "Placement does not cover every bundle"
            );
            return Err(callbacks);
        }

        let mut targets = Vec::with_capacity(bundles.len());
        for (((bundle, resources), node_id), address) in bundles
            .into_iter()
            .zip(&decision.bundle_nodes)
            .zip(&addresses)
        {
            let client = self.registry.get_or_create(address);
            self.spawn_reservation(attempt, bundle.index, bundle, resources, client.clone());
            targets.push(BundleTarget {
                bundle,
                node_id: node_id.clone(),
                client,
                outcome: None,
                commit: None,
            });
        }

        info!(
            attempt,
            group_id = %group_id,
            reservations = targets.len(),
            nodes = decision.nodes().len(),
            "Reserving bundles"
        );

        self.attempts.insert(
            attempt,
            LeaseAttempt {
                group_id,
                group,
                prior_state,
                targets,
                phase: AttemptPhase::Reserving,
                replies: 0,
                callbacks,
            },
        );
        Ok(())
    }

    /// Apply one reply; returns the resolution once the attempt is over
    pub(crate) async fn handle(&mut self, event: CoordinatorEvent) -> Option<AttemptResolution> {
        match event {
            CoordinatorEvent::Reservation {
                attempt,
                bundle_index,
                outcome,
            } => self.on_reservation(attempt, bundle_index, outcome).await,
            CoordinatorEvent::Commit {
                attempt,
                bundle_index,
                result,
            } => self.on_commit(attempt, bundle_index, result).await,
            CoordinatorEvent::LateGrant {
                attempt,
                bundle,
                client,
            } => {
                warn!(
                    attempt,
                    bundle = %bundle,
                    node = %client.address(),
                    "Reservation granted after its deadline, returning it"
                );
                self.spawn_cancel(bundle, client);
                None
            }
        }
    }

    async fn on_reservation(
        &mut self,
        attempt_id: AttemptId,
        bundle_index: usize,
        outcome: ReservationOutcome,
    ) -> Option<AttemptResolution> {
        let attempt = match self.attempts.get_mut(&attempt_id) {
            Some(attempt) if attempt.phase == AttemptPhase::Reserving => attempt,
            _ => {
                debug!(attempt = attempt_id, bundle_index, "Ignoring stale reservation reply");
                return None;
            }
        };
        let target = attempt
            .targets
            .iter_mut()
            .find(|t| t.bundle.index == bundle_index && t.outcome.is_none())?;

        match &outcome {
            ReservationOutcome::Granted => {
                debug!(
                    attempt = attempt_id,
                    bundle = %target.bundle,
                    node = %target.node_id,
                    "Reservation granted"
                );
                let mut group = attempt.group.write().await;
                if let Some(bundle) = group.bundles.get_mut(bundle_index) {
                    bundle.state = BundleState::Reserved;
                }
            }
            ReservationOutcome::Denied => {
                warn!(
                    attempt = attempt_id,
                    bundle = %target.bundle,
                    node = %target.node_id,
                    "Reservation denied"
                );
            }
            ReservationOutcome::Failed(e) if e.is_denial() => {
                warn!(
                    attempt = attempt_id,
                    bundle = %target.bundle,
                    node = %target.node_id,
                    error = %e,
                    "Reservation failed"
                );
            }
            ReservationOutcome::Failed(e) => {
                error!(
                    attempt = attempt_id,
                    bundle = %target.bundle,
                    node = %target.node_id,
                    error = %e,
                    "Unexpected reservation error"
                );
            }
        }
        target.outcome = Some(outcome);
        attempt.replies += 1;

        if !attempt.all_replied() {
            return None;
        }

        if attempt
            .targets
            .iter()
            .all(|t| t.outcome.as_ref().is_some_and(ReservationOutcome::is_granted))
        {
            self.start_commit(attempt_id);
            return None;
        }

        self.roll_back(attempt_id)
    }

    /// Phase two: every reservation was granted
    fn start_commit(&mut self, attempt_id: AttemptId) {
        let Some(attempt) = self.attempts.get_mut(&attempt_id) else {
            return;
        };
        attempt.phase = AttemptPhase::Committing;
        attempt.replies = 0;

        let commits: Vec<(usize, BundleId, Arc<dyn LeaseClient>)> = attempt
            .targets
            .iter()
            .map(|t| (t.bundle.index, t.bundle, t.client.clone()))
            .collect();

        debug!(
            attempt = attempt_id,
            commits = commits.len(),
            "All reservations granted, committing"
        );
        for (bundle_index, bundle, client) in commits {
            self.spawn_commit(attempt_id, bundle_index, bundle, client);
        }
    }

    /// Cancel exactly the granted reservations of a failed attempt
    fn roll_back(&mut self, attempt_id: AttemptId) -> Option<AttemptResolution> {
        let LeaseAttempt {
            group_id,
            group,
            prior_state,
            targets,
            callbacks,
            ..
        } = self.attempts.remove(&attempt_id)?;

        let mut granted = 0;
        let mut denied = 0;
        let mut cause = None;
        for target in targets {
            let error = match target.outcome {
                Some(ReservationOutcome::Granted) => {
                    granted += 1;
                    self.spawn_cancel(target.bundle, target.client);
                    continue;
                }
                Some(ReservationOutcome::Failed(e)) => e,
                Some(ReservationOutcome::Denied) | None => PgschedError::ReservationDenied(
                    format!("bundle {} on node {}", target.bundle, target.node_id),
                ),
            };
            denied += 1;
            cause.get_or_insert(error);
        }

        let cause = cause.unwrap_or_else(|| {
            PgschedError::Internal(format!("attempt {} rolled back with no denial", attempt_id))
        });

        info!(
            attempt = attempt_id,
            group_id = %group_id,
            granted,
            denied,
            cause = %cause,
            "Reservation failed, returning granted bundles"
        );

        Some(AttemptResolution {
            attempt: attempt_id,
            group,
            prior_state,
            outcome: AttemptOutcome::RolledBack {
                granted,
                denied,
                cause,
            },
            callbacks,
        })
    }

    async fn on_commit(
        &mut self,
        attempt_id: AttemptId,
        bundle_index: usize,
        result: PgschedResult<()>,
    ) -> Option<AttemptResolution> {
        let attempt = match self.attempts.get_mut(&attempt_id) {
            Some(attempt) if attempt.phase == AttemptPhase::Committing => attempt,
            _ => {
                debug!(attempt = attempt_id, bundle_index, "Ignoring stale commit reply");
                return None;
            }
        };
        let target = attempt
            .targets
            .iter_mut()
            .find(|t| t.bundle.index == bundle_index && t.commit.is_none())?;
        target.commit = Some(result);
        attempt.replies += 1;

        if !attempt.all_replied() {
            return None;
        }

        let LeaseAttempt {
            group,
            prior_state,
            targets,
            callbacks,
            ..
        } = self.attempts.remove(&attempt_id)?;
        let mut commit_failures = Vec::new();
        {
            let mut g = group.write().await;
            for target in targets {
                if let Some(bundle) = g.bundles.get_mut(target.bundle.index) {
                    bundle.state = BundleState::Committed;
                }
                if let Some(Err(error)) = target.commit {
                    error!(
                        attempt = attempt_id,
                        bundle = %target.bundle,
                        node = %target.node_id,
                        error = %error,
                        "Commit failed after grant, node may hold an unconfirmed lease"
                    );
                    commit_failures.push(CommitFailure {
                        bundle: target.bundle,
                        node_id: target.node_id,
                        error,
                    });
                }
            }
        }

        Some(AttemptResolution {
            attempt: attempt_id,
            group,
            prior_state,
            outcome: AttemptOutcome::Committed { commit_failures },
            callbacks,
        })
    }

    fn spawn_reservation(
        &self,
        attempt: AttemptId,
        bundle_index: usize,
        bundle: BundleId,
        resources: ResourceSet,
        client: Arc<dyn LeaseClient>,
    ) {
        let events = self.events.clone();
        let timeout = self.config.reservation_timeout();

        tokio::spawn(async move {
            let request = client.request_reservation(bundle, &resources);
            tokio::pin!(request);

            let (outcome, timed_out) = tokio::select! {
                reply = &mut request => (ReservationOutcome::from_reply(reply), false),
                _ = tokio::time::sleep(timeout) => {
                    let error = PgschedError::Timeout(format!(
                        "no reply for bundle {} from {} within {:?}",
                        bundle,
                        client.address(),
                        timeout
                    ));
                    (ReservationOutcome::Failed(error), true)
                }
            };
            let _ = events.send(CoordinatorEvent::Reservation {
                attempt,
                bundle_index,
                outcome,
            });

            if timed_out {
                if let Ok(ReservationReply::Granted) = request.await {
                    let _ = events.send(CoordinatorEvent::LateGrant {
                        attempt,
                        bundle,
                        client: client.clone(),
                    });
                }
            }
        });
    }

    fn spawn_commit(
        &self,
        attempt: AttemptId,
        bundle_index: usize,
        bundle: BundleId,
        client: Arc<dyn LeaseClient>,
    ) {
        let events = self.events.clone();
        let max_attempts = self.config.commit_max_attempts.max(1);
        let timeout = self.config.reservation_timeout();
        let backoff = self.config.commit_retry_backoff();

        tokio::spawn(async move {
            let result = commit_with_retry(client, bundle, max_attempts, timeout, backoff).await;
            let _ = events.send(CoordinatorEvent::Commit {
                attempt,
                bundle_index,
                result,
            });
        });
    }

    fn spawn_cancel(&self, bundle: BundleId, client: Arc<dyn LeaseClient>) {
        let timeout = self.config.reservation_timeout();
        tokio::spawn(async move {
            let node = client.address().clone();
            match tokio::time::timeout(timeout, client.cancel(bundle)).await {
                Ok(Ok(())) => debug!(bundle = %bundle, node = %node, "Reservation returned"),
                Ok(Err(e)) => warn!(
                    bundle = %bundle,
                    node = %node,
                    error = %e,
                    "Failed to return reservation"
                ),
                Err(_) => warn!(bundle = %bundle, node = %node, "Returning reservation timed out"),
            }
        });
    }
}

/// Commit one bundle, retrying up to `max_attempts` times
///
/// Returns the last error once every try has failed.
async fn commit_with_retry(
    client: Arc<dyn LeaseClient>,
    bundle: BundleId,
    max_attempts: u32,
    timeout: Duration,
    backoff: Duration,
) -> PgschedResult<()> {
    let mut last_error =
        PgschedError::Internal(format!("commit of {} was never attempted", bundle));

    for try_number in 1..=max_attempts {
        last_error = match tokio::time::timeout(timeout, client.commit(bundle)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => PgschedError::Timeout(format!(
                "commit of {} to {} timed out after {:?}",
                bundle,
                client.address(),
                timeout
            )),
        };
        warn!(
            bundle = %bundle,
            node = %client.address(),
            try_number,
            max_attempts,
            error = %last_error,
            "Commit attempt failed"
        );
        if try_number < max_attempts {
            tokio::time::sleep(backoff).await;
        }
    }

    Err(last_error)
}
