// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`HaCore`]: the interface the HA manager uses.

use crate::agent::{AgentClient, ClusterMembership, MembershipError};
use crate::config::CoreConfig;
use crate::events::EventSource;
use crate::investigator::{Investigator, InvestigatorError, Resolution};
use crate::peer::PeerProbe;
use crate::probe::{DirectProbe, Probe};
use crate::tracker::{
    ChangeSet, PlacementStore, StateTracker, TrackerHandle, TrackerParams,
};
use crate::waiter::{OperationHandle, OperationOutcome, OperationWaiter};
use ha_types::{ClusterId, Host, HostId, Placement, PoolRole, Verdict};
use slog::{info, warn, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackerError {
    #[error("cluster {0} has no pool coordinator to listen through")]
    NoCoordinator(ClusterId),

    #[error("failed to look up cluster members")]
    Membership(#[from] MembershipError),
}

/// Result of asking to start tracking a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingStatus {
    /// A tracker is now listening through `coordinator`.
    Started { coordinator: HostId },
    /// A tracker was already running for this cluster.
    AlreadyRunning,
}

/// Assembles an [`HaCore`] from configuration and its collaborators
pub struct HaCoreBuilder {
    log: Logger,
    config: CoreConfig,
    membership: Arc<dyn ClusterMembership>,
    agent: Arc<dyn AgentClient>,
    events: Arc<dyn EventSource>,
    extra_probes: Vec<Arc<dyn Probe>>,
}

impl HaCoreBuilder {
    pub fn new(
        log: &Logger,
        config: CoreConfig,
        membership: Arc<dyn ClusterMembership>,
        agent: Arc<dyn AgentClient>,
        events: Arc<dyn EventSource>,
    ) -> Self {
        HaCoreBuilder {
            log: log.clone(),
            config,
            membership,
            agent,
            events,
            extra_probes: Vec::new(),
        }
    }

    /// Registers another probe, to be placed in the chain by name.
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.extra_probes.push(probe);
        self
    }

    pub fn build(self) -> Result<HaCore, InvestigatorError> {
        let log = self.log.new(slog::o!("component" => "HaCore"));
        let config = self.config;

        let direct: Arc<dyn Probe> = Arc::new(DirectProbe::new(
            &log,
            Arc::clone(&self.agent),
            config.investigator.direct_kinds.clone(),
            config.direct.command_timeout,
        ));
        let peer: Arc<dyn Probe> = Arc::new(PeerProbe::new(
            &log,
            Arc::clone(&self.membership),
            Arc::clone(&self.agent),
            config.investigator.peer_kinds.clone(),
            config.peer.params(),
        ));
        let mut available = vec![direct, peer];
        available.extend(self.extra_probes);
        let investigator = Investigator::from_order(
            &log,
            available,
            &config.investigator.probe_order,
        )?;
        info!(
            log,
            "investigator configured";
            "probe_order" => ?investigator.probe_order(),
        );

        let waiter = OperationWaiter::new(
            &log,
            Arc::clone(&self.events),
            config.waiter.empty_cycles_before_error,
        );
        let tracker_params =
            config.tracker.params(config.direct.command_timeout);

        Ok(HaCore {
            log,
            membership: self.membership,
            agent: self.agent,
            events: self.events,
            investigator,
            waiter,
            placements: PlacementStore::new(),
            tracker_params,
            trackers: Mutex::new(BTreeMap::new()),
        })
    }
}

/// Liveness investigation and VM state reconciliation for a set of clusters
pub struct HaCore {
    log: Logger,
    membership: Arc<dyn ClusterMembership>,
    agent: Arc<dyn AgentClient>,
    events: Arc<dyn EventSource>,
    investigator: Investigator,
    waiter: OperationWaiter,
    placements: PlacementStore,
    tracker_params: TrackerParams,
    trackers: Mutex<BTreeMap<ClusterId, TrackerHandle>>,
}

impl HaCore {
    /// Determines whether `host` is alive.
    ///
    /// `Unknown` means no probe could tell. It must not be treated as `Dead`.
    pub async fn resolve(&self, host: &Host) -> Verdict {
        self.investigator.resolve(host).await
    }

    /// Like [`HaCore::resolve`], also naming the probe that decided.
    pub async fn resolve_host_detailed(&self, host: &Host) -> Resolution {
        self.investigator.resolve_host_detailed(host).await
    }

    /// Determines whether the VM `vm_name` on `host` is alive.
    pub async fn resolve_vm(&self, vm_name: &str, host: &Host) -> Verdict {
        self.investigator.resolve_vm(vm_name, host).await
    }

    /// Returns every VM change seen in `cluster` since the last call.
    pub fn drain_changes(&self, cluster: ClusterId) -> ChangeSet {
        self.placements.drain_changes(cluster)
    }

    pub fn placement(
        &self,
        cluster: ClusterId,
        vm: &str,
    ) -> Option<Placement> {
        self.placements.placement(cluster, vm)
    }

    /// Records where a VM is and what it is doing, as decided by whoever is
    /// starting, stopping or migrating it.
    pub fn record_placement(
        &self,
        cluster: ClusterId,
        vm: &str,
        placement: Placement,
    ) {
        self.placements.record_placement(cluster, vm, placement)
    }

    /// Drops the placement record of a VM that no longer exists, returning
    /// what was recorded.
    ///
    /// A later notification about the VM starts over from "never seen".
    pub fn forget_placement(
        &self,
        cluster: ClusterId,
        vm: &str,
    ) -> Option<Placement> {
        self.placements.forget_placement(cluster, vm)
    }

    /// Waits for a hypervisor operation to finish.
    pub async fn await_operation(
        &self,
        operation: &OperationHandle,
        poll_hint: Duration,
        timeout: Duration,
    ) -> OperationOutcome {
        self.waiter.wait(operation, poll_hint, timeout).await
    }

    /// Starts a tracker for `cluster`, listening through its pool
    /// coordinator.
    pub async fn start_tracking(
        &self,
        cluster: ClusterId,
    ) -> Result<TrackingStatus, TrackerError> {
        let log = self.log.new(slog::o!("cluster_id" => cluster.to_string()));
        let hosts = self.membership.hosts_in_cluster(cluster).await?;
        let Some(coordinator) =
            hosts.iter().find(|h| h.role == PoolRole::Coordinator)
        else {
            warn!(log, "not listening: cluster has no pool coordinator");
            return Err(TrackerError::NoCoordinator(cluster));
        };

        let mut trackers = self.trackers();
        if trackers.get(&cluster).is_some_and(|t| t.is_running()) {
            return Ok(TrackingStatus::AlreadyRunning);
        }
        let tracker = StateTracker::new(
            &self.log,
            self.placements.cluster(cluster),
            coordinator.id,
            Arc::clone(&self.events),
            Arc::clone(&self.agent),
            self.tracker_params.clone(),
        );
        trackers.insert(cluster, tracker.spawn());
        info!(log, "tracking started"; "coordinator" => %coordinator.id);
        Ok(TrackingStatus::Started { coordinator: coordinator.id })
    }

    /// Stops the tracker for `cluster`, returning whether one was running.
    ///
    /// The cluster's placement map and pending changes are kept. Tracking can
    /// be started again later and resumes where it left off.
    pub async fn stop_tracking(&self, cluster: ClusterId) -> bool {
        let Some(tracker) = self.trackers().remove(&cluster) else {
            return false;
        };
        let was_running = tracker.is_running();
        if let Err(error) = tracker.stop().await {
            warn!(
                self.log,
                "tracker task failed";
                "cluster_id" => %cluster,
                "error" => %error,
            );
        }
        was_running
    }

    pub fn is_tracking(&self, cluster: ClusterId) -> bool {
        self.trackers().get(&cluster).is_some_and(|t| t.is_running())
    }

    fn trackers(&self) -> MutexGuard<'_, BTreeMap<ClusterId, TrackerHandle>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
