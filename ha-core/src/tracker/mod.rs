// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracking where every VM is running, and in what power state.
//!
//! One [`StateTracker`] task runs per tracked cluster. It subscribes to the
//! hypervisor's VM notifications through the cluster's pool coordinator,
//! applies each notification to the cluster's placement map, and records the
//! unexpected ones as pending changes for the HA manager to drain.
//!
//! The resumption cursor is committed only after a whole batch has been
//! applied. A tracker that is stopped and started again picks up exactly
//! where the last one left off.

mod naming;
mod store;
mod transition;

pub use naming::VmNamePolicy;
pub use store::{ChangeSet, ClusterState, ClusterStore, PlacementStore};
pub use transition::{classify, Disposition};

use crate::agent::{send_with_timeout, AgentClient, Answer, Command};
use crate::backoff::{next_delay, subscription_retry_policy, Backoff};
use crate::events::{
    EventFilter, EventRecord, EventSource, SnapshotError, VmSnapshot,
};
use ha_types::{HostId, Placement, PowerState};
use slog::{debug, info, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// Tunables for a tracker task
#[derive(Clone, Debug)]
pub struct TrackerParams {
    /// Naming convention suffix identifying VMs this deployment manages.
    pub instance_name: String,
    /// How long one subscription call may wait for new events.
    pub subscribe_wait: Duration,
    /// Discard the first batch of a fresh subscription as history.
    pub skip_initial_history: bool,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Deadline for re-checking a VM reported as stopped.
    pub recheck_timeout: Duration,
}

pub struct StateTracker {
    log: Logger,
    cluster: ClusterStore,
    coordinator: HostId,
    events: Arc<dyn EventSource>,
    agent: Arc<dyn AgentClient>,
    names: VmNamePolicy,
    params: TrackerParams,
}

impl StateTracker {
    pub fn new(
        log: &Logger,
        cluster: ClusterStore,
        coordinator: HostId,
        events: Arc<dyn EventSource>,
        agent: Arc<dyn AgentClient>,
        params: TrackerParams,
    ) -> Self {
        let log = log.new(slog::o!(
            "component" => "StateTracker",
            "cluster_id" => cluster.cluster_id().to_string(),
            "coordinator" => coordinator.to_string(),
        ));
        let names = VmNamePolicy::new(params.instance_name.clone());
        StateTracker { log, cluster, coordinator, events, agent, names, params }
    }

    /// Starts the tracker loop in its own tokio task.
    pub fn spawn(self) -> TrackerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(stop_rx));
        TrackerHandle { stop_tx, join }
    }

    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let log = &self.log;
        let mut retry = subscription_retry_policy(
            self.params.retry_initial,
            self.params.retry_max,
        );
        // A tracker resuming from a committed cursor has no history to skip.
        let mut skip_history = self.params.skip_initial_history
            && self.cluster.lock().resume_token().is_empty();
        info!(log, "starting"; "skip_history" => skip_history);

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let cycle_start = Instant::now();
            let token = self.cluster.lock().resume_token().clone();
            let result = tokio::select! {
                _ = stop_rx.changed() => break,
                result = self.events.subscribe(
                    self.coordinator,
                    &EventFilter::Vms,
                    &token,
                    self.params.subscribe_wait,
                ) => result,
            };

            let batch = match result {
                Ok(batch) => {
                    retry.reset();
                    batch
                }
                Err(error) => {
                    let delay = next_delay(&mut retry);
                    warn!(
                        log,
                        "failed to subscribe to VM events";
                        "error" => %error,
                        "retry_in" => ?delay,
                    );
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            if batch.events.is_empty() {
                // No history to skip after all.
                skip_history = false;
                self.cluster.lock().commit_resume_token(batch.token);
                // A source may return an empty batch before the wait is up.
                // Don't ask again sooner than a full wait would have.
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep_until(
                        cycle_start + self.params.subscribe_wait,
                    ) => {}
                }
                continue;
            }

            if skip_history {
                skip_history = false;
                info!(
                    log,
                    "discarding initial batch as history";
                    "events" => batch.events.len(),
                );
            } else {
                debug!(
                    log,
                    "received VM events";
                    "events" => batch.events.len(),
                    "token" => %token,
                );
                let mut stopped = false;
                for event in &batch.events {
                    stopped = tokio::select! {
                        _ = stop_rx.changed() => true,
                        _ = self.record_event(event) => false,
                    };
                    if stopped {
                        break;
                    }
                }
                if stopped {
                    // The batch is replayed from the old cursor on restart.
                    // Applying an event twice records nothing new.
                    info!(log, "stopped mid-batch; cursor not advanced");
                    break;
                }
            }
            self.cluster.lock().commit_resume_token(batch.token);
        }

        info!(log, "stopped");
    }

    async fn record_event(&self, event: &EventRecord) {
        let snapshot = match VmSnapshot::from_event(event) {
            Ok(snapshot) => snapshot,
            Err(error @ SnapshotError::WrongKind { .. }) => {
                debug!(self.log, "ignoring event"; "error" => %error);
                return;
            }
            Err(error @ SnapshotError::Malformed { .. }) => {
                warn!(
                    self.log,
                    "skipping malformed VM event";
                    "error" => %error,
                    "reference" => &event.reference,
                );
                return;
            }
        };

        let name = snapshot.name_label.as_str();
        if self.names.is_migration_transient(name) {
            debug!(self.log, "ignoring migration target"; "vm" => name);
            return;
        }
        if !self.names.is_managed(name) {
            return;
        }

        let log = self.log.new(slog::o!("vm" => name.to_string()));
        let mut state = PowerState::from(snapshot.power_state);
        if state == PowerState::Stopped {
            state =
                self.recheck_stopped(&log, name, snapshot.resident_on).await;
        }

        let reported = Placement::new(snapshot.resident_on, state);
        let (previous, disposition) =
            self.cluster.lock().apply(name, reported, self.coordinator);
        if disposition.report_change {
            info!(
                log,
                "VM state changed";
                "previous" => %previous,
                "current" => %reported,
            );
        } else {
            debug!(
                log,
                "VM state recorded";
                "previous" => %previous,
                "current" => %reported,
                "updated" => disposition.update_map,
            );
        }
    }

    /// Asks the hypervisor directly whether a VM reported as stopped really
    /// is.
    ///
    /// Stopped notifications can race with a VM starting back up. If the
    /// check fails, the notification is taken at its word.
    async fn recheck_stopped(
        &self,
        log: &Logger,
        vm_name: &str,
        resident_on: Option<HostId>,
    ) -> PowerState {
        let host = resident_on.unwrap_or(self.coordinator);
        let result = send_with_timeout(
            &*self.agent,
            host,
            Command::CheckVm { vm_name: vm_name.to_string() },
            self.params.recheck_timeout,
        )
        .await;
        match result {
            Ok(Answer::VmState(state)) => {
                if state != PowerState::Stopped {
                    info!(
                        log,
                        "re-check contradicts stopped notification";
                        "actual" => %state,
                    );
                }
                state
            }
            Ok(answer) => {
                warn!(
                    log,
                    "unexpected answer re-checking stopped VM";
                    "answer" => ?answer,
                );
                PowerState::Stopped
            }
            Err(error) => {
                warn!(
                    log,
                    "failed to re-check stopped VM";
                    "error" => %error,
                );
                PowerState::Stopped
            }
        }
    }
}

/// Owner's handle on a running tracker task
#[derive(Debug)]
pub struct TrackerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TrackerHandle {
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Signals the tracker to stop and waits for it to finish.
    ///
    /// The tracker notices within one subscription cycle. A batch being
    /// applied when the signal arrives is finished first.
    pub async fn stop(self) -> Result<(), JoinError> {
        // The task may have already exited.
        let _ = self.stop_tx.send(true);
        self.join.await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::{EntityKind, ResumeToken, VmPowerState};
    use crate::sim::{test_setup_log, SimAgent, SimEventSource, SimResponse};
    use ha_types::ClusterId;
    use std::collections::BTreeMap;

    struct Setup {
        log: Logger,
        store: PlacementStore,
        cluster_id: ClusterId,
        coordinator: HostId,
        events: Arc<SimEventSource>,
        agent: Arc<SimAgent>,
    }

    impl Setup {
        fn new(test_name: &str) -> Self {
            Setup {
                log: test_setup_log(test_name),
                store: PlacementStore::new(),
                cluster_id: ClusterId::new_v4(),
                coordinator: HostId::new_v4(),
                events: Arc::new(SimEventSource::new()),
                agent: Arc::new(SimAgent::new()),
            }
        }

        fn params(&self) -> TrackerParams {
            TrackerParams {
                instance_name: "VM".to_string(),
                subscribe_wait: Duration::from_secs(10),
                skip_initial_history: false,
                retry_initial: Duration::from_secs(1),
                retry_max: Duration::from_secs(10),
                recheck_timeout: Duration::from_secs(5),
            }
        }

        fn start(&self, params: TrackerParams) -> TrackerHandle {
            StateTracker::new(
                &self.log,
                self.store.cluster(self.cluster_id),
                self.coordinator,
                self.events.clone(),
                self.agent.clone(),
                params,
            )
            .spawn()
        }

        fn push_vm(
            &self,
            name: &str,
            power_state: VmPowerState,
            resident_on: Option<HostId>,
        ) {
            self.events.push_event(
                self.coordinator,
                EventFilter::Vms,
                EventRecord::vm(&VmSnapshot {
                    name_label: name.to_string(),
                    power_state,
                    resident_on,
                }),
            );
        }

        fn placement(&self, vm: &str) -> Option<Placement> {
            self.store.placement(self.cluster_id, vm)
        }

        fn record(&self, vm: &str, host: HostId, state: PowerState) {
            self.store.record_placement(
                self.cluster_id,
                vm,
                Placement::new(Some(host), state),
            );
        }
    }

    /// Lets the tracker work through everything it has been given.
    ///
    /// Time is paused in these tests, so the clock only moves once every task
    /// is idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions() {
        let setup = Setup::new("test_transitions");
        let (h1, h2) = (HostId::new_v4(), HostId::new_v4());
        setup.record("i-2-1-VM", h1, PowerState::Starting);
        setup.record("i-2-2-VM", h1, PowerState::Running);
        setup.record("i-2-3-VM", h1, PowerState::Stopping);

        setup.push_vm("i-2-1-VM", VmPowerState::Running, Some(h1));
        setup.push_vm("i-2-2-VM", VmPowerState::Running, Some(h2));
        setup.push_vm("i-2-3-VM", VmPowerState::Running, Some(h1));
        let tracker = setup.start(setup.params());
        settle().await;

        assert_eq!(
            setup.placement("i-2-1-VM"),
            Some(Placement::new(Some(h1), PowerState::Running))
        );
        assert_eq!(
            setup.placement("i-2-2-VM"),
            Some(Placement::new(Some(h2), PowerState::Running))
        );
        assert_eq!(
            setup.placement("i-2-3-VM"),
            Some(Placement::new(Some(h1), PowerState::Stopping))
        );
        assert_eq!(
            setup.store.drain_changes(setup.cluster_id),
            BTreeMap::from([(
                "i-2-2-VM".to_string(),
                Placement::new(Some(h2), PowerState::Running)
            )])
        );
        assert!(setup.store.drain_changes(setup.cluster_id).is_empty());

        tracker.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmanaged_and_malformed_events_are_skipped() {
        let setup =
            Setup::new("test_unmanaged_and_malformed_events_are_skipped");
        let h1 = HostId::new_v4();
        setup.push_vm("migrating-i-2-1-VM", VmPowerState::Running, Some(h1));
        setup.push_vm("my-windows-box", VmPowerState::Running, Some(h1));
        setup.push_vm("i-2-1-OTHER", VmPowerState::Running, Some(h1));
        setup.events.push_event(
            setup.coordinator,
            EventFilter::Vms,
            EventRecord {
                kind: EntityKind::Vm,
                reference: "vm:broken".to_string(),
                snapshot: serde_json::json!({ "name_label": "i-2-9-VM" }),
            },
        );
        setup.events.push_event(
            setup.coordinator,
            EventFilter::Vms,
            EventRecord {
                kind: EntityKind::Other,
                reference: "pool:1".to_string(),
                snapshot: serde_json::json!({}),
            },
        );
        setup.push_vm("i-2-5-VM", VmPowerState::Running, Some(h1));

        let tracker = setup.start(setup.params());
        settle().await;
        assert!(tracker.is_running());

        let changes = setup.store.drain_changes(setup.cluster_id);
        assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["i-2-5-VM"]);
        assert_eq!(setup.placement("i-2-9-VM"), None);
        assert_eq!(setup.placement("my-windows-box"), None);
        tracker.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_is_rechecked() {
        let setup = Setup::new("test_stopped_is_rechecked");
        let h1 = HostId::new_v4();
        setup.record("i-2-1-VM", h1, PowerState::Running);
        setup.record("i-2-2-VM", h1, PowerState::Running);

        // The first VM is back up by the time we ask. The re-check for the
        // second fails, so its notification is believed.
        setup.agent.set_response(
            setup.coordinator,
            Command::CheckVm { vm_name: "i-2-1-VM".to_string() },
            SimResponse::Answer(Answer::VmState(PowerState::Running)),
        );
        setup.push_vm("i-2-1-VM", VmPowerState::Halted, None);
        setup.push_vm("i-2-2-VM", VmPowerState::Halted, None);

        let tracker = setup.start(setup.params());
        settle().await;

        assert_eq!(
            setup.placement("i-2-1-VM"),
            Some(Placement::new(Some(h1), PowerState::Running))
        );
        assert_eq!(
            setup.store.drain_changes(setup.cluster_id),
            BTreeMap::from([(
                "i-2-2-VM".to_string(),
                Placement::new(Some(h1), PowerState::Stopped)
            )])
        );
        assert_eq!(setup.agent.calls_to(setup.coordinator), 2);
        tracker.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_restart() {
        let setup = Setup::new("test_resume_after_restart");
        let h1 = HostId::new_v4();
        setup.push_vm("i-2-1-VM", VmPowerState::Running, Some(h1));
        setup.push_vm("i-2-2-VM", VmPowerState::Running, Some(h1));

        let tracker = setup.start(setup.params());
        settle().await;
        tracker.stop().await.unwrap();
        assert_eq!(setup.store.drain_changes(setup.cluster_id).len(), 2);
        assert_eq!(
            setup.store.cluster(setup.cluster_id).lock().resume_token(),
            &ResumeToken::new("2")
        );

        // Nothing is consumed while stopped.
        setup.push_vm("i-2-3-VM", VmPowerState::Running, Some(h1));
        settle().await;
        assert!(setup.store.drain_changes(setup.cluster_id).is_empty());

        let nsubscriptions = setup.events.subscriptions().len();
        let tracker = setup.start(setup.params());
        settle().await;
        let (_, _, token) = &setup.events.subscriptions()[nsubscriptions];
        assert_eq!(token, &ResumeToken::new("2"));
        assert_eq!(
            setup
                .store
                .drain_changes(setup.cluster_id)
                .keys()
                .collect::<Vec<_>>(),
            vec!["i-2-3-VM"]
        );
        tracker.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_initial_history() {
        let setup = Setup::new("test_skip_initial_history");
        let h1 = HostId::new_v4();
        setup.push_vm("i-2-1-VM", VmPowerState::Running, Some(h1));
        setup.push_vm("i-2-2-VM", VmPowerState::Running, Some(h1));

        let mut params = setup.params();
        params.skip_initial_history = true;
        let tracker = setup.start(params);
        settle().await;
        assert!(setup.store.drain_changes(setup.cluster_id).is_empty());
        assert_eq!(setup.placement("i-2-1-VM"), None);

        setup.push_vm("i-2-3-VM", VmPowerState::Running, Some(h1));
        settle().await;
        assert_eq!(
            setup
                .store
                .drain_changes(setup.cluster_id)
                .keys()
                .collect::<Vec<_>>(),
            vec!["i-2-3-VM"]
        );
        tracker.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_errors_are_retried() {
        let setup = Setup::new("test_subscription_errors_are_retried");
        let h1 = HostId::new_v4();
        setup.events.fail_next_subscribes(setup.coordinator, 3);
        setup.push_vm("i-2-1-VM", VmPowerState::Running, Some(h1));

        let tracker = setup.start(setup.params());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(tracker.is_running());
        assert!(setup.events.subscriptions().len() >= 4);
        assert_eq!(setup.store.drain_changes(setup.cluster_id).len(), 1);
        tracker.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_waiting() {
        let setup = Setup::new("test_stop_while_waiting");
        let mut params = setup.params();
        params.subscribe_wait = Duration::from_secs(3600);
        let tracker = setup.start(params);
        settle().await;

        let start = tokio::time::Instant::now();
        tracker.stop().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_rechecks() {
        let setup = Setup::new("test_stop_during_rechecks");
        let h1 = HostId::new_v4();
        for i in 0..20 {
            let name = format!("i-2-{i}-VM");
            setup.record(&name, h1, PowerState::Running);
            setup.push_vm(&name, VmPowerState::Halted, None);
        }
        // Every re-check runs into its deadline.
        setup.agent.set_default(setup.coordinator, SimResponse::Hang);

        let tracker = setup.start(setup.params());
        settle().await;
        let start = tokio::time::Instant::now();
        tracker.stop().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        // The interrupted batch was not committed.
        assert!(setup
            .store
            .cluster(setup.cluster_id)
            .lock()
            .resume_token()
            .is_empty());
        assert!(setup.store.drain_changes(setup.cluster_id).is_empty());

        // A new tracker replays the whole batch.
        setup.agent.set_default(
            setup.coordinator,
            SimResponse::Answer(Answer::VmState(PowerState::Stopped)),
        );
        let tracker = setup.start(setup.params());
        settle().await;
        let changes = setup.store.drain_changes(setup.cluster_id);
        assert_eq!(changes.len(), 20);
        assert_eq!(
            changes["i-2-7-VM"],
            Placement::new(Some(h1), PowerState::Stopped)
        );
        assert_eq!(
            setup.store.cluster(setup.cluster_id).lock().resume_token(),
            &ResumeToken::new("20")
        );
        tracker.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_empty_batches_are_paced() {
        let setup = Setup::new("test_early_empty_batches_are_paced");
        setup.events.set_return_early(true);

        let tracker = setup.start(setup.params());
        // subscribe_wait is 10s.
        tokio::time::sleep(Duration::from_secs(35)).await;
        let nsubscriptions = setup.events.subscriptions().len();
        assert!(
            (3..=5).contains(&nsubscriptions),
            "unexpected subscription count {nsubscriptions}"
        );

        // Events are still picked up on the next cycle.
        let h1 = HostId::new_v4();
        setup.push_vm("i-2-1-VM", VmPowerState::Running, Some(h1));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(setup.store.drain_changes(setup.cluster_id).len(), 1);
        tracker.stop().await.unwrap();
    }
}
