// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-cluster placement and change records.
//!
//! Every cluster gets its own lock. All reads and writes of a cluster's
//! placement map, its pending changes and its resumption cursor happen under
//! that lock, so clusters never contend with each other and no two writers
//! race on the same VM.

use super::transition::{classify, Disposition};
use crate::events::ResumeToken;
use ha_types::{ClusterId, HostId, Placement};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Net changes since the last drain, keyed by VM name
pub type ChangeSet = BTreeMap<String, Placement>;

#[derive(Debug, Default)]
pub struct ClusterState {
    placements: BTreeMap<String, Placement>,
    changes: ChangeSet,
    resume_token: ResumeToken,
}

impl ClusterState {
    /// Applies a reported placement for `vm` and returns what was done.
    ///
    /// A VM missing from the map is assumed to have been stopped. A reported
    /// change that carries no host is attributed to the VM's previous host,
    /// or failing that to `fallback_host`.
    pub fn apply(
        &mut self,
        vm: &str,
        reported: Placement,
        fallback_host: HostId,
    ) -> (Placement, Disposition) {
        let previous = self
            .placements
            .get(vm)
            .copied()
            .unwrap_or(Placement::never_seen());
        let disposition = classify(&previous, reported.state, reported.host);

        if disposition.update_map {
            self.placements.insert(vm.to_string(), reported);
        }
        if disposition.report_change {
            let host =
                reported.host.or(previous.host).unwrap_or(fallback_host);
            // Overwrite rather than append: callers only see the net effect.
            self.changes.insert(
                vm.to_string(),
                Placement::new(Some(host), reported.state),
            );
        }
        (previous, disposition)
    }

    pub fn placement(&self, vm: &str) -> Option<Placement> {
        self.placements.get(vm).copied()
    }

    pub fn set_placement(&mut self, vm: &str, placement: Placement) {
        self.placements.insert(vm.to_string(), placement);
    }

    pub fn remove_placement(&mut self, vm: &str) -> Option<Placement> {
        self.placements.remove(vm)
    }

    /// Returns every pending change and clears the set.
    pub fn drain_changes(&mut self) -> ChangeSet {
        std::mem::take(&mut self.changes)
    }

    pub fn pending_changes(&self) -> usize {
        self.changes.len()
    }

    pub fn resume_token(&self) -> &ResumeToken {
        &self.resume_token
    }

    pub fn commit_resume_token(&mut self, token: ResumeToken) {
        self.resume_token = token;
    }
}

/// Handle to one cluster's state
#[derive(Clone, Debug)]
pub struct ClusterStore {
    cluster_id: ClusterId,
    state: Arc<Mutex<ClusterState>>,
}

impl ClusterStore {
    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// Locks this cluster's state.
    ///
    /// The critical sections never panic partway through an update, so a
    /// poisoned lock still holds consistent state.
    pub fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The placement records of every cluster, interned by cluster id
#[derive(Debug, Default)]
pub struct PlacementStore {
    clusters: Mutex<BTreeMap<ClusterId, ClusterStore>>,
}

impl PlacementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store for `cluster_id`, creating it on first use.
    pub fn cluster(&self, cluster_id: ClusterId) -> ClusterStore {
        let mut clusters =
            self.clusters.lock().unwrap_or_else(PoisonError::into_inner);
        clusters
            .entry(cluster_id)
            .or_insert_with(|| ClusterStore {
                cluster_id,
                state: Arc::new(Mutex::new(ClusterState::default())),
            })
            .clone()
    }

    /// Returns the store for `cluster_id` if anything was ever recorded
    /// there.
    fn existing(&self, cluster_id: ClusterId) -> Option<ClusterStore> {
        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cluster_id)
            .cloned()
    }

    pub fn drain_changes(&self, cluster_id: ClusterId) -> ChangeSet {
        self.existing(cluster_id)
            .map(|cluster| cluster.lock().drain_changes())
            .unwrap_or_default()
    }

    pub fn placement(
        &self,
        cluster_id: ClusterId,
        vm: &str,
    ) -> Option<Placement> {
        self.existing(cluster_id)?.lock().placement(vm)
    }

    pub fn record_placement(
        &self,
        cluster_id: ClusterId,
        vm: &str,
        placement: Placement,
    ) {
        self.cluster(cluster_id).lock().set_placement(vm, placement)
    }

    pub fn forget_placement(
        &self,
        cluster_id: ClusterId,
        vm: &str,
    ) -> Option<Placement> {
        self.existing(cluster_id)?.lock().remove_placement(vm)
    }
}
