// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor's change-notification stream.
//!
//! A subscriber asks for every change to some class of entities since a
//! [`ResumeToken`], and gets back a batch of events plus a new token to use
//! for the next call. Event payloads are opaque JSON snapshots of the entity
//! that changed; the typed views in this module interpret the two kinds of
//! entity the HA core cares about (VMs and tasks).

use async_trait::async_trait;
use ha_types::{HostId, OperationId, PowerState, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque cursor into the notification stream
///
/// The empty token asks for the stream from whatever point the hypervisor
/// considers the beginning.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Which events a subscription wants to see
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventFilter {
    /// Changes to any VM in the pool.
    Vms,
    /// Changes to one specific task.
    Task(OperationId),
}

/// The kind of entity an event describes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Vm,
    Task,
    #[serde(other)]
    Other,
}

impl EntityKind {
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Vm => "vm",
            EntityKind::Task => "task",
            EntityKind::Other => "other",
        }
    }
}

/// One change notification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EntityKind,
    /// hypervisor-side reference to the entity that changed
    pub reference: String,
    pub snapshot: serde_json::Value,
}

impl EventRecord {
    pub fn vm(snapshot: &VmSnapshot) -> Self {
        EventRecord {
            kind: EntityKind::Vm,
            reference: format!("vm:{}", snapshot.name_label),
            snapshot: serde_json::json!(snapshot),
        }
    }

    pub fn task(snapshot: &TaskSnapshot) -> Self {
        EventRecord {
            kind: EntityKind::Task,
            reference: format!("task:{}", snapshot.id),
            snapshot: serde_json::json!(snapshot),
        }
    }
}

/// Result of one subscription cycle
#[derive(Clone, Debug, Default)]
pub struct EventBatch {
    /// token to pass to the next subscription call
    pub token: ResumeToken,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EventError {
    #[error("event stream on host {host} is unreachable: {message}")]
    Unreachable { host: HostId, message: String },

    #[error("hypervisor rejected request on host {host}: {message}")]
    Rejected { host: HostId, message: String },
}

/// The hypervisor's notification stream, reached through a particular host
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Waits up to `wait` for events matching `filter` that happened after
    /// `token`.
    ///
    /// An empty batch is a normal result when nothing changed in time.
    async fn subscribe(
        &self,
        host: HostId,
        filter: &EventFilter,
        token: &ResumeToken,
        wait: Duration,
    ) -> Result<EventBatch, EventError>;

    /// Asks the hypervisor to cancel a pending task.
    async fn cancel_operation(
        &self,
        host: HostId,
        operation: OperationId,
    ) -> Result<(), EventError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("event {reference} is a {found} event, not a {expected} event")]
    WrongKind {
        reference: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("malformed {kind} snapshot in event {reference}")]
    Malformed {
        kind: &'static str,
        reference: String,
        #[source]
        err: serde_json::Error,
    },
}

/// Power states as the hypervisor reports them
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPowerState {
    Halted,
    Paused,
    Running,
    Suspended,
    #[serde(other)]
    Unrecognized,
}

impl From<VmPowerState> for PowerState {
    fn from(value: VmPowerState) -> Self {
        match value {
            VmPowerState::Halted => PowerState::Stopped,
            // A paused or suspended VM still holds its memory on the host it
            // was running on, and must not be restarted anywhere else.
            VmPowerState::Paused | VmPowerState::Suspended => {
                PowerState::Running
            }
            VmPowerState::Running => PowerState::Running,
            VmPowerState::Unrecognized => PowerState::Unknown,
        }
    }
}

/// Typed view of a VM event's snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub name_label: String,
    pub power_state: VmPowerState,
    /// host the VM is resident on, if any
    #[serde(default)]
    pub resident_on: Option<HostId>,
}

impl VmSnapshot {
    pub fn from_event(event: &EventRecord) -> Result<Self, SnapshotError> {
        parse_snapshot(event, EntityKind::Vm)
    }
}

/// Typed view of a task event's snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: OperationId,
    pub status: TaskStatus,
    /// fraction complete, from 0.0 to 1.0
    #[serde(default)]
    pub progress: f64,
}

impl TaskSnapshot {
    pub fn from_event(event: &EventRecord) -> Result<Self, SnapshotError> {
        parse_snapshot(event, EntityKind::Task)
    }
}

fn parse_snapshot<T: serde::de::DeserializeOwned>(
    event: &EventRecord,
    expected: EntityKind,
) -> Result<T, SnapshotError> {
    if event.kind != expected {
        return Err(SnapshotError::WrongKind {
            reference: event.reference.clone(),
            expected: expected.label(),
            found: event.kind.label(),
        });
    }
    T::deserialize(&event.snapshot).map_err(|err| SnapshotError::Malformed {
        kind: expected.label(),
        reference: event.reference.clone(),
        err,
    })
}
