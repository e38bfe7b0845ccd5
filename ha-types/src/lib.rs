// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the HA core and the HA manager that consumes it.
//!
//! None of these types are owned by the core: hosts and clusters are created
//! by cluster management, and the core only reads them. Placements and
//! verdicts are what the core hands back.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self)
            }
        }
    };
}

uuid_newtype!(
    /// Unique identifier of a physical host
    HostId
);
uuid_newtype!(
    /// Unique identifier of a cluster of hosts
    ClusterId
);
uuid_newtype!(
    /// Identifier of a long-running hypervisor operation (a "task")
    OperationId
);

/// Which hypervisor a host runs
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorKind {
    XenServer,
    Kvm,
    #[serde(rename = "vmware")]
    VMware,
    Simulator,
}

impl HypervisorKind {
    pub fn label(&self) -> &'static str {
        match self {
            HypervisorKind::XenServer => "xen_server",
            HypervisorKind::Kvm => "kvm",
            HypervisorKind::VMware => "vmware",
            HypervisorKind::Simulator => "simulator",
        }
    }
}

impl fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Administrative status of a host, as recorded by cluster management
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Up,
    Down,
    Disconnected,
    Alert,
    Maintenance,
    Unknown,
}

/// A host's role within its hypervisor pool
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PoolRole {
    Member,
    /// The host that owns the pool-wide event stream.
    Coordinator,
}

/// A physical host, as seen by the HA core
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Host {
    pub id: HostId,
    pub cluster_id: ClusterId,
    pub hypervisor: HypervisorKind,
    pub status: HostStatus,
    pub role: PoolRole,
}

/// Power state of a virtual machine, as tracked by the HA core
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Unknown,
}

impl PowerState {
    pub fn label(&self) -> &'static str {
        match self {
            PowerState::Starting => "starting",
            PowerState::Running => "running",
            PowerState::Stopping => "stopping",
            PowerState::Stopped => "stopped",
            PowerState::Migrating => "migrating",
            PowerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Answer to "is this host (or VM) alive?"
///
/// `Unknown` means no decisive signal was found. It must never be read as
/// `Dead`: callers should not fence on it.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Alive,
    Dead,
    #[default]
    Unknown,
}

impl Verdict {
    /// Returns true for `Alive` and `Dead`.
    pub fn is_decisive(&self) -> bool {
        !matches!(self, Verdict::Unknown)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Alive => "alive",
            Verdict::Dead => "dead",
            Verdict::Unknown => "unknown",
        }
    }
}

impl From<bool> for Verdict {
    fn from(alive: bool) -> Self {
        if alive {
            Verdict::Alive
        } else {
            Verdict::Dead
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Where a VM is and what power state it is in
///
/// This is both the value of the tracker's placement map and the value of a
/// reported change. `host` is `None` when the VM is not resident anywhere.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct Placement {
    pub host: Option<HostId>,
    pub state: PowerState,
}

impl Placement {
    pub fn new(host: Option<HostId>, state: PowerState) -> Self {
        Self { host, state }
    }

    /// The placement assumed for a VM the tracker has never seen.
    pub const fn never_seen() -> Self {
        Self { host: None, state: PowerState::Stopped }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(host) => write!(f, "[{}, {}]", host, self.state),
            None => write!(f, "[none, {}]", self.state),
        }
    }
}

/// Status of a long-running hypervisor operation
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

impl TaskStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Pending)
    }
}
