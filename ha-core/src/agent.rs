// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the collaborators that live outside the HA core: the agents
//! running on each host, and the cluster membership records.

use async_trait::async_trait;
use ha_types::{ClusterId, Host, HostId, PowerState};
use std::time::Duration;

/// A question the HA core can ask a host's agent
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Command {
    /// Ask the receiving agent whether `target` is alive.
    ///
    /// This is sent either to the target's own agent, or to a peer in the
    /// same cluster which checks on the target independently.
    CheckHost { target: HostId },
    /// Ask the receiving agent for the current power state of a VM.
    CheckVm { vm_name: String },
}

/// What an agent said in response to a [`Command`]
#[derive(Clone, Debug, PartialEq)]
pub enum Answer {
    /// Response to [`Command::CheckHost`].
    HostAlive(bool),
    /// Response to [`Command::CheckVm`].
    VmState(PowerState),
    /// The agent received the command but could not carry it out.
    Failed(String),
}

/// Failures to get any answer out of an agent
///
/// None of these say anything about the health of the host being asked
/// about. Losing our own link to an agent is not evidence that the host is
/// down.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("agent on host {host} is unreachable: {message}")]
    Unreachable { host: HostId, message: String },

    #[error("command to agent on host {host} timed out after {timeout:?}")]
    Timeout { host: HostId, timeout: Duration },
}

/// Sends commands to the agent running on a particular host
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn send_command(
        &self,
        host: HostId,
        command: Command,
    ) -> Result<Answer, AgentError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MembershipError {
    #[error("no such cluster: {0}")]
    NoSuchCluster(ClusterId),

    #[error("cluster membership unavailable: {0}")]
    Unavailable(String),
}

/// Read access to cluster membership, as maintained by cluster management
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// Returns every host in `cluster`, regardless of status.
    async fn hosts_in_cluster(
        &self,
        cluster: ClusterId,
    ) -> Result<Vec<Host>, MembershipError>;
}

/// Sends `command` to `host`, giving up after `timeout`.
///
/// An agent client that never returns is treated the same as one that
/// reports a timeout.
pub(crate) async fn send_with_timeout(
    agent: &dyn AgentClient,
    host: HostId,
    command: Command,
    timeout: Duration,
) -> Result<Answer, AgentError> {
    match tokio::time::timeout(timeout, agent.send_command(host, command))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout { host, timeout }),
    }
}
