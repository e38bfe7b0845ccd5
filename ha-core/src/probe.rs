// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness probes: single checks that produce a [`Verdict`].
//!
//! A probe never asserts that something is dead because it failed to talk to
//! it. Every transport failure, timeout, or unexpected answer becomes
//! [`Verdict::Unknown`].

use crate::agent::send_with_timeout;
use crate::agent::{AgentClient, AgentError, Answer, Command};
use async_trait::async_trait;
use ha_types::{Host, HypervisorKind, PowerState, Verdict};
use slog::{debug, info, Logger};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// A source of liveness evidence about hosts and VMs
#[async_trait]
pub trait Probe: Send + Sync {
    /// Name used to refer to this probe in configuration.
    fn name(&self) -> &str;

    /// Whether this probe knows how to check hosts of this kind.
    fn supports(&self, kind: HypervisorKind) -> bool;

    async fn probe_host(&self, host: &Host) -> Verdict;

    async fn probe_vm(&self, vm_name: &str, host: &Host) -> Verdict;
}

/// Converts an agent's answer into a [`Verdict`]
///
/// Each hypervisor kind may read answers differently. The defaults treat
/// transitional VM states as inconclusive.
pub trait AnswerInterpreter: Send + Sync {
    fn host_verdict(&self, answer: &Answer) -> Verdict {
        match answer {
            Answer::HostAlive(alive) => Verdict::from(*alive),
            Answer::VmState(_) | Answer::Failed(_) => Verdict::Unknown,
        }
    }

    fn vm_verdict(&self, answer: &Answer) -> Verdict {
        match answer {
            Answer::VmState(PowerState::Running) => Verdict::Alive,
            Answer::VmState(PowerState::Stopped) => Verdict::Dead,
            Answer::VmState(_) | Answer::HostAlive(_) | Answer::Failed(_) => {
                Verdict::Unknown
            }
        }
    }
}

/// Interpretation used by XenServer, KVM and VMware agents
pub struct DefaultInterpreter;

impl AnswerInterpreter for DefaultInterpreter {}

/// Interpretation used by simulated hosts
///
/// The simulator's states are authoritative: a simulated VM that is not
/// running is dead.
pub struct SimulatorInterpreter;

impl AnswerInterpreter for SimulatorInterpreter {
    fn vm_verdict(&self, answer: &Answer) -> Verdict {
        match answer {
            Answer::VmState(state) => {
                Verdict::from(*state == PowerState::Running)
            }
            Answer::HostAlive(_) | Answer::Failed(_) => Verdict::Unknown,
        }
    }
}

pub fn interpreter_for(kind: HypervisorKind) -> &'static dyn AnswerInterpreter {
    match kind {
        HypervisorKind::Simulator => &SimulatorInterpreter,
        HypervisorKind::XenServer
        | HypervisorKind::Kvm
        | HypervisorKind::VMware => &DefaultInterpreter,
    }
}

/// Maps the outcome of one agent request onto a verdict, logging anything
/// that prevented a decisive answer.
pub(crate) fn verdict_from_result(
    log: &Logger,
    result: Result<Answer, AgentError>,
    interpret: impl FnOnce(&Answer) -> Verdict,
) -> Verdict {
    match result {
        Ok(Answer::Failed(message)) => {
            info!(log, "agent could not answer"; "message" => message);
            Verdict::Unknown
        }
        Ok(answer) => {
            let verdict = interpret(&answer);
            debug!(
                log,
                "agent answered";
                "answer" => ?answer,
                "verdict" => %verdict,
            );
            verdict
        }
        Err(error @ AgentError::Unreachable { .. }) => {
            info!(log, "agent unreachable"; "error" => %error);
            Verdict::Unknown
        }
        Err(error @ AgentError::Timeout { .. }) => {
            info!(log, "agent request timed out"; "error" => %error);
            Verdict::Unknown
        }
    }
}

/// Asks a host's own agent about the host, or about one of its VMs
pub struct DirectProbe {
    log: Logger,
    agent: Arc<dyn AgentClient>,
    kinds: BTreeSet<HypervisorKind>,
    command_timeout: Duration,
}

impl DirectProbe {
    pub const NAME: &'static str = "direct";

    pub fn new(
        log: &Logger,
        agent: Arc<dyn AgentClient>,
        kinds: BTreeSet<HypervisorKind>,
        command_timeout: Duration,
    ) -> Self {
        let log = log.new(slog::o!("probe" => Self::NAME));
        DirectProbe { log, agent, kinds, command_timeout }
    }
}

#[async_trait]
impl Probe for DirectProbe {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supports(&self, kind: HypervisorKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn probe_host(&self, host: &Host) -> Verdict {
        let log = self.log.new(slog::o!("host_id" => host.id.to_string()));
        let result = send_with_timeout(
            &*self.agent,
            host.id,
            Command::CheckHost { target: host.id },
            self.command_timeout,
        )
        .await;
        verdict_from_result(&log, result, |answer| {
            interpreter_for(host.hypervisor).host_verdict(answer)
        })
    }

    async fn probe_vm(&self, vm_name: &str, host: &Host) -> Verdict {
        let log = self.log.new(slog::o!(
            "host_id" => host.id.to_string(),
            "vm" => vm_name.to_string(),
        ));
        let result = send_with_timeout(
            &*self.agent,
            host.id,
            Command::CheckVm { vm_name: vm_name.to_string() },
            self.command_timeout,
        )
        .await;
        verdict_from_result(&log, result, |answer| {
            interpreter_for(host.hypervisor).vm_verdict(answer)
        })
    }
}
