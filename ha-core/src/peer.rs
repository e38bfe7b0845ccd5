// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Corroborating a host's liveness through its peers.
//!
//! Losing our own link to a host is not evidence that the host is down:
//! other hosts on the same network segment may still see it. This probe asks
//! the other `Up` hosts of the same cluster (and the same hypervisor kind) to
//! check on the target, and takes the first decisive answer.

use crate::agent::send_with_timeout;
use crate::agent::{
    AgentClient, AgentError, Answer, ClusterMembership, Command,
};
use crate::probe::{interpreter_for, verdict_from_result, Probe};
use async_trait::async_trait;
use ha_types::{Host, HostId, HostStatus, HypervisorKind, Verdict};
use slog::{debug, info, warn, Logger};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

type PeerReply = (HostId, Result<Answer, AgentError>);

/// Tunables for peer fan-out
#[derive(Clone, Debug)]
pub struct PeerProbeParams {
    /// Overall deadline for getting a decisive answer from any peer.
    pub fanout_timeout: Duration,
    /// Deadline for each individual peer request.
    pub per_peer_timeout: Duration,
    /// Maximum number of peers asked at once.
    pub max_parallel_peers: usize,
}

pub struct PeerProbe {
    log: Logger,
    membership: Arc<dyn ClusterMembership>,
    agent: Arc<dyn AgentClient>,
    kinds: BTreeSet<HypervisorKind>,
    params: PeerProbeParams,
}

impl PeerProbe {
    pub const NAME: &'static str = "peer";

    pub fn new(
        log: &Logger,
        membership: Arc<dyn ClusterMembership>,
        agent: Arc<dyn AgentClient>,
        kinds: BTreeSet<HypervisorKind>,
        params: PeerProbeParams,
    ) -> Self {
        let log = log.new(slog::o!("probe" => Self::NAME));
        PeerProbe { log, membership, agent, kinds, params }
    }

    /// Returns the peers eligible to vouch for `target`, in membership order.
    async fn eligible_peers(
        &self,
        log: &Logger,
        target: &Host,
    ) -> Option<Vec<Host>> {
        let hosts =
            match self.membership.hosts_in_cluster(target.cluster_id).await {
                Ok(hosts) => hosts,
                Err(error) => {
                    warn!(
                        log,
                        "failed to list cluster members";
                        "error" => %error,
                    );
                    return None;
                }
            };
        Some(
            hosts
                .into_iter()
                .filter(|peer| {
                    peer.id != target.id
                        && peer.status == HostStatus::Up
                        && peer.hypervisor == target.hypervisor
                })
                .collect(),
        )
    }

    /// Asks peers about `target` and returns the first decisive answer.
    pub async fn probe_host_via_peers(&self, target: &Host) -> Verdict {
        let log = self.log.new(slog::o!("target" => target.id.to_string()));
        let Some(peers) = self.eligible_peers(&log, target).await else {
            return Verdict::Unknown;
        };
        if peers.is_empty() {
            info!(log, "no eligible peers to corroborate host liveness");
            return Verdict::Unknown;
        }

        let deadline = Instant::now() + self.params.fanout_timeout;
        let max_parallel = self.params.max_parallel_peers.max(1);

        // Each peer request runs in its own tokio task and reports back over
        // this channel. Once we return, the receiver is dropped and any
        // stragglers' answers are discarded.
        let (tx, mut rx) = mpsc::channel(peers.len());
        let mut waiting = peers.into_iter();
        let mut in_flight = 0;

        loop {
            while in_flight < max_parallel {
                let Some(peer) = waiting.next() else { break };
                self.dispatch(&log, peer.id, target.id, tx.clone());
                in_flight += 1;
            }
            if in_flight == 0 {
                info!(log, "no peer gave a decisive answer");
                return Verdict::Unknown;
            }

            let (peer, result) =
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(reply)) => reply,
                    // We hold a sender, so the channel can't close.
                    Ok(None) => return Verdict::Unknown,
                    Err(_) => {
                        info!(
                            log,
                            "peer fan-out deadline passed without a \
                             decisive answer";
                            "timeout" => ?self.params.fanout_timeout,
                            "in_flight" => in_flight,
                        );
                        return Verdict::Unknown;
                    }
                };
            in_flight -= 1;

            let peer_log = log.new(slog::o!("peer" => peer.to_string()));
            let verdict = verdict_from_result(&peer_log, result, |answer| {
                interpreter_for(target.hypervisor).host_verdict(answer)
            });
            if verdict.is_decisive() {
                info!(
                    peer_log,
                    "peer vouched for host";
                    "verdict" => %verdict,
                );
                return verdict;
            }
        }
    }

    fn dispatch(
        &self,
        log: &Logger,
        peer: HostId,
        target: HostId,
        tx: mpsc::Sender<PeerReply>,
    ) {
        debug!(log, "asking peer"; "peer" => %peer);
        let agent = Arc::clone(&self.agent);
        let timeout = self.params.per_peer_timeout;
        tokio::spawn(async move {
            let result = send_with_timeout(
                &*agent,
                peer,
                Command::CheckHost { target },
                timeout,
            )
            .await;
            // The prober may have already moved on.
            let _ = tx.send((peer, result)).await;
        });
    }
}

#[async_trait]
impl Probe for PeerProbe {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supports(&self, kind: HypervisorKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn probe_host(&self, host: &Host) -> Verdict {
        self.probe_host_via_peers(host).await
    }

    /// Peers have no view of each other's VMs.
    async fn probe_vm(&self, _vm_name: &str, _host: &Host) -> Verdict {
        Verdict::Unknown
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{test_setup_log, SimAgent, SimMembership, SimResponse};
    use ha_types::{ClusterId, PoolRole};

    fn params(max_parallel_peers: usize) -> PeerProbeParams {
        PeerProbeParams {
            fanout_timeout: Duration::from_secs(30),
            per_peer_timeout: Duration::from_secs(5),
            max_parallel_peers,
        }
    }

    fn host(cluster_id: ClusterId, kind: HypervisorKind) -> Host {
        Host {
            id: HostId::new_v4(),
            cluster_id,
            hypervisor: kind,
            status: HostStatus::Up,
            role: PoolRole::Member,
        }
    }

    struct Setup {
        target: Host,
        peers: Vec<Host>,
        agent: Arc<SimAgent>,
        membership: Arc<SimMembership>,
    }

    fn setup(npeers: usize) -> Setup {
        let cluster = ClusterId::new_v4();
        let target = host(cluster, HypervisorKind::XenServer);
        let peers: Vec<_> = (0..npeers)
            .map(|_| host(cluster, HypervisorKind::XenServer))
            .collect();
        let membership = Arc::new(SimMembership::new());
        membership.add_host(target.clone());
        for peer in &peers {
            membership.add_host(peer.clone());
        }
        Setup { target, peers, agent: Arc::new(SimAgent::new()), membership }
    }

    fn probe(log: &Logger, setup: &Setup, max_parallel: usize) -> PeerProbe {
        PeerProbe::new(
            log,
            setup.membership.clone(),
            setup.agent.clone(),
            BTreeSet::from([HypervisorKind::XenServer]),
            params(max_parallel),
        )
    }

    // B times out, then A says the target is alive. C is never asked.
    #[tokio::test(start_paused = true)]
    async fn test_first_decisive_peer_wins() {
        let log = test_setup_log("test_first_decisive_peer_wins");
        let setup = setup(3);
        let (b, a, c) = (&setup.peers[0], &setup.peers[1], &setup.peers[2]);
        let check = Command::CheckHost { target: setup.target.id };
        setup.agent.set_response(b.id, check.clone(), SimResponse::Hang);
        setup.agent.set_response(
            a.id,
            check.clone(),
            SimResponse::Answer(Answer::HostAlive(true)),
        );
        setup.agent.set_response(
            c.id,
            check,
            SimResponse::Answer(Answer::HostAlive(false)),
        );

        let probe = probe(&log, &setup, 1);
        assert_eq!(
            probe.probe_host_via_peers(&setup.target).await,
            Verdict::Alive
        );
        assert_eq!(setup.agent.calls_to(b.id), 1);
        assert_eq!(setup.agent.calls_to(a.id), 1);
        assert_eq!(setup.agent.calls_to(c.id), 0);
        assert_eq!(setup.agent.calls_to(setup.target.id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_dead_answer_is_decisive() {
        let log = test_setup_log("test_peer_dead_answer_is_decisive");
        let setup = setup(2);
        let check = Command::CheckHost { target: setup.target.id };
        setup.agent.set_response(
            setup.peers[0].id,
            check.clone(),
            SimResponse::Unreachable,
        );
        setup.agent.set_response(
            setup.peers[1].id,
            check,
            SimResponse::Delayed(
                Duration::from_secs(1),
                Answer::HostAlive(false),
            ),
        );

        let probe = probe(&log, &setup, 4);
        assert_eq!(
            probe.probe_host_via_peers(&setup.target).await,
            Verdict::Dead
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_decisive_peer_is_unknown() {
        let log = test_setup_log("test_no_decisive_peer_is_unknown");
        let setup = setup(3);
        let check = Command::CheckHost { target: setup.target.id };
        setup.agent.set_response(
            setup.peers[0].id,
            check.clone(),
            SimResponse::Unreachable,
        );
        setup.agent.set_response(
            setup.peers[1].id,
            check.clone(),
            SimResponse::Timeout,
        );
        setup.agent.set_response(
            setup.peers[2].id,
            check,
            SimResponse::Answer(Answer::Failed("busy".to_string())),
        );

        let probe = probe(&log, &setup, 4);
        assert_eq!(
            probe.probe_host_via_peers(&setup.target).await,
            Verdict::Unknown
        );
        for peer in &setup.peers {
            assert_eq!(setup.agent.calls_to(peer.id), 1);
        }
    }

    // All peers hang past the fan-out deadline: the result is Unknown and
    // arrives by the deadline, not after every peer's own timeout.
    #[tokio::test(start_paused = true)]
    async fn test_fanout_deadline() {
        let log = test_setup_log("test_fanout_deadline");
        let setup = setup(2);
        let check = Command::CheckHost { target: setup.target.id };
        for peer in &setup.peers {
            setup.agent.set_response(peer.id, check.clone(), SimResponse::Hang);
        }

        let mut params = params(4);
        params.fanout_timeout = Duration::from_secs(2);
        let probe = PeerProbe::new(
            &log,
            setup.membership.clone(),
            setup.agent.clone(),
            BTreeSet::from([HypervisorKind::XenServer]),
            params,
        );
        let start = Instant::now();
        assert_eq!(
            probe.probe_host_via_peers(&setup.target).await,
            Verdict::Unknown
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_ineligible_peers_are_skipped() {
        let log = test_setup_log("test_ineligible_peers_are_skipped");
        let setup = setup(0);
        let cluster = setup.target.cluster_id;

        let mut down = host(cluster, HypervisorKind::XenServer);
        down.status = HostStatus::Down;
        let kvm = host(cluster, HypervisorKind::Kvm);
        let other_cluster =
            host(ClusterId::new_v4(), HypervisorKind::XenServer);
        for peer in [&down, &kvm, &other_cluster] {
            setup.membership.add_host(peer.clone());
            setup.agent.set_default(
                peer.id,
                SimResponse::Answer(Answer::HostAlive(true)),
            );
        }

        let probe = probe(&log, &setup, 4);
        assert_eq!(
            probe.probe_host_via_peers(&setup.target).await,
            Verdict::Unknown
        );
        assert!(setup.agent.calls().is_empty());
    }

    #[tokio::test]
    async fn test_membership_failure_is_unknown() {
        let log = test_setup_log("test_membership_failure_is_unknown");
        let setup = setup(2);
        setup.membership.set_unavailable(true);
        let probe = probe(&log, &setup, 4);
        assert_eq!(probe.probe_host(&setup.target).await, Verdict::Unknown);
        assert_eq!(
            probe.probe_vm("i-2-3-VM", &setup.target).await,
            Verdict::Unknown
        );
    }
}
