// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The investigator chain: probes consulted in priority order.
//!
//! Probes are asked one at a time, in the configured order, and the first
//! decisive verdict wins. Later probes are not consulted, so a less
//! trustworthy signal can never overrule a more trustworthy one. Probes are
//! never raced against each other and never put to a vote.

use crate::probe::Probe;
use ha_types::{Host, Verdict};
use slog::{debug, info, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum InvestigatorError {
    #[error("probe {0:?} named in the probe order is not registered")]
    UnknownProbe(String),

    #[error("probe {0:?} appears more than once in the probe order")]
    DuplicateProbe(String),

    #[error("two probes registered with the same name: {0:?}")]
    DuplicateRegistration(String),
}

/// The outcome of an investigation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub verdict: Verdict,
    /// name of the probe that produced a decisive verdict, if any did
    pub decided_by: Option<String>,
}

impl Resolution {
    fn undecided() -> Self {
        Resolution { verdict: Verdict::Unknown, decided_by: None }
    }
}

pub struct Investigator {
    log: Logger,
    probes: Vec<Arc<dyn Probe>>,
}

impl Investigator {
    /// Builds a chain that consults `probes` in the order given.
    pub fn new(log: &Logger, probes: Vec<Arc<dyn Probe>>) -> Self {
        let log = log.new(slog::o!("component" => "Investigator"));
        Investigator { log, probes }
    }

    /// Builds a chain from the probes in `available`, ordered by `order`.
    ///
    /// Registered probes that `order` does not mention are left out of the
    /// chain.
    pub fn from_order(
        log: &Logger,
        available: Vec<Arc<dyn Probe>>,
        order: &[String],
    ) -> Result<Self, InvestigatorError> {
        let mut by_name = BTreeMap::new();
        for probe in available {
            let name = probe.name().to_string();
            if by_name.insert(name.clone(), probe).is_some() {
                return Err(InvestigatorError::DuplicateRegistration(name));
            }
        }

        let mut probes = Vec::with_capacity(order.len());
        for name in order {
            let Some(probe) = by_name.get(name) else {
                return Err(InvestigatorError::UnknownProbe(name.clone()));
            };
            let already_listed = probes
                .iter()
                .any(|p: &Arc<dyn Probe>| p.name() == name.as_str());
            if already_listed {
                return Err(InvestigatorError::DuplicateProbe(name.clone()));
            }
            probes.push(Arc::clone(probe));
        }
        Ok(Self::new(log, probes))
    }

    /// Names of the probes in the chain, in the order they are consulted.
    pub fn probe_order(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    pub async fn resolve(&self, host: &Host) -> Verdict {
        self.resolve_host_detailed(host).await.verdict
    }

    pub async fn resolve_host_detailed(&self, host: &Host) -> Resolution {
        let log = self.log.new(slog::o!(
            "host_id" => host.id.to_string(),
            "hypervisor" => host.hypervisor.label(),
        ));
        for probe in self.supporting(host) {
            let verdict = probe.probe_host(host).await;
            debug!(
                log,
                "probe finished";
                "probe" => probe.name(),
                "verdict" => %verdict,
            );
            if verdict.is_decisive() {
                info!(
                    log,
                    "host liveness resolved";
                    "probe" => probe.name(),
                    "verdict" => %verdict,
                );
                return Resolution {
                    verdict,
                    decided_by: Some(probe.name().to_string()),
                };
            }
        }
        info!(log, "no probe could determine host liveness");
        Resolution::undecided()
    }

    pub async fn resolve_vm(&self, vm_name: &str, host: &Host) -> Verdict {
        let log = self.log.new(slog::o!(
            "host_id" => host.id.to_string(),
            "vm" => vm_name.to_string(),
        ));
        for probe in self.supporting(host) {
            let verdict = probe.probe_vm(vm_name, host).await;
            if verdict.is_decisive() {
                info!(
                    log,
                    "VM liveness resolved";
                    "probe" => probe.name(),
                    "verdict" => %verdict,
                );
                return verdict;
            }
        }
        info!(log, "no probe could determine VM liveness");
        Verdict::Unknown
    }

    fn supporting<'a>(
        &'a self,
        host: &'a Host,
    ) -> impl Iterator<Item = &'a Arc<dyn Probe>> + 'a {
        self.probes.iter().filter(move |p| p.supports(host.hypervisor))
    }
}

impl std::fmt::Debug for Investigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Investigator")
            .field("probes", &self.probe_order())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::test_setup_log;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use ha_types::{
        ClusterId, HostId, HostStatus, HypervisorKind, PoolRole,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A probe that always returns the same verdict and counts its calls
    struct FixedProbe {
        name: &'static str,
        verdict: Verdict,
        kinds: Vec<HypervisorKind>,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(name: &'static str, verdict: Verdict) -> Arc<Self> {
            Arc::new(FixedProbe {
                name,
                verdict,
                kinds: vec![HypervisorKind::XenServer],
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for FixedProbe {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, kind: HypervisorKind) -> bool {
            self.kinds.contains(&kind)
        }

        async fn probe_host(&self, _host: &Host) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }

        async fn probe_vm(&self, _vm_name: &str, _host: &Host) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }
    }

    fn chain(log: &Logger, probes: &[&Arc<FixedProbe>]) -> Investigator {
        let probes = probes
            .iter()
            .map(|p| Arc::clone(*p) as Arc<dyn Probe>)
            .collect();
        Investigator::new(log, probes)
    }

    fn xen_host() -> Host {
        Host {
            id: HostId::new_v4(),
            cluster_id: ClusterId::new_v4(),
            hypervisor: HypervisorKind::XenServer,
            status: HostStatus::Up,
            role: PoolRole::Member,
        }
    }

    #[tokio::test]
    async fn test_first_decisive_probe_short_circuits() {
        let log = test_setup_log("test_first_decisive_probe_short_circuits");
        let p1 = FixedProbe::new("p1", Verdict::Dead);
        let p2 = FixedProbe::new("p2", Verdict::Alive);
        let chain = chain(&log, &[&p1, &p2]);

        let resolution = chain.resolve_host_detailed(&xen_host()).await;
        assert_eq!(resolution.verdict, Verdict::Dead);
        assert_eq!(resolution.decided_by.as_deref(), Some("p1"));
        assert_eq!(p1.calls(), 1);
        assert_eq!(p2.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_falls_through() {
        let log = test_setup_log("test_unknown_falls_through");
        let p1 = FixedProbe::new("p1", Verdict::Unknown);
        let p2 = FixedProbe::new("p2", Verdict::Alive);
        let chain = chain(&log, &[&p1, &p2]);

        assert_eq!(chain.resolve(&xen_host()).await, Verdict::Alive);
        assert_eq!(
            chain.resolve_vm("i-2-3-VM", &xen_host()).await,
            Verdict::Alive
        );
        assert_eq!(p1.calls(), 2);
        assert_eq!(p2.calls(), 2);
    }

    #[tokio::test]
    async fn test_all_unknown_is_unknown() {
        let log = test_setup_log("test_all_unknown_is_unknown");
        let p1 = FixedProbe::new("p1", Verdict::Unknown);
        let p2 = FixedProbe::new("p2", Verdict::Unknown);
        let chain = chain(&log, &[&p1, &p2]);

        let resolution = chain.resolve_host_detailed(&xen_host()).await;
        assert_eq!(resolution, Resolution::undecided());
        assert_eq!(
            chain.resolve_vm("i-2-3-VM", &xen_host()).await,
            Verdict::Unknown
        );
        assert_eq!(p1.calls(), 2);
        assert_eq!(p2.calls(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_probes_are_skipped() {
        let log = test_setup_log("test_unsupported_probes_are_skipped");
        let kvm_only = Arc::new(FixedProbe {
            name: "kvm",
            verdict: Verdict::Dead,
            kinds: vec![HypervisorKind::Kvm],
            calls: AtomicUsize::new(0),
        });
        let xen = FixedProbe::new("xen", Verdict::Alive);
        let chain = chain(&log, &[&kvm_only, &xen]);

        assert_eq!(chain.resolve(&xen_host()).await, Verdict::Alive);
        assert_eq!(kvm_only.calls(), 0);
    }

    #[test]
    fn test_from_order() {
        let log = test_setup_log("test_from_order");
        let available = || -> Vec<Arc<dyn Probe>> {
            ["direct", "peer", "storage"]
                .into_iter()
                .map(|name| {
                    FixedProbe::new(name, Verdict::Unknown) as Arc<dyn Probe>
                })
                .collect()
        };

        let chain = Investigator::from_order(
            &log,
            available(),
            &["storage".to_string(), "direct".to_string()],
        )
        .unwrap();
        assert_eq!(chain.probe_order(), vec!["storage", "direct"]);

        assert_matches!(
            Investigator::from_order(&log, available(), &["ipmi".to_string()]),
            Err(InvestigatorError::UnknownProbe(name)) if name == "ipmi"
        );
        assert_matches!(
            Investigator::from_order(
                &log,
                available(),
                &["peer".to_string(), "peer".to_string()]
            ),
            Err(InvestigatorError::DuplicateProbe(_))
        );

        let mut twice = available();
        twice.push(FixedProbe::new("peer", Verdict::Alive));
        assert_matches!(
            Investigator::from_order(&log, twice, &[]),
            Err(InvestigatorError::DuplicateRegistration(_))
        );
    }
}
