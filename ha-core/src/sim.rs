// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated collaborators for exercising the HA core without a hypervisor.
//!
//! [`SimAgent`], [`SimMembership`] and [`SimEventSource`] implement the
//! collaborator traits entirely in memory. Tests script their responses and
//! inspect what was asked of them afterwards.

use crate::agent::{
    AgentClient, AgentError, Answer, ClusterMembership, Command,
    MembershipError,
};
use crate::events::{
    EventBatch, EventError, EventFilter, EventRecord, EventSource,
    ResumeToken,
};
use async_trait::async_trait;
use ha_types::{ClusterId, Host, HostId, OperationId};
use slog::{Drain, Logger};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Returns a logger for use by the test named `test_name`.
pub fn test_setup_log(test_name: &str) -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, slog::o!("test" => test_name.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a simulated agent responds to one command
#[derive(Clone, Debug)]
pub enum SimResponse {
    Answer(Answer),
    /// The agent can't be reached.
    Unreachable,
    /// The agent client reports a timeout right away.
    Timeout,
    /// The agent never responds.
    Hang,
    /// The agent answers after a delay.
    Delayed(Duration, Answer),
}

#[derive(Default)]
struct SimAgentInner {
    responses: BTreeMap<(HostId, Command), SimResponse>,
    defaults: BTreeMap<HostId, SimResponse>,
    calls: Vec<(HostId, Command)>,
}

/// An [`AgentClient`] whose agents answer from a script
///
/// A command with no scripted response, sent to a host with no default,
/// finds the agent unreachable.
#[derive(Default)]
pub struct SimAgent {
    inner: Mutex<SimAgentInner>,
}

impl SimAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the response of `host`'s agent to `command`.
    pub fn set_response(
        &self,
        host: HostId,
        command: Command,
        response: SimResponse,
    ) {
        lock(&self.inner).responses.insert((host, command), response);
    }

    /// Scripts the response of `host`'s agent to any unscripted command.
    pub fn set_default(&self, host: HostId, response: SimResponse) {
        lock(&self.inner).defaults.insert(host, response);
    }

    /// Every command sent so far, in order.
    pub fn calls(&self) -> Vec<(HostId, Command)> {
        lock(&self.inner).calls.clone()
    }

    pub fn calls_to(&self, host: HostId) -> usize {
        lock(&self.inner).calls.iter().filter(|(h, _)| *h == host).count()
    }
}

#[async_trait]
impl AgentClient for SimAgent {
    async fn send_command(
        &self,
        host: HostId,
        command: Command,
    ) -> Result<Answer, AgentError> {
        let response = {
            let mut inner = lock(&self.inner);
            inner.calls.push((host, command.clone()));
            inner
                .responses
                .get(&(host, command))
                .or_else(|| inner.defaults.get(&host))
                .cloned()
                .unwrap_or(SimResponse::Unreachable)
        };

        match response {
            SimResponse::Answer(answer) => Ok(answer),
            SimResponse::Unreachable => Err(AgentError::Unreachable {
                host,
                message: "simulated agent unreachable".to_string(),
            }),
            SimResponse::Timeout => Err(AgentError::Timeout {
                host,
                timeout: Duration::ZERO,
            }),
            SimResponse::Hang => std::future::pending().await,
            SimResponse::Delayed(delay, answer) => {
                tokio::time::sleep(delay).await;
                Ok(answer)
            }
        }
    }
}

#[derive(Default)]
struct SimMembershipInner {
    hosts: Vec<Host>,
    unavailable: bool,
}

/// A [`ClusterMembership`] backed by a list of hosts
///
/// Hosts are listed in the order they were added.
#[derive(Default)]
pub struct SimMembership {
    inner: Mutex<SimMembershipInner>,
}

impl SimMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `host`, replacing any existing host with the same id.
    pub fn add_host(&self, host: Host) {
        let mut inner = lock(&self.inner);
        match inner.hosts.iter().position(|h| h.id == host.id) {
            Some(i) => inner.hosts[i] = host,
            None => inner.hosts.push(host),
        }
    }

    /// Makes every subsequent lookup fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.inner).unavailable = unavailable;
    }
}

#[async_trait]
impl ClusterMembership for SimMembership {
    async fn hosts_in_cluster(
        &self,
        cluster: ClusterId,
    ) -> Result<Vec<Host>, MembershipError> {
        let inner = lock(&self.inner);
        if inner.unavailable {
            return Err(MembershipError::Unavailable(
                "simulated outage".to_string(),
            ));
        }
        let hosts: Vec<_> = inner
            .hosts
            .iter()
            .filter(|h| h.cluster_id == cluster)
            .cloned()
            .collect();
        if hosts.is_empty() {
            return Err(MembershipError::NoSuchCluster(cluster));
        }
        Ok(hosts)
    }
}

#[derive(Default)]
struct SimEventsInner {
    /// one append-only log per host and filter
    streams: BTreeMap<(HostId, EventFilter), Vec<EventRecord>>,
    failures: BTreeMap<HostId, usize>,
    subscriptions: Vec<(HostId, EventFilter, ResumeToken)>,
    cancellations: Vec<(HostId, OperationId)>,
    cancel_fails: bool,
    return_early: bool,
}

/// An [`EventSource`] backed by in-memory event logs
///
/// Each `(host, filter)` pair has its own log. A resumption token is the
/// number of events of that log already delivered; the empty token starts
/// from the beginning.
#[derive(Default)]
pub struct SimEventSource {
    inner: Mutex<SimEventsInner>,
    appended: Notify,
}

impl SimEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event` to the log `filter` subscribers of `host` read.
    pub fn push_event(
        &self,
        host: HostId,
        filter: EventFilter,
        event: EventRecord,
    ) {
        lock(&self.inner)
            .streams
            .entry((host, filter))
            .or_default()
            .push(event);
        self.appended.notify_waiters();
    }

    /// Makes the next `count` subscriptions through `host` fail.
    pub fn fail_next_subscribes(&self, host: HostId, count: usize) {
        lock(&self.inner).failures.insert(host, count);
    }

    /// Makes cancellation requests fail.
    pub fn set_cancel_fails(&self, fails: bool) {
        lock(&self.inner).cancel_fails = fails;
    }

    /// Makes subscriptions with nothing new answer at once instead of
    /// waiting.
    pub fn set_return_early(&self, early: bool) {
        lock(&self.inner).return_early = early;
    }

    /// Every subscription call so far, with the token it carried.
    pub fn subscriptions(&self) -> Vec<(HostId, EventFilter, ResumeToken)> {
        lock(&self.inner).subscriptions.clone()
    }

    pub fn cancellations(&self) -> Vec<(HostId, OperationId)> {
        lock(&self.inner).cancellations.clone()
    }

    /// Returns the events after `start`, if there are any yet.
    fn events_after(
        &self,
        host: HostId,
        filter: &EventFilter,
        start: usize,
    ) -> Option<EventBatch> {
        let inner = lock(&self.inner);
        let events = inner.streams.get(&(host, filter.clone()))?;
        let new = events.get(start..).filter(|new| !new.is_empty())?;
        Some(EventBatch {
            token: ResumeToken::new(events.len().to_string()),
            events: new.to_vec(),
        })
    }
}

#[async_trait]
impl EventSource for SimEventSource {
    async fn subscribe(
        &self,
        host: HostId,
        filter: &EventFilter,
        token: &ResumeToken,
        wait: Duration,
    ) -> Result<EventBatch, EventError> {
        {
            let mut inner = lock(&self.inner);
            inner.subscriptions.push((host, filter.clone(), token.clone()));
            if let Some(remaining) =
                inner.failures.get_mut(&host).filter(|n| **n > 0)
            {
                *remaining -= 1;
                return Err(EventError::Unreachable {
                    host,
                    message: "simulated subscription failure".to_string(),
                });
            }
        }

        let start = if token.is_empty() {
            0
        } else {
            token.as_str().parse::<usize>().map_err(|_| {
                EventError::Rejected {
                    host,
                    message: format!("invalid token {}", token),
                }
            })?
        };

        let deadline = Instant::now() + wait;
        loop {
            // Register for wakeups before looking, so an event appended in
            // between is not missed.
            let appended = self.appended.notified();
            if let Some(batch) = self.events_after(host, filter, start) {
                return Ok(batch);
            }
            let early = lock(&self.inner).return_early;
            if early
                || tokio::time::timeout_at(deadline, appended).await.is_err()
            {
                return Ok(EventBatch {
                    token: ResumeToken::new(start.to_string()),
                    events: Vec::new(),
                });
            }
        }
    }

    async fn cancel_operation(
        &self,
        host: HostId,
        operation: OperationId,
    ) -> Result<(), EventError> {
        let mut inner = lock(&self.inner);
        inner.cancellations.push((host, operation));
        if inner.cancel_fails {
            return Err(EventError::Rejected {
                host,
                message: "simulated cancellation failure".to_string(),
            });
        }
        Ok(())
    }
}
