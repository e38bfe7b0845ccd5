// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for long-running hypervisor operations to finish.
//!
//! The waiter watches an operation's own notification stream until the
//! operation is no longer pending. It uses its own subscription, separate from
//! any state tracker, and only ever suspends the task that called it.

use crate::events::{EventFilter, EventSource, ResumeToken, TaskSnapshot};
use chrono::{DateTime, Utc};
use ha_types::{HostId, OperationId, TaskStatus};
use slog::{debug, error, info, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shortest interval we'll wait for notifications in one cycle.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a best-effort cancellation request may take.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies an operation submitted to a hypervisor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationHandle {
    pub id: OperationId,
    /// host through which the operation was submitted
    pub host: HostId,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperationOutcome {
    /// The operation is no longer pending.
    Completed { status: TaskStatus, progress: f64 },
    /// The operation did not finish in time and its outcome is unknown.
    ///
    /// Cancellation was requested, but may not have taken effect.
    TimedOut,
}

/// One operation being waited on
#[derive(Clone, Debug)]
pub struct PendingOperation {
    pub id: OperationId,
    pub submitted: DateTime<Utc>,
    pub deadline: Instant,
}

impl PendingOperation {
    fn new(id: OperationId, timeout: Duration) -> Self {
        PendingOperation {
            id,
            submitted: Utc::now(),
            deadline: Instant::now() + timeout,
        }
    }
}

pub struct OperationWaiter {
    log: Logger,
    events: Arc<dyn EventSource>,
    empty_cycles_before_error: u32,
}

impl OperationWaiter {
    pub fn new(
        log: &Logger,
        events: Arc<dyn EventSource>,
        empty_cycles_before_error: u32,
    ) -> Self {
        let log = log.new(slog::o!("component" => "OperationWaiter"));
        OperationWaiter { log, events, empty_cycles_before_error }
    }

    /// Waits until `operation` is no longer pending, or `timeout` elapses.
    ///
    /// Each cycle waits up to `poll_hint` for notifications. On timeout, one
    /// cancellation request is sent before returning
    /// [`OperationOutcome::TimedOut`].
    pub async fn wait(
        &self,
        operation: &OperationHandle,
        poll_hint: Duration,
        timeout: Duration,
    ) -> OperationOutcome {
        let pending = PendingOperation::new(operation.id, timeout);
        let log = self.log.new(slog::o!(
            "operation_id" => operation.id.to_string(),
            "host_id" => operation.host.to_string(),
        ));
        let poll = poll_hint.max(MIN_POLL_INTERVAL);
        let filter = EventFilter::Task(operation.id);
        let mut token = ResumeToken::default();
        let mut empty_cycles: u32 = 0;

        loop {
            let now = Instant::now();
            if now >= pending.deadline {
                break;
            }
            let wait = poll.min(pending.deadline - now);

            let subscribed = tokio::time::timeout_at(
                pending.deadline,
                self.events.subscribe(operation.host, &filter, &token, wait),
            )
            .await;
            let batch = match subscribed {
                Err(_) => break,
                Ok(Err(error)) => {
                    warn!(
                        log,
                        "failed to subscribe to operation events";
                        "error" => %error,
                    );
                    tokio::time::sleep_until(
                        (now + poll).min(pending.deadline),
                    )
                    .await;
                    continue;
                }
                Ok(Ok(batch)) => batch,
            };
            token = batch.token;

            if batch.events.is_empty() {
                empty_cycles += 1;
                if empty_cycles >= self.empty_cycles_before_error {
                    error!(
                        log,
                        "still no notifications for operation";
                        "empty_cycles" => empty_cycles,
                    );
                } else {
                    warn!(
                        log,
                        "no notifications for operation this cycle";
                        "empty_cycles" => empty_cycles,
                    );
                }
                // The source may have answered before `wait` was up.
                tokio::time::sleep_until((now + poll).min(pending.deadline))
                    .await;
                continue;
            }
            empty_cycles = 0;

            for event in &batch.events {
                let task = match TaskSnapshot::from_event(event) {
                    Ok(task) => task,
                    Err(error) => {
                        warn!(
                            log,
                            "skipping unusable operation event";
                            "error" => %error,
                        );
                        continue;
                    }
                };
                if task.id != operation.id {
                    debug!(
                        log,
                        "ignoring event for another operation";
                        "other" => %task.id,
                    );
                    continue;
                }
                if task.status.is_pending() {
                    debug!(
                        log,
                        "operation still pending";
                        "progress" => task.progress,
                    );
                    continue;
                }
                info!(
                    log,
                    "operation finished";
                    "status" => ?task.status,
                    "elapsed" => ?(Utc::now() - pending.submitted),
                );
                return OperationOutcome::Completed {
                    status: task.status,
                    progress: task.progress,
                };
            }
        }

        warn!(
            log,
            "operation timed out; requesting cancellation";
            "timeout" => ?timeout,
            "submitted" => %pending.submitted,
        );
        match tokio::time::timeout(
            CANCEL_TIMEOUT,
            self.events.cancel_operation(operation.host, operation.id),
        )
        .await
        {
            Ok(Ok(())) => (),
            Ok(Err(error)) => {
                warn!(log, "failed to cancel operation"; "error" => %error);
            }
            Err(_) => {
                warn!(log, "timed out cancelling operation");
            }
        }
        OperationOutcome::TimedOut
    }
}
