// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry policies for talking to the hypervisor's notification stream.

use std::time::Duration;

pub use ::backoff::backoff::Backoff;
pub use ::backoff::ExponentialBackoff;

/// Returns a backoff policy for retrying a failed subscription indefinitely.
///
/// The delay starts at `initial` and doubles (with jitter) up to `max`. The
/// policy never gives up: the caller decides when to stop.
pub fn subscription_retry_policy(
    initial: Duration,
    max: Duration,
) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        multiplier: 2.0,
        max_interval: max.max(initial),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Returns the next delay from `policy`, or its ceiling if it has none.
pub fn next_delay(policy: &mut ExponentialBackoff) -> Duration {
    policy.next_backoff().unwrap_or(policy.max_interval)
}
