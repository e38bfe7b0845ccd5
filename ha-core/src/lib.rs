// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness investigation and VM state reconciliation.
//!
//! Recovering a VM from a failed host means starting it somewhere else. If
//! the host was not actually dead, the VM ends up running twice. This crate
//! decides, from signals that are each individually unreliable, whether a
//! host or VM is alive ([`investigator`]), and keeps an authoritative record
//! of where every VM is running ([`tracker`]). What to do about a dead host
//! is up to the caller.
//!
//! The crate talks to the outside world only through the traits in
//! [`agent`] and [`events`]. [`HaCore`] ties the pieces together.

pub mod agent;
pub mod backoff;
pub mod config;
pub mod events;
mod ha;
pub mod investigator;
pub mod peer;
pub mod probe;
#[cfg(any(test, feature = "testing"))]
pub mod sim;
pub mod tracker;
pub mod waiter;

pub use config::{Config, ConfigError, CoreConfig};
pub use ha::{HaCore, HaCoreBuilder, TrackerError, TrackingStatus};
pub use investigator::{InvestigatorError, Resolution};
pub use waiter::{OperationHandle, OperationOutcome};
