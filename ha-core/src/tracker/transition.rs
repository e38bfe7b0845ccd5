// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding what a reported VM state means, given what we last knew.
//!
//! VMs pass through transitional states while other parts of the system are
//! starting, stopping or migrating them. Those operations track their own
//! completion, so the expected progressions are recorded without being
//! reported as changes. Only genuinely unexpected states are reported.

use ha_types::{HostId, Placement, PowerState};

/// What to do with one reported VM state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disposition {
    /// write the reported placement into the placement map
    pub update_map: bool,
    /// add the reported placement to the set of pending changes
    pub report_change: bool,
}

impl Disposition {
    const IGNORE: Disposition =
        Disposition { update_map: false, report_change: false };
    const RECORD: Disposition =
        Disposition { update_map: true, report_change: false };
    const REPORT: Disposition =
        Disposition { update_map: true, report_change: true };
}

/// Classifies a reported `(current_host, current)` against `previous`.
///
/// A report that carries no host never counts as a host move.
pub fn classify(
    previous: &Placement,
    current: PowerState,
    current_host: Option<HostId>,
) -> Disposition {
    use PowerState::*;

    match (previous.state, current) {
        // Expected progression of a start.
        (Starting, Running) => Disposition::RECORD,
        // The start command hasn't caught up yet; leave its bookkeeping
        // alone.
        (Starting, Stopped) => Disposition::IGNORE,
        // Migration completion belongs to whoever initiated the migration.
        (Migrating, _) => Disposition::RECORD,
        // Expected progression of a stop.
        (Stopping, Stopped) => Disposition::RECORD,
        // The stop command hasn't caught up yet.
        (Stopping, Running) => Disposition::IGNORE,
        (prev, cur) if prev != cur => Disposition::REPORT,
        _ => match current_host {
            Some(host) if Some(host) != previous.host => Disposition::REPORT,
            _ => Disposition::IGNORE,
        },
    }
}
