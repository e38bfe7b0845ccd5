// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Which VM names belong to this orchestrator.
//!
//! Guest VMs are named `i-<account>-<vm>-<instance>`. System VMs (virtual
//! routers, secondary storage VMs and console proxies) are named
//! `r-<vm>-<instance>`, `s-<vm>-<instance>` and `v-<vm>-<instance>`. The ids
//! are decimal, and `<instance>` is this deployment's instance name. Any VM
//! whose name does not follow this convention was created by someone else
//! and is ignored by the tracker.

/// Prefix the hypervisor gives a VM while it is the target of a migration.
const MIGRATING_PREFIX: &str = "migrating";

#[derive(Clone, Debug)]
pub struct VmNamePolicy {
    instance: String,
}

impl VmNamePolicy {
    pub fn new(instance: impl Into<String>) -> Self {
        VmNamePolicy { instance: instance.into() }
    }

    /// Returns true if `name` is a VM managed by this orchestrator.
    pub fn is_managed(&self, name: &str) -> bool {
        let Some((kind, rest)) = name.split_once('-') else {
            return false;
        };
        let suffix = match kind {
            "i" => {
                // account id, then vm id
                let mut parts = rest.splitn(3, '-');
                let (Some(account), Some(vm), Some(suffix)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return false;
                };
                if !is_id(account) || !is_id(vm) {
                    return false;
                }
                suffix
            }
            "r" | "s" | "v" => {
                let Some((vm, suffix)) = rest.split_once('-') else {
                    return false;
                };
                if !is_id(vm) {
                    return false;
                }
                suffix
            }
            _ => return false,
        };
        suffix == self.instance
    }

    /// Returns true for the transient name a VM carries mid-migration.
    pub fn is_migration_transient(&self, name: &str) -> bool {
        name.starts_with(MIGRATING_PREFIX)
    }
}

fn is_id(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
