/*
 * Copyright (C) 2025 The Arbor Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use super::Cgroup;
use crate::arbor::config;
use crate::arbor::util::current_time_ms;
use crate::arbor::util::error::{ArborError, Result};
use crate::arbor::util::wait_deadline;

pub const STATE: &str = "freezer.state";
pub const SELF_FREEZING: &str = "freezer.self_freezing";
pub const PARENT_FREEZING: &str = "freezer.parent_freezing";

const FROZEN: &str = "FROZEN";
const THAWED: &str = "THAWED";

/// Freezer subsystem wrappers. Freezing is asynchronous in the kernel:
/// writes to freezer.state are requests and the state file trails them,
/// so every transition waits for the reported state.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreezerController;

impl FreezerController {
    pub fn wait_state(&self, cg: &Cgroup, state: &str) -> Result<()> {
        let deadline = current_time_ms() + config::freezer_wait_timeout_ms();
        loop {
            let cur = cg.get(STATE)?;
            if cur.trim() == state {
                return Ok(());
            }
            if wait_deadline(deadline) {
                return Err(ArborError::unknown(format!(
                    "freezer {} timeout waiting {}",
                    cg.name, state
                )));
            }
        }
    }

    pub fn freeze(&self, cg: &Cgroup) -> Result<()> {
        cg.set(STATE, FROZEN)?;
        // the kernel owns self_freezing; scratch trees get it mirrored
        let _ = cg.set(SELF_FREEZING, "1");
        self.wait_state(cg, FROZEN)
    }

    pub fn thaw(&self, cg: &Cgroup, wait: bool) -> Result<()> {
        cg.set(STATE, THAWED)?;
        let _ = cg.set(SELF_FREEZING, "0");
        if !wait {
            return Ok(());
        }
        self.wait_state(cg, THAWED)
    }

    /// Frozen by itself or by any ancestor.
    pub fn is_frozen(&self, cg: &Cgroup) -> bool {
        cg.get(STATE)
            .map(|state| state.trim() != THAWED)
            .unwrap_or(false)
    }

    pub fn is_self_freezing(&self, cg: &Cgroup) -> bool {
        cg.get_bool(SELF_FREEZING).unwrap_or(false)
    }

    pub fn is_parent_freezing(&self, cg: &Cgroup) -> bool {
        cg.get_bool(PARENT_FREEZING).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbor::cgroup::{CgroupSet, SubsystemKind};
    use tempfile::TempDir;

    fn frozen_cg(set: &CgroupSet) -> Cgroup<'_> {
        let cg = set.cgroup(SubsystemKind::Freezer, "/arbor");
        cg.create().unwrap();
        cg
    }

    #[test]
    fn freeze_then_thaw_round_trip() {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        let cg = frozen_cg(&set);

        // A scratch tree reflects writes verbatim, standing in for the
        // kernel completing the transition.
        set.freezer.freeze(&cg).unwrap();
        assert!(set.freezer.is_frozen(&cg));

        set.freezer.thaw(&cg, true).unwrap();
        assert!(!set.freezer.is_frozen(&cg));
    }

    #[test]
    fn missing_cgroup_reads_as_thawed() {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        let cg = set.cgroup(SubsystemKind::Freezer, "/arbor/none");
        assert!(!set.freezer.is_frozen(&cg));
        assert!(!set.freezer.is_self_freezing(&cg));
        assert!(!set.freezer.is_parent_freezing(&cg));
    }

    #[test]
    fn self_freezing_flag_is_read_as_bool() {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        let cg = frozen_cg(&set);
        cg.set(SELF_FREEZING, "1\n").unwrap();
        assert!(set.freezer.is_self_freezing(&cg));
        cg.set(SELF_FREEZING, "0\n").unwrap();
        assert!(!set.freezer.is_self_freezing(&cg));
    }
}
