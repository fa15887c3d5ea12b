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
use crate::arbor::device::Device;
use crate::arbor::util::error::Result;

pub const ALLOW: &str = "devices.allow";
pub const DENY: &str = "devices.deny";

#[derive(Debug, Clone, Copy, Default)]
pub struct DevicesController;

impl DevicesController {
    /// Denies everything, then re-allows the baseline device set every
    /// container needs. 'm' is kept so the task launcher can populate the
    /// container's /dev.
    pub fn apply_default(&self, cg: &Cgroup) -> Result<()> {
        cg.set(DENY, "a")?;

        let rules = [
            "c 1:3 rwm",  // /dev/null
            "c 1:5 rwm",  // /dev/zero
            "c 1:7 rwm",  // /dev/full
            "c 1:8 rwm",  // /dev/random
            "c 1:9 rwm",  // /dev/urandom
            "c 5:0 rwm",  // /dev/tty
            "c 5:2 rw",   // /dev/ptmx
            "c 136:* rw", // /dev/pts/*
        ];
        for rule in rules {
            cg.set(ALLOW, rule)?;
        }
        Ok(())
    }

    pub fn apply_device(&self, cg: &Cgroup, device: &Device) -> Result<()> {
        let allow = device.cgroup_rule(true);
        if !allow.is_empty() {
            cg.set(ALLOW, &allow)?;
        }
        let deny = device.cgroup_rule(false);
        if !deny.is_empty() {
            cg.set(DENY, &deny)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbor::cgroup::{CgroupSet, SubsystemKind};
    use tempfile::TempDir;

    #[test]
    fn default_rules_start_with_deny_all() {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        let cg = set.cgroup(SubsystemKind::Devices, "/arbor");
        cg.create().unwrap();

        set.devices.apply_default(&cg).unwrap();
        assert_eq!(cg.get(DENY).unwrap(), "a");
        // the scratch tree keeps only the last write
        assert_eq!(cg.get(ALLOW).unwrap(), "c 136:* rw");
    }

    #[test]
    fn device_grant_writes_allow_rule() {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        let cg = set.cgroup(SubsystemKind::Devices, "/arbor");
        cg.create().unwrap();

        let device = Device::parse("/dev/null rw").unwrap();
        set.devices.apply_device(&cg, &device).unwrap();
        assert_eq!(cg.get(ALLOW).unwrap(), "c 1:3 rw");
        assert_eq!(cg.get(DENY).unwrap(), "c 1:3 m");
    }
}
