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

use log::info;

use super::Cgroup;
use crate::arbor::util::error::Result;

pub const SHARES: &str = "cpu.shares";
pub const QUOTA: &str = "cpu.cfs_quota_us";
pub const PERIOD: &str = "cpu.cfs_period_us";
pub const RESERVE: &str = "cpu.cfs_reserve_us";
pub const RESERVE_SHARES: &str = "cpu.cfs_reserve_shares";
pub const SMART: &str = "cpu.smart";

pub fn num_cores() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1)
}

/// Cpu subsystem wrappers with kernel feature flags probed at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuController {
    pub has_shares: bool,
    pub has_quota: bool,
    pub has_reserve: bool,
    pub has_smart: bool,
    pub base_shares: u64,
    pub base_period: u64,
}

impl CpuController {
    pub fn probe(root: &Cgroup) -> Self {
        let has_shares = root.has_knob(SHARES);
        let base_shares = if has_shares {
            root.get_u64(SHARES).unwrap_or(1024)
        } else {
            1024
        };

        let has_quota = root.has_knob(QUOTA) && root.has_knob(PERIOD);
        let base_period = if has_quota {
            root.get_u64(PERIOD).unwrap_or(100_000)
        } else {
            100_000
        };

        let has_reserve =
            has_shares && has_quota && root.has_knob(RESERVE) && root.has_knob(RESERVE_SHARES);
        let has_smart = root.has_knob(SMART);

        info!(
            "cpu: {} cores, base shares {}, quota period {}",
            num_cores(),
            base_shares,
            base_period
        );

        Self {
            has_shares,
            has_quota,
            has_reserve,
            has_smart,
            base_shares,
            base_period,
        }
    }

    /// Applies a policy tag plus fractional-core guarantee and limit onto
    /// whatever knobs this kernel offers. A limit at or above the core
    /// count removes the quota.
    pub fn set_policy(&self, cg: &Cgroup, policy: &str, guarantee: f64, limit: f64) -> Result<()> {
        if self.has_quota {
            let mut quota = (limit * self.base_period as f64).ceil() as i64;
            if quota < 1000 {
                quota = 1000;
            }
            if limit >= num_cores() as f64 {
                quota = -1;
            }
            cg.set(QUOTA, &quota.to_string())?;
        }

        if self.has_reserve {
            let reserve = (guarantee * self.base_period as f64).floor() as u64;
            let mut shares = self.base_shares;
            let mut reserve_shares = self.base_shares;

            match policy {
                "rt" => {
                    shares *= 16;
                    reserve_shares *= 256;
                }
                "normal" => reserve_shares *= 16,
                "idle" => shares /= 16,
                _ => {}
            }

            cg.set_u64(SHARES, shares)?;
            cg.set_u64(RESERVE_SHARES, reserve_shares)?;
            cg.set_u64(RESERVE, reserve)?;
        } else if self.has_shares {
            let mut shares = ((guarantee + 1.0) * self.base_shares as f64).floor() as u64;

            if policy == "rt" && !self.has_smart {
                shares *= 16;
            } else if policy == "idle" {
                shares /= 16;
            }

            cg.set_u64(SHARES, shares)?;
        }

        if self.has_smart {
            cg.set_u64(SMART, u64::from(policy == "rt"))?;
        }

        Ok(())
    }
}

/// Cpu accounting reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuacctController;

impl CpuacctController {
    /// Consumed cpu time in nanoseconds.
    pub fn usage(&self, cg: &Cgroup) -> Result<u64> {
        cg.get_u64("cpuacct.usage")
    }

    pub fn system_usage(&self, cg: &Cgroup) -> Result<u64> {
        let stat = cg.get_uint_map("cpuacct.stat")?;
        let ticks = stat.get("system").copied().unwrap_or(0);
        let tick_ns = 1_000_000_000 / unsafe { libc::sysconf(libc::_SC_CLK_TCK) as u64 };
        Ok(ticks * tick_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbor::cgroup::{CgroupSet, SubsystemKind};
    use tempfile::TempDir;

    fn scratch() -> (TempDir, CgroupSet) {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        (temp, set)
    }

    #[test]
    fn policy_on_featureless_kernel_is_a_no_op() {
        let (_temp, set) = scratch();
        let cg = set.cgroup(SubsystemKind::Cpu, "/arbor");
        cg.create().unwrap();
        set.cpu.set_policy(&cg, "normal", 0.0, 2.0).unwrap();
        assert!(!cg.has_knob(SHARES));
    }

    #[test]
    fn quota_tracks_fractional_limit() {
        let (_temp, set) = scratch();
        let cg = set.cgroup(SubsystemKind::Cpu, "/arbor");
        cg.create().unwrap();

        let mut cpu = CpuController {
            has_quota: true,
            base_period: 100_000,
            ..Default::default()
        };
        cpu.has_shares = false;
        cpu.set_policy(&cg, "normal", 0.0, 0.5).unwrap();
        assert_eq!(cg.get(QUOTA).unwrap(), "50000");

        // At or above the core count the quota is removed.
        cpu.set_policy(&cg, "normal", 0.0, num_cores() as f64).unwrap();
        assert_eq!(cg.get(QUOTA).unwrap(), "-1");
    }

    #[test]
    fn idle_policy_shrinks_shares() {
        let (_temp, set) = scratch();
        let cg = set.cgroup(SubsystemKind::Cpu, "/arbor");
        cg.create().unwrap();

        let cpu = CpuController {
            has_shares: true,
            base_shares: 1024,
            ..Default::default()
        };
        cpu.set_policy(&cg, "idle", 0.0, 1.0).unwrap();
        assert_eq!(cg.get_u64(SHARES).unwrap(), 64);
    }
}
