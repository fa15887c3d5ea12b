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

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;

use super::Cgroup;
use crate::arbor::util::error::{ArborError, ErrorKind, Result};

pub const STAT: &str = "memory.stat";
pub const OOM_CONTROL: &str = "memory.oom_control";
pub const EVENT_CONTROL: &str = "cgroup.event_control";
pub const USE_HIERARCHY: &str = "memory.use_hierarchy";
pub const RECHARGE_ON_PGFAULT: &str = "memory.recharge_on_pgfault";
pub const USAGE: &str = "memory.usage_in_bytes";
pub const LIMIT: &str = "memory.limit_in_bytes";
pub const SOFT_LIMIT: &str = "memory.soft_limit_in_bytes";
pub const LOW_LIMIT: &str = "memory.low_limit_in_bytes";
pub const MEM_SWAP_LIMIT: &str = "memory.memsw.limit_in_bytes";
pub const DIRTY_LIMIT: &str = "memory.dirty_limit_in_bytes";
pub const DIRTY_RATIO: &str = "memory.dirty_ratio";
pub const FS_BPS_LIMIT: &str = "memory.fs_bps_limit";
pub const FS_IOPS_LIMIT: &str = "memory.fs_iops_limit";
pub const ANON_USAGE: &str = "memory.anon.usage";
pub const ANON_LIMIT: &str = "memory.anon.limit";
pub const FAIL_CNT: &str = "memory.failcnt";

/// Memory subsystem wrappers plus the feature flags probed at startup on
/// the root cgroup.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryController {
    pub supports_guarantee: bool,
    pub supports_io_limit: bool,
    pub supports_dirty_limit: bool,
    pub supports_swap: bool,
    pub supports_anon_limit: bool,
    pub supports_recharge_on_pgfault: bool,
}

impl MemoryController {
    pub fn probe(root: &Cgroup) -> Self {
        Self {
            supports_guarantee: root.has_knob(LOW_LIMIT),
            supports_io_limit: root.has_knob(FS_BPS_LIMIT),
            supports_dirty_limit: root.has_knob(DIRTY_LIMIT),
            supports_swap: root.has_knob(MEM_SWAP_LIMIT),
            supports_anon_limit: root.has_knob(ANON_LIMIT),
            supports_recharge_on_pgfault: root.has_knob(RECHARGE_ON_PGFAULT),
        }
    }

    pub fn usage(&self, cg: &Cgroup) -> Result<u64> {
        cg.get_u64(USAGE)
    }

    pub fn get_soft_limit(&self, cg: &Cgroup) -> Result<u64> {
        cg.get_u64(SOFT_LIMIT)
    }

    pub fn set_soft_limit(&self, cg: &Cgroup, limit: u64) -> Result<()> {
        cg.set_u64(SOFT_LIMIT, limit)
    }

    pub fn set_guarantee(&self, cg: &Cgroup, guarantee: u64) -> Result<()> {
        if !self.supports_guarantee {
            return Ok(());
        }
        cg.set_u64(LOW_LIMIT, guarantee)
    }

    /// Lowering the limit below current usage fails with EBUSY; walk the
    /// value toward the target by bisection the way the kernel allows,
    /// keeping memsw above the memory limit at all times. Zero lifts the
    /// limit ("-1" works everywhere since 2.6.31).
    pub fn set_limit(&self, cg: &Cgroup, limit: u64) -> Result<()> {
        if !cg.has_knob(LIMIT) {
            return Ok(());
        }
        if limit == 0 {
            if self.supports_swap {
                let _ = cg.set(MEM_SWAP_LIMIT, "-1");
            }
            return cg.set(LIMIT, "-1");
        }

        let old_limit = cg.get_u64(LIMIT)?;
        if old_limit == limit {
            return Ok(());
        }

        if self.supports_swap {
            if let Ok(cur) = cg.get_u64(MEM_SWAP_LIMIT) {
                if cur < limit {
                    let _ = cg.set_u64(MEM_SWAP_LIMIT, limit);
                }
            }
        }

        let mut cur_limit = old_limit;
        let mut new_limit = limit;
        let mut result;
        loop {
            result = cg.set_u64(LIMIT, new_limit);
            match &result {
                Ok(()) => {
                    cur_limit = new_limit;
                    new_limit = limit;
                }
                Err(_) => {
                    if cur_limit < i64::MAX as u64 {
                        new_limit = (cur_limit + new_limit) / 2;
                    } else {
                        new_limit = new_limit.saturating_mul(2);
                    }
                }
            }
            let busy = matches!(&result, Err(err) if err.errno() == Some(Errno::EBUSY));
            if cur_limit == limit
                || new_limit > cur_limit.saturating_sub(4096)
                || (result.is_err() && !busy)
            {
                break;
            }
        }

        if result.is_ok() && self.supports_swap {
            result = cg.set_u64(MEM_SWAP_LIMIT, limit);
        }

        if result.is_err() {
            let _ = cg.set_u64(LIMIT, old_limit);
        }

        result
    }

    pub fn anon_usage(&self, cg: &Cgroup) -> Result<u64> {
        if cg.has_knob(ANON_USAGE) {
            return cg.get_u64(ANON_USAGE);
        }
        let stat = cg.get_uint_map(STAT)?;
        Ok(stat.get("total_inactive_anon").copied().unwrap_or(0)
            + stat.get("total_active_anon").copied().unwrap_or(0)
            + stat.get("unevictable").copied().unwrap_or(0)
            + stat.get("total_swap").copied().unwrap_or(0))
    }

    pub fn set_anon_limit(&self, cg: &Cgroup, limit: u64) -> Result<()> {
        if !cg.has_knob(ANON_LIMIT) {
            return Ok(());
        }
        if limit == 0 {
            cg.set(ANON_LIMIT, "-1")
        } else {
            cg.set_u64(ANON_LIMIT, limit)
        }
    }

    pub fn set_io_limit(&self, cg: &Cgroup, limit: u64) -> Result<()> {
        if !self.supports_io_limit {
            return Ok(());
        }
        cg.set_u64(FS_BPS_LIMIT, limit)
    }

    pub fn set_iops_limit(&self, cg: &Cgroup, limit: u64) -> Result<()> {
        if !self.supports_io_limit {
            return Ok(());
        }
        cg.set_u64(FS_IOPS_LIMIT, limit)
    }

    pub fn set_dirty_limit(&self, cg: &Cgroup, limit: u64) -> Result<()> {
        if !self.supports_dirty_limit {
            return Ok(());
        }
        if limit != 0 {
            cg.set_u64(DIRTY_LIMIT, limit)
        } else {
            cg.set_u64(DIRTY_RATIO, 50)
        }
    }

    pub fn recharge_on_pgfault(&self, cg: &Cgroup, enable: bool) -> Result<()> {
        if !self.supports_recharge_on_pgfault {
            return Ok(());
        }
        cg.set_bool(RECHARGE_ON_PGFAULT, enable)
    }

    pub fn fail_cnt(&self, cg: &Cgroup) -> Result<u64> {
        cg.get_u64(FAIL_CNT)
    }

    pub fn set_use_hierarchy(&self, cg: &Cgroup) -> Result<()> {
        cg.set_bool(USE_HIERARCHY, true)
    }

    /// Arms OOM notification: an eventfd registered against the cgroup's
    /// oom_control through cgroup.event_control. The returned fd becomes
    /// readable on every OOM kill inside the cgroup.
    pub fn setup_oom_event(&self, cg: &Cgroup) -> Result<OwnedFd> {
        let knob = std::fs::File::open(cg.knob_path(OOM_CONTROL))
            .map_err(|err| ArborError::from(err).wrap(format!("open {} oom_control", cg)))?;

        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(ArborError::with_errno(
                ErrorKind::Unknown,
                Errno::last(),
                "cannot create eventfd",
            ));
        }
        let event = unsafe { OwnedFd::from_raw_fd(fd) };

        cg.set(
            EVENT_CONTROL,
            &format!("{} {}", event.as_raw_fd(), knob.as_raw_fd()),
        )?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbor::cgroup::{CgroupSet, SubsystemKind};
    use tempfile::TempDir;

    fn memory_cg(set: &CgroupSet) -> Cgroup<'_> {
        let cg = set.cgroup(SubsystemKind::Memory, "/arbor");
        if !cg.exists() {
            cg.create().unwrap();
        }
        cg
    }

    fn scratch() -> (TempDir, CgroupSet) {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        (temp, set)
    }

    #[test]
    fn probe_reports_missing_features_on_scratch_tree() {
        let (_temp, set) = scratch();
        assert!(!set.memory.supports_guarantee);
        assert!(!set.memory.supports_swap);
        assert!(!set.memory.supports_io_limit);
    }

    #[test]
    fn zero_limit_writes_unlimited() {
        let (_temp, set) = scratch();
        let cg = memory_cg(&set);
        cg.set_u64(LIMIT, 1 << 30).unwrap();
        set.memory.set_limit(&cg, 0).unwrap();
        assert_eq!(cg.get(LIMIT).unwrap(), "-1");
    }

    #[test]
    fn absent_memory_controller_is_tolerated() {
        let (_temp, set) = scratch();
        let cg = memory_cg(&set);
        set.memory.set_limit(&cg, 104857600).unwrap();
        assert!(!cg.has_knob(LIMIT));
    }

    #[test]
    fn limit_converges_to_target() {
        let (_temp, set) = scratch();
        let cg = memory_cg(&set);
        cg.set_u64(LIMIT, u64::MAX / 2).unwrap();
        set.memory.set_limit(&cg, 104857600).unwrap();
        assert_eq!(cg.get_u64(LIMIT).unwrap(), 104857600);
    }

    #[test]
    fn unsupported_knobs_are_silently_skipped() {
        let (_temp, set) = scratch();
        let cg = memory_cg(&set);
        set.memory.set_guarantee(&cg, 1 << 20).unwrap();
        set.memory.set_io_limit(&cg, 1 << 20).unwrap();
        set.memory.set_dirty_limit(&cg, 1 << 20).unwrap();
        assert!(!cg.has_knob(LOW_LIMIT));
        assert!(!cg.has_knob(FS_BPS_LIMIT));
    }

    #[test]
    fn anon_usage_falls_back_to_stat() {
        let (_temp, set) = scratch();
        let cg = memory_cg(&set);
        cg.set(
            STAT,
            "total_inactive_anon 100\ntotal_active_anon 50\nunevictable 8\ntotal_swap 2\n",
        )
        .unwrap();
        assert_eq!(set.memory.anon_usage(&cg).unwrap(), 160);
    }
}
