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

use std::fs;
use std::path::Path;

use super::Cgroup;
use crate::arbor::util::error::{ArborError, Result};

pub const WEIGHT: &str = "blkio.weight";

const NORMAL_IO_WEIGHT: u64 = 500;
const BATCH_IO_WEIGHT: u64 = 100;

/// Per-device io accounting sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlkioStat {
    pub device: String,
    pub read: u64,
    pub write: u64,
    pub sync: u64,
    pub async_: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlkioController {
    pub supports_io_policy: bool,
}

impl BlkioController {
    pub fn probe(root: &Cgroup) -> Self {
        Self {
            supports_io_policy: root.has_knob(WEIGHT),
        }
    }

    /// Maps the io policy tag to a blkio weight.
    pub fn set_io_policy(&self, cg: &Cgroup, policy: &str) -> Result<()> {
        if !self.supports_io_policy {
            return Ok(());
        }
        let weight = match policy {
            "normal" => NORMAL_IO_WEIGHT,
            "batch" => BATCH_IO_WEIGHT,
            _ => return Err(ArborError::invalid_value(format!("unknown policy: {}", policy))),
        };
        cg.set_u64(WEIGHT, weight)
    }

    fn device_name(majmin: &str) -> Result<String> {
        let link = fs::read_link(Path::new("/sys/dev/block").join(majmin))
            .map_err(|err| ArborError::from(err).wrap(format!("resolve block device {}", majmin)))?;
        Ok(link
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    /// Parses five-line-per-device stat knobs such as
    /// blkio.io_service_bytes: `maj:min Read n / Write n / Sync n /
    /// Async n / Total n`, with a trailing overall Total line.
    pub fn statistics(&self, cg: &Cgroup, knob: &str) -> Result<Vec<BlkioStat>> {
        let text = cg.get(knob)?;
        let lines: Vec<&str> = text.lines().collect();
        let mut stats = Vec::new();

        let mut i = 0;
        while i < lines.len() {
            let fields: Vec<&str> = lines[i].split_whitespace().collect();
            if fields.len() != 3 {
                // overall Total line
                i += 1;
                continue;
            }

            let mut stat = BlkioStat {
                device: Self::device_name(fields[0]).unwrap_or_else(|_| fields[0].to_string()),
                ..Default::default()
            };

            for (offset, name) in [(0, "Read"), (1, "Write"), (2, "Sync"), (3, "Async")] {
                let line = lines.get(i + offset).ok_or_else(|| {
                    ArborError::unknown("truncated blkio statistics".to_string())
                })?;
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 3 || fields[1] != name {
                    return Err(ArborError::unknown(
                        "unexpected field in blkio statistics".to_string(),
                    ));
                }
                let value: u64 = fields[2].parse().map_err(|_| {
                    ArborError::invalid_data(format!("bad blkio counter: {}", line))
                })?;
                match name {
                    "Read" => stat.read = value,
                    "Write" => stat.write = value,
                    "Sync" => stat.sync = value,
                    _ => stat.async_ = value,
                }
            }

            stats.push(stat);
            i += 5;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbor::cgroup::{CgroupSet, SubsystemKind};
    use tempfile::TempDir;

    #[test]
    fn unknown_policy_is_rejected_when_supported() {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        let cg = set.cgroup(SubsystemKind::Blkio, "/arbor");
        cg.create().unwrap();

        let blkio = BlkioController {
            supports_io_policy: true,
        };
        assert!(blkio.set_io_policy(&cg, "turbo").is_err());
        blkio.set_io_policy(&cg, "batch").unwrap();
        assert_eq!(cg.get_u64(WEIGHT).unwrap(), BATCH_IO_WEIGHT);
    }

    #[test]
    fn policy_without_kernel_support_is_skipped() {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        let cg = set.cgroup(SubsystemKind::Blkio, "/arbor");
        cg.create().unwrap();
        set.blkio.set_io_policy(&cg, "normal").unwrap();
        assert!(!cg.has_knob(WEIGHT));
    }

    #[test]
    fn statistics_parse_per_device_blocks() {
        let temp = TempDir::new().unwrap();
        let set = CgroupSet::initialize(temp.path()).unwrap();
        let cg = set.cgroup(SubsystemKind::Blkio, "/arbor");
        cg.create().unwrap();
        cg.set(
            "blkio.io_service_bytes",
            "259:0 Read 4096\n259:0 Write 8192\n259:0 Sync 4096\n259:0 Async 8192\n259:0 Total 12288\nTotal 12288\n",
        )
        .unwrap();

        let blkio = BlkioController::default();
        let stats = blkio.statistics(&cg, "blkio.io_service_bytes").unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].read, 4096);
        assert_eq!(stats[0].write, 8192);
    }
}
