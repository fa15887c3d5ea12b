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

//! Typed access to the fixed set of cgroup-v1 subsystems the daemon
//! drives: memory, freezer, cpu, cpuacct, blkio, net_cls and devices.
//! Co-mounted subsystems share one hierarchy; only hierarchy leaders are
//! created and removed.

pub mod blkio;
pub mod cpu;
pub mod devices;
pub mod freezer;
pub mod memory;

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind as IoKind;
use std::path::{Path, PathBuf};

use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::arbor::config;
use crate::arbor::util::error::{ArborError, ErrorKind, Result};
use crate::arbor::util::wait_deadline;
use crate::arbor::util::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsystemKind {
    Memory,
    Freezer,
    Cpu,
    Cpuacct,
    Blkio,
    NetCls,
    Devices,
}

impl SubsystemKind {
    pub const ALL: [SubsystemKind; 7] = [
        SubsystemKind::Freezer,
        SubsystemKind::Memory,
        SubsystemKind::Cpu,
        SubsystemKind::Cpuacct,
        SubsystemKind::NetCls,
        SubsystemKind::Blkio,
        SubsystemKind::Devices,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SubsystemKind::Memory => "memory",
            SubsystemKind::Freezer => "freezer",
            SubsystemKind::Cpu => "cpu",
            SubsystemKind::Cpuacct => "cpuacct",
            SubsystemKind::Blkio => "blkio",
            SubsystemKind::NetCls => "net_cls",
            SubsystemKind::Devices => "devices",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subsystem {
    pub kind: SubsystemKind,
    pub root: PathBuf,
    /// Leader of the hierarchy this subsystem is mounted into. Equal to
    /// `kind` unless the kernel co-mounted it with another subsystem.
    pub hierarchy: SubsystemKind,
}

impl Subsystem {
    pub fn is_leader(&self) -> bool {
        self.hierarchy == self.kind
    }
}

/// The controller table plus feature flags probed once at startup.
pub struct CgroupSet {
    subsystems: Vec<Subsystem>,
    pub memory: memory::MemoryController,
    pub freezer: freezer::FreezerController,
    pub cpu: cpu::CpuController,
    pub cpuacct: cpu::CpuacctController,
    pub blkio: blkio::BlkioController,
    pub devices: devices::DevicesController,
}

impl CgroupSet {
    /// Discovers subsystem mounts from /proc/self/mountinfo, falling back
    /// to `<sysfs_root>/<type>` for subsystems without a live mount (the
    /// fallback directory is created, which is also what the test suites
    /// rely on to run against a scratch tree). A non-default sysfs root is
    /// honored as-is and skips mount discovery.
    pub fn initialize(sysfs_root: &Path) -> Result<Self> {
        let mounts = if sysfs_root == Path::new("/sys/fs/cgroup") {
            read_cgroup_mounts()
        } else {
            BTreeMap::new()
        };
        let mut subsystems = Vec::with_capacity(SubsystemKind::ALL.len());

        for kind in SubsystemKind::ALL {
            let root = match mounts.get(kind.as_str()) {
                Some(target) => {
                    info!("found cgroup subsystem {} at {}", kind.as_str(), target.display());
                    target.clone()
                }
                None => {
                    let target = sysfs_root.join(kind.as_str());
                    fs::create_dir_all(&target).map_err(|err| {
                        ArborError::from(err).wrap(format!(
                            "create cgroup mountpoint for {}",
                            kind.as_str()
                        ))
                    })?;
                    if let Err(errno) = nix::mount::mount(
                        Some("cgroup"),
                        &target,
                        Some("cgroup"),
                        nix::mount::MsFlags::empty(),
                        Some(kind.as_str()),
                    ) {
                        // scratch trees and v2-only kernels run unmounted
                        info!(
                            "cannot mount cgroup subsystem {}: {}",
                            kind.as_str(),
                            errno
                        );
                    }
                    target
                }
            };

            let hierarchy = subsystems
                .iter()
                .find(|s: &&Subsystem| s.root == root)
                .map(|s| {
                    info!(
                        "cgroup subsystem {} bound to hierarchy {}",
                        kind.as_str(),
                        s.hierarchy.as_str()
                    );
                    s.hierarchy
                })
                .unwrap_or(kind);

            subsystems.push(Subsystem {
                kind,
                root,
                hierarchy,
            });
        }

        let mut set = Self {
            subsystems,
            memory: memory::MemoryController::default(),
            freezer: freezer::FreezerController::default(),
            cpu: cpu::CpuController::default(),
            cpuacct: cpu::CpuacctController::default(),
            blkio: blkio::BlkioController::default(),
            devices: devices::DevicesController::default(),
        };
        set.memory = memory::MemoryController::probe(&set.root_cgroup(SubsystemKind::Memory));
        set.cpu = cpu::CpuController::probe(&set.root_cgroup(SubsystemKind::Cpu));
        set.blkio = blkio::BlkioController::probe(&set.root_cgroup(SubsystemKind::Blkio));
        Ok(set)
    }

    pub fn subsystem(&self, kind: SubsystemKind) -> &Subsystem {
        self.subsystems
            .iter()
            .find(|s| s.kind == kind)
            .expect("all subsystems are registered at initialization")
    }

    /// Hierarchy leaders, the set of cgroups actually created per container.
    pub fn hierarchies(&self) -> impl Iterator<Item = &Subsystem> {
        self.subsystems.iter().filter(|s| s.is_leader())
    }

    /// Addresses a cgroup by logical path; does not touch the filesystem.
    pub fn cgroup(&self, kind: SubsystemKind, name: &str) -> Cgroup<'_> {
        debug_assert!(name.starts_with('/'));
        Cgroup {
            subsys: self.subsystem(kind),
            name: name.to_string(),
        }
    }

    pub fn root_cgroup(&self, kind: SubsystemKind) -> Cgroup<'_> {
        self.cgroup(kind, "/")
    }

    /// Subsystem names a pid belongs to, read from /proc/<pid>/cgroup.
    /// Returns the logical cgroup path within `kind`'s hierarchy.
    pub fn task_cgroup(&self, kind: SubsystemKind, pid: Pid) -> Result<Cgroup<'_>> {
        let text = fs::read_to_string(format!("/proc/{}/cgroup", pid.as_raw()))
            .map_err(|err| ArborError::from(err).wrap(format!("read cgroups of {}", pid)))?;
        for line in text.lines() {
            let mut fields = line.splitn(3, ':');
            let _id = fields.next();
            let controllers = fields.next().unwrap_or("");
            let path = fields.next().unwrap_or("/");
            if controllers.split(',').any(|c| c == kind.as_str()) {
                return Ok(self.cgroup(kind, path));
            }
        }
        Err(ArborError::unknown(format!(
            "cannot find {} cgroup for process {}",
            kind.as_str(),
            pid
        )))
    }
}

fn read_cgroup_mounts() -> BTreeMap<String, PathBuf> {
    let mut mounts = BTreeMap::new();
    let Ok(text) = fs::read_to_string("/proc/self/mountinfo") else {
        return mounts;
    };
    for line in text.lines() {
        // 36 35 98:0 / /sys/fs/cgroup/memory rw ... - cgroup cgroup rw,memory
        let Some((head, tail)) = line.split_once(" - ") else {
            continue;
        };
        let mut tail_fields = tail.split_whitespace();
        if tail_fields.next() != Some("cgroup") {
            continue;
        }
        let _source = tail_fields.next();
        let options = tail_fields.next().unwrap_or("");
        let Some(target) = head.split_whitespace().nth(4) else {
            continue;
        };
        for option in options.split(',') {
            if SubsystemKind::ALL.iter().any(|k| k.as_str() == option) {
                mounts.insert(option.to_string(), PathBuf::from(target));
            }
        }
    }
    mounts
}

/// A cgroup addressed by logical path within one subsystem hierarchy.
#[derive(Debug, Clone)]
pub struct Cgroup<'a> {
    pub subsys: &'a Subsystem,
    pub name: String,
}

impl<'a> Cgroup<'a> {
    pub fn path(&self) -> PathBuf {
        if self.is_root() {
            self.subsys.root.clone()
        } else {
            self.subsys.root.join(self.name.trim_start_matches('/'))
        }
    }

    pub fn knob_path(&self, knob: &str) -> PathBuf {
        self.path().join(knob)
    }

    pub fn is_root(&self) -> bool {
        self.name == "/"
    }

    /// Secondary cgroups live inside a hierarchy led by another subsystem
    /// and must not be created or removed on their own.
    pub fn is_secondary(&self) -> bool {
        !self.subsys.is_leader()
    }

    pub fn exists(&self) -> bool {
        self.path().is_dir()
    }

    pub fn child(&self, name: &str) -> Cgroup<'a> {
        debug_assert!(!name.starts_with('/'));
        let child_name = if self.is_root() {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.name, name)
        };
        Cgroup {
            subsys: self.subsys,
            name: child_name,
        }
    }

    pub fn create(&self) -> Result<()> {
        if self.is_secondary() {
            return Err(ArborError::unknown(format!(
                "cannot create secondary cgroup {}",
                self
            )));
        }
        info!("create cgroup {}", self);
        fs::create_dir(self.path()).map_err(|err| {
            let errno = err.raw_os_error().map(Errno::from_raw);
            match errno {
                Some(Errno::EEXIST) => ArborError::with_errno(
                    ErrorKind::Unknown,
                    Errno::EEXIST,
                    format!("cgroup {} already exists", self),
                ),
                _ => ArborError::from(err).wrap(format!("create cgroup {}", self)),
            }
        })
    }

    /// Idempotent on absence. EBUSY is retried within a bounded window,
    /// which covers the kernel's lazy release of exiting tasks.
    pub fn remove(&self) -> Result<()> {
        if self.is_secondary() {
            return Err(ArborError::unknown(format!(
                "cannot remove secondary cgroup {}",
                self
            )));
        }
        info!("remove cgroup {}", self);
        let mut result = fs::remove_dir(self.path());

        if matches!(&result, Err(err) if err.raw_os_error() == Some(libc::EBUSY)) {
            let deadline = current_time_ms() + config::cgroup_remove_timeout_ms();
            loop {
                result = fs::remove_dir(self.path());
                match &result {
                    Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {}
                    _ => break,
                }
                if wait_deadline(deadline) {
                    break;
                }
            }
        }

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoKind::NotFound => Ok(()),
            Err(err) => {
                let err = ArborError::from(err).wrap(format!("remove cgroup {}", self));
                warn!("{}", err);
                Err(err)
            }
        }
    }

    pub fn has_knob(&self, knob: &str) -> bool {
        self.knob_path(knob).is_file()
    }

    pub fn get(&self, knob: &str) -> Result<String> {
        fs::read_to_string(self.knob_path(knob))
            .map_err(|err| ArborError::from(err).wrap(format!("get {} {}", self, knob)))
    }

    pub fn set(&self, knob: &str, value: &str) -> Result<()> {
        info!("set {} {} = {}", self, knob, value);
        fs::write(self.knob_path(knob), value)
            .map_err(|err| ArborError::from(err).wrap(format!("set {} {}", self, knob)))
    }

    pub fn get_u64(&self, knob: &str) -> Result<u64> {
        let text = self.get(knob)?;
        text.trim().parse().map_err(|_| {
            ArborError::invalid_data(format!("{} {} is not a number: {}", self, knob, text.trim()))
        })
    }

    pub fn set_u64(&self, knob: &str, value: u64) -> Result<()> {
        self.set(knob, &value.to_string())
    }

    pub fn get_bool(&self, knob: &str) -> Result<bool> {
        Ok(self.get(knob)?.trim() != "0")
    }

    pub fn set_bool(&self, knob: &str, value: bool) -> Result<()> {
        self.set(knob, if value { "1" } else { "0" })
    }

    /// Parses `key value` line knobs such as memory.stat and cpuacct.stat.
    pub fn get_uint_map(&self, knob: &str) -> Result<BTreeMap<String, u64>> {
        let text = self.get(knob)?;
        let mut map = BTreeMap::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            if let (Some(key), Some(value)) = (fields.next(), fields.next()) {
                if let Ok(value) = value.parse() {
                    map.insert(key.to_string(), value);
                }
            }
        }
        Ok(map)
    }

    fn get_pids(&self, knob: &str) -> Result<Vec<Pid>> {
        let text = self.get(knob)?;
        Ok(text
            .split_whitespace()
            .filter_map(|t| t.parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect())
    }

    /// Threads in this cgroup.
    pub fn get_tasks(&self) -> Result<Vec<Pid>> {
        self.get_pids("tasks")
    }

    /// Thread-group leaders in this cgroup.
    pub fn get_procs(&self) -> Result<Vec<Pid>> {
        self.get_pids("cgroup.procs")
    }

    /// Empty on read failure as well: a missing cgroup holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.get_tasks().map(|t| t.is_empty()).unwrap_or(true)
    }

    pub fn attach(&self, pid: Pid) -> Result<()> {
        if self.is_secondary() {
            return Err(ArborError::unknown(format!(
                "cannot attach to secondary cgroup {}",
                self
            )));
        }
        info!("attach process {} to {}", pid, self);
        self.set("cgroup.procs", &pid.to_string())
            .map_err(|err| err.wrap(format!("attach {}", pid)))
    }

    /// Signals every task currently in the cgroup. Tasks may fork while we
    /// iterate; callers re-invoke until `is_empty`.
    pub fn kill_all(&self, signal: Signal) -> Result<()> {
        info!("kill_all {} {}", signal, self);
        let tasks = self.get_tasks()?;
        let mut result = Ok(());
        for pid in tasks {
            if let Err(errno) = kill(pid, signal) {
                if errno != Errno::ESRCH {
                    let err = ArborError::with_errno(
                        ErrorKind::Unknown,
                        errno,
                        format!("kill({}, {})", pid, signal),
                    );
                    warn!("cannot kill process {}: {}", pid, err);
                    result = Err(err);
                }
            }
        }
        result
    }
}

impl std::fmt::Display for Cgroup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.subsys.kind.as_str(), self.name)
    }
}
