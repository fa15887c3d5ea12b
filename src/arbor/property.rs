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

//! The property registry: one table mapping property names to accessors,
//! restore handling, a dynamic flag and the dirty-tracking tag. Setters
//! validate and assign; pushing values into the kernel happens separately
//! from the dirty bitset so restarts and restores apply minimal changes.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::arbor::caps::CapSet;
use crate::arbor::cgroup::cpu::num_cores;
use crate::arbor::container::{AccessLevel, ContainerInner, ContainerState, VirtMode};
use crate::arbor::net::{format_uint_map, parse_uint_map};
use crate::arbor::util::error::{ArborError, Result};

/// Dirty-tracking tags. Every persisted or kernel-visible property has
/// one; the fixed-size bitset in the container is indexed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Prop {
    Command,
    Cwd,
    Root,
    RootRo,
    User,
    Group,
    Env,
    Hostname,
    Bind,
    ResolvConf,
    Devices,
    Ulimit,
    Ip,
    DefaultGw,
    Net,
    StdinPath,
    StdoutPath,
    StderrPath,
    MemLimit,
    MemGuarantee,
    AnonLimit,
    DirtyLimit,
    RechargeOnPgfault,
    IoLimit,
    IoOpsLimit,
    IoPolicy,
    CpuPolicy,
    CpuLimit,
    CpuGuarantee,
    NetPrio,
    NetLimit,
    NetGuarantee,
    Respawn,
    MaxRespawns,
    AgingTime,
    Private,
    Isolate,
    BindDns,
    VirtMode,
    Capabilities,
    AccessLevel,
    Weak,
    Umask,
    State,
    RootPid,
    ExitStatus,
    OomKilled,
    StartTime,
    DeathTime,
    RespawnCount,
}

impl Prop {
    pub const COUNT: usize = Prop::RespawnCount as usize + 1;
}

/// Fixed-size bitset indexed by property tag.
#[derive(Debug, Clone)]
pub struct PropMask([bool; Prop::COUNT]);

impl Default for PropMask {
    fn default() -> Self {
        Self([false; Prop::COUNT])
    }
}

impl PropMask {
    pub fn set(&mut self, prop: Prop) {
        self.0[prop as usize] = true;
    }

    pub fn clear(&mut self, prop: Prop) {
        self.0[prop as usize] = false;
    }

    pub fn has(&self, prop: Prop) -> bool {
        self.0[prop as usize]
    }

    pub fn test_clear(&mut self, prop: Prop) -> bool {
        let was = self.0[prop as usize];
        self.0[prop as usize] = false;
        was
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|bit| *bit)
    }
}

type Getter = fn(&ContainerInner) -> Result<String>;
type Setter = fn(&mut ContainerInner, &str) -> Result<()>;

pub struct PropDef {
    pub name: &'static str,
    pub prop: Prop,
    /// Settable while the container is running.
    pub dynamic: bool,
    /// Refused for client writes; still restored from the kv node.
    pub read_only: bool,
    pub get: Getter,
    pub set: Setter,
    /// Overrides `get` when serializing to the kv node.
    pub get_save: Option<Getter>,
    /// Overrides `set` when restoring from the kv node.
    pub set_restore: Option<Setter>,
}

impl PropDef {
    fn new(name: &'static str, prop: Prop, get: Getter, set: Setter) -> Self {
        Self {
            name,
            prop,
            dynamic: false,
            read_only: false,
            get,
            set,
            get_save: None,
            set_restore: None,
        }
    }

    fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn save_as(mut self, get_save: Getter) -> Self {
        self.get_save = Some(get_save);
        self
    }

    fn restore_as(mut self, set_restore: Setter) -> Self {
        self.set_restore = Some(set_restore);
        self
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ArborError::invalid_value(format!(
            "expected true or false, got: {}",
            value
        ))),
    }
}

fn format_bool(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn parse_u64(value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| ArborError::invalid_value(format!("not a number: {}", value)))
}

fn parse_i64(value: &str) -> Result<i64> {
    value
        .trim()
        .parse()
        .map_err(|_| ArborError::invalid_value(format!("not a number: {}", value)))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn format_list(list: &[String]) -> String {
    list.join(";")
}

/// `nofile: 1024 2048; nproc: 100 100`
fn parse_ulimits(value: &str) -> Result<BTreeMap<String, (u64, u64)>> {
    let mut map = BTreeMap::new();
    for token in parse_list(value) {
        let (name, limits) = token
            .split_once(':')
            .ok_or_else(|| ArborError::invalid_value(format!("bad ulimit entry: {}", token)))?;
        let mut fields = limits.split_whitespace();
        let soft = fields
            .next()
            .ok_or_else(|| ArborError::invalid_value(format!("bad ulimit entry: {}", token)))?;
        let hard = fields.next().unwrap_or(soft);
        let parse = |text: &str| -> Result<u64> {
            if text == "unlimited" {
                Ok(u64::MAX)
            } else {
                parse_u64(text)
            }
        };
        map.insert(name.trim().to_string(), (parse(soft)?, parse(hard)?));
    }
    Ok(map)
}

fn format_ulimits(map: &BTreeMap<String, (u64, u64)>) -> String {
    map.iter()
        .map(|(name, (soft, hard))| {
            let fmt = |v: u64| {
                if v == u64::MAX {
                    "unlimited".to_string()
                } else {
                    v.to_string()
                }
            };
            format!("{}: {} {}", name, fmt(*soft), fmt(*hard))
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn registry_table() -> Vec<PropDef> {
    vec![
        PropDef::new(
            "command",
            Prop::Command,
            |ct| Ok(ct.command.clone()),
            |ct, v| {
                ct.command = v.to_string();
                Ok(())
            },
        ),
        PropDef::new(
            "cwd",
            Prop::Cwd,
            |ct| Ok(ct.cwd.clone()),
            |ct, v| {
                if !v.starts_with('/') {
                    return Err(ArborError::invalid_value("cwd must be an absolute path"));
                }
                ct.cwd = v.to_string();
                Ok(())
            },
        ),
        PropDef::new(
            "root",
            Prop::Root,
            |ct| Ok(ct.root.clone()),
            |ct, v| {
                if !v.starts_with('/') {
                    return Err(ArborError::invalid_value("root must be an absolute path"));
                }
                ct.root = v.to_string();
                Ok(())
            },
        ),
        PropDef::new(
            "root_readonly",
            Prop::RootRo,
            |ct| Ok(format_bool(ct.root_ro)),
            |ct, v| {
                ct.root_ro = parse_bool(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "user",
            Prop::User,
            |ct| Ok(crate::arbor::util::user_name(ct.owner_uid)),
            |ct, v| {
                let uid = match nix::unistd::User::from_name(v) {
                    Ok(Some(user)) => user.uid.as_raw(),
                    _ => parse_u64(v).map_err(|_| {
                        ArborError::invalid_value(format!("unknown user: {}", v))
                    })? as u32,
                };
                ct.owner_uid = uid;
                Ok(())
            },
        ),
        PropDef::new(
            "group",
            Prop::Group,
            |ct| {
                match nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(ct.owner_gid)) {
                    Ok(Some(group)) => Ok(group.name),
                    _ => Ok(ct.owner_gid.to_string()),
                }
            },
            |ct, v| {
                let gid = match nix::unistd::Group::from_name(v) {
                    Ok(Some(group)) => group.gid.as_raw(),
                    _ => parse_u64(v).map_err(|_| {
                        ArborError::invalid_value(format!("unknown group: {}", v))
                    })? as u32,
                };
                ct.owner_gid = gid;
                Ok(())
            },
        ),
        PropDef::new(
            "env",
            Prop::Env,
            |ct| Ok(format_list(&ct.env)),
            |ct, v| {
                let env = parse_list(v);
                for entry in &env {
                    if !entry.contains('=') {
                        return Err(ArborError::invalid_value(format!(
                            "environment entry without '=': {}",
                            entry
                        )));
                    }
                }
                ct.env = env;
                Ok(())
            },
        ),
        PropDef::new(
            "hostname",
            Prop::Hostname,
            |ct| Ok(ct.hostname.clone()),
            |ct, v| {
                ct.hostname = v.to_string();
                Ok(())
            },
        ),
        PropDef::new(
            "bind",
            Prop::Bind,
            |ct| Ok(format_list(&ct.bind_mounts)),
            |ct, v| {
                for entry in parse_list(v) {
                    let fields: Vec<&str> = entry.split_whitespace().collect();
                    if fields.len() < 2
                        || fields.len() > 3
                        || (fields.len() == 3 && fields[2] != "ro" && fields[2] != "rw")
                    {
                        return Err(ArborError::invalid_value(format!(
                            "bind entry must be <source> <target> [ro|rw]: {}",
                            entry
                        )));
                    }
                }
                ct.bind_mounts = parse_list(v);
                Ok(())
            },
        ),
        PropDef::new(
            "resolv_conf",
            Prop::ResolvConf,
            |ct| Ok(format_list(&ct.resolv_conf)),
            |ct, v| {
                ct.resolv_conf = parse_list(v);
                Ok(())
            },
        ),
        PropDef::new(
            "devices",
            Prop::Devices,
            |ct| Ok(format_list(&ct.devices)),
            |ct, v| {
                ct.devices = parse_list(v);
                Ok(())
            },
        ),
        PropDef::new(
            "ulimit",
            Prop::Ulimit,
            |ct| Ok(format_ulimits(&ct.ulimits)),
            |ct, v| {
                ct.ulimits = parse_ulimits(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "ip",
            Prop::Ip,
            |ct| Ok(format_list(&ct.ip_list)),
            |ct, v| {
                ct.ip_list = parse_list(v);
                Ok(())
            },
        ),
        PropDef::new(
            "default_gw",
            Prop::DefaultGw,
            |ct| Ok(format_list(&ct.default_gw)),
            |ct, v| {
                ct.default_gw = parse_list(v);
                Ok(())
            },
        ),
        PropDef::new(
            "net",
            Prop::Net,
            |ct| Ok(format_list(&ct.net_prop)),
            |ct, v| {
                let tokens = parse_list(v);
                crate::arbor::net::NetMode::parse(&tokens)?;
                ct.net_prop = tokens;
                Ok(())
            },
        ),
        PropDef::new(
            "stdin_path",
            Prop::StdinPath,
            |ct| Ok(ct.stdin.outside.clone()),
            |ct, v| {
                ct.stdin.outside = v.to_string();
                Ok(())
            },
        ),
        PropDef::new(
            "stdout_path",
            Prop::StdoutPath,
            |ct| Ok(ct.stdout.outside.clone()),
            |ct, v| {
                ct.stdout.outside = v.to_string();
                Ok(())
            },
        ),
        PropDef::new(
            "stderr_path",
            Prop::StderrPath,
            |ct| Ok(ct.stderr.outside.clone()),
            |ct, v| {
                ct.stderr.outside = v.to_string();
                Ok(())
            },
        ),
        PropDef::new(
            "memory_limit",
            Prop::MemLimit,
            |ct| Ok(ct.mem_limit.to_string()),
            |ct, v| {
                ct.mem_limit = parse_u64(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "memory_guarantee",
            Prop::MemGuarantee,
            |ct| Ok(ct.mem_guarantee.to_string()),
            |ct, v| {
                ct.mem_guarantee = parse_u64(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "anon_limit",
            Prop::AnonLimit,
            |ct| Ok(ct.anon_limit.to_string()),
            |ct, v| {
                ct.anon_limit = parse_u64(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "dirty_limit",
            Prop::DirtyLimit,
            |ct| Ok(ct.dirty_limit.to_string()),
            |ct, v| {
                ct.dirty_limit = parse_u64(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "recharge_on_pgfault",
            Prop::RechargeOnPgfault,
            |ct| Ok(format_bool(ct.recharge_on_pgfault)),
            |ct, v| {
                ct.recharge_on_pgfault = parse_bool(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "io_limit",
            Prop::IoLimit,
            |ct| Ok(ct.io_limit.to_string()),
            |ct, v| {
                ct.io_limit = parse_u64(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "io_ops_limit",
            Prop::IoOpsLimit,
            |ct| Ok(ct.io_ops_limit.to_string()),
            |ct, v| {
                ct.io_ops_limit = parse_u64(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "io_policy",
            Prop::IoPolicy,
            |ct| Ok(ct.io_policy.clone()),
            |ct, v| {
                if v != "normal" && v != "batch" {
                    return Err(ArborError::invalid_value(format!(
                        "unknown io policy: {}",
                        v
                    )));
                }
                ct.io_policy = v.to_string();
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "cpu_policy",
            Prop::CpuPolicy,
            |ct| Ok(ct.cpu_policy.clone()),
            |ct, v| {
                if v != "normal" && v != "rt" && v != "idle" {
                    return Err(ArborError::invalid_value(format!(
                        "unknown cpu policy: {}",
                        v
                    )));
                }
                ct.cpu_policy = v.to_string();
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "cpu_limit",
            Prop::CpuLimit,
            |ct| Ok(format!("{}c", ct.cpu_limit)),
            |ct, v| {
                ct.cpu_limit = parse_cpu_cores(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "cpu_guarantee",
            Prop::CpuGuarantee,
            |ct| Ok(format!("{}c", ct.cpu_guarantee)),
            |ct, v| {
                ct.cpu_guarantee = parse_cores(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "net_priority",
            Prop::NetPrio,
            |ct| Ok(format_uint_map(&ct.net_priority)),
            |ct, v| {
                let map = parse_uint_map(v)?;
                for (iface, prio) in &map {
                    if *prio > 7 {
                        return Err(ArborError::invalid_value(format!(
                            "priority for {} out of range 0-7",
                            iface
                        )));
                    }
                }
                ct.net_priority = map;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "net_limit",
            Prop::NetLimit,
            |ct| Ok(format_uint_map(&ct.net_limit)),
            |ct, v| {
                ct.net_limit = parse_uint_map(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "net_guarantee",
            Prop::NetGuarantee,
            |ct| Ok(format_uint_map(&ct.net_guarantee)),
            |ct, v| {
                ct.net_guarantee = parse_uint_map(v)?;
                Ok(())
            },
        )
        .dynamic(),
        PropDef::new(
            "respawn",
            Prop::Respawn,
            |ct| Ok(format_bool(ct.to_respawn)),
            |ct, v| {
                ct.to_respawn = parse_bool(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "max_respawns",
            Prop::MaxRespawns,
            |ct| Ok(ct.max_respawns.to_string()),
            |ct, v| {
                ct.max_respawns = parse_i64(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "aging_time",
            Prop::AgingTime,
            |ct| Ok(ct.aging_time_s.to_string()),
            |ct, v| {
                ct.aging_time_s = parse_u64(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "private",
            Prop::Private,
            |ct| Ok(ct.private.clone()),
            |ct, v| {
                ct.private = v.to_string();
                Ok(())
            },
        ),
        PropDef::new(
            "isolate",
            Prop::Isolate,
            |ct| Ok(format_bool(ct.isolate)),
            |ct, v| {
                ct.isolate = parse_bool(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "bind_dns",
            Prop::BindDns,
            |ct| Ok(format_bool(ct.bind_dns)),
            |ct, v| {
                ct.bind_dns = parse_bool(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "virt_mode",
            Prop::VirtMode,
            |ct| Ok(ct.virt_mode.as_str().to_string()),
            |ct, v| {
                ct.virt_mode = VirtMode::parse(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "capabilities",
            Prop::Capabilities,
            |ct| Ok(ct.cap_limit.to_string()),
            |ct, v| {
                ct.cap_limit = CapSet::parse(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "access_level",
            Prop::AccessLevel,
            |ct| Ok(ct.access_level.as_str().to_string()),
            |ct, v| {
                ct.access_level = AccessLevel::parse(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "weak",
            Prop::Weak,
            |ct| Ok(format_bool(ct.is_weak)),
            |ct, v| {
                ct.is_weak = parse_bool(v)?;
                Ok(())
            },
        ),
        PropDef::new(
            "umask",
            Prop::Umask,
            |ct| Ok(format!("{:o}", ct.umask)),
            |ct, v| {
                ct.umask = u32::from_str_radix(v, 8)
                    .map_err(|_| ArborError::invalid_value(format!("bad umask: {}", v)))?;
                Ok(())
            },
        ),
        // Runtime read-outs. Read-only for clients, restored from the kv
        // node so state survives a slave restart.
        PropDef::new(
            "state",
            Prop::State,
            |ct| Ok(ct.state.as_str().to_string()),
            |ct, v| {
                ct.state = ContainerState::parse(v)?;
                Ok(())
            },
        )
        .read_only(),
        PropDef::new(
            "root_pid",
            Prop::RootPid,
            |ct| {
                if ct.task_pid == 0 {
                    return Err(ArborError::invalid_state("container has no task"));
                }
                Ok(ct.task_pid.to_string())
            },
            |ct, v| {
                ct.task_pid = parse_i64(v)? as i32;
                Ok(())
            },
        )
        .read_only()
        .save_as(|ct| Ok(format!("{};{};{}", ct.task_pid, ct.task_vpid, ct.wait_task_pid)))
        .restore_as(|ct, v| {
            let fields: Vec<&str> = v.split(';').collect();
            match fields.as_slice() {
                [pid] => {
                    ct.task_pid = parse_i64(pid)? as i32;
                    ct.task_vpid = ct.task_pid;
                    ct.wait_task_pid = ct.task_pid;
                }
                [pid, vpid, wait_pid] => {
                    ct.task_pid = parse_i64(pid)? as i32;
                    ct.task_vpid = parse_i64(vpid)? as i32;
                    ct.wait_task_pid = parse_i64(wait_pid)? as i32;
                }
                _ => {
                    return Err(ArborError::invalid_data(format!(
                        "bad root_pid record: {}",
                        v
                    )))
                }
            }
            Ok(())
        }),
        PropDef::new(
            "exit_status",
            Prop::ExitStatus,
            |ct| {
                if ct.state != ContainerState::Dead {
                    return Err(ArborError::invalid_state("container is not dead"));
                }
                Ok(ct.exit_status.to_string())
            },
            |ct, v| {
                ct.exit_status = parse_i64(v)? as i32;
                Ok(())
            },
        )
        .read_only()
        .save_as(|ct| Ok(ct.exit_status.to_string())),
        PropDef::new(
            "oom_killed",
            Prop::OomKilled,
            |ct| {
                if ct.state != ContainerState::Dead {
                    return Err(ArborError::invalid_state("container is not dead"));
                }
                Ok(format_bool(ct.oom_killed))
            },
            |ct, v| {
                ct.oom_killed = parse_bool(v)?;
                Ok(())
            },
        )
        .read_only()
        .save_as(|ct| Ok(format_bool(ct.oom_killed))),
        PropDef::new(
            "start_time",
            Prop::StartTime,
            |ct| Ok(ct.start_time_ms.to_string()),
            |ct, v| {
                ct.start_time_ms = parse_u64(v)?;
                Ok(())
            },
        )
        .read_only(),
        PropDef::new(
            "death_time",
            Prop::DeathTime,
            |ct| Ok(ct.death_time_ms.to_string()),
            |ct, v| {
                ct.death_time_ms = parse_u64(v)?;
                Ok(())
            },
        )
        .read_only(),
        PropDef::new(
            "respawn_count",
            Prop::RespawnCount,
            |ct| Ok(ct.respawn_count.to_string()),
            |ct, v| {
                ct.respawn_count = parse_u64(v)?;
                Ok(())
            },
        )
        .read_only(),
    ]
}

/// Accepts plain core counts with an optional `c` suffix: `2`, `1.5c`.
fn parse_cores(value: &str) -> Result<f64> {
    let text = value.trim().trim_end_matches('c');
    let cores: f64 = text
        .parse()
        .map_err(|_| ArborError::invalid_value(format!("bad cpu value: {}", value)))?;
    if cores < 0.0 {
        return Err(ArborError::invalid_value(format!(
            "negative cpu value: {}",
            value
        )));
    }
    Ok(cores)
}

/// Same grammar; zero lifts the limit to the machine's core count.
fn parse_cpu_cores(value: &str) -> Result<f64> {
    let cores = parse_cores(value)?;
    if cores == 0.0 {
        return Ok(num_cores() as f64);
    }
    Ok(cores)
}

pub fn registry() -> &'static [PropDef] {
    static REGISTRY: OnceLock<Vec<PropDef>> = OnceLock::new();
    REGISTRY.get_or_init(registry_table)
}

pub fn find(name: &str) -> Option<&'static PropDef> {
    registry().iter().find(|def| def.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbor::container::ContainerInner;

    fn inner() -> ContainerInner {
        ContainerInner::new_for_tests()
    }

    #[test]
    fn every_prop_tag_is_unique() {
        let mut seen = [false; Prop::COUNT];
        for def in registry() {
            assert!(!seen[def.prop as usize], "duplicate tag for {}", def.name);
            seen[def.prop as usize] = true;
        }
    }

    #[test]
    fn recognized_set_matches_the_external_surface() {
        for name in [
            "command",
            "cwd",
            "root",
            "user",
            "group",
            "env",
            "memory_limit",
            "memory_guarantee",
            "anon_limit",
            "dirty_limit",
            "recharge_on_pgfault",
            "io_limit",
            "io_ops_limit",
            "io_policy",
            "cpu_policy",
            "cpu_limit",
            "cpu_guarantee",
            "net_priority",
            "net_limit",
            "net_guarantee",
            "respawn",
            "max_respawns",
            "aging_time",
            "private",
            "isolate",
            "bind_dns",
            "virt_mode",
            "capabilities",
            "hostname",
            "devices",
            "ulimit",
            "bind",
            "ip",
            "default_gw",
            "resolv_conf",
            "net",
            "access_level",
            "weak",
            "umask",
        ] {
            assert!(find(name).is_some(), "missing property {}", name);
        }
        assert!(find("bogus").is_none());
    }

    #[test]
    fn dynamic_flags_follow_the_table() {
        for (name, dynamic) in [
            ("command", false),
            ("memory_limit", true),
            ("cpu_limit", true),
            ("net_priority", true),
            ("respawn", false),
            ("isolate", false),
        ] {
            assert_eq!(find(name).unwrap().dynamic, dynamic, "{}", name);
        }
    }

    #[test]
    fn setter_validation_rejects_garbage() {
        let mut ct = inner();
        assert!((find("memory_limit").unwrap().set)(&mut ct, "lots").is_err());
        assert!((find("cwd").unwrap().set)(&mut ct, "relative/path").is_err());
        assert!((find("env").unwrap().set)(&mut ct, "NOEQUALS").is_err());
        assert!((find("io_policy").unwrap().set)(&mut ct, "turbo").is_err());
        assert!((find("net_priority").unwrap().set)(&mut ct, "default: 9").is_err());
        assert!((find("umask").unwrap().set)(&mut ct, "999").is_err());
        assert!((find("bind").unwrap().set)(&mut ct, "/src").is_err());
    }

    #[test]
    fn value_round_trips_through_get_set() {
        let mut ct = inner();
        for (name, value) in [
            ("command", "/bin/sleep 3"),
            ("memory_limit", "104857600"),
            ("cpu_policy", "rt"),
            ("net_priority", "default: 5;eth0: 1"),
            ("ulimit", "nofile: 1024 2048"),
            ("capabilities", "CAP_KILL;CAP_NET_ADMIN"),
            ("virt_mode", "os"),
            ("access_level", "read-only"),
            ("umask", "22"),
        ] {
            let def = find(name).unwrap();
            (def.set)(&mut ct, value).unwrap_or_else(|e| panic!("set {}: {}", name, e));
            assert_eq!((def.get)(&ct).unwrap(), value, "{}", name);
        }
    }

    #[test]
    fn cpu_values_accept_core_suffix() {
        let mut ct = inner();
        let def = find("cpu_limit").unwrap();
        (def.set)(&mut ct, "1.5c").unwrap();
        assert_eq!(ct.cpu_limit, 1.5);
        (def.set)(&mut ct, "2").unwrap();
        assert_eq!(ct.cpu_limit, 2.0);
        (def.set)(&mut ct, "0").unwrap();
        assert_eq!(ct.cpu_limit, num_cores() as f64);
    }

    #[test]
    fn root_pid_restores_the_triple() {
        let mut ct = inner();
        let def = find("root_pid").unwrap();
        let restore = def.set_restore.unwrap();
        restore(&mut ct, "100;2;101").unwrap();
        assert_eq!(
            (ct.task_pid, ct.task_vpid, ct.wait_task_pid),
            (100, 2, 101)
        );
        restore(&mut ct, "200").unwrap();
        assert_eq!(
            (ct.task_pid, ct.task_vpid, ct.wait_task_pid),
            (200, 200, 200)
        );
        assert!(restore(&mut ct, "1;2").is_err());
    }

    #[test]
    fn dead_only_readouts_check_state() {
        let mut ct = inner();
        ct.state = ContainerState::Running;
        assert!((find("exit_status").unwrap().get)(&ct).is_err());
        ct.state = ContainerState::Dead;
        ct.exit_status = 0;
        assert_eq!((find("exit_status").unwrap().get)(&ct).unwrap(), "0");
    }
}
