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

//! Capability bitsets. A container carries three sets: the ambient set
//! granted to the exec'd process, the allowed ceiling for ambient grants
//! and the bounding-set ceiling for setuid-gained capabilities. The sets
//! obey `ambient ⊆ allowed ⊆ limit ⊆ ⋂ ancestors.limit`.

use std::fmt;

use crate::arbor::util::error::{ArborError, Result};

const CAP_NAMES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

const fn bit(name_index: usize) -> u64 {
    1u64 << name_index
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapSet(pub u64);

pub const NO_CAPS: CapSet = CapSet(0);
pub const ALL_CAPS: CapSet = CapSet((1u64 << CAP_NAMES.len()) - 1);

/// Ceiling for app-mode containers owned by a non-root user.
pub const APP_MODE_CAPS: CapSet = CapSet(
    bit(0)  // CAP_CHOWN
        | bit(1)  // CAP_DAC_OVERRIDE
        | bit(3)  // CAP_FOWNER
        | bit(4)  // CAP_FSETID
        | bit(5)  // CAP_KILL
        | bit(6)  // CAP_SETGID
        | bit(7)  // CAP_SETUID
        | bit(8)  // CAP_SETPCAP
        | bit(9)  // CAP_LINUX_IMMUTABLE
        | bit(10) // CAP_NET_BIND_SERVICE
        | bit(12) // CAP_NET_ADMIN
        | bit(13) // CAP_NET_RAW
        | bit(14) // CAP_IPC_LOCK
        | bit(18) // CAP_SYS_CHROOT
        | bit(19) // CAP_SYS_PTRACE
        | bit(27) // CAP_MKNOD
        | bit(29) // CAP_AUDIT_WRITE
        | bit(31), // CAP_SETFCAP
);

/// Os-mode containers run an init and get a wider ceiling.
pub const OS_MODE_CAPS: CapSet = CapSet(
    APP_MODE_CAPS.0
        | bit(22) // CAP_SYS_BOOT
        | bit(23) // CAP_SYS_NICE
        | bit(24) // CAP_SYS_RESOURCE
        | bit(30) // CAP_AUDIT_CONTROL
        | bit(34), // CAP_SYSLOG
);

/// Tighter ceiling for capabilities regained through setuid binaries in
/// app mode.
pub const SUID_CAPS: CapSet = CapSet(
    bit(0)
        | bit(1)
        | bit(3)
        | bit(4)
        | bit(5)
        | bit(6)
        | bit(7)
        | bit(8)
        | bit(10)
        | bit(13)
        | bit(14)
        | bit(18)
        | bit(27)
        | bit(29)
        | bit(31),
);

/// Capabilities that reach across a shared pid namespace.
pub const PIDNS_CAPS: CapSet = CapSet(bit(5) | bit(19));
/// Capabilities that can pin memory past any cgroup limit.
pub const MEMCG_CAPS: CapSet = CapSet(bit(14) | bit(21));
/// Capabilities that reconfigure a shared network namespace.
pub const NETNS_CAPS: CapSet = CapSet(bit(12) | bit(13));

impl CapSet {
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: CapSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: CapSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn intersect(self, other: CapSet) -> CapSet {
        CapSet(self.0 & other.0)
    }

    pub fn union(self, other: CapSet) -> CapSet {
        CapSet(self.0 | other.0)
    }

    /// Parses a `;`-separated list of CAP_ names; empty input is the
    /// empty set.
    pub fn parse(text: &str) -> Result<CapSet> {
        let mut set = NO_CAPS;
        for token in text.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let index = CAP_NAMES
                .iter()
                .position(|name| name.eq_ignore_ascii_case(token))
                .ok_or_else(|| {
                    ArborError::invalid_value(format!("unknown capability: {}", token))
                })?;
            set.0 |= bit(index);
        }
        Ok(set)
    }
}

impl fmt::Display for CapSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (index, name) in CAP_NAMES.iter().enumerate() {
            if self.0 & bit(index) != 0 {
                if !first {
                    f.write_str(";")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Whether this kernel supports ambient capabilities.
pub fn has_ambient_support() -> bool {
    unsafe { libc::prctl(libc::PR_CAP_AMBIENT, libc::PR_CAP_AMBIENT_IS_SET, 0, 0, 0) >= 0 }
}

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Drops everything outside `limit` from the bounding set. Runs in the
/// forked child before exec.
pub fn apply_bounding_set(limit: CapSet) -> Result<()> {
    for index in 0..CAP_NAMES.len() {
        if limit.0 & bit(index) != 0 {
            continue;
        }
        let ret = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, index as libc::c_ulong, 0, 0, 0) };
        if ret < 0 {
            let errno = nix::errno::Errno::last();
            // older kernels know fewer capabilities
            if errno == nix::errno::Errno::EINVAL {
                break;
            }
            return Err(ArborError::with_errno(
                crate::arbor::util::error::ErrorKind::Unknown,
                errno,
                format!("drop bounding {}", CAP_NAMES[index]),
            ));
        }
    }
    Ok(())
}

/// Raises `ambient` into the ambient set. The capabilities must first be
/// made inheritable; runs in the forked child after credentials drop.
pub fn apply_ambient_set(ambient: CapSet) -> Result<()> {
    if ambient.is_empty() || !has_ambient_support() {
        return Ok(());
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];
    let ret = unsafe { libc::syscall(libc::SYS_capget, &header, data.as_mut_ptr()) };
    if ret < 0 {
        return Err(ArborError::from(nix::errno::Errno::last()).wrap("capget"));
    }

    data[0].inheritable = (ambient.0 & 0xffff_ffff) as u32;
    data[1].inheritable = (ambient.0 >> 32) as u32;
    let ret = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if ret < 0 {
        return Err(ArborError::from(nix::errno::Errno::last()).wrap("capset inheritable"));
    }

    for index in 0..CAP_NAMES.len() {
        if ambient.0 & bit(index) == 0 {
            continue;
        }
        let ret = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_RAISE,
                index as libc::c_ulong,
                0,
                0,
            )
        };
        if ret < 0 {
            return Err(ArborError::from(nix::errno::Errno::last())
                .wrap(format!("raise ambient {}", CAP_NAMES[index])));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        let set = CapSet::parse("CAP_NET_ADMIN;CAP_SYS_PTRACE").unwrap();
        assert!(set.intersects(NETNS_CAPS));
        assert!(set.intersects(PIDNS_CAPS));
        assert_eq!(set.to_string(), "CAP_NET_ADMIN;CAP_SYS_PTRACE");
        assert_eq!(CapSet::parse(&set.to_string()).unwrap(), set);
    }

    #[test]
    fn empty_input_is_the_empty_set() {
        assert_eq!(CapSet::parse("").unwrap(), NO_CAPS);
        assert_eq!(NO_CAPS.to_string(), "");
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(CapSet::parse("CAP_FLY").is_err());
    }

    #[test]
    fn preset_chains_are_ordered() {
        assert!(ALL_CAPS.contains(OS_MODE_CAPS));
        assert!(OS_MODE_CAPS.contains(APP_MODE_CAPS));
        assert!(APP_MODE_CAPS.contains(SUID_CAPS));
        assert!(APP_MODE_CAPS.contains(PIDNS_CAPS));
        assert!(APP_MODE_CAPS.contains(NETNS_CAPS));
        assert!(MEMCG_CAPS.contains(CapSet::parse("CAP_SYS_ADMIN").unwrap()));
    }

    #[test]
    fn intersect_narrows() {
        let set = CapSet::parse("CAP_SYS_ADMIN;CAP_KILL").unwrap();
        let narrowed = set.intersect(APP_MODE_CAPS);
        assert_eq!(narrowed, CapSet::parse("CAP_KILL").unwrap());
    }
}
