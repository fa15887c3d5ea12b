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

//! Device ACL entries. A container's `devices` property holds lines of
//! the form `<path> [rwm]` granting the exec'd process access to host
//! device nodes; the grant is enforced through the devices cgroup and
//! mirrored as a node inside the container's /dev.

use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::PathBuf;

use nix::unistd::{Gid, Uid};

use crate::arbor::util::error::{ArborError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub path: PathBuf,
    /// 'c' or 'b'.
    pub node_type: char,
    pub major: u64,
    pub minor: u64,
    pub read: bool,
    pub write: bool,
    pub mknod: bool,
}

impl Device {
    /// Parses `<path> [access]` where access defaults to `rwm`. The path
    /// must name an existing character or block device.
    pub fn parse(cfg: &str) -> Result<Self> {
        let mut fields = cfg.split_whitespace();
        let path = fields
            .next()
            .ok_or_else(|| ArborError::invalid_value("empty device entry"))?;
        let access = fields.next().unwrap_or("rwm");
        if fields.next().is_some() {
            return Err(ArborError::invalid_value(format!(
                "trailing tokens in device entry: {}",
                cfg
            )));
        }
        if !path.starts_with("/dev/") {
            return Err(ArborError::invalid_value(format!(
                "device path outside /dev: {}",
                path
            )));
        }
        if access.is_empty() || !access.chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
            return Err(ArborError::invalid_value(format!(
                "bad device access: {}",
                access
            )));
        }

        let meta = std::fs::metadata(path)
            .map_err(|err| ArborError::from(err).wrap(format!("device {}", path)))?;
        let file_type = meta.file_type();
        let node_type = if file_type.is_char_device() {
            'c'
        } else if file_type.is_block_device() {
            'b'
        } else {
            return Err(ArborError::invalid_value(format!(
                "{} is not a device node",
                path
            )));
        };

        let rdev = meta.rdev();
        Ok(Self {
            path: PathBuf::from(path),
            node_type,
            major: libc::major(rdev) as u64,
            minor: libc::minor(rdev) as u64,
            read: access.contains('r'),
            write: access.contains('w'),
            mknod: access.contains('m'),
        })
    }

    /// A non-root owner may only grant access it holds itself on the host
    /// node (world bits are enough for the common /dev devices).
    pub fn permitted(&self, uid: Uid, gid: Gid) -> Result<()> {
        if uid.is_root() {
            return Ok(());
        }
        let meta = std::fs::metadata(&self.path)
            .map_err(|err| ArborError::from(err).wrap(format!("device {}", self.path.display())))?;
        let mode = meta.permissions().mode();

        let (read_bit, write_bit) = if meta.uid() == uid.as_raw() {
            (0o400, 0o200)
        } else if meta.gid() == gid.as_raw() {
            (0o040, 0o020)
        } else {
            (0o004, 0o002)
        };

        if (self.read && mode & read_bit == 0) || (self.write && mode & write_bit == 0) {
            return Err(ArborError::permission(format!(
                "no host access to device {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Rule line for devices.allow / devices.deny.
    pub fn cgroup_rule(&self, allow: bool) -> String {
        let mut access = String::new();
        if self.read == allow {
            access.push('r');
        }
        if self.write == allow {
            access.push('w');
        }
        if self.mknod == allow {
            access.push('m');
        }
        if access.is_empty() || (!allow && access.len() == 3) {
            return String::new();
        }
        format!("{} {}:{} {}", self.node_type, self.major, self.minor, access)
    }

    /// Mode bits for the node created inside the container's /dev.
    pub fn node_mode(&self) -> u32 {
        let type_bits = if self.node_type == 'b' {
            libc::S_IFBLK
        } else {
            libc::S_IFCHR
        };
        let mut perm = 0;
        if self.read {
            perm |= 0o444;
        }
        if self.write {
            perm |= 0o222;
        }
        type_bits | perm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_to_full_access() {
        let dev = Device::parse("/dev/null").unwrap();
        assert_eq!(dev.node_type, 'c');
        assert_eq!((dev.major, dev.minor), (1, 3));
        assert!(dev.read && dev.write && dev.mknod);
    }

    #[test]
    fn parse_honors_access_letters() {
        let dev = Device::parse("/dev/zero rw").unwrap();
        assert!(dev.read && dev.write && !dev.mknod);
        assert_eq!(dev.cgroup_rule(true), "c 1:5 rw");
    }

    #[test]
    fn parse_rejects_non_devices() {
        assert!(Device::parse("/etc/passwd rwm").is_err());
        assert!(Device::parse("/dev/definitely-missing rwm").is_err());
        assert!(Device::parse("/dev/null xyz").is_err());
    }

    #[test]
    fn deny_rule_lists_the_withheld_bits() {
        let dev = Device::parse("/dev/null r").unwrap();
        assert_eq!(dev.cgroup_rule(true), "c 1:3 r");
        assert_eq!(dev.cgroup_rule(false), "c 1:3 wm");
    }

    #[test]
    fn world_readable_device_is_permitted_for_any_owner() {
        let dev = Device::parse("/dev/null rw").unwrap();
        dev.permitted(Uid::from_raw(12345), Gid::from_raw(12345))
            .unwrap();
    }
}
