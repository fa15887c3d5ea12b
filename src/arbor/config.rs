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

use std::env;
use std::path::PathBuf;

/// Enum for supported configuration parameters. Every path can be
/// overridden through its environment variable, which is also how the
/// test suites redirect the daemon into a temporary directory.
#[derive(Debug, Clone, Copy)]
pub enum Config {
    /// Directory holding one key-value node per container id.
    KeyValueDir,
    /// Advisory lock file guarding the key-value directory.
    LockFile,
    /// Per-container working directories and std streams.
    WorkDir,
    /// Root of the cgroup subsystem mounts.
    SysfsRoot,
    LogFile,
    MasterPidFile,
    SlavePidFile,
    /// Snapshot of unacknowledged exit statuses across master re-exec.
    PidMapFile,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::KeyValueDir => "ARBOR_KEYVALUE_DIR",
            Config::LockFile => "ARBOR_LOCK_FILE",
            Config::WorkDir => "ARBOR_WORK_DIR",
            Config::SysfsRoot => "ARBOR_SYSFS_ROOT",
            Config::LogFile => "ARBOR_LOG_FILE",
            Config::MasterPidFile => "ARBOR_MASTER_PID_FILE",
            Config::SlavePidFile => "ARBOR_SLAVE_PID_FILE",
            Config::PidMapFile => "ARBOR_PIDMAP_FILE",
        }
    }

    /// Returns the default path used when the environment does not
    /// override the parameter.
    pub fn default_path(&self) -> &'static str {
        match self {
            Config::KeyValueDir => {
                #[cfg(test)]
                {
                    "/tmp/arbor-test/kv"
                }
                #[cfg(not(test))]
                {
                    "/run/arbor/kv"
                }
            }
            Config::LockFile => {
                #[cfg(test)]
                {
                    "/tmp/arbor-test/kv.lock"
                }
                #[cfg(not(test))]
                {
                    "/run/arbor/kv.lock"
                }
            }
            Config::WorkDir => {
                #[cfg(test)]
                {
                    "/tmp/arbor-test/containers"
                }
                #[cfg(not(test))]
                {
                    "/place/arbor/containers"
                }
            }
            Config::SysfsRoot => {
                #[cfg(test)]
                {
                    "/tmp/arbor-test/cgroup"
                }
                #[cfg(not(test))]
                {
                    "/sys/fs/cgroup"
                }
            }
            Config::LogFile => "/var/log/arbord.log",
            Config::MasterPidFile => "/run/arbord.pid",
            Config::SlavePidFile => "/run/arbord-slave.pid",
            Config::PidMapFile => "/run/arbord.pidmap",
        }
    }

    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var())
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(self.default_path()))
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Seconds a dead container lingers before auto-stop.
pub fn default_aging_time_s() -> u64 {
    env_u64("ARBOR_AGING_TIME_S", 60 * 60 * 24)
}

/// Delay before a scheduled respawn fires.
pub fn respawn_delay_ms() -> u64 {
    env_u64("ARBOR_RESPAWN_DELAY_MS", 1000)
}

/// SIGTERM grace period used by stop and respawn.
pub fn kill_timeout_ms() -> u64 {
    env_u64("ARBOR_KILL_TIMEOUT_MS", 30_000)
}

pub fn stop_timeout_ms() -> u64 {
    env_u64("ARBOR_STOP_TIMEOUT_MS", 5 * 60_000)
}

/// Bound on waiting for freezer state flips.
pub fn freezer_wait_timeout_ms() -> u64 {
    env_u64("ARBOR_FREEZER_WAIT_TIMEOUT_MS", 5 * 60_000)
}

/// Bound on retrying EBUSY cgroup removal.
pub fn cgroup_remove_timeout_ms() -> u64 {
    env_u64("ARBOR_CGROUP_REMOVE_TIMEOUT_MS", 300_000)
}

/// Byte cap for container stdout/stderr files before rotation.
pub fn stdio_limit_bytes() -> u64 {
    env_u64("ARBOR_STDIO_LIMIT", 8 << 20)
}

pub fn max_containers() -> u64 {
    env_u64("ARBOR_MAX_CONTAINERS", crate::arbor::CONTAINER_ID_MAX as u64)
}

/// Period of the log-rotation sweep in the event loop.
pub fn rotate_logs_period_ms() -> u64 {
    env_u64("ARBOR_ROTATE_PERIOD_MS", 60_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_default_path() {
        let key = Config::KeyValueDir.env_var();
        let previous = env::var(key).ok();
        env::set_var(key, "/tmp/arbor-other-kv");
        assert_eq!(
            Config::KeyValueDir.get_path(),
            PathBuf::from("/tmp/arbor-other-kv")
        );
        match previous {
            Some(prev) => env::set_var(key, prev),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn test_defaults_stay_in_tmp() {
        assert!(Config::WorkDir
            .default_path()
            .starts_with("/tmp/arbor-test"));
        assert!(Config::SysfsRoot
            .default_path()
            .starts_with("/tmp/arbor-test"));
    }
}
