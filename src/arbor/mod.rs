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

pub mod caps;
pub mod cgroup;
pub mod config;
pub mod container;
pub mod device;
pub mod events;
pub mod holder;
pub mod kv;
pub mod logger;
pub mod net;
pub mod property;
pub mod stream;
pub mod supervisor;
pub mod task;
pub mod util;
pub mod volume;

pub use config::Config;

/// Host root container, the top of every container tree.
pub const ROOT_CONTAINER: &str = "/";
/// Synthetic parent of all user containers.
pub const ARBOR_ROOT_CONTAINER: &str = "/arbor";

pub const ROOT_CONTAINER_ID: u32 = 1;
pub const ARBOR_ROOT_CONTAINER_ID: u32 = 3;

pub const ARBOR_ROOT_CGROUP: &str = "/arbor";
pub const ARBOR_DAEMON_CGROUP: &str = "/arbord";

pub const CONTAINER_NAME_MAX: usize = 128;
pub const CONTAINER_PATH_MAX: usize = 200;
pub const CONTAINER_ID_MAX: u32 = 16384;
pub const CONTAINER_LEVEL_MAX: usize = 7;

pub const NAME_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-@:./";

/// Inherited descriptors connecting the master and the slave.
pub const REAP_EVT_FD: i32 = 128;
pub const REAP_ACK_FD: i32 = 129;
