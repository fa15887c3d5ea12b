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

//! Network attachment for containers. The supervision core only decides
//! *what* traffic classes exist and with which rates; the netlink
//! conversation that realizes them is behind [`NetlinkBackend`], an
//! external concern. Containers attach to a preconfigured host network;
//! per-container isolation beyond `none`/`inherited` is out of scope.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

use crate::arbor::util::error::{ArborError, Result};

pub const ROOT_TC_MAJOR: u32 = 1;
pub const ROOT_TC_MINOR: u32 = 0;
pub const NET_DEFAULT_PRIO: u64 = 3;
pub const NET_MAX_RATE: u64 = 2_000_000_000;

/// Packs a tc class handle the way the kernel encodes `major:minor`.
pub fn tc_handle(major: u32, minor: u32) -> u32 {
    (major << 16) | (minor & 0xffff)
}

/// Per-interface unsigned maps: `default: 3;eth0: 5`. The `default` key
/// applies to interfaces without an explicit entry.
pub type UintMap = BTreeMap<String, u64>;

pub fn parse_uint_map(text: &str) -> Result<UintMap> {
    let mut map = UintMap::new();
    for token in text.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (key, value) = token.split_once(':').ok_or_else(|| {
            ArborError::invalid_value(format!("expected <iface>: <value>, got: {}", token))
        })?;
        let value: u64 = value.trim().parse().map_err(|_| {
            ArborError::invalid_value(format!("bad value in map entry: {}", token))
        })?;
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}

pub fn format_uint_map(map: &UintMap) -> String {
    map.iter()
        .map(|(key, value)| format!("{}: {}", key, value))
        .collect::<Vec<_>>()
        .join(";")
}

/// Requested network mode, from the `net` property.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetMode {
    /// Share the parent's namespace and classes.
    #[default]
    Inherited,
    /// Loopback only.
    None,
    /// The host namespace, explicit.
    Host,
    /// Join a named netns prepared by the operator.
    Netns(String),
}

impl NetMode {
    pub fn parse(tokens: &[String]) -> Result<NetMode> {
        let Some(first) = tokens.first() else {
            return Ok(NetMode::Inherited);
        };
        let mut fields = first.split_whitespace();
        let mode = match fields.next() {
            None | Some("inherited") => NetMode::Inherited,
            Some("none") => NetMode::None,
            Some("host") => NetMode::Host,
            Some("netns") => {
                let name = fields
                    .next()
                    .ok_or_else(|| ArborError::invalid_value("netns requires a name"))?;
                NetMode::Netns(name.to_string())
            }
            Some(other) => {
                return Err(ArborError::invalid_value(format!(
                    "unknown net mode: {}",
                    other
                )))
            }
        };
        Ok(mode)
    }
}

impl fmt::Display for NetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetMode::Inherited => f.write_str("inherited"),
            NetMode::None => f.write_str("none"),
            NetMode::Host => f.write_str("host"),
            NetMode::Netns(name) => write!(f, "netns {}", name),
        }
    }
}

/// Class settings shipped to the backend.
#[derive(Debug, Clone, Default)]
pub struct TcClass {
    pub handle: u32,
    pub parent: u32,
    /// Leaf classes carry traffic; inner classes only shape children.
    pub leaf: bool,
    pub prio: UintMap,
    pub rate: UintMap,
    pub ceil: UintMap,
}

/// Kernel-facing side of traffic shaping. The real implementation talks
/// rtnetlink; the default logs and accepts everything, which also serves
/// the test suites.
pub trait NetlinkBackend: Send + Sync {
    fn create_class(&self, class: &TcClass) -> Result<()>;
    fn destroy_class(&self, handle: u32) -> Result<()>;
    fn refresh(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NullNetlink;

impl NetlinkBackend for NullNetlink {
    fn create_class(&self, class: &TcClass) -> Result<()> {
        info!(
            "tc class {:x}:{:x} parent {:x}:{:x} leaf {}",
            class.handle >> 16,
            class.handle & 0xffff,
            class.parent >> 16,
            class.parent & 0xffff,
            class.leaf
        );
        Ok(())
    }

    fn destroy_class(&self, handle: u32) -> Result<()> {
        info!("tc destroy class {:x}:{:x}", handle >> 16, handle & 0xffff);
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// One managed network (normally the host network). Holds its own lock,
/// taken only while already holding the container lock.
pub struct Network {
    backend: Arc<dyn NetlinkBackend>,
    lock: Mutex<()>,
}

impl Network {
    pub fn new(backend: Arc<dyn NetlinkBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            lock: Mutex::new(()),
        })
    }

    pub fn scoped_lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().expect("network lock poisoned")
    }

    pub fn create_tc(
        &self,
        handle: u32,
        parent: u32,
        leaf: bool,
        prio: &UintMap,
        rate: &UintMap,
        ceil: &UintMap,
    ) -> Result<()> {
        let _guard = self.scoped_lock();
        let mut prio = prio.clone();
        prio.entry("default".to_string()).or_insert(NET_DEFAULT_PRIO);
        let mut ceil = ceil.clone();
        ceil.entry("default".to_string()).or_insert(NET_MAX_RATE);
        self.backend.create_class(&TcClass {
            handle,
            parent,
            leaf,
            prio,
            rate: rate.clone(),
            ceil,
        })
    }

    pub fn destroy_tc(&self, handle: u32) -> Result<()> {
        let _guard = self.scoped_lock();
        self.backend.destroy_class(handle)
    }

    pub fn refresh_classes(&self) {
        let _guard = self.scoped_lock();
        if let Err(err) = self.backend.refresh() {
            warn!("network refresh failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tc_handle_packs_major_minor() {
        assert_eq!(tc_handle(1, 0), 0x0001_0000);
        assert_eq!(tc_handle(1, 42), 0x0001_002a);
    }

    #[test]
    fn uint_map_round_trip() {
        let map = parse_uint_map("default: 3;eth0: 125000").unwrap();
        assert_eq!(map["default"], 3);
        assert_eq!(map["eth0"], 125000);
        assert_eq!(
            parse_uint_map(&format_uint_map(&map)).unwrap(),
            map
        );
    }

    #[test]
    fn uint_map_rejects_garbage() {
        assert!(parse_uint_map("eth0").is_err());
        assert!(parse_uint_map("eth0: fast").is_err());
        assert_eq!(parse_uint_map("").unwrap().len(), 0);
    }

    #[test]
    fn net_mode_parse_covers_the_grammar() {
        assert_eq!(NetMode::parse(&[]).unwrap(), NetMode::Inherited);
        assert_eq!(
            NetMode::parse(&["none".to_string()]).unwrap(),
            NetMode::None
        );
        assert_eq!(
            NetMode::parse(&["netns vpn0".to_string()]).unwrap(),
            NetMode::Netns("vpn0".to_string())
        );
        assert!(NetMode::parse(&["bridge".to_string()]).is_err());
        assert!(NetMode::parse(&["netns".to_string()]).is_err());
    }

    #[test]
    fn create_tc_fills_defaults() {
        struct Capture(Mutex<Vec<TcClass>>);
        impl NetlinkBackend for Capture {
            fn create_class(&self, class: &TcClass) -> Result<()> {
                self.0.lock().unwrap().push(class.clone());
                Ok(())
            }
            fn destroy_class(&self, _handle: u32) -> Result<()> {
                Ok(())
            }
            fn refresh(&self) -> Result<()> {
                Ok(())
            }
        }

        let backend = Arc::new(Capture(Mutex::new(Vec::new())));
        let net = Network::new(backend.clone());
        net.create_tc(
            tc_handle(1, 7),
            tc_handle(1, 0),
            true,
            &UintMap::new(),
            &UintMap::new(),
            &UintMap::new(),
        )
        .unwrap();

        let classes = backend.0.lock().unwrap();
        assert_eq!(classes[0].prio["default"], NET_DEFAULT_PRIO);
        assert_eq!(classes[0].ceil["default"], NET_MAX_RATE);
    }
}
