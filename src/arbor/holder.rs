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

//! The container holder: the name index under one mutex, the id
//! allocator, parent linkage and tree orchestration. Restore walks
//! key-value nodes sorted by id so parents come back before children;
//! destroy refuses while children exist, keeping teardown leaves-first.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use crate::arbor::cgroup::CgroupSet;
use crate::arbor::config;
use crate::arbor::container::{Container, ContainerState};
use crate::arbor::events::{EpollLoop, Event, EventQueue};
use crate::arbor::kv::KvStore;
use crate::arbor::net::Network;
use crate::arbor::util::error::{ArborError, Result};
use crate::arbor::volume::VolumeBackend;
use crate::arbor::{
    ARBOR_ROOT_CONTAINER, ARBOR_ROOT_CONTAINER_ID, CONTAINER_ID_MAX, CONTAINER_LEVEL_MAX,
    CONTAINER_NAME_MAX, CONTAINER_PATH_MAX, ROOT_CONTAINER, ROOT_CONTAINER_ID,
};

struct IdAlloc {
    used: BTreeSet<u32>,
    cursor: u32,
}

impl IdAlloc {
    fn new() -> Self {
        Self {
            used: BTreeSet::new(),
            cursor: ARBOR_ROOT_CONTAINER_ID,
        }
    }

    fn claim(&mut self, id: u32) -> bool {
        self.used.insert(id)
    }

    fn allocate(&mut self) -> Result<u32> {
        for _ in 0..CONTAINER_ID_MAX {
            self.cursor = if self.cursor >= CONTAINER_ID_MAX {
                1
            } else {
                self.cursor + 1
            };
            if !self.used.contains(&self.cursor) {
                self.used.insert(self.cursor);
                return Ok(self.cursor);
            }
        }
        Err(ArborError::busy("out of container ids"))
    }

    fn release(&mut self, id: u32) {
        self.used.remove(&id);
    }
}

pub struct Holder {
    containers: Mutex<BTreeMap<String, Arc<Container>>>,
    ids: Mutex<IdAlloc>,
    kv: KvStore,
    cgroups: CgroupSet,
    epoll: EpollLoop,
    queue: EventQueue,
    host_net: Arc<Network>,
    volumes: Arc<dyn VolumeBackend>,
    work_dir: PathBuf,
}

impl Holder {
    pub fn new(
        kv: KvStore,
        cgroups: CgroupSet,
        host_net: Arc<Network>,
        volumes: Arc<dyn VolumeBackend>,
        work_dir: &Path,
    ) -> Result<Self> {
        std::fs::create_dir_all(work_dir)
            .map_err(|err| ArborError::from(err).wrap("create containers dir"))?;
        Ok(Self {
            containers: Mutex::new(BTreeMap::new()),
            ids: Mutex::new(IdAlloc::new()),
            kv,
            cgroups,
            epoll: EpollLoop::new()?,
            queue: EventQueue::new(),
            host_net,
            volumes,
            work_dir: work_dir.to_path_buf(),
        })
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn cgroups(&self) -> &CgroupSet {
        &self.cgroups
    }

    pub fn epoll(&self) -> &EpollLoop {
        &self.epoll
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn host_net(&self) -> &Network {
        &self.host_net
    }

    pub fn volumes(&self) -> &dyn VolumeBackend {
        self.volumes.as_ref()
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Creates the host root and the arbor root and brings both up as
    /// meta containers.
    pub fn bootstrap(&self) -> Result<()> {
        {
            let mut ids = self.ids.lock().expect("id lock poisoned");
            ids.claim(ROOT_CONTAINER_ID);
            ids.claim(ARBOR_ROOT_CONTAINER_ID);
        }

        let root = Container::new(ROOT_CONTAINER, ROOT_CONTAINER_ID, None, &self.work_dir);
        let arbor_root = Container::new(
            ARBOR_ROOT_CONTAINER,
            ARBOR_ROOT_CONTAINER_ID,
            Some(root.clone()),
            &self.work_dir,
        );
        root.add_child(&arbor_root);

        {
            let mut containers = self.containers.lock().expect("holder lock poisoned");
            containers.insert(ROOT_CONTAINER.to_string(), root.clone());
            containers.insert(ARBOR_ROOT_CONTAINER.to_string(), arbor_root.clone());
        }

        root.create(self, 0, 0, &[])?;
        arbor_root.create(self, 0, 0, &[])?;
        root.start(self, true)?;
        arbor_root.start(self, true)?;
        Ok(())
    }

    fn valid_name(name: &str) -> bool {
        if name.is_empty()
            || name.len() > CONTAINER_PATH_MAX
            || name.starts_with('/')
            || name.contains("//")
            || name.split('/').count() > CONTAINER_LEVEL_MAX
        {
            return false;
        }
        for segment in name.split('/') {
            if segment.is_empty() || segment.len() > CONTAINER_NAME_MAX || segment == "." {
                return false;
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | ':' | '.' | '-'))
            {
                return false;
            }
        }
        true
    }

    fn parent_name(name: &str) -> Option<&str> {
        name.rfind('/').map(|slash| &name[..slash])
    }

    pub fn create(
        &self,
        name: &str,
        uid: u32,
        gid: u32,
        groups: &[u32],
    ) -> Result<Arc<Container>> {
        if !Self::valid_name(name) {
            return Err(ArborError::invalid_value(format!(
                "invalid container name {}",
                name
            )));
        }

        let container = {
            let mut containers = self.containers.lock().expect("holder lock poisoned");
            if containers.contains_key(name) {
                return Err(ArborError::already_exists(format!(
                    "container {} already exists",
                    name
                )));
            }
            if containers.len() as u64 >= config::max_containers() + 2 {
                return Err(ArborError::busy("too many containers"));
            }

            let parent = match Self::parent_name(name) {
                Some(parent_name) => containers.get(parent_name).cloned().ok_or_else(|| {
                    ArborError::invalid_value(format!("invalid parent container for {}", name))
                })?,
                None => containers
                    .get(ARBOR_ROOT_CONTAINER)
                    .cloned()
                    .ok_or_else(|| ArborError::invalid_value("arbor root is not initialized"))?,
            };

            let id = self.ids.lock().expect("id lock poisoned").allocate()?;
            let container = Container::new(name, id, Some(parent.clone()), &self.work_dir);
            parent.add_child(&container);
            containers.insert(name.to_string(), container.clone());
            container
        };

        if let Err(err) = container.create(self, uid, gid, groups) {
            let mut containers = self.containers.lock().expect("holder lock poisoned");
            containers.remove(name);
            self.ids
                .lock()
                .expect("id lock poisoned")
                .release(container.id);
            return Err(err);
        }

        Ok(container)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Container>> {
        self.containers
            .lock()
            .expect("holder lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| ArborError::no_container(format!("container {} not found", name)))
    }

    pub fn list(&self) -> Vec<String> {
        self.containers
            .lock()
            .expect("holder lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn destroy(&self, name: &str) -> Result<()> {
        if name == ROOT_CONTAINER || name == ARBOR_ROOT_CONTAINER {
            return Err(ArborError::permission("cannot destroy system container"));
        }

        let container = {
            let containers = self.containers.lock().expect("holder lock poisoned");
            containers.get(name).cloned().ok_or_else(|| {
                ArborError::invalid_value(format!("invalid container name {}", name))
            })?
        };

        if container.has_children() {
            return Err(ArborError::invalid_state("container has children"));
        }
        if !container.acquire() {
            return Err(ArborError::busy(format!("container {} is busy", name)));
        }

        let result: Result<()> = (|| {
            let state = container.state();
            if state != ContainerState::Stopped {
                container.stop(self, config::kill_timeout_ms())?;
            }
            Ok(())
        })();
        container.release();
        result?;

        container.destroy(self);

        self.containers
            .lock()
            .expect("holder lock poisoned")
            .remove(name);
        self.ids
            .lock()
            .expect("id lock poisoned")
            .release(container.id);
        Ok(())
    }

    /// Rebuilds the tree from the key-value directory after a restart.
    /// Nodes are visited in id order; the system containers are rebuilt
    /// by `bootstrap`, their stale nodes are refreshed in place.
    pub fn restore_from_storage(&self) -> bool {
        let ids = match self.kv.list_ids() {
            Ok(ids) => ids,
            Err(err) => {
                error!("cannot list key-value nodes: {}", err);
                return false;
            }
        };

        let mut restored = false;
        for id in ids {
            if id == ROOT_CONTAINER_ID || id == ARBOR_ROOT_CONTAINER_ID {
                continue;
            }

            let node = self.kv.node(id);
            let data = match node.load() {
                Ok(data) => data,
                Err(err) => {
                    error!("cannot load key-value node {}: {}", id, err);
                    let _ = node.remove();
                    continue;
                }
            };
            let Some(name) = data.get("name").cloned() else {
                warn!("key-value node {} has no name, dropped", id);
                let _ = node.remove();
                continue;
            };

            info!("restore {} from node {}", name, id);
            match self.restore_one(&name, id, &data) {
                Ok(()) => restored = true,
                Err(err) => {
                    error!("cannot restore container {}: {}", name, err);
                    let mut containers = self.containers.lock().expect("holder lock poisoned");
                    containers.remove(&name);
                    self.ids.lock().expect("id lock poisoned").release(id);
                    let _ = node.remove();
                }
            }
        }
        restored
    }

    fn restore_one(&self, name: &str, id: u32, data: &BTreeMap<String, String>) -> Result<()> {
        let container = {
            let mut containers = self.containers.lock().expect("holder lock poisoned");
            if containers.contains_key(name) {
                return Err(ArborError::already_exists(format!(
                    "container {} already restored",
                    name
                )));
            }
            let parent = match Self::parent_name(name) {
                Some(parent_name) => containers.get(parent_name).cloned().ok_or_else(|| {
                    ArborError::invalid_value(format!("parent missing for {}", name))
                })?,
                None => containers
                    .get(ARBOR_ROOT_CONTAINER)
                    .cloned()
                    .ok_or_else(|| ArborError::invalid_value("arbor root is not initialized"))?,
            };
            if !self.ids.lock().expect("id lock poisoned").claim(id) {
                return Err(ArborError::invalid_data(format!(
                    "container id {} already taken",
                    id
                )));
            }
            let container = Container::new(name, id, Some(parent.clone()), &self.work_dir);
            parent.add_child(&container);
            containers.insert(name.to_string(), container.clone());
            container
        };

        container.restore(self, data)
    }

    /// Fans one event out to its target container.
    pub fn deliver_event(&self, event: &Event) {
        match event {
            Event::Exit { pid, .. } => {
                let target = {
                    let containers = self.containers.lock().expect("holder lock poisoned");
                    containers
                        .values()
                        .find(|ct| {
                            let inner = ct.lock();
                            inner.wait_task_pid == *pid || inner.task_pid == *pid
                        })
                        .cloned()
                };
                match target {
                    Some(container) => container.deliver_event(self, event),
                    None => info!("exit status for unknown pid {}", pid),
                }
            }
            Event::Oom { fd } => {
                let target = {
                    let containers = self.containers.lock().expect("holder lock poisoned");
                    containers
                        .values()
                        .find(|ct| ct.owns_oom_fd(*fd))
                        .cloned()
                };
                if let Some(container) = target {
                    if container.may_receive_oom(*fd) {
                        container.deliver_event(self, event);
                    }
                }
            }
            Event::RotateLogs => {
                let running: Vec<Arc<Container>> = {
                    let containers = self.containers.lock().expect("holder lock poisoned");
                    containers.values().cloned().collect()
                };
                for container in running {
                    if container.state() == ContainerState::Running {
                        container.deliver_event(self, event);
                    }
                }
            }
            Event::Respawn { name } => {
                if let Ok(container) = self.get(name) {
                    container.deliver_event(self, event);
                }
            }
            Event::DestroyWeak { name } => {
                if let Err(err) = self.destroy(name) {
                    warn!("cannot destroy weak container {}: {}", name, err);
                }
            }
        }
    }

    /// Periodic sweep: ages out dead containers and rotates streams of
    /// running ones.
    pub fn heartbeat(&self) {
        let all: Vec<Arc<Container>> = {
            let containers = self.containers.lock().expect("holder lock poisoned");
            containers.values().cloned().collect()
        };

        for container in all {
            if container.can_remove_dead() {
                info!("stop aged dead container {}", container.name);
                if let Err(err) = container.stop(self, 0) {
                    warn!("cannot stop dead container {}: {}", container.name, err);
                }
            } else if container.state() == ContainerState::Running {
                container.deliver_event(self, &Event::RotateLogs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_grammar() {
        for good in ["a", "web", "a/b", "a/b/c", "x_y-z.9@host:8080", "A1"] {
            assert!(Holder::valid_name(good), "{} should be valid", good);
        }
        for bad in [
            "",
            "/a",
            "a//b",
            "a/",
            ".",
            "a/./b",
            "a b",
            "a\tb",
            "a/b!",
            &"x".repeat(201),
        ] {
            assert!(!Holder::valid_name(bad), "{:?} should be invalid", bad);
        }
        let long_segment = "s".repeat(129);
        assert!(!Holder::valid_name(&long_segment));
        assert!(Holder::valid_name(&"s".repeat(128)));

        assert!(Holder::valid_name("a/b/c/d/e/f/g"));
        assert!(!Holder::valid_name("a/b/c/d/e/f/g/h"));
    }

    #[test]
    fn parent_name_is_the_longest_prefix() {
        assert_eq!(Holder::parent_name("a/b/c"), Some("a/b"));
        assert_eq!(Holder::parent_name("a"), None);
    }

    #[test]
    fn id_allocation_recycles_released_ids() {
        let mut ids = IdAlloc::new();
        ids.claim(ROOT_CONTAINER_ID);
        ids.claim(ARBOR_ROOT_CONTAINER_ID);

        let first = ids.allocate().unwrap();
        let second = ids.allocate().unwrap();
        assert_ne!(first, second);
        assert!(first >= 1 && first <= CONTAINER_ID_MAX);

        ids.release(first);
        // the cursor walks forward, the freed id comes back eventually
        let mut seen = BTreeSet::new();
        for _ in 0..CONTAINER_ID_MAX {
            match ids.allocate() {
                Ok(id) => {
                    seen.insert(id);
                }
                Err(_) => break,
            }
        }
        assert!(seen.contains(&first));
    }

    #[test]
    fn id_allocator_is_bounded() {
        let mut ids = IdAlloc::new();
        for _ in 0..CONTAINER_ID_MAX {
            let _ = ids.allocate();
        }
        assert!(ids.allocate().is_err());
    }
}
